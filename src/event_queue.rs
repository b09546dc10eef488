//! Unbounded file event queue with batch/timeout draining

use async_channel as channel;
use futures_lite::future;
use std::time::Duration;

use crate::events::FileEvent;

/// Producer handle; cheap to clone, one per scan worker.
#[derive(Debug, Clone)]
pub struct EventSender {
	tx: channel::Sender<FileEvent>,
}

impl EventSender {
	/// Returns false once the consumer side is gone.
	pub fn send(&self, event: FileEvent) -> bool {
		self.tx.try_send(event).is_ok()
	}

	pub fn send_all(&self, events: impl IntoIterator<Item = FileEvent>) -> usize {
		let mut sent = 0;
		for event in events {
			if !self.send(event) {
				break;
			}
			sent += 1;
		}
		sent
	}
}

#[derive(Debug, Clone)]
pub struct EventQueue {
	tx: channel::Sender<FileEvent>,
	rx: channel::Receiver<FileEvent>,
}

impl Default for EventQueue {
	fn default() -> Self {
		Self::new()
	}
}

impl EventQueue {
	pub fn new() -> Self {
		let (tx, rx) = channel::unbounded();
		Self { tx, rx }
	}

	pub fn sender(&self) -> EventSender {
		EventSender {
			tx: self.tx.clone(),
		}
	}

	pub fn len(&self) -> usize {
		self.rx.len()
	}

	pub fn is_empty(&self) -> bool {
		self.rx.is_empty()
	}

	/// Everything queued right now, without waiting.
	pub fn drain_now(&self, max: usize) -> Vec<FileEvent> {
		let mut batch = Vec::new();
		while batch.len() < max {
			match self.rx.try_recv() {
				Ok(event) => batch.push(event),
				Err(_) => break,
			}
		}
		batch
	}

	/// Collect up to `max` events, waiting at most `timeout` overall.
	/// An empty batch after the timeout is not an error.
	pub async fn drain_batch(&self, max: usize, timeout: Duration) -> Vec<FileEvent> {
		let mut batch = Vec::new();
		let deadline = std::time::Instant::now() + timeout;
		while batch.len() < max {
			// Take whatever is already there before waiting
			if let Ok(event) = self.rx.try_recv() {
				batch.push(event);
				continue;
			}
			let recv = async { self.rx.recv().await.ok() };
			let timer = async {
				smol::Timer::at(deadline).await;
				None
			};
			match future::or(recv, timer).await {
				Some(event) => batch.push(event),
				None => break,
			}
		}
		batch
	}
}
