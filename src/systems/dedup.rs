//! Dedup worker: reduces file event batches into the Registry, then runs the plugins

use async_trait::async_trait;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::SystemResult;
use crate::event_queue::EventQueue;
use crate::events::{FileEvent, apply_file_events};
use crate::fs::FileSystem;
use crate::plugins::{DuplicatePlugin, PluginReport, run_plugins};
use crate::registry::Registry;
use crate::systems::{Worker, WorkerContext};

pub struct DedupWorker {
	registry: Arc<Registry>,
	fs: Arc<dyn FileSystem>,
	plugins: Vec<Arc<dyn DuplicatePlugin>>,
	queue: EventQueue,
	batch_size: usize,
	batch_timeout: Duration,
	last_reports: Mutex<Vec<PluginReport>>,
}

impl DedupWorker {
	pub fn new(
		registry: Arc<Registry>,
		fs: Arc<dyn FileSystem>,
		plugins: Vec<Arc<dyn DuplicatePlugin>>,
		queue: EventQueue,
		batch_size: usize,
		batch_timeout: Duration,
	) -> Self {
		Self {
			registry,
			fs,
			plugins,
			queue,
			batch_size: batch_size.max(1),
			batch_timeout,
			last_reports: Mutex::new(Vec::new()),
		}
	}

	/// Apply one batch and run every plugin once.
	pub fn process_batch(&self, events: &[FileEvent], cancel: &AtomicBool) -> Vec<PluginReport> {
		match apply_file_events(&self.registry, events) {
			Ok(summary) => debug!(
				"Dedup: reduced {} events (stored {}, removed {}, invalidated {}, skipped {})",
				events.len(),
				summary.stored,
				summary.removed,
				summary.invalidated,
				summary.skipped
			),
			Err(e) => warn!("Dedup: reducing batch failed: {}", e),
		}
		let reports = run_plugins(&self.registry, &self.plugins, self.fs.as_ref(), cancel);
		if let Ok(mut last) = self.last_reports.lock() {
			*last = reports.clone();
		}
		reports
	}

	/// Reports of the most recent plugin pass.
	pub fn last_reports(&self) -> Vec<PluginReport> {
		self.last_reports
			.lock()
			.map(|reports| reports.clone())
			.unwrap_or_default()
	}
}

#[async_trait]
impl Worker for DedupWorker {
	async fn run(&self, context: &WorkerContext) -> SystemResult<()> {
		info!("Dedup: worker started with {} plugins", self.plugins.len());
		while !context.is_cancelled() {
			let batch = self.queue.drain_batch(self.batch_size, self.batch_timeout).await;
			if batch.is_empty() || context.is_cancelled() {
				continue;
			}
			self.process_batch(&batch, &context.cancellation_token);
		}
		info!("Dedup: worker stopped");
		Ok(())
	}

	fn name(&self) -> &'static str {
		"Dedup"
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::fs::LocalFileSystem;
	use crate::paths::FilePath;
	use crate::plugins::ContentHashPlugin;
	use crate::registry::FileSnapshot;
	use chrono::Utc;
	use futures_lite::future;
	use std::fs;
	use tempfile::TempDir;

	fn worker(queue: &EventQueue) -> DedupWorker {
		DedupWorker::new(
			Arc::new(Registry::in_memory().unwrap()),
			Arc::new(LocalFileSystem::new()),
			vec![Arc::new(ContentHashPlugin::new()) as Arc<dyn DuplicatePlugin>],
			queue.clone(),
			100,
			Duration::from_millis(50),
		)
	}

	fn added(temp_dir: &TempDir, name: &str, content: &str) -> FileEvent {
		fs::write(temp_dir.path().join(name), content).unwrap();
		let path = FilePath::new(temp_dir.path().join(name)).unwrap();
		FileEvent::Added(FileSnapshot::new(path, content.len() as u64, Utc::now()))
	}

	#[test_log::test]
	fn test_batch_is_reduced_then_grouped() {
		let temp_dir = TempDir::new().unwrap();
		let queue = EventQueue::new();
		let worker = worker(&queue);
		let events = vec![
			added(&temp_dir, "x.bin", "AAAA"),
			added(&temp_dir, "y.bin", "AAAA"),
			added(&temp_dir, "z.bin", "BBBB"),
		];

		let reports = worker.process_batch(&events, &AtomicBool::new(false));
		assert_eq!(reports.len(), 1);
		assert_eq!(reports[0].computed, 3);
		assert_eq!(reports[0].groups.len(), 1);
		assert_eq!(reports[0].groups[0].len(), 2);
		assert_eq!(worker.last_reports(), reports);
	}

	#[smol_potat::test]
	async fn test_worker_drains_queue_until_cancelled() {
		let temp_dir = TempDir::new().unwrap();
		let queue = EventQueue::new();
		let worker = worker(&queue);
		queue.sender().send_all(vec![
			added(&temp_dir, "x.bin", "AAAA"),
			added(&temp_dir, "y.bin", "AAAA"),
		]);

		let context = WorkerContext::new().with_poll_interval(Duration::from_millis(10));
		let stopper = context.clone();
		let watch = async {
			while worker.last_reports().is_empty() {
				smol::Timer::after(Duration::from_millis(10)).await;
			}
			stopper.cancel();
		};
		let (result, ()) = future::zip(worker.run(&context), watch).await;
		assert!(result.is_ok());
		assert!(queue.is_empty());
		assert_eq!(worker.last_reports()[0].groups.len(), 1);
	}
}
