//! Long-lived worker loops: folder scanning and duplicate detection

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::SystemResult;

pub mod dedup;
pub mod scan;

pub use dedup::DedupWorker;
pub use scan::{ScanRequest, ScanSummary, ScanWorker};

/// Common interface for the worker loops
#[async_trait]
pub trait Worker: Send + Sync {
	/// Loop until the context is cancelled or the input closes
	async fn run(&self, context: &WorkerContext) -> SystemResult<()>;

	/// Worker name for logging and thread names
	fn name(&self) -> &'static str;
}

/// Worker execution context
#[derive(Debug, Clone)]
pub struct WorkerContext {
	/// Shared by every worker of one engine
	pub cancellation_token: Arc<AtomicBool>,
	/// How long an idle loop waits before re-checking cancellation
	pub poll_interval: Duration,
}

impl Default for WorkerContext {
	fn default() -> Self {
		Self {
			cancellation_token: Arc::new(AtomicBool::new(false)),
			poll_interval: Duration::from_millis(100),
		}
	}
}

impl WorkerContext {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_cancellation_token(mut self, token: Arc<AtomicBool>) -> Self {
		self.cancellation_token = token;
		self
	}

	pub fn with_poll_interval(mut self, interval: Duration) -> Self {
		self.poll_interval = interval;
		self
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancellation_token.load(Ordering::Relaxed)
	}

	pub fn cancel(&self) {
		self.cancellation_token.store(true, Ordering::Relaxed);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test_log::test]
	fn test_cancellation_is_shared() {
		let token = Arc::new(AtomicBool::new(false));
		let a = WorkerContext::new().with_cancellation_token(token.clone());
		let b = a.clone().with_poll_interval(Duration::from_millis(5));
		assert!(!b.is_cancelled());
		a.cancel();
		assert!(b.is_cancelled());
		assert!(token.load(Ordering::Relaxed));
	}
}
