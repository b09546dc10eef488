//! Scan worker: diffs folders on disk against the Registry and emits file events

use async_channel as channel;
use async_trait::async_trait;
use futures_lite::future;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::error::{DedupError, DedupResult, SystemResult};
use crate::event_queue::EventSender;
use crate::events::FileEvent;
use crate::fs::FileSystem;
use crate::paths::{FilePath, FolderPath};
use crate::registry::{FileSnapshot, Registry};
use crate::systems::{Worker, WorkerContext};

/// One root folder to scan, with the Ignore set as it was when the request was made.
#[derive(Debug, Clone)]
pub struct ScanRequest {
	pub root: FolderPath,
	pub ignored: Arc<BTreeSet<FolderPath>>,
}

impl ScanRequest {
	pub fn new(root: FolderPath, ignored: Arc<BTreeSet<FolderPath>>) -> Self {
		Self { root, ignored }
	}

	fn is_ignored(&self, folder: &FolderPath) -> bool {
		self.ignored.iter().any(|ignored| folder.starts_with(ignored))
	}
}

/// Totals for one scanned tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
	pub folders: usize,
	pub added: usize,
	pub removed: usize,
	/// Subtrees skipped because they are ignored
	pub ignored: usize,
	/// Subtrees skipped after an error, plus one if the whole tree was aborted
	pub failed: usize,
	/// Folders only partly diffed because they exceed the batch size
	pub partial: usize,
}

/// Slice of a folder's sorted listing diffed in one pass: names in `(after, upto]`.
#[derive(Debug, PartialEq, Eq)]
struct Window {
	after: Option<String>,
	upto: Option<String>,
}

impl Window {
	fn contains(&self, name: &str) -> bool {
		self.after.as_deref().is_none_or(|after| name > after)
			&& self.upto.as_deref().is_none_or(|upto| name <= upto)
	}
}

pub struct ScanWorker {
	registry: Arc<Registry>,
	fs: Arc<dyn FileSystem>,
	requests: channel::Receiver<ScanRequest>,
	events: EventSender,
	batch_size: usize,
	/// Last name diffed per oversized folder
	cursors: Mutex<HashMap<FolderPath, String>>,
}

impl ScanWorker {
	pub fn new(
		registry: Arc<Registry>,
		fs: Arc<dyn FileSystem>,
		requests: channel::Receiver<ScanRequest>,
		events: EventSender,
		batch_size: usize,
	) -> Self {
		Self {
			registry,
			fs,
			requests,
			events,
			batch_size: batch_size.max(1),
			cursors: Mutex::new(HashMap::new()),
		}
	}

	/// Scan a whole tree depth-first. Path and I/O errors skip only the subtree
	/// they occur in; store errors abort the tree.
	pub fn scan_tree(&self, request: &ScanRequest, cancel: &AtomicBool) -> ScanSummary {
		let mut summary = ScanSummary::default();
		if request.is_ignored(&request.root) {
			debug!("Scan: root {} is ignored", request.root);
			summary.ignored += 1;
			return summary;
		}
		info!("Scan: starting {}", request.root);
		if let Err(e) = self.scan_subtree(&request.root, request, cancel, &mut summary) {
			error!("Scan: aborting {}: {}", request.root, e);
			summary.failed += 1;
		}
		info!(
			"Scan: finished {} ({} folders, +{} -{}, {} failed)",
			request.root, summary.folders, summary.added, summary.removed, summary.failed
		);
		summary
	}

	fn scan_subtree(
		&self,
		folder: &FolderPath,
		request: &ScanRequest,
		cancel: &AtomicBool,
		summary: &mut ScanSummary,
	) -> DedupResult<()> {
		if cancel.load(Ordering::Relaxed) {
			return Ok(());
		}
		let subfolders = match self
			.diff_folder(folder, summary)
			.and_then(|()| self.fs.list_subfolders(folder))
		{
			Ok(subfolders) => subfolders,
			Err(e) if e.is_subtree_local() => {
				warn!("Scan: skipping subtree {}: {}", folder, e);
				summary.failed += 1;
				return Ok(());
			}
			Err(e) => return Err(e),
		};

		for subfolder in subfolders {
			if request.is_ignored(&subfolder) {
				trace!("Scan: ignoring {}", subfolder);
				summary.ignored += 1;
				continue;
			}
			self.scan_subtree(&subfolder, request, cancel, summary)?;
		}
		Ok(())
	}

	fn next_window(&self, folder: &FolderPath, names: &[&str]) -> Window {
		let Ok(mut cursors) = self.cursors.lock() else {
			return Window {
				after: None,
				upto: None,
			};
		};
		let after = cursors.remove(folder).filter(|cursor| {
			// A cursor past the last name wraps around to the start
			names.last().is_some_and(|last| *last > cursor.as_str())
		});
		let start = after
			.as_deref()
			.map(|cursor| names.partition_point(|name| *name <= cursor))
			.unwrap_or(0);
		let end = (start + self.batch_size).min(names.len());
		let upto = if end < names.len() {
			let last = names[end - 1].to_string();
			cursors.insert(folder.clone(), last.clone());
			Some(last)
		} else {
			None
		};
		Window { after, upto }
	}

	/// Diff the direct files of one folder and apply the result.
	fn diff_folder(&self, folder: &FolderPath, summary: &mut ScanSummary) -> DedupResult<()> {
		summary.folders += 1;
		let listing = self.fs.list_files(folder)?;
		let names: Vec<&str> = listing.iter().map(|path| path.file_name()).collect();
		let window = self.next_window(folder, &names);
		if window.after.is_some() || window.upto.is_some() {
			summary.partial += 1;
		}

		let mut current = HashSet::new();
		// Names whose state is unknown this pass; their entries stay as they are
		let mut undiffed: HashSet<&str> = HashSet::new();
		for path in listing.iter().filter(|path| window.contains(path.file_name())) {
			match self.fs.stat(path) {
				Ok(stat) => {
					current.insert(FileSnapshot::new(path.clone(), stat.size, stat.modified));
				}
				// Vanished between listing and stat
				Err(DedupError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
					trace!("Scan: {} vanished before stat", path);
				}
				Err(e) => {
					warn!("Scan: cannot stat {}, leaving it undiffed: {}", path, e);
					undiffed.insert(path.file_name());
				}
			}
		}
		let existing: HashSet<FileSnapshot> = self
			.registry
			.files_in_folder(folder)?
			.into_iter()
			.filter(|snapshot| {
				let name = snapshot.path.file_name();
				window.contains(name) && !undiffed.contains(name)
			})
			.collect();

		let mut removed: Vec<FileSnapshot> = existing.difference(&current).cloned().collect();
		let mut added: Vec<FileSnapshot> = current.difference(&existing).cloned().collect();
		if removed.is_empty() && added.is_empty() {
			return Ok(());
		}
		removed.sort_by(|a, b| a.path.cmp(&b.path));
		added.sort_by(|a, b| a.path.cmp(&b.path));

		let paths: Vec<FilePath> = removed.iter().map(|s| s.path.clone()).collect();
		self.registry.apply_diff(&paths, &added)?;
		summary.removed += removed.len();
		summary.added += added.len();
		self.events.send_all(removed.into_iter().map(FileEvent::Removed));
		self.events.send_all(added.into_iter().map(FileEvent::Added));
		Ok(())
	}
}

enum Next {
	Request(ScanRequest),
	Idle,
	Closed,
}

#[async_trait]
impl Worker for ScanWorker {
	async fn run(&self, context: &WorkerContext) -> SystemResult<()> {
		info!("Scan: worker started");
		while !context.is_cancelled() {
			let recv = async {
				match self.requests.recv().await {
					Ok(request) => Next::Request(request),
					Err(_) => Next::Closed,
				}
			};
			let idle = async {
				smol::Timer::after(context.poll_interval).await;
				Next::Idle
			};
			match future::or(recv, idle).await {
				Next::Request(request) => {
					self.scan_tree(&request, &context.cancellation_token);
				}
				Next::Idle => {}
				Next::Closed => {
					debug!("Scan: request queue closed");
					break;
				}
			}
		}
		info!("Scan: worker stopped");
		Ok(())
	}

	fn name(&self) -> &'static str {
		"Scan"
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::event_queue::EventQueue;
	use crate::fs::{FileStat, LocalFileSystem};
	use std::fs;
	use std::io::Read;
	use std::time::Duration;
	use tempfile::TempDir;

	struct Fixture {
		temp_dir: TempDir,
		root: FolderPath,
		registry: Arc<Registry>,
		queue: EventQueue,
		worker: ScanWorker,
		requests: channel::Sender<ScanRequest>,
	}

	/// The local disk, except that `stat` fails for the listed names.
	#[derive(Debug, Default)]
	struct FlakyStat {
		failing: Mutex<HashMap<String, io::ErrorKind>>,
	}

	impl FlakyStat {
		fn fail(&self, name: &str, kind: io::ErrorKind) {
			self.failing.lock().unwrap().insert(name.to_string(), kind);
		}
	}

	impl FileSystem for FlakyStat {
		fn list_files(&self, folder: &FolderPath) -> DedupResult<Vec<FilePath>> {
			LocalFileSystem.list_files(folder)
		}

		fn list_subfolders(&self, folder: &FolderPath) -> DedupResult<Vec<FolderPath>> {
			LocalFileSystem.list_subfolders(folder)
		}

		fn stat(&self, path: &FilePath) -> DedupResult<FileStat> {
			if let Some(kind) = self.failing.lock().unwrap().get(path.file_name()) {
				return Err(io::Error::new(*kind, "stat failed").into());
			}
			LocalFileSystem.stat(path)
		}

		fn open_read(&self, path: &FilePath) -> DedupResult<Box<dyn Read + Send>> {
			LocalFileSystem.open_read(path)
		}
	}

	fn fixture(batch_size: usize) -> Fixture {
		fixture_on(batch_size, Arc::new(LocalFileSystem::new()))
	}

	fn fixture_on(batch_size: usize, fs: Arc<dyn FileSystem>) -> Fixture {
		let temp_dir = TempDir::new().unwrap();
		let root = FolderPath::new(temp_dir.path()).unwrap();
		let registry = Arc::new(Registry::in_memory().unwrap());
		let queue = EventQueue::new();
		let (tx, rx) = channel::unbounded();
		let worker = ScanWorker::new(registry.clone(), fs, rx, queue.sender(), batch_size);
		Fixture {
			temp_dir,
			root,
			registry,
			queue,
			worker,
			requests: tx,
		}
	}

	impl Fixture {
		fn scan(&self) -> ScanSummary {
			self.scan_ignoring(BTreeSet::new())
		}

		fn scan_ignoring(&self, ignored: BTreeSet<FolderPath>) -> ScanSummary {
			let request = ScanRequest::new(self.root.clone(), Arc::new(ignored));
			self.worker.scan_tree(&request, &AtomicBool::new(false))
		}

		fn write(&self, rel: &str, content: &str) {
			let path = self.temp_dir.path().join(rel);
			fs::create_dir_all(path.parent().unwrap()).unwrap();
			fs::write(path, content).unwrap();
		}

		fn file(&self, rel: &str) -> FilePath {
			FilePath::new(self.temp_dir.path().join(rel)).unwrap()
		}
	}

	#[test_log::test]
	fn test_diff_emits_removes_then_adds() {
		let f = fixture(100);
		f.write("a.txt", "a");
		f.write("b.txt", "b");
		let first = f.scan();
		assert_eq!(first.added, 2);
		assert_eq!(f.queue.drain_now(10).len(), 2);

		// Second scan of an unchanged tree is silent
		assert_eq!(f.scan().added, 0);
		assert!(f.queue.is_empty());

		fs::remove_file(f.temp_dir.path().join("a.txt")).unwrap();
		f.write("b.txt", "bigger");
		f.write("c.txt", "c");
		let summary = f.scan();
		assert_eq!((summary.removed, summary.added), (2, 2));

		let events = f.queue.drain_now(10);
		let kinds: Vec<(&str, &str)> = events
			.iter()
			.map(|e| match e {
				FileEvent::Removed(s) => ("removed", s.path.file_name()),
				FileEvent::Added(s) => ("added", s.path.file_name()),
				FileEvent::Updated(s) => ("updated", s.path.file_name()),
			})
			.collect();
		assert_eq!(
			kinds,
			vec![
				("removed", "a.txt"),
				("removed", "b.txt"),
				("added", "b.txt"),
				("added", "c.txt")
			]
		);
		// Registry was updated before the events were queued
		assert_eq!(f.registry.file(&f.file("b.txt")).unwrap().unwrap().size, 6);
		assert!(f.registry.file(&f.file("a.txt")).unwrap().is_none());
	}

	#[test_log::test]
	fn test_recursion_is_lexical_and_honors_ignore() {
		let f = fixture(100);
		f.write("b/two.txt", "2");
		f.write("a/one.txt", "1");
		f.write("skip/three.txt", "3");
		f.write("a/deeper/four.txt", "4");

		let mut ignored = BTreeSet::new();
		ignored.insert(FolderPath::new(f.temp_dir.path().join("skip")).unwrap());
		let summary = f.scan_ignoring(ignored);
		assert_eq!(summary.ignored, 1);
		assert_eq!(summary.added, 3);

		let order: Vec<String> = f
			.queue
			.drain_now(10)
			.iter()
			.map(|e| e.snapshot().path.file_name().to_string())
			.collect();
		assert_eq!(order, vec!["one.txt", "four.txt", "two.txt"]);
		assert!(f.registry.file(&f.file("skip/three.txt")).unwrap().is_none());
	}

	#[test_log::test]
	fn test_oversized_folder_converges_over_passes() {
		let f = fixture(2);
		for name in ["a", "b", "c", "d", "e"] {
			f.write(name, name);
		}

		let passes: Vec<usize> = (0..3).map(|_| f.scan().added).collect();
		assert_eq!(passes, vec![2, 2, 1]);
		assert_eq!(f.registry.files_in_folder(&f.root).unwrap().len(), 5);

		// Files outside the current window are never removed
		let summary = f.scan();
		assert_eq!((summary.added, summary.removed), (0, 0));
		assert_eq!(f.registry.files_in_folder(&f.root).unwrap().len(), 5);
	}

	#[test_log::test]
	fn test_missing_root_counts_as_failed_subtree() {
		let f = fixture(10);
		let request = ScanRequest::new(
			FolderPath::new(f.temp_dir.path().join("gone")).unwrap(),
			Arc::new(BTreeSet::new()),
		);
		let summary = f.worker.scan_tree(&request, &AtomicBool::new(false));
		assert_eq!(summary.failed, 1);
	}

	#[test_log::test]
	fn test_too_deep_subtree_does_not_stop_siblings() {
		let f = fixture(10);
		let deep: std::path::PathBuf = (0..crate::paths::MAX_FOLDER_DEPTH).map(|i| format!("d{i}")).collect();
		f.write(&deep.join("deep.txt").to_string_lossy(), "deep");
		f.write("z/sibling.txt", "s");

		let summary = f.scan();
		assert_eq!(summary.failed, 1);
		assert!(f.registry.file(&f.file("z/sibling.txt")).unwrap().is_some());
		assert!(f.registry.file(&f.file(&deep.join("deep.txt").to_string_lossy())).is_err());
	}

	#[test_log::test]
	fn test_stat_failure_other_than_not_found_keeps_entry() {
		let fs = Arc::new(FlakyStat::default());
		let f = fixture_on(10, fs.clone());
		f.write("locked.txt", "l");
		f.write("vanishing.txt", "v");
		assert_eq!(f.scan().added, 2);
		let locked = f.registry.file(&f.file("locked.txt")).unwrap().unwrap();
		f.queue.drain_now(10);

		fs.fail("locked.txt", io::ErrorKind::PermissionDenied);
		fs.fail("vanishing.txt", io::ErrorKind::NotFound);
		let summary = f.scan();
		assert_eq!((summary.added, summary.removed), (0, 1));
		assert_eq!(f.registry.file(&f.file("locked.txt")).unwrap(), Some(locked));
		assert!(f.registry.file(&f.file("vanishing.txt")).unwrap().is_none());
		let events = f.queue.drain_now(10);
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].snapshot().path, f.file("vanishing.txt"));
	}

	#[cfg(unix)]
	#[test_log::test]
	fn test_unrepresentable_folder_name_does_not_hide_siblings() {
		use std::ffi::OsStr;
		use std::os::unix::ffi::OsStrExt;

		let f = fixture(10);
		let bad = f.temp_dir.path().join(OsStr::from_bytes(b"bad\xff"));
		fs::create_dir(&bad).unwrap();
		fs::write(bad.join("inside.txt"), "i").unwrap();
		f.write("good/keep.txt", "k");

		let summary = f.scan();
		assert_eq!(summary.failed, 0);
		assert_eq!(summary.added, 1);
		assert!(f.registry.file(&f.file("good/keep.txt")).unwrap().is_some());
	}

	#[smol_potat::test]
	async fn test_worker_loop_stops_on_cancel() {
		let f = fixture(10);
		f.write("x.bin", "AAAA");
		f.requests
			.send(ScanRequest::new(f.root.clone(), Arc::new(BTreeSet::new())))
			.await
			.unwrap();

		let context = WorkerContext::new().with_poll_interval(Duration::from_millis(10));
		let stopper = context.clone();
		let events = f.queue.clone();
		let run = f.worker.run(&context);
		let cancel = async {
			let batch = events.drain_batch(1, Duration::from_secs(5)).await;
			stopper.cancel();
			batch
		};
		let (result, batch) = future::zip(run, cancel).await;
		assert!(result.is_ok());
		assert_eq!(batch.len(), 1);
	}
}
