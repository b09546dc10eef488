//! Bounded LRU caches in front of folder and file resolution
//!
//! The caches are views, never the source of truth: a miss always falls through
//! to the store, and removals must evict explicitly.

use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

use crate::error::{DedupError, DedupResult};
use crate::paths::{FilePath, FolderPath};
use crate::store::{FileRow, FolderId};

pub const DEFAULT_FOLDER_CACHE_CAPACITY: usize = 1000;
pub const DEFAULT_FILE_CACHE_CAPACITY: usize = 50_000;

/// Hit/miss counters for one cache
#[derive(Debug, Default)]
pub struct CacheStats {
	hits: AtomicU64,
	misses: AtomicU64,
}

impl CacheStats {
	pub fn hits(&self) -> u64 {
		self.hits.load(Ordering::Relaxed)
	}

	pub fn misses(&self) -> u64 {
		self.misses.load(Ordering::Relaxed)
	}

	pub fn hit_rate(&self) -> f64 {
		let hits = self.hits() as f64;
		let total = hits + self.misses() as f64;
		if total == 0.0 { 0.0 } else { hits / total }
	}
}

#[derive(Debug)]
struct BoundedCache<K: Hash + Eq, V> {
	name: &'static str,
	entries: Mutex<LruCache<K, V>>,
	stats: CacheStats,
}

impl<K: Hash + Eq + Clone, V: Clone> BoundedCache<K, V> {
	fn new(name: &'static str, capacity: usize) -> DedupResult<Self> {
		let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
			DedupError::Config(format!("{name} cache capacity must be greater than 0"))
		})?;
		Ok(Self {
			name,
			entries: Mutex::new(LruCache::new(capacity)),
			stats: CacheStats::default(),
		})
	}

	fn get(&self, key: &K) -> Option<V> {
		// A poisoned cache behaves as empty; the store still answers.
		let found = self.entries.lock().ok().and_then(|mut lru| lru.get(key).cloned());
		match found {
			Some(_) => self.stats.hits.fetch_add(1, Ordering::Relaxed),
			None => self.stats.misses.fetch_add(1, Ordering::Relaxed),
		};
		found
	}

	fn put(&self, key: K, value: V) {
		if let Ok(mut lru) = self.entries.lock() {
			lru.put(key, value);
		}
	}

	fn evict(&self, key: &K) -> bool {
		let evicted = self
			.entries
			.lock()
			.ok()
			.and_then(|mut lru| lru.pop(key))
			.is_some();
		if evicted {
			trace!("Cache[{}]: evicted entry", self.name);
		}
		evicted
	}

	fn evict_where(&self, mut predicate: impl FnMut(&K) -> bool) -> usize {
		let Ok(mut lru) = self.entries.lock() else {
			return 0;
		};
		let doomed: Vec<K> = lru
			.iter()
			.filter(|(k, _)| predicate(k))
			.map(|(k, _)| k)
			.cloned()
			.collect();
		for key in &doomed {
			lru.pop(key);
		}
		doomed.len()
	}

	fn len(&self) -> usize {
		self.entries.lock().map(|lru| lru.len()).unwrap_or(0)
	}

	fn cap(&self) -> usize {
		self.entries.lock().map(|lru| lru.cap().get()).unwrap_or(0)
	}
}

/// Folder path → folder id, file path → file row.
#[derive(Debug)]
pub struct PathCaches {
	folders: BoundedCache<FolderPath, FolderId>,
	files: BoundedCache<FilePath, FileRow>,
}

impl PathCaches {
	pub fn new(folder_capacity: usize, file_capacity: usize) -> DedupResult<Self> {
		debug!(
			"PathCaches: init with folders={} files={}",
			folder_capacity, file_capacity
		);
		Ok(Self {
			folders: BoundedCache::new("folders", folder_capacity)?,
			files: BoundedCache::new("files", file_capacity)?,
		})
	}

	pub fn with_defaults() -> DedupResult<Self> {
		Self::new(DEFAULT_FOLDER_CACHE_CAPACITY, DEFAULT_FILE_CACHE_CAPACITY)
	}

	pub fn folder(&self, path: &FolderPath) -> Option<FolderId> {
		self.folders.get(path)
	}

	pub fn put_folder(&self, path: FolderPath, id: FolderId) {
		self.folders.put(path, id);
	}

	pub fn evict_folder(&self, path: &FolderPath) -> bool {
		self.folders.evict(path)
	}

	/// Evict a folder, every cached folder below it and every cached file inside them.
	pub fn evict_subtree(&self, root: &FolderPath) -> usize {
		self.folders.evict_where(|path| path.starts_with(root))
			+ self.files.evict_where(|path| path.folder().starts_with(root))
	}

	pub fn file(&self, path: &FilePath) -> Option<FileRow> {
		self.files.get(path)
	}

	pub fn put_file(&self, path: FilePath, row: FileRow) {
		self.files.put(path, row);
	}

	pub fn evict_file(&self, path: &FilePath) -> bool {
		self.files.evict(path)
	}

	pub fn folder_stats(&self) -> &CacheStats {
		&self.folders.stats
	}

	pub fn file_stats(&self) -> &CacheStats {
		&self.files.stats
	}

	/// (folders cached, folder capacity, files cached, file capacity)
	pub fn usage(&self) -> (usize, usize, usize, usize) {
		(
			self.folders.len(),
			self.folders.cap(),
			self.files.len(),
			self.files.cap(),
		)
	}
}
