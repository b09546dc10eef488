//! Path Store: folder and file identities from absolute paths
//!
//! Folder resolution is delegated to a [`FolderIndex`] strategy:
//! - [`FlatFolderIndex`] (default) stores the ancestor-name chain as fixed
//!   positional levels and resolves with one equality lookup, bounded by
//!   [`MAX_FOLDER_DEPTH`](crate::paths::MAX_FOLDER_DEPTH);
//! - [`AdjacencyFolderIndex`] stores parent pointers, has no depth bound and
//!   needs a backtracking search to disambiguate same-named folders.
//!
//! Both sit behind the same pair of bounded LRU caches.

mod adjacency;
mod cache;
mod flat;

pub use adjacency::AdjacencyFolderIndex;
pub use cache::{CacheStats, DEFAULT_FILE_CACHE_CAPACITY, DEFAULT_FOLDER_CACHE_CAPACITY, PathCaches};
pub use flat::FlatFolderIndex;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

use crate::error::DedupResult;
use crate::paths::{FilePath, FolderPath};
use crate::store::{FileRow, FolderId, Store};

/// A folder storage strategy.
pub trait FolderIndex: Send + Sync + fmt::Debug {
	fn name(&self) -> &'static str;

	/// Look up an existing folder. Never writes.
	fn resolve(&self, store: &Store, path: &FolderPath) -> DedupResult<Option<FolderId>>;

	/// Resolve or create the folder and whatever it needs along the way.
	/// Path validation happens before the first write.
	fn create(&self, store: &Store, path: &FolderPath) -> DedupResult<FolderId>;

	/// Rebuild the path of a folder created by this index.
	fn folder_path(&self, store: &Store, id: FolderId) -> DedupResult<Option<FolderPath>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
	#[default]
	Flat,
	Adjacency,
}

impl IndexKind {
	pub fn build(self) -> Box<dyn FolderIndex> {
		match self {
			IndexKind::Flat => Box::new(FlatFolderIndex::new()),
			IndexKind::Adjacency => Box::new(AdjacencyFolderIndex::new()),
		}
	}
}

/// Entries, capacity, hits and misses of both caches.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheReport {
	pub folder_entries: usize,
	pub folder_capacity: usize,
	pub folder_hits: u64,
	pub folder_misses: u64,
	pub file_entries: usize,
	pub file_capacity: usize,
	pub file_hits: u64,
	pub file_misses: u64,
}

#[derive(Debug)]
pub struct PathStore {
	store: Arc<Store>,
	index: Box<dyn FolderIndex>,
	caches: PathCaches,
}

impl PathStore {
	pub fn new(store: Arc<Store>, index: Box<dyn FolderIndex>, caches: PathCaches) -> Self {
		Self {
			store,
			index,
			caches,
		}
	}

	/// Flat index, default cache capacities.
	pub fn with_defaults(store: Arc<Store>) -> DedupResult<Self> {
		Ok(Self::new(store, IndexKind::Flat.build(), PathCaches::with_defaults()?))
	}

	pub fn store(&self) -> &Arc<Store> {
		&self.store
	}

	pub fn index_name(&self) -> &'static str {
		self.index.name()
	}

	pub fn resolve_folder(&self, path: &FolderPath) -> DedupResult<Option<FolderId>> {
		if let Some(id) = self.caches.folder(path) {
			return Ok(Some(id));
		}
		let found = self.index.resolve(&self.store, path)?;
		if let Some(id) = found {
			self.caches.put_folder(path.clone(), id);
		}
		Ok(found)
	}

	pub fn create_folder(&self, path: &FolderPath) -> DedupResult<FolderId> {
		if let Some(id) = self.caches.folder(path) {
			return Ok(id);
		}
		let id = self.index.create(&self.store, path)?;
		trace!("PathStore: created {} as {:?}", path, id);
		self.caches.put_folder(path.clone(), id);
		Ok(id)
	}

	pub fn folder_path(&self, id: FolderId) -> DedupResult<Option<FolderPath>> {
		self.index.folder_path(&self.store, id)
	}

	/// Resolve a file to its stored row, through the file cache.
	pub fn resolve_file(&self, path: &FilePath) -> DedupResult<Option<FileRow>> {
		if let Some(row) = self.caches.file(path) {
			return Ok(Some(row));
		}
		let Some(folder) = self.resolve_folder(&path.folder())? else {
			return Ok(None);
		};
		let row = self.store.file_in_folder(folder, path.file_name())?;
		if let Some(row) = &row {
			self.caches.put_file(path.clone(), row.clone());
		}
		Ok(row)
	}

	/// Full path of a stored file row.
	pub fn file_path(&self, row: &FileRow) -> DedupResult<Option<FilePath>> {
		Ok(self
			.folder_path(row.folder)?
			.map(|folder| folder.join_file(&row.name)))
	}

	/// Record a freshly committed row. Call only after the commit succeeded.
	pub fn cache_file(&self, path: FilePath, row: FileRow) {
		self.caches.put_file(path, row);
	}

	pub fn evict_file(&self, path: &FilePath) {
		self.caches.evict_file(path);
	}

	/// Evict a folder, its subfolders and their files from both caches.
	pub fn evict_folder(&self, path: &FolderPath) -> usize {
		self.caches.evict_subtree(path)
	}

	pub fn cache_stats(&self) -> CacheReport {
		let (folder_entries, folder_capacity, file_entries, file_capacity) = self.caches.usage();
		CacheReport {
			folder_entries,
			folder_capacity,
			folder_hits: self.caches.folder_stats().hits(),
			folder_misses: self.caches.folder_stats().misses(),
			file_entries,
			file_capacity,
			file_hits: self.caches.file_stats().hits(),
			file_misses: self.caches.file_stats().misses(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::DedupError;
	use crate::paths::MAX_FOLDER_DEPTH;
	use chrono::Utc;

	fn folder(rel: &str) -> FolderPath {
		FolderPath::new(std::env::temp_dir().join(rel)).unwrap()
	}

	fn path_store(kind: IndexKind) -> PathStore {
		PathStore::new(
			Arc::new(Store::in_memory().unwrap()),
			kind.build(),
			PathCaches::new(16, 16).unwrap(),
		)
	}

	#[test_log::test]
	fn test_index_kind_from_json() {
		let kind: IndexKind = serde_json::from_str("\"adjacency\"").unwrap();
		assert_eq!(kind, IndexKind::Adjacency);
		assert_eq!(IndexKind::default().build().name(), "flat");
	}

	#[test_log::test]
	fn test_resolve_goes_through_cache() {
		for kind in [IndexKind::Flat, IndexKind::Adjacency] {
			let paths = path_store(kind);
			let path = folder("cached/folder");
			let id = paths.create_folder(&path).unwrap();

			assert_eq!(paths.resolve_folder(&path).unwrap(), Some(id));
			let stats = paths.cache_stats();
			assert_eq!(stats.folder_hits, 1);
			assert_eq!(stats.folder_entries, 1);
			assert_eq!(paths.folder_path(id).unwrap(), Some(path));
		}
	}

	#[test_log::test]
	fn test_removed_file_is_not_served_from_cache() {
		let paths = path_store(IndexKind::Flat);
		let folder_path = folder("f");
		let file = folder_path.join_file("x.bin");
		let folder_id = paths.create_folder(&folder_path).unwrap();

		let mut tx = paths.store().begin();
		let id = tx.insert_file(folder_id, "x.bin", 4, Utc::now());
		tx.commit().unwrap();
		let row = paths.resolve_file(&file).unwrap().unwrap();
		assert_eq!(row.id, id);
		assert_eq!(paths.file_path(&row).unwrap(), Some(file.clone()));

		let mut tx = paths.store().begin();
		tx.delete_file(id);
		tx.commit().unwrap();
		paths.evict_file(&file);
		assert_eq!(paths.resolve_file(&file).unwrap(), None);
	}

	#[test_log::test]
	fn test_flat_depth_bound_leaves_cache_untouched() {
		let paths = path_store(IndexKind::Flat);
		let deep = folder(&vec!["d"; MAX_FOLDER_DEPTH + 1].join("/"));
		assert!(matches!(
			paths.create_folder(&deep),
			Err(DedupError::DepthExceeded { .. })
		));
		assert_eq!(paths.cache_stats().folder_entries, 0);
		assert_eq!(paths.store().counts().unwrap().folders, 0);
	}
}
