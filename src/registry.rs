//! Registry: files and per-file attributes on top of the Path Store
//!
//! File identity is the path. Every write goes through one store transaction
//! and the caches are only touched after that transaction committed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::{DedupError, DedupResult, StoreError};
use crate::path_store::PathStore;
use crate::paths::{FilePath, FolderPath};
use crate::query::{AttributeQuery, FileQuery};
use crate::store::{AttributeKey, AttributeRow, FileId, FileRow, Store, Transaction};

/// What change detection compares: two snapshots are equal iff path, size and
/// modified time all match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileSnapshot {
	pub path: FilePath,
	pub size: u64,
	pub modified: DateTime<Utc>,
}

impl FileSnapshot {
	pub fn new(path: FilePath, size: u64, modified: DateTime<Utc>) -> Self {
		Self {
			path,
			size,
			modified,
		}
	}

	/// Same content metadata as a stored row (the path is assumed to match).
	pub fn matches(&self, row: &FileRow) -> bool {
		self.size == row.size && self.modified == row.modified
	}
}

/// What [`Registry::apply_diff`] committed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffApplied {
	/// Paths that had a stored entry and lost it
	pub removed: usize,
	/// One id per added snapshot, in input order
	pub ids: Vec<FileId>,
}

/// Rows written or removed by one transaction, applied to the caches after commit.
#[derive(Default)]
struct Staged<'a> {
	written: HashMap<&'a FilePath, FileRow>,
	removed: HashSet<&'a FilePath>,
}

#[derive(Debug)]
pub struct Registry {
	paths: PathStore,
}

impl Registry {
	pub fn new(paths: PathStore) -> Self {
		Self { paths }
	}

	/// In-memory store, flat index, default caches.
	pub fn in_memory() -> DedupResult<Self> {
		Ok(Self::new(PathStore::with_defaults(Arc::new(Store::in_memory()?))?))
	}

	pub fn path_store(&self) -> &PathStore {
		&self.paths
	}

	pub fn store(&self) -> &Store {
		self.paths.store()
	}

	/// Add or replace the file at `snapshot.path`. A snapshot identical to the
	/// stored one is a no-op and returns the existing id.
	pub fn add(&self, snapshot: &FileSnapshot) -> DedupResult<FileId> {
		let ids = self.add_batch(std::slice::from_ref(snapshot))?;
		// add_batch returns one id per input
		Ok(ids[0])
	}

	/// Same rule as [`Registry::add`] for every snapshot, committed once.
	pub fn add_batch(&self, snapshots: &[FileSnapshot]) -> DedupResult<Vec<FileId>> {
		let mut tx = self.paths.store().begin();
		let mut staged = Staged::default();
		let ids = self.stage_additions(&mut tx, snapshots, &mut staged)?;
		self.commit(tx, staged)?;
		Ok(ids)
	}

	/// Store `snapshot` only if nothing is stored at its path yet.
	///
	/// Returns the id when the stored entry equals `snapshot` afterwards, and
	/// `None` when a different entry was already there and was kept.
	pub fn add_if_absent(&self, snapshot: &FileSnapshot) -> DedupResult<Option<FileId>> {
		if let Some(row) = self.paths.resolve_file(&snapshot.path)? {
			return Ok(snapshot.matches(&row).then_some(row.id));
		}
		match self.add(snapshot) {
			Ok(id) => Ok(Some(id)),
			Err(DedupError::Store(StoreError::UniqueViolation { table: "files", .. })) => {
				trace!("Registry: {} stored concurrently, re-reading", snapshot.path);
				Ok(self
					.paths
					.resolve_file(&snapshot.path)?
					.filter(|row| snapshot.matches(row))
					.map(|row| row.id))
			}
			Err(e) => Err(e),
		}
	}

	/// Remove files and their attributes. Missing paths are skipped.
	/// Returns how many files were actually removed.
	pub fn remove(&self, paths: &[FilePath]) -> DedupResult<usize> {
		let mut tx = self.paths.store().begin();
		let mut staged = Staged::default();
		self.stage_removals(&mut tx, paths, &mut staged)?;
		let removed = staged.removed.len();
		self.commit(tx, staged)?;
		Ok(removed)
	}

	/// Remove `removed` and add `added` in one store transaction: either the
	/// whole folder diff lands or none of it does.
	pub fn apply_diff(&self, removed: &[FilePath], added: &[FileSnapshot]) -> DedupResult<DiffApplied> {
		let mut tx = self.paths.store().begin();
		let mut staged = Staged::default();
		self.stage_removals(&mut tx, removed, &mut staged)?;
		let removed_count = staged.removed.len();
		let ids = self.stage_additions(&mut tx, added, &mut staged)?;
		self.commit(tx, staged)?;
		Ok(DiffApplied {
			removed: removed_count,
			ids,
		})
	}

	fn stage_removals<'a>(
		&self,
		tx: &mut Transaction<'_>,
		paths: &'a [FilePath],
		staged: &mut Staged<'a>,
	) -> DedupResult<()> {
		for path in paths {
			if staged.removed.contains(path) {
				continue;
			}
			if let Some(row) = self.paths.resolve_file(path)? {
				// Attributes follow the row
				tx.delete_file(row.id);
				staged.removed.insert(path);
			}
		}
		Ok(())
	}

	fn stage_additions<'a>(
		&self,
		tx: &mut Transaction<'_>,
		snapshots: &'a [FileSnapshot],
		staged: &mut Staged<'a>,
	) -> DedupResult<Vec<FileId>> {
		let mut ids = Vec::with_capacity(snapshots.len());
		for snapshot in snapshots {
			let existing = match staged.written.get(&snapshot.path) {
				Some(row) => Some(row.clone()),
				None if staged.removed.contains(&snapshot.path) => None,
				None => self.paths.resolve_file(&snapshot.path)?,
			};
			if let Some(row) = &existing {
				if snapshot.matches(row) {
					trace!("Registry: {} unchanged", snapshot.path);
					ids.push(row.id);
					continue;
				}
				tx.delete_file(row.id);
			}

			let folder = self.paths.create_folder(&snapshot.path.folder())?;
			let name = snapshot.path.file_name();
			let id = tx.insert_file(folder, name, snapshot.size, snapshot.modified);
			staged.written.insert(
				&snapshot.path,
				FileRow {
					id,
					folder,
					name: name.to_string(),
					size: snapshot.size,
					modified: snapshot.modified,
				},
			);
			ids.push(id);
		}
		Ok(ids)
	}

	/// Commit, then bring the caches in line with what was written.
	fn commit(&self, tx: Transaction<'_>, staged: Staged<'_>) -> DedupResult<()> {
		if tx.is_empty() {
			return Ok(());
		}
		tx.commit()?;
		debug!(
			"Registry: committed {} file writes, {} removals",
			staged.written.len(),
			staged.removed.len()
		);
		for path in &staged.removed {
			if !staged.written.contains_key(*path) {
				self.paths.evict_file(path);
			}
		}
		for (path, row) in staged.written {
			self.paths.cache_file(path.clone(), row);
		}
		Ok(())
	}

	/// Remove the file only if the stored entry still equals `snapshot`.
	pub fn remove_matching(&self, snapshot: &FileSnapshot) -> DedupResult<bool> {
		match self.paths.resolve_file(&snapshot.path)? {
			Some(row) if snapshot.matches(&row) => {
				Ok(self.remove(std::slice::from_ref(&snapshot.path))? > 0)
			}
			_ => Ok(false),
		}
	}

	/// Upsert: afterwards exactly one attribute row exists for (file, key).
	pub fn set_attribute(&self, file: FileId, key: &AttributeKey, value: &str) -> DedupResult<()> {
		let mut tx = self.paths.store().begin();
		tx.upsert_attribute(file, key, value);
		tx.commit()?;
		Ok(())
	}

	/// Drop every attribute of a file. Returns false if the file is unknown.
	pub fn clear_attributes(&self, path: &FilePath) -> DedupResult<bool> {
		let Some(row) = self.paths.resolve_file(path)? else {
			return Ok(false);
		};
		let mut tx = self.paths.store().begin();
		tx.delete_attributes(row.id);
		tx.commit()?;
		trace!("Registry: cleared attributes of {}", path);
		Ok(true)
	}

	pub fn file(&self, path: &FilePath) -> DedupResult<Option<FileRow>> {
		self.paths.resolve_file(path)
	}

	pub fn attributes(&self, file: FileId) -> DedupResult<Vec<AttributeRow>> {
		Ok(self.paths.store().attributes_of(file)?)
	}

	/// Stored state of one folder's direct files. Unknown folders are empty.
	pub fn files_in_folder(&self, folder: &FolderPath) -> DedupResult<Vec<FileSnapshot>> {
		let Some(id) = self.paths.resolve_folder(folder)? else {
			return Ok(Vec::new());
		};
		let rows = self.paths.store().files_in_folder(id)?;
		Ok(rows
			.into_iter()
			.map(|row| {
				let path = folder.join_file(&row.name);
				let snapshot = FileSnapshot::new(path.clone(), row.size, row.modified);
				self.paths.cache_file(path, row);
				snapshot
			})
			.collect())
	}

	pub fn file_query(&self) -> DedupResult<FileQuery> {
		FileQuery::load(&self.paths)
	}

	/// Files without `key` whose size is shared by another such file.
	pub fn size_collisions(&self, key: &AttributeKey) -> DedupResult<FileQuery> {
		FileQuery::load_size_collisions(&self.paths, key)
	}

	pub fn attribute_query(&self, key: &AttributeKey) -> DedupResult<AttributeQuery> {
		AttributeQuery::load(self.paths.store(), key)
	}
}
