//! Read views over the Registry handed to duplicate plugins
//!
//! Both queries are point-in-time copies: a plugin can iterate and filter them
//! freely while the scan worker keeps writing to the store. Grouping itself
//! happens in SQL before the copy is taken.
//!
//! ## Query Categories
//!
//! ### [`FileQuery`]
//! - every stored file with its full path, size, modified time and attributes
//! - files lacking a given attribute key
//! - files lacking a key whose size collides with another such file
//!
//! ### [`AttributeQuery`]
//! - every attribute row for one key
//! - groups of files sharing a value, which is how duplicates are found
//!
//! ```rust
//! use dupwatch::{AttributeKey, FileSnapshot, FilePath, Registry};
//! use chrono::Utc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Registry::in_memory()?;
//! let path = FilePath::new(std::env::temp_dir().join("q/a.bin"))?;
//! registry.add(&FileSnapshot::new(path, 4, Utc::now()))?;
//!
//! let key = AttributeKey::new("content.blake3");
//! let query = registry.file_query()?;
//! assert_eq!(query.without_attribute(&key).count(), 1);
//! // A file alone in its size cannot collide
//! assert!(registry.size_collisions(&key)?.is_empty());
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

use crate::error::DedupResult;
use crate::path_store::PathStore;
use crate::paths::{FilePath, FolderPath};
use crate::store::{AttributeKey, AttributeRow, FileId, FileRow, FolderId, Store};

/// One stored file with everything a plugin may select on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
	pub id: FileId,
	pub path: FilePath,
	pub size: u64,
	pub modified: DateTime<Utc>,
	pub attributes: BTreeMap<AttributeKey, String>,
}

impl FileEntry {
	pub fn attribute(&self, key: &AttributeKey) -> Option<&str> {
		self.attributes.get(key).map(String::as_str)
	}
}

#[derive(Debug, Clone, Default)]
pub struct FileQuery {
	files: Vec<FileEntry>,
}

impl FileQuery {
	pub(crate) fn load(paths: &PathStore) -> DedupResult<Self> {
		let rows = paths.store().all_files()?;
		Self::from_rows(paths, rows)
	}

	/// Files without `key` that share their size with another such file.
	pub(crate) fn load_size_collisions(paths: &PathStore, key: &AttributeKey) -> DedupResult<Self> {
		let rows = paths.store().size_collisions(key)?;
		Self::from_rows(paths, rows)
	}

	fn from_rows(paths: &PathStore, rows: Vec<FileRow>) -> DedupResult<Self> {
		let store = paths.store();
		let mut folders: HashMap<FolderId, Option<FolderPath>> = HashMap::new();
		let mut files = Vec::with_capacity(rows.len());
		for row in rows {
			let folder = match folders.get(&row.folder) {
				Some(folder) => folder.clone(),
				None => {
					let folder = paths.folder_path(row.folder)?;
					folders.insert(row.folder, folder.clone());
					folder
				}
			};
			// Rows whose folder cannot be rebuilt are not addressable by path
			let Some(folder) = folder else {
				continue;
			};
			let attributes = store
				.attributes_of(row.id)?
				.into_iter()
				.map(|attribute| (attribute.key, attribute.value))
				.collect();
			files.push(FileEntry {
				id: row.id,
				path: folder.join_file(&row.name),
				size: row.size,
				modified: row.modified,
				attributes,
			});
		}
		Ok(Self { files })
	}

	pub fn files(&self) -> &[FileEntry] {
		&self.files
	}

	pub fn len(&self) -> usize {
		self.files.len()
	}

	pub fn is_empty(&self) -> bool {
		self.files.is_empty()
	}

	pub fn get(&self, id: FileId) -> Option<&FileEntry> {
		self.files.iter().find(|file| file.id == id)
	}

	/// Files with no `key` attribute. The iterator only borrows the query.
	pub fn without_attribute<'a>(
		&'a self,
		key: &AttributeKey,
	) -> impl Iterator<Item = &'a FileEntry> + use<'a> {
		let key = key.clone();
		self.files.iter().filter(move |file| !file.attributes.contains_key(&key))
	}

	pub fn into_files(self) -> Vec<FileEntry> {
		self.files
	}
}

#[derive(Debug, Clone)]
pub struct AttributeQuery {
	key: AttributeKey,
	rows: Vec<AttributeRow>,
	groups: Vec<Vec<FileId>>,
}

impl AttributeQuery {
	pub(crate) fn load(store: &Store, key: &AttributeKey) -> DedupResult<Self> {
		Ok(Self {
			key: key.clone(),
			rows: store.attributes_with_key(key)?,
			groups: store.value_groups(key)?,
		})
	}

	pub fn key(&self) -> &AttributeKey {
		&self.key
	}

	pub fn rows(&self) -> &[AttributeRow] {
		&self.rows
	}

	pub fn len(&self) -> usize {
		self.rows.len()
	}

	pub fn is_empty(&self) -> bool {
		self.rows.is_empty()
	}

	/// File ids sharing a value with at least one other file, one group per
	/// value; ids within a group keep file-id order.
	pub fn shared_values(&self) -> &[Vec<FileId>] {
		&self.groups
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::registry::{FileSnapshot, Registry};

	fn file(rel: &str) -> FilePath {
		FilePath::new(std::env::temp_dir().join(rel)).unwrap()
	}

	#[test_log::test]
	fn test_file_query_carries_paths_and_attributes() {
		let registry = Registry::in_memory().unwrap();
		let key = AttributeKey::new("k");
		let a = registry.add(&FileSnapshot::new(file("fq/a"), 4, Utc::now())).unwrap();
		registry.add(&FileSnapshot::new(file("fq/sub/b"), 4, Utc::now())).unwrap();
		registry.add(&FileSnapshot::new(file("fq/c"), 9, Utc::now())).unwrap();
		registry.set_attribute(a, &key, "v").unwrap();

		let query = registry.file_query().unwrap();
		assert_eq!(query.len(), 3);
		assert_eq!(query.get(a).unwrap().path, file("fq/a"));
		assert_eq!(query.get(a).unwrap().attribute(&key), Some("v"));

		let missing: Vec<_> = query.without_attribute(&key).map(|f| f.path.clone()).collect();
		assert_eq!(missing, vec![file("fq/sub/b"), file("fq/c")]);
	}

	#[test_log::test]
	fn test_filtered_entries_outlive_the_key() {
		let registry = Registry::in_memory().unwrap();
		registry.add(&FileSnapshot::new(file("fk/a"), 1, Utc::now())).unwrap();
		let query = registry.file_query().unwrap();

		let pending: Vec<&FileEntry> = {
			let key = AttributeKey::new("short.lived");
			query.without_attribute(&key).collect()
		};
		assert_eq!(pending.len(), 1);
	}

	#[test_log::test]
	fn test_size_collisions_carry_paths() {
		let registry = Registry::in_memory().unwrap();
		let key = AttributeKey::new("k");
		registry.add(&FileSnapshot::new(file("sc/a"), 4, Utc::now())).unwrap();
		registry.add(&FileSnapshot::new(file("sc/deep/b"), 4, Utc::now())).unwrap();
		registry.add(&FileSnapshot::new(file("sc/c"), 9, Utc::now())).unwrap();

		let paths: Vec<FilePath> = registry
			.size_collisions(&key)
			.unwrap()
			.into_files()
			.into_iter()
			.map(|f| f.path)
			.collect();
		assert_eq!(paths, vec![file("sc/a"), file("sc/deep/b")]);
	}

	#[test_log::test]
	fn test_attribute_query_groups_by_value() {
		let registry = Registry::in_memory().unwrap();
		let key = AttributeKey::new("k");
		let other = AttributeKey::new("other");
		let ids: Vec<FileId> = ["aq/1", "aq/2", "aq/3", "aq/4"]
			.iter()
			.map(|rel| registry.add(&FileSnapshot::new(file(rel), 1, Utc::now())).unwrap())
			.collect();
		registry.set_attribute(ids[0], &key, "h1").unwrap();
		registry.set_attribute(ids[1], &key, "h2").unwrap();
		registry.set_attribute(ids[2], &key, "h1").unwrap();
		registry.set_attribute(ids[3], &other, "h1").unwrap();

		let query = registry.attribute_query(&key).unwrap();
		assert_eq!(query.len(), 3);
		assert_eq!(query.shared_values(), &[vec![ids[0], ids[2]]]);
	}
}
