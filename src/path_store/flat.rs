//! Flattened-depth folder index
//!
//! A folder is stored as `(depth, level₀ … level_depth-1)` where every level is
//! a folder-name id. Resolution is a single equality lookup; nothing walks
//! parent links. The price is the [`MAX_FOLDER_DEPTH`] bound.

use std::collections::HashMap;
use tracing::{debug, trace};

use super::FolderIndex;
use crate::error::{DedupResult, StoreError};
use crate::paths::{FolderPath, MAX_FOLDER_DEPTH};
use crate::store::{FolderId, FolderLevels, NameId, Store};

#[derive(Debug, Default)]
pub struct FlatFolderIndex;

impl FlatFolderIndex {
	pub fn new() -> Self {
		Self
	}

	/// Insert every missing name, falling back to a re-read whenever another
	/// writer inserted the same name first.
	fn ensure_names(store: &Store, segments: &[String]) -> DedupResult<HashMap<String, NameId>> {
		let mut ids = store.name_ids(segments)?;
		for segment in segments {
			if ids.contains_key(segment) {
				continue;
			}
			let id = match store.insert_name(segment) {
				Ok(id) => id,
				Err(StoreError::UniqueViolation { .. }) => {
					trace!("FlatIndex: name '{}' created concurrently, re-reading", segment);
					let existing = store.name_ids(std::slice::from_ref(segment))?;
					match existing.get(segment) {
						Some(id) => *id,
						None => {
							return Err(StoreError::UniqueViolation {
								table: "folder_names",
								key: segment.clone(),
							}
							.into());
						}
					}
				}
				Err(e) => return Err(e.into()),
			};
			ids.insert(segment.clone(), id);
		}
		Ok(ids)
	}

	fn levels_for(segments: &[String], names: &HashMap<String, NameId>) -> Option<FolderLevels> {
		let mut levels = [None; MAX_FOLDER_DEPTH];
		for (slot, segment) in levels.iter_mut().zip(segments) {
			*slot = Some(*names.get(segment)?);
		}
		Some(levels)
	}

	fn find_or_insert(store: &Store, depth: usize, levels: FolderLevels) -> DedupResult<FolderId> {
		if let Some(row) = store.find_folder(depth, &levels)? {
			return Ok(row.id);
		}
		match store.insert_folder(depth, levels) {
			Ok(row) => Ok(row.id),
			Err(StoreError::UniqueViolation { .. }) => store
				.find_folder(depth, &levels)?
				.map(|row| row.id)
				.ok_or_else(|| {
					StoreError::UniqueViolation {
						table: "folders",
						key: format!("depth {depth}"),
					}
					.into()
				}),
			Err(e) => Err(e.into()),
		}
	}
}

impl FolderIndex for FlatFolderIndex {
	fn name(&self) -> &'static str {
		"flat"
	}

	fn resolve(&self, store: &Store, path: &FolderPath) -> DedupResult<Option<FolderId>> {
		let segments = path.segments()?;
		let names = store.name_ids(&segments)?;
		let Some(levels) = Self::levels_for(&segments, &names) else {
			return Ok(None);
		};
		Ok(store.find_folder(segments.len(), &levels)?.map(|row| row.id))
	}

	fn create(&self, store: &Store, path: &FolderPath) -> DedupResult<FolderId> {
		// Fails with DepthExceeded before anything is written
		let segments = path.segments()?;
		let names = Self::ensure_names(store, &segments)?;

		let mut levels = [None; MAX_FOLDER_DEPTH];
		let mut id = None;
		for (depth, segment) in segments.iter().enumerate() {
			levels[depth] = names.get(segment).copied();
			id = Some(Self::find_or_insert(store, depth + 1, levels)?);
		}
		let id = id.ok_or_else(|| crate::error::DedupError::InvalidPath {
			path: path.to_string(),
			reason: "a folder path needs at least one segment".to_string(),
		})?;
		debug!("FlatIndex: folder {} -> {:?}", path, id);
		Ok(id)
	}

	fn folder_path(&self, store: &Store, id: FolderId) -> DedupResult<Option<FolderPath>> {
		let Some(row) = store.folder(id)? else {
			return Ok(None);
		};
		let segments = store.names_of(row.level_ids())?;
		Ok(Some(FolderPath::from_segments(&segments)))
	}
}
