//! Content hashing plugin (blake3)

use std::io;
use tracing::trace;

use super::DuplicatePlugin;
use crate::error::DedupResult;
use crate::fs::FileSystem;
use crate::paths::FilePath;
use crate::query::FileEntry;
use crate::registry::Registry;
use crate::store::AttributeKey;

pub const CONTENT_HASH_KEY: &str = "content.blake3";

/// Exact duplicates by blake3 digest of the whole file.
///
/// Only files that lack a digest and share their size with at least one other
/// such file are hashed; a file unique in size cannot have a content duplicate.
#[derive(Debug)]
pub struct ContentHashPlugin {
	key: AttributeKey,
}

impl Default for ContentHashPlugin {
	fn default() -> Self {
		Self::new()
	}
}

impl ContentHashPlugin {
	pub fn new() -> Self {
		Self {
			key: AttributeKey::new(CONTENT_HASH_KEY),
		}
	}
}

impl DuplicatePlugin for ContentHashPlugin {
	fn identifier(&self) -> &str {
		"ContentHash"
	}

	fn key(&self) -> &AttributeKey {
		&self.key
	}

	fn candidates(&self, registry: &Registry) -> DedupResult<Vec<FileEntry>> {
		Ok(registry.size_collisions(&self.key)?.into_files())
	}

	fn calculate(&self, path: &FilePath, fs: &dyn FileSystem) -> DedupResult<String> {
		let mut reader = fs.open_read(path)?;
		let mut hasher = blake3::Hasher::new();
		let bytes = io::copy(&mut reader, &mut hasher)?;
		let digest = hasher.finalize().to_hex().to_string();
		trace!("Hashed {} ({} bytes)", path, bytes);
		Ok(digest)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::fs::LocalFileSystem;
	use crate::registry::FileSnapshot;
	use crate::store::FileId;
	use chrono::Utc;
	use std::fs;
	use tempfile::TempDir;

	#[test_log::test]
	fn test_candidates_skip_unique_sizes_and_hashed_files() {
		let registry = Registry::in_memory().unwrap();
		let plugin = ContentHashPlugin::new();
		let add = |name: &str, size| {
			let path = FilePath::new(std::env::temp_dir().join("hash").join(name)).unwrap();
			registry.add(&FileSnapshot::new(path, size, Utc::now())).unwrap()
		};
		let a = add("a", 4);
		let b = add("b", 4);
		add("c", 7);
		let d = add("d", 9);
		let e = add("e", 9);
		registry.set_attribute(d, plugin.key(), "done").unwrap();

		let ids: Vec<FileId> = plugin.candidates(&registry).unwrap().iter().map(|f| f.id).collect();
		assert_eq!(ids, vec![a, b]);
		assert!(!ids.contains(&e));

		// Once d's digest is dropped, e has a partner again
		registry.clear_attributes(&FilePath::new(std::env::temp_dir().join("hash/d")).unwrap()).unwrap();
		let ids: Vec<FileId> = plugin.candidates(&registry).unwrap().iter().map(|f| f.id).collect();
		assert_eq!(ids, vec![a, b, d, e]);
	}

	#[test_log::test]
	fn test_calculate_streams_blake3() {
		let temp_dir = TempDir::new().unwrap();
		fs::write(temp_dir.path().join("x.bin"), "AAAA").unwrap();
		let path = FilePath::new(temp_dir.path().join("x.bin")).unwrap();

		let digest = ContentHashPlugin::new()
			.calculate(&path, &LocalFileSystem::new())
			.unwrap();
		assert_eq!(digest, blake3::hash(b"AAAA").to_hex().to_string());
	}

	#[test_log::test]
	fn test_calculate_missing_file_fails() {
		let temp_dir = TempDir::new().unwrap();
		let path = FilePath::new(temp_dir.path().join("gone.bin")).unwrap();
		assert!(ContentHashPlugin::new()
			.calculate(&path, &LocalFileSystem::new())
			.is_err());
	}

	#[test_log::test]
	fn test_find_duplicates_drops_singletons() {
		let registry = Registry::in_memory().unwrap();
		let plugin = ContentHashPlugin::new();
		let ids: Vec<FileId> = ["1", "2", "3"]
			.iter()
			.map(|name| {
				let path = FilePath::new(std::env::temp_dir().join("dups").join(name)).unwrap();
				registry.add(&FileSnapshot::new(path, 4, Utc::now())).unwrap()
			})
			.collect();
		registry.set_attribute(ids[0], plugin.key(), "h1").unwrap();
		registry.set_attribute(ids[1], plugin.key(), "h1").unwrap();
		registry.set_attribute(ids[2], plugin.key(), "h2").unwrap();

		let query = registry.attribute_query(plugin.key()).unwrap();
		assert_eq!(plugin.find_duplicates(&query), vec![vec![ids[0], ids[1]]]);
	}
}
