//! Folder configuration events, file change events and the file event reducer

use tracing::{debug, trace};

use crate::error::DedupResult;
use crate::paths::FolderPath;
use crate::registry::{FileSnapshot, Registry};

/// Transitions of the Input/Ignore/Output folder sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderEvent {
	InputAdded(FolderPath),
	InputRemoved(FolderPath),
	IgnoreAdded(FolderPath),
	IgnoreRemoved(FolderPath),
	OutputAdded(FolderPath),
	OutputRemoved(FolderPath),
}

impl FolderEvent {
	pub fn folder(&self) -> &FolderPath {
		match self {
			FolderEvent::InputAdded(f)
			| FolderEvent::InputRemoved(f)
			| FolderEvent::IgnoreAdded(f)
			| FolderEvent::IgnoreRemoved(f)
			| FolderEvent::OutputAdded(f)
			| FolderEvent::OutputRemoved(f) => f,
		}
	}
}

/// A change to one file, consumed once off the event queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
	Added(FileSnapshot),
	Removed(FileSnapshot),
	Updated(FileSnapshot),
}

impl FileEvent {
	pub fn snapshot(&self) -> &FileSnapshot {
		match self {
			FileEvent::Added(s) | FileEvent::Removed(s) | FileEvent::Updated(s) => s,
		}
	}
}

/// What applying one event did to the Registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
	/// Entry written or already identical
	Stored,
	/// Entry removed
	Removed,
	/// Attributes dropped
	Invalidated,
	/// Nothing matched, e.g. a Remove or Add for an entry already replaced
	Skipped,
}

/// Apply a file event to the Registry.
///
/// - `Added` stores the snapshot only when nothing is stored at its path. An
///   identical entry counts as stored; a different one is newer and is kept.
/// - `Removed` deletes the entry only while it still equals the removed snapshot,
///   so a Remove followed by an Add for a changed file keeps the new entry.
/// - `Updated` drops every attribute of the file so no stale fingerprint can be
///   matched against new content.
pub fn apply_file_event(registry: &Registry, event: &FileEvent) -> DedupResult<Applied> {
	let applied = match event {
		FileEvent::Added(snapshot) => match registry.add_if_absent(snapshot)? {
			Some(_) => Applied::Stored,
			None => Applied::Skipped,
		},
		FileEvent::Removed(snapshot) => {
			if registry.remove_matching(snapshot)? {
				Applied::Removed
			} else {
				Applied::Skipped
			}
		}
		FileEvent::Updated(snapshot) => {
			if registry.clear_attributes(&snapshot.path)? {
				Applied::Invalidated
			} else {
				Applied::Skipped
			}
		}
	};
	trace!("Reducer: {:?} -> {:?}", event, applied);
	Ok(applied)
}

/// Counts per outcome for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReduceSummary {
	pub stored: usize,
	pub removed: usize,
	pub invalidated: usize,
	pub skipped: usize,
}

/// Apply a batch in order. Stops at the first store error.
pub fn apply_file_events(registry: &Registry, events: &[FileEvent]) -> DedupResult<ReduceSummary> {
	let mut summary = ReduceSummary::default();
	for event in events {
		match apply_file_event(registry, event)? {
			Applied::Stored => summary.stored += 1,
			Applied::Removed => summary.removed += 1,
			Applied::Invalidated => summary.invalidated += 1,
			Applied::Skipped => summary.skipped += 1,
		}
	}
	debug!("Reducer: applied {} events: {:?}", events.len(), summary);
	Ok(summary)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::paths::FilePath;
	use crate::store::AttributeKey;
	use chrono::{DateTime, TimeZone, Utc};

	fn snapshot(rel: &str, size: u64, secs: i64) -> FileSnapshot {
		let modified: DateTime<Utc> = Utc.timestamp_opt(secs, 0).unwrap();
		FileSnapshot::new(FilePath::new(std::env::temp_dir().join(rel)).unwrap(), size, modified)
	}

	#[test_log::test]
	fn test_remove_then_add_keeps_new_entry() {
		let registry = Registry::in_memory().unwrap();
		let old = snapshot("ev/a", 1, 1);
		let new = snapshot("ev/a", 2, 2);
		registry.add(&old).unwrap();
		// The scan already wrote the new entry before emitting its events
		registry.add(&new).unwrap();

		let summary = apply_file_events(
			&registry,
			&[FileEvent::Removed(old), FileEvent::Added(new.clone())],
		)
		.unwrap();
		assert_eq!(summary.skipped, 1);
		assert_eq!(summary.stored, 1);
		let row = registry.file(&new.path).unwrap().unwrap();
		assert_eq!(row.size, 2);
	}

	#[test_log::test]
	fn test_stale_add_keeps_newer_entry() {
		let registry = Registry::in_memory().unwrap();
		let key = AttributeKey::new("content.blake3");
		let s1 = snapshot("ev/stale", 1, 1);
		let s2 = snapshot("ev/stale", 2, 2);
		registry.add(&s1).unwrap();
		let id = registry.add(&s2).unwrap();
		registry.set_attribute(id, &key, "fresh").unwrap();

		assert_eq!(
			apply_file_event(&registry, &FileEvent::Added(s1)).unwrap(),
			Applied::Skipped
		);
		let row = registry.file(&s2.path).unwrap().unwrap();
		assert_eq!((row.id, row.size), (id, 2));
		assert_eq!(registry.attributes(id).unwrap()[0].value, "fresh");

		// Re-applying the current entry's event changes nothing either
		let counts = registry.store().counts().unwrap();
		assert_eq!(
			apply_file_event(&registry, &FileEvent::Added(s2)).unwrap(),
			Applied::Stored
		);
		assert_eq!(registry.store().counts().unwrap(), counts);
	}

	#[test_log::test]
	fn test_update_drops_attributes() {
		let registry = Registry::in_memory().unwrap();
		let key = AttributeKey::new("content.blake3");
		let s = snapshot("ev/u", 1, 1);
		let id = registry.add(&s).unwrap();
		registry.set_attribute(id, &key, "stale").unwrap();

		assert_eq!(
			apply_file_event(&registry, &FileEvent::Updated(s.clone())).unwrap(),
			Applied::Invalidated
		);
		assert!(registry.attributes(id).unwrap().is_empty());
		assert_eq!(
			apply_file_event(&registry, &FileEvent::Removed(s.clone())).unwrap(),
			Applied::Removed
		);
		assert_eq!(
			apply_file_event(&registry, &FileEvent::Updated(s)).unwrap(),
			Applied::Skipped
		);
	}

	#[test_log::test]
	fn test_folder_event_accessor() {
		let folder = FolderPath::new(std::env::temp_dir()).unwrap();
		assert_eq!(FolderEvent::IgnoreAdded(folder.clone()).folder(), &folder);
	}
}
