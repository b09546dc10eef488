//! Folder configuration and engine settings

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{DedupError, DedupResult};
use crate::events::FolderEvent;
use crate::path_store::{DEFAULT_FILE_CACHE_CAPACITY, DEFAULT_FOLDER_CACHE_CAPACITY, IndexKind};
use crate::paths::FolderPath;

/// Which folder set a folder belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderKind {
	Input,
	Ignore,
	Output,
}

/// Input, Ignore and Output folders. A folder is in at most one set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
	#[serde(default)]
	pub input: BTreeSet<FolderPath>,
	#[serde(default)]
	pub ignore: BTreeSet<FolderPath>,
	#[serde(default)]
	pub output: BTreeSet<FolderPath>,
}

fn added(kind: FolderKind, folder: FolderPath) -> FolderEvent {
	match kind {
		FolderKind::Input => FolderEvent::InputAdded(folder),
		FolderKind::Ignore => FolderEvent::IgnoreAdded(folder),
		FolderKind::Output => FolderEvent::OutputAdded(folder),
	}
}

fn removed(kind: FolderKind, folder: FolderPath) -> FolderEvent {
	match kind {
		FolderKind::Input => FolderEvent::InputRemoved(folder),
		FolderKind::Ignore => FolderEvent::IgnoreRemoved(folder),
		FolderKind::Output => FolderEvent::OutputRemoved(folder),
	}
}

const KINDS: [FolderKind; 3] = [FolderKind::Input, FolderKind::Ignore, FolderKind::Output];

impl Configuration {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn folders(&self, kind: FolderKind) -> &BTreeSet<FolderPath> {
		match kind {
			FolderKind::Input => &self.input,
			FolderKind::Ignore => &self.ignore,
			FolderKind::Output => &self.output,
		}
	}

	fn folders_mut(&mut self, kind: FolderKind) -> &mut BTreeSet<FolderPath> {
		match kind {
			FolderKind::Input => &mut self.input,
			FolderKind::Ignore => &mut self.ignore,
			FolderKind::Output => &mut self.output,
		}
	}

	pub fn kind_of(&self, folder: &FolderPath) -> Option<FolderKind> {
		KINDS.into_iter().find(|kind| self.folders(*kind).contains(folder))
	}

	/// Move `folder` into `kind`. Removals from the other sets come first, then
	/// the addition; re-adding to the same set yields nothing.
	pub fn add_folder(&mut self, folder: FolderPath, kind: FolderKind) -> Vec<FolderEvent> {
		let mut events = Vec::new();
		for other in KINDS.into_iter().filter(|other| *other != kind) {
			if self.folders_mut(other).remove(&folder) {
				events.push(removed(other, folder.clone()));
			}
		}
		if self.folders_mut(kind).insert(folder.clone()) {
			events.push(added(kind, folder));
		}
		debug!("Configuration: {} events", events.len());
		events
	}

	pub fn remove_folder(&mut self, folder: &FolderPath, kind: FolderKind) -> Vec<FolderEvent> {
		if self.folders_mut(kind).remove(folder) {
			vec![removed(kind, folder.clone())]
		} else {
			Vec::new()
		}
	}

	/// Replay every membership as an `*Added` event, e.g. after loading from disk.
	pub fn replay(&self) -> Vec<FolderEvent> {
		KINDS
			.into_iter()
			.flat_map(|kind| self.folders(kind).iter().map(move |f| added(kind, f.clone())))
			.collect()
	}
}

mod duration_ms {
	use serde::{Deserialize, Deserializer, Serializer};
	use std::time::Duration;

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_u64(d.as_millis() as u64)
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		u64::deserialize(d).map(Duration::from_millis)
	}
}

/// Tunables. Every field has a default; durations are milliseconds in JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
	pub folder_cache_capacity: usize,
	pub file_cache_capacity: usize,
	/// Files diffed per folder per pass
	pub scan_batch_size: usize,
	pub event_batch_size: usize,
	#[serde(with = "duration_ms")]
	pub event_batch_timeout: Duration,
	#[serde(with = "duration_ms")]
	pub shutdown_grace: Duration,
	/// SQLite database file; memory-only when absent
	pub store_path: Option<PathBuf>,
	pub index: IndexKind,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			folder_cache_capacity: DEFAULT_FOLDER_CACHE_CAPACITY,
			file_cache_capacity: DEFAULT_FILE_CACHE_CAPACITY,
			scan_batch_size: 2000,
			event_batch_size: 500,
			event_batch_timeout: Duration::from_secs(2),
			shutdown_grace: Duration::from_secs(3),
			store_path: None,
			index: IndexKind::Flat,
		}
	}
}

impl Settings {
	pub fn load(path: impl AsRef<Path>) -> DedupResult<Self> {
		let bytes = std::fs::read(path.as_ref())?;
		let settings: Settings = serde_json::from_slice(&bytes).map_err(|e| {
			DedupError::Config(format!("{}: {}", path.as_ref().display(), e))
		})?;
		settings.validate()?;
		Ok(settings)
	}

	pub fn validate(&self) -> DedupResult<()> {
		let checks = [
			("folder_cache_capacity", self.folder_cache_capacity),
			("file_cache_capacity", self.file_cache_capacity),
			("scan_batch_size", self.scan_batch_size),
			("event_batch_size", self.event_batch_size),
		];
		for (name, value) in checks {
			if value == 0 {
				return Err(DedupError::Config(format!("{name} must be greater than 0")));
			}
		}
		Ok(())
	}
}
