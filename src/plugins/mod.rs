//! Duplicate-detection plugins and the pipeline that runs them
//!
//! A plugin owns one attribute key. Per pass it selects candidates from the
//! Registry, computes a fingerprint for each, then groups files by equal
//! attribute value. Candidates come back as owned [`FileEntry`] values so a
//! plugin can build them from any query. Plugins run one after another and
//! never touch each other's keys.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::error::{DedupError, DedupResult};
use crate::fs::FileSystem;
use crate::paths::FilePath;
use crate::query::{AttributeQuery, FileEntry};
use crate::registry::Registry;
use crate::store::{AttributeKey, FileId};

mod hash;

pub use hash::{CONTENT_HASH_KEY, ContentHashPlugin};

/// A duplicate-detection strategy.
pub trait DuplicatePlugin: Send + Sync + fmt::Debug {
	/// Stable name used in logs and reports
	fn identifier(&self) -> &str;

	/// Attribute key this plugin writes; unique across registered plugins
	fn key(&self) -> &AttributeKey;

	/// Files that need their attribute (re)computed
	fn candidates(&self, registry: &Registry) -> DedupResult<Vec<FileEntry>>;

	/// Fingerprint one file by streaming its bytes
	fn calculate(&self, path: &FilePath, fs: &dyn FileSystem) -> DedupResult<String>;

	/// Groups of files sharing an attribute value; singletons are dropped
	fn find_duplicates(&self, attributes: &AttributeQuery) -> Vec<Vec<FileId>> {
		attributes.shared_values().to_vec()
	}
}

/// One candidate that could not be processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFailure {
	pub file: FileId,
	pub path: FilePath,
	pub reason: String,
}

/// Outcome of one plugin pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginReport {
	pub plugin: String,
	pub candidates: usize,
	pub computed: usize,
	pub failures: Vec<CandidateFailure>,
	pub groups: Vec<Vec<FileId>>,
	/// Set when the pass stopped before finishing (store error or cancellation)
	pub aborted: Option<String>,
}

/// Make sure no two plugins share an attribute key.
pub fn check_unique_keys(plugins: &[Arc<dyn DuplicatePlugin>]) -> DedupResult<()> {
	for (i, plugin) in plugins.iter().enumerate() {
		if plugins[..i].iter().any(|other| other.key() == plugin.key()) {
			return Err(DedupError::DuplicateAttributeKey(plugin.key().to_string()));
		}
	}
	Ok(())
}

/// Run a single plugin against the whole Registry.
pub fn run_plugin(
	registry: &Registry,
	plugin: &dyn DuplicatePlugin,
	fs: &dyn FileSystem,
	cancel: &AtomicBool,
) -> PluginReport {
	let mut report = PluginReport {
		plugin: plugin.identifier().to_string(),
		..Default::default()
	};
	if let Err(e) = run_plugin_inner(registry, plugin, fs, cancel, &mut report) {
		warn!("Plugin {}: pass aborted: {}", report.plugin, e);
		report.aborted = Some(e.to_string());
	}
	report
}

fn run_plugin_inner(
	registry: &Registry,
	plugin: &dyn DuplicatePlugin,
	fs: &dyn FileSystem,
	cancel: &AtomicBool,
	report: &mut PluginReport,
) -> DedupResult<()> {
	let candidates = plugin.candidates(registry)?;
	report.candidates = candidates.len();
	debug!(
		"Plugin {}: {} candidates out of {} files",
		report.plugin,
		candidates.len(),
		registry.store().counts()?.files
	);

	for candidate in candidates {
		if cancel.load(Ordering::Relaxed) {
			report.aborted = Some("cancelled".to_string());
			return Ok(());
		}
		let outcome = plugin
			.calculate(&candidate.path, fs)
			.and_then(|value| registry.set_attribute(candidate.id, plugin.key(), &value));
		match outcome {
			Ok(()) => report.computed += 1,
			Err(e) => {
				let failure = DedupError::Plugin {
					plugin: report.plugin.clone(),
					path: candidate.path.to_string(),
					reason: e.to_string(),
				};
				warn!("{}", failure);
				report.failures.push(CandidateFailure {
					file: candidate.id,
					path: candidate.path.clone(),
					reason: e.to_string(),
				});
			}
		}
	}

	let attributes = registry.attribute_query(plugin.key())?;
	report.groups = plugin.find_duplicates(&attributes);
	Ok(())
}

/// Run every plugin in order. A plugin that fails does not stop the others.
pub fn run_plugins(
	registry: &Registry,
	plugins: &[Arc<dyn DuplicatePlugin>],
	fs: &dyn FileSystem,
	cancel: &AtomicBool,
) -> Vec<PluginReport> {
	let mut reports = Vec::with_capacity(plugins.len());
	for plugin in plugins {
		if cancel.load(Ordering::Relaxed) {
			break;
		}
		let report = run_plugin(registry, plugin.as_ref(), fs, cancel);
		info!(
			"Plugin {}: computed {}/{}, {} failures, {} duplicate groups",
			report.plugin,
			report.computed,
			report.candidates,
			report.failures.len(),
			report.groups.len()
		);
		reports.push(report);
	}
	reports
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::fs::LocalFileSystem;
	use crate::registry::FileSnapshot;
	use chrono::Utc;

	/// Fingerprint = file name length; fails on names starting with "bad".
	#[derive(Debug)]
	struct NameLengthPlugin {
		key: AttributeKey,
	}

	impl DuplicatePlugin for NameLengthPlugin {
		fn identifier(&self) -> &str {
			"NameLength"
		}

		fn key(&self) -> &AttributeKey {
			&self.key
		}

		fn candidates(&self, registry: &Registry) -> DedupResult<Vec<FileEntry>> {
			let files = registry.file_query()?;
			Ok(files.without_attribute(&self.key).cloned().collect())
		}

		fn calculate(&self, path: &FilePath, _fs: &dyn FileSystem) -> DedupResult<String> {
			if path.file_name().starts_with("bad") {
				return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "vanished").into());
			}
			Ok(path.file_name().len().to_string())
		}
	}

	fn add(registry: &Registry, rel: &str) -> FileId {
		let path = FilePath::new(std::env::temp_dir().join(rel)).unwrap();
		registry.add(&FileSnapshot::new(path, 1, Utc::now())).unwrap()
	}

	#[test_log::test]
	fn test_failures_are_isolated_per_candidate() {
		let registry = Registry::in_memory().unwrap();
		let a = add(&registry, "p/aa");
		add(&registry, "p/bad1");
		let b = add(&registry, "p/bb");
		add(&registry, "p/ccc");

		let plugin: Arc<dyn DuplicatePlugin> = Arc::new(NameLengthPlugin {
			key: AttributeKey::new("name.len"),
		});
		let cancel = AtomicBool::new(false);
		let reports = run_plugins(&registry, &[plugin], &LocalFileSystem::new(), &cancel);

		let report = &reports[0];
		assert_eq!(report.candidates, 4);
		assert_eq!(report.computed, 3);
		assert_eq!(report.failures.len(), 1);
		assert!(report.aborted.is_none());
		assert_eq!(report.groups, vec![vec![a, b]]);
	}

	#[test_log::test]
	fn test_cancelled_pass_stops_early() {
		let registry = Registry::in_memory().unwrap();
		add(&registry, "c/one");
		let plugin = NameLengthPlugin {
			key: AttributeKey::new("name.len"),
		};
		let cancel = AtomicBool::new(true);
		let report = run_plugin(&registry, &plugin, &LocalFileSystem::new(), &cancel);
		assert_eq!(report.computed, 0);
		assert_eq!(report.aborted.as_deref(), Some("cancelled"));
	}

	#[test_log::test]
	fn test_duplicate_keys_rejected() {
		let make = || -> Arc<dyn DuplicatePlugin> {
			Arc::new(NameLengthPlugin {
				key: AttributeKey::new("same"),
			})
		};
		assert!(check_unique_keys(&[make()]).is_ok());
		assert!(matches!(
			check_unique_keys(&[make(), make()]),
			Err(DedupError::DuplicateAttributeKey(_))
		));
	}
}
