//! Normalized absolute folder/file paths and their segment decomposition

use std::fmt;
use std::path::{Component, MAIN_SEPARATOR, Path, PathBuf};

use dirs::cache_dir;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{DedupError, DedupResult};

/// Maximum number of segments a folder path may have in the flattened folder model.
///
/// Real filesystems rarely go deeper than 20-25 levels
/// (`find / -type d | awk -F/ 'NF > max {max = NF} END {print max}'`).
pub const MAX_FOLDER_DEPTH: usize = 30;

/// A normalized absolute folder path.
///
/// Equality is string equality of the normalized form, so `/a//b/` and `/a/b`
/// compare equal once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct FolderPath(String);

/// A normalized absolute file path. Its parent is always a valid [`FolderPath`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct FilePath(String);

fn normalize(path: &Path) -> DedupResult<(PathBuf, Vec<String>)> {
	let invalid = |reason: &str| DedupError::InvalidPath {
		path: path.display().to_string(),
		reason: reason.to_string(),
	};

	if !path.is_absolute() {
		return Err(invalid("only absolute paths are supported"));
	}

	let mut normalized = PathBuf::new();
	let mut segments = Vec::new();
	for component in path.components() {
		let segment = match component {
			Component::Prefix(prefix) => prefix
				.as_os_str()
				.to_str()
				.ok_or_else(|| invalid("path is not valid UTF-8"))?
				.to_string(),
			Component::RootDir => MAIN_SEPARATOR.to_string(),
			Component::Normal(name) => name
				.to_str()
				.ok_or_else(|| invalid("path is not valid UTF-8"))?
				.to_string(),
			Component::CurDir | Component::ParentDir => {
				return Err(invalid("'.' and '..' segments are not allowed"));
			}
		};
		normalized.push(component.as_os_str());
		segments.push(segment);
	}
	Ok((normalized, segments))
}

fn check_depth(path: &str, segments: Vec<String>) -> DedupResult<Vec<String>> {
	if segments.len() > MAX_FOLDER_DEPTH {
		return Err(DedupError::DepthExceeded {
			path: path.to_string(),
			depth: segments.len(),
			max: MAX_FOLDER_DEPTH,
		});
	}
	Ok(segments)
}

impl FolderPath {
	pub fn new(path: impl AsRef<Path>) -> DedupResult<Self> {
		let (normalized, _) = normalize(path.as_ref())?;
		// normalize() rejected non-UTF-8 components already
		Ok(Self(normalized.to_string_lossy().into_owned()))
	}

	/// Rebuild a folder path from segments produced by [`FolderPath::segments`].
	pub fn from_segments<S: AsRef<str>>(segments: &[S]) -> Self {
		let path: PathBuf = segments.iter().map(|s| s.as_ref()).collect();
		Self(path.to_string_lossy().into_owned())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn as_path(&self) -> &Path {
		Path::new(&self.0)
	}

	/// Ordered segments, root first. Fails with [`DedupError::DepthExceeded`] when
	/// the folder is deeper than [`MAX_FOLDER_DEPTH`].
	pub fn segments(&self) -> DedupResult<Vec<String>> {
		let (_, segments) = normalize(self.as_path())?;
		check_depth(&self.0, segments)
	}

	/// Ordered segments without the depth bound, for folder indexes that have none.
	pub fn segments_unbounded(&self) -> DedupResult<Vec<String>> {
		normalize(self.as_path()).map(|(_, segments)| segments)
	}

	/// Number of segments, without enforcing the depth bound.
	pub fn depth(&self) -> usize {
		self.as_path().components().count()
	}

	pub fn join(&self, name: &str) -> FolderPath {
		FolderPath(self.as_path().join(name).to_string_lossy().into_owned())
	}

	pub fn join_file(&self, name: &str) -> FilePath {
		FilePath(self.as_path().join(name).to_string_lossy().into_owned())
	}

	pub fn parent(&self) -> Option<FolderPath> {
		self.as_path()
			.parent()
			.map(|p| FolderPath(p.to_string_lossy().into_owned()))
	}

	/// Component-wise prefix test: `/a/b` starts with `/a` but not with `/a/bc`.
	pub fn starts_with(&self, other: &FolderPath) -> bool {
		self.as_path().starts_with(other.as_path())
	}
}

impl FilePath {
	pub fn new(path: impl AsRef<Path>) -> DedupResult<Self> {
		let path = path.as_ref();
		let (normalized, _) = normalize(path)?;
		if !matches!(normalized.components().next_back(), Some(Component::Normal(_))) {
			return Err(DedupError::InvalidPath {
				path: path.display().to_string(),
				reason: "a file path needs a file name".to_string(),
			});
		}
		Ok(Self(normalized.to_string_lossy().into_owned()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn as_path(&self) -> &Path {
		Path::new(&self.0)
	}

	/// The folder containing this file.
	pub fn folder(&self) -> FolderPath {
		let parent = self.as_path().parent().unwrap_or_else(|| Path::new(""));
		FolderPath(parent.to_string_lossy().into_owned())
	}

	pub fn file_name(&self) -> &str {
		self.as_path()
			.file_name()
			.and_then(|name| name.to_str())
			.unwrap_or_default()
	}
}

impl fmt::Display for FolderPath {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl fmt::Display for FilePath {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl AsRef<Path> for FolderPath {
	fn as_ref(&self) -> &Path {
		self.as_path()
	}
}

impl AsRef<Path> for FilePath {
	fn as_ref(&self) -> &Path {
		self.as_path()
	}
}

impl<'de> Deserialize<'de> for FolderPath {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		FolderPath::new(s).map_err(serde::de::Error::custom)
	}
}

impl<'de> Deserialize<'de> for FilePath {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		FilePath::new(s).map_err(serde::de::Error::custom)
	}
}

/// Get the default data directory for dupwatch, e.g.:
/// - Linux: ~/.cache/dupwatch
/// - macOS: ~/Library/Caches/dupwatch
/// - Windows: %LOCALAPPDATA%\dupwatch
pub fn default_cache_dir() -> Option<PathBuf> {
	cache_dir().map(|mut p| {
		p.push("dupwatch");
		p
	})
}
