//! Filesystem access used by the scan worker and the plugins

use chrono::{DateTime, Utc};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use tracing::{trace, warn};
use walkdir::WalkDir;

use crate::error::DedupResult;
use crate::paths::{FilePath, FolderPath};

/// Size and modification time of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
	pub size: u64,
	pub modified: DateTime<Utc>,
}

/// Listing, metadata and streaming reads. I/O failures surface as errors,
/// never as silently shortened results.
pub trait FileSystem: Send + Sync + fmt::Debug {
	/// Direct child files, ordered by name.
	fn list_files(&self, folder: &FolderPath) -> DedupResult<Vec<FilePath>>;

	/// Direct child folders, ordered by name.
	fn list_subfolders(&self, folder: &FolderPath) -> DedupResult<Vec<FolderPath>>;

	fn stat(&self, path: &FilePath) -> DedupResult<FileStat>;

	fn open_read(&self, path: &FilePath) -> DedupResult<Box<dyn Read + Send>>;
}

/// The local disk. Symbolic links are not followed.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

impl LocalFileSystem {
	pub fn new() -> Self {
		Self
	}

	fn children(folder: &FolderPath) -> DedupResult<Vec<walkdir::DirEntry>> {
		let walker = WalkDir::new(folder.as_path())
			.min_depth(1)
			.max_depth(1)
			.follow_links(false)
			.sort_by_file_name();

		let mut entries = Vec::new();
		for entry in walker {
			match entry {
				Ok(entry) => entries.push(entry),
				// The folder itself could not be read
				Err(e) if e.depth() == 0 => return Err(io::Error::from(e).into()),
				Err(e) => warn!("FileSystem: skipping entry in {}: {}", folder, e),
			}
		}
		Ok(entries)
	}
}

impl FileSystem for LocalFileSystem {
	fn list_files(&self, folder: &FolderPath) -> DedupResult<Vec<FilePath>> {
		let files: Vec<FilePath> = Self::children(folder)?
			.into_iter()
			.filter(|entry| entry.file_type().is_file())
			.filter_map(|entry| match FilePath::new(entry.path()) {
				Ok(path) => Some(path),
				Err(e) => {
					warn!("FileSystem: skipping {}: {}", entry.path().display(), e);
					None
				}
			})
			.collect();
		trace!("FileSystem: {} files in {}", files.len(), folder);
		Ok(files)
	}

	fn list_subfolders(&self, folder: &FolderPath) -> DedupResult<Vec<FolderPath>> {
		let folders: Vec<FolderPath> = Self::children(folder)?
			.into_iter()
			.filter(|entry| entry.file_type().is_dir())
			.filter_map(|entry| match FolderPath::new(entry.path()) {
				Ok(path) => Some(path),
				Err(e) => {
					warn!("FileSystem: skipping {}: {}", entry.path().display(), e);
					None
				}
			})
			.collect();
		trace!("FileSystem: {} subfolders in {}", folders.len(), folder);
		Ok(folders)
	}

	fn stat(&self, path: &FilePath) -> DedupResult<FileStat> {
		let metadata = std::fs::metadata(path.as_path())?;
		Ok(FileStat {
			size: metadata.len(),
			modified: DateTime::<Utc>::from(metadata.modified()?),
		})
	}

	fn open_read(&self, path: &FilePath) -> DedupResult<Box<dyn Read + Send>> {
		Ok(Box::new(BufReader::new(File::open(path.as_path())?)))
	}
}
