//! Error types for the folder watcher and duplicate pipeline

use thiserror::Error;

/// Top-level error covering every failure mode the engine surfaces.
///
/// The variants fall into three families that callers treat differently:
///
/// ### Configuration errors
/// A path that the storage model cannot represent. [`DedupError::DepthExceeded`]
/// aborts only the offending path or subtree; the scan of sibling folders
/// carries on.
///
/// ### Transient I/O errors
/// A file vanished, was locked, or became unreadable while it was being listed
/// or fingerprinted. Inside the plugin pipeline these are caught per candidate
/// and reported as [`DedupError::Plugin`]; the batch continues.
///
/// ### Store consistency errors
/// A unique-index violation raised by the store. The path store resolves these
/// by re-reading the winning row, so they only reach callers when the retry
/// itself fails.
///
/// ```rust
/// use dupwatch::{DedupError, FolderPath};
///
/// let deep = format!("/{}", vec!["d"; 40].join("/"));
/// match FolderPath::new(&deep).and_then(|p| p.segments().map(|_| ())) {
///     Err(DedupError::DepthExceeded { depth, max, .. }) => assert!(depth > max),
///     other => panic!("expected DepthExceeded, got {other:?}"),
/// }
/// ```
#[derive(Debug, Error)]
pub enum DedupError {
	/// File system I/O errors while listing or reading
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	/// Folder hierarchy deeper than the flattened folder model supports
	#[error("Path '{path}' has {depth} segments, maximum supported is {max}")]
	DepthExceeded { path: String, depth: usize, max: usize },

	/// Relative, empty or otherwise unnormalized paths
	#[error("Invalid path '{path}': {reason}")]
	InvalidPath { path: String, reason: String },

	/// More than one folder chain matched the same path in the adjacency index
	#[error("Ambiguous path '{path}': {matches} folder chains match")]
	AmbiguousPath { path: String, matches: usize },

	#[error("Store error: {0}")]
	Store(#[from] StoreError),

	#[error("Persistence error: {0}")]
	Persist(#[from] PersistError),

	/// A single candidate failed inside a plugin pass
	#[error("Plugin {plugin} failed on {path}: {reason}")]
	Plugin {
		plugin: String,
		path: String,
		reason: String,
	},

	/// Two plugins claimed the same attribute key
	#[error("Attribute key '{0}' is already owned by another plugin")]
	DuplicateAttributeKey(String),

	#[error("Configuration error: {0}")]
	Config(String),

	#[error("System error: {0}")]
	System(#[from] SystemError),
}

/// Errors raised by the backing store
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("Unique constraint violated on {table}: {key}")]
	UniqueViolation { table: &'static str, key: String },

	#[error("No row {id} in {table}")]
	MissingRow { table: &'static str, id: u64 },

	#[error("Store lock poisoned")]
	Poisoned,

	#[error("Database error: {0}")]
	Sqlite(#[from] rusqlite::Error),

	#[error("Database setup failed: {0}")]
	Persist(#[from] PersistError),
}

/// Opening the database or migrating its schema
#[derive(Debug, Error)]
pub enum PersistError {
	#[error("Database I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("Database error: {0}")]
	Sqlite(#[from] rusqlite::Error),

	#[error("Schema version mismatch: this build knows up to {expected}, database has {found}")]
	VersionMismatch { expected: u32, found: u32 },
}

/// Worker loop errors
#[derive(Debug, Error)]
pub enum SystemError {
	#[error("System execution failed: {system} - {reason}")]
	ExecutionFailed { system: String, reason: String },

	#[error("System cancelled: {system}")]
	Cancelled { system: String },

	#[error("System timeout: {system} exceeded {timeout_ms} ms")]
	Timeout { system: String, timeout_ms: u64 },
}

impl DedupError {
	/// Whether this error should abort only the current subtree rather than the whole scan.
	pub fn is_subtree_local(&self) -> bool {
		matches!(
			self,
			DedupError::DepthExceeded { .. }
				| DedupError::InvalidPath { .. }
				| DedupError::AmbiguousPath { .. }
				| DedupError::Io(_)
		)
	}
}

pub type DedupResult<T> = Result<T, DedupError>;

pub type StoreResult<T> = Result<T, StoreError>;

pub type PersistResult<T> = Result<T, PersistError>;

pub type SystemResult<T> = Result<T, SystemError>;
