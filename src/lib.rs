//! # dupwatch
//!
//! Watches configured folders, diffs them against a durable registry and groups
//! files whose pluggable fingerprints match. Folder identities live in a
//! depth-bounded flattened index fronted by LRU caches; scanning and duplicate
//! detection run as two cooperative worker loops on the smol runtime.

pub mod config;
pub mod engine;
pub mod error;
pub mod event_queue;
pub mod events;
pub mod fs;
pub mod path_store;
pub mod paths;
pub mod persist;
pub mod plugins;
pub mod query;
pub mod registry;
pub mod store;
pub mod systems;

// Re-export main API types
pub use config::{Configuration, FolderKind, Settings};
pub use engine::{Engine, ScanReport};
pub use error::{DedupError, DedupResult};
pub use events::{FileEvent, FolderEvent};
pub use fs::{FileSystem, LocalFileSystem};
pub use path_store::{IndexKind, PathStore};
pub use paths::{FilePath, FolderPath, MAX_FOLDER_DEPTH};
pub use plugins::{ContentHashPlugin, DuplicatePlugin, PluginReport};
pub use query::{AttributeQuery, FileEntry, FileQuery};
pub use registry::{DiffApplied, FileSnapshot, Registry};
pub use store::{AttributeKey, FileId, Store};
