//! Backing store: SQLite tables for folder names, folders, files and attributes.
//!
//! Every table carries the unique indexes the model relies on. Inserts use
//! `ON CONFLICT DO NOTHING` and report a lost race as
//! [`StoreError::UniqueViolation`] instead of overwriting, so callers get
//! insert-if-absent semantics by re-reading the winning row.
//!
//! Two kinds of writes exist:
//! - name, folder and folder-node inserts commit immediately;
//! - file and attribute changes are staged in a [`Transaction`] and applied by
//!   [`Transaction::commit`] inside one SQLite transaction, so a batch is
//!   all-or-nothing.
//!
//! Grouping for duplicate detection runs in SQL (`GROUP BY … HAVING COUNT(*) > 1`).
//! A store opened with [`Store::open`] writes through SQLite's WAL; each commit
//! only touches the rows it changed.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row, ToSql, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::error::{DedupResult, StoreError, StoreResult};
use crate::paths::MAX_FOLDER_DEPTH;
use crate::persist;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NameId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FolderId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub u64);

macro_rules! sql_id {
	($($ty:ident),*) => {$(
		impl ToSql for $ty {
			fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
				Ok(ToSqlOutput::from(self.0 as i64))
			}
		}

		impl FromSql for $ty {
			fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
				i64::column_result(value).map(|id| $ty(id as u64))
			}
		}
	)*};
}

sql_id!(NameId, FolderId, FileId);

/// Attribute key: one per plugin, e.g. `content.blake3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeKey(String);

impl AttributeKey {
	pub fn new(key: impl Into<String>) -> Self {
		Self(key.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for AttributeKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl ToSql for AttributeKey {
	fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
		self.0.to_sql()
	}
}

impl FromSql for AttributeKey {
	fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
		String::column_result(value).map(AttributeKey)
	}
}

/// Flattened ancestor chain: level `i` holds the name of segment `i`, unused levels are `None`.
pub type FolderLevels = [Option<NameId>; MAX_FOLDER_DEPTH];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRow {
	pub id: NameId,
	pub name: String,
}

/// Flattened-depth folder row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderRow {
	pub id: FolderId,
	pub depth: usize,
	pub levels: FolderLevels,
}

impl FolderRow {
	pub fn level_ids(&self) -> impl Iterator<Item = NameId> + '_ {
		self.levels.iter().take(self.depth).flatten().copied()
	}
}

/// Parent-pointer folder row used by the adjacency index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRow {
	pub id: FolderId,
	pub name: String,
	pub depth: usize,
	pub parent: Option<FolderId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRow {
	pub id: FileId,
	pub folder: FolderId,
	pub name: String,
	pub size: u64,
	pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeRow {
	pub file: FileId,
	pub key: AttributeKey,
	pub value: String,
}

/// Row counts per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
	pub names: usize,
	pub folders: usize,
	pub nodes: usize,
	pub files: usize,
	pub attributes: usize,
}

const FILE_COLUMNS: &str = "id, folder, name, size, modified";
const NODE_COLUMNS: &str = "id, name, depth, parent";

fn file_row(row: &Row<'_>) -> rusqlite::Result<FileRow> {
	Ok(FileRow {
		id: row.get(0)?,
		folder: row.get(1)?,
		name: row.get(2)?,
		size: row.get::<_, i64>(3)? as u64,
		modified: row.get(4)?,
	})
}

fn node_row(row: &Row<'_>) -> rusqlite::Result<NodeRow> {
	Ok(NodeRow {
		id: row.get(0)?,
		name: row.get(1)?,
		depth: row.get::<_, i64>(2)? as usize,
		parent: row.get(3)?,
	})
}

fn folder_row(row: &Row<'_>) -> rusqlite::Result<FolderRow> {
	let mut levels = [None; MAX_FOLDER_DEPTH];
	for (level, slot) in levels.iter_mut().enumerate() {
		let id: i64 = row.get(2 + level)?;
		*slot = (id != 0).then_some(NameId(id as u64));
	}
	Ok(FolderRow {
		id: row.get(0)?,
		depth: row.get::<_, i64>(1)? as usize,
		levels,
	})
}

fn attribute_row(row: &Row<'_>) -> rusqlite::Result<AttributeRow> {
	Ok(AttributeRow {
		file: row.get(0)?,
		key: row.get(1)?,
		value: row.get(2)?,
	})
}

/// `depth` then every level, unused levels as 0.
fn folder_params(depth: usize, levels: &FolderLevels) -> Vec<i64> {
	std::iter::once(depth as i64)
		.chain(levels.iter().map(|level| level.map_or(0, |id| id.0 as i64)))
		.collect()
}

/// Statements over the positional level columns, built once per store.
#[derive(Debug)]
struct FolderSql {
	select_by_id: String,
	select_by_levels: String,
	insert: String,
}

impl FolderSql {
	fn new() -> Self {
		let columns = persist::level_columns();
		let select = format!("SELECT id, depth, {} FROM folders", columns.join(", "));
		let matches: Vec<String> = columns
			.iter()
			.enumerate()
			.map(|(level, column)| format!("{column} = ?{}", level + 2))
			.collect();
		let placeholders: Vec<String> = (0..columns.len()).map(|level| format!("?{}", level + 2)).collect();
		Self {
			select_by_id: format!("{select} WHERE id = ?1"),
			select_by_levels: format!("{select} WHERE depth = ?1 AND {}", matches.join(" AND ")),
			insert: format!(
				"INSERT INTO folders (depth, {}) VALUES (?1, {}) ON CONFLICT DO NOTHING",
				columns.join(", "),
				placeholders.join(", ")
			),
		}
	}
}

#[derive(Debug)]
enum WriteOp {
	InsertFile(FileRow),
	DeleteFile(FileId),
	DeleteAttributes(FileId),
	UpsertAttribute {
		file: FileId,
		key: AttributeKey,
		value: String,
	},
}

impl WriteOp {
	fn apply(&self, conn: &Connection) -> StoreResult<()> {
		match self {
			WriteOp::InsertFile(row) => {
				let inserted = conn
					.prepare_cached(
						"INSERT INTO files (id, folder, name, size, modified)
						 VALUES (?1, ?2, ?3, ?4, ?5) ON CONFLICT DO NOTHING",
					)?
					.execute(params![row.id, row.folder, row.name, row.size as i64, row.modified])?;
				if inserted == 0 {
					return Err(StoreError::UniqueViolation {
						table: "files",
						key: row.name.clone(),
					});
				}
			}
			WriteOp::DeleteFile(id) => {
				// Attributes go with it (ON DELETE CASCADE)
				conn.prepare_cached("DELETE FROM files WHERE id = ?1")?
					.execute(params![id])?;
			}
			WriteOp::DeleteAttributes(file) => {
				conn.prepare_cached("DELETE FROM attributes WHERE file = ?1")?
					.execute(params![file])?;
			}
			WriteOp::UpsertAttribute { file, key, value } => {
				let written = conn
					.prepare_cached(
						"INSERT INTO attributes (file, key, value)
						 SELECT ?1, ?2, ?3 WHERE EXISTS (SELECT 1 FROM files WHERE id = ?1)
						 ON CONFLICT (file, key) DO UPDATE SET value = excluded.value",
					)?
					.execute(params![file, key, value])?;
				if written == 0 {
					return Err(StoreError::MissingRow {
						table: "files",
						id: file.0,
					});
				}
			}
		}
		Ok(())
	}
}

/// The store shared by the path store, the registry and the workers.
#[derive(Debug)]
pub struct Store {
	conn: Mutex<Connection>,
	persistent: bool,
	next_file_id: AtomicU64,
	folder_sql: FolderSql,
}

impl Store {
	fn from_connection(conn: Connection, persistent: bool) -> StoreResult<Self> {
		// File ids are handed out while staging, before the row exists
		let last: i64 = conn.query_row(
			"SELECT COALESCE((SELECT seq FROM sqlite_sequence WHERE name = 'files'), 0)",
			[],
			|row| row.get(0),
		)?;
		Ok(Self {
			conn: Mutex::new(conn),
			persistent,
			next_file_id: AtomicU64::new(last as u64 + 1),
			folder_sql: FolderSql::new(),
		})
	}

	/// A store that lives only as long as the process.
	pub fn in_memory() -> StoreResult<Self> {
		Self::from_connection(persist::open_in_memory()?, false)
	}

	/// Open a file-backed store, creating and migrating the database as needed.
	pub fn open(path: impl AsRef<Path>) -> DedupResult<Self> {
		let path = path.as_ref();
		let store = Self::from_connection(persist::open(path)?, true)?;
		let counts = store.counts()?;
		info!(
			"Store: opened {} with {} files and {} folders",
			path.display(),
			counts.files,
			counts.folders + counts.nodes
		);
		Ok(store)
	}

	pub fn is_persistent(&self) -> bool {
		self.persistent
	}

	fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
		self.conn.lock().map_err(|_| StoreError::Poisoned)
	}

	fn allocate_file_id(&self) -> FileId {
		FileId(self.next_file_id.fetch_add(1, Ordering::Relaxed))
	}

	// Folder names

	/// Look up the ids of the given names. Names without a row are absent from the result.
	pub fn name_ids(&self, names: &[String]) -> StoreResult<HashMap<String, NameId>> {
		let conn = self.lock()?;
		let mut stmt = conn.prepare_cached("SELECT id FROM folder_names WHERE name = ?1")?;
		let mut ids: HashMap<String, NameId> = HashMap::with_capacity(names.len());
		for name in names {
			if let Some(id) = stmt.query_row(params![name], |row| row.get(0)).optional()? {
				ids.insert(name.clone(), id);
			}
		}
		Ok(ids)
	}

	/// Resolve name ids back to names, in order.
	pub fn names_of(&self, ids: impl IntoIterator<Item = NameId>) -> StoreResult<Vec<String>> {
		let conn = self.lock()?;
		let mut stmt = conn.prepare_cached("SELECT name FROM folder_names WHERE id = ?1")?;
		ids.into_iter()
			.map(|id| {
				stmt.query_row(params![id], |row| row.get(0))
					.optional()?
					.ok_or(StoreError::MissingRow {
						table: "folder_names",
						id: id.0,
					})
			})
			.collect()
	}

	/// Insert a folder name; fails with a unique violation if the name exists.
	pub fn insert_name(&self, name: &str) -> StoreResult<NameId> {
		let conn = self.lock()?;
		let inserted = conn
			.prepare_cached("INSERT INTO folder_names (name) VALUES (?1) ON CONFLICT DO NOTHING")?
			.execute(params![name])?;
		if inserted == 0 {
			return Err(StoreError::UniqueViolation {
				table: "folder_names",
				key: name.to_string(),
			});
		}
		Ok(NameId(conn.last_insert_rowid() as u64))
	}

	// Flattened folders

	/// Equality lookup on (depth, level₀ … level_depth-1).
	pub fn find_folder(&self, depth: usize, levels: &FolderLevels) -> StoreResult<Option<FolderRow>> {
		let conn = self.lock()?;
		let mut stmt = conn.prepare_cached(&self.folder_sql.select_by_levels)?;
		Ok(stmt
			.query_row(rusqlite::params_from_iter(folder_params(depth, levels)), folder_row)
			.optional()?)
	}

	pub fn folder(&self, id: FolderId) -> StoreResult<Option<FolderRow>> {
		let conn = self.lock()?;
		let mut stmt = conn.prepare_cached(&self.folder_sql.select_by_id)?;
		Ok(stmt.query_row(params![id], folder_row).optional()?)
	}

	pub fn insert_folder(&self, depth: usize, levels: FolderLevels) -> StoreResult<FolderRow> {
		let conn = self.lock()?;
		let inserted = conn
			.prepare_cached(&self.folder_sql.insert)?
			.execute(rusqlite::params_from_iter(folder_params(depth, &levels)))?;
		if inserted == 0 {
			let ids: Vec<NameId> = levels.iter().take(depth).flatten().copied().collect();
			return Err(StoreError::UniqueViolation {
				table: "folders",
				key: format!("depth {} {:?}", depth, ids),
			});
		}
		Ok(FolderRow {
			id: FolderId(conn.last_insert_rowid() as u64),
			depth,
			levels,
		})
	}

	// Adjacency folder nodes

	/// Nodes matching any of the given (depth, name) pairs.
	pub fn nodes_matching(&self, pairs: &[(usize, &str)]) -> StoreResult<Vec<NodeRow>> {
		let conn = self.lock()?;
		let mut stmt = conn.prepare_cached(&format!(
			"SELECT {NODE_COLUMNS} FROM folder_nodes WHERE depth = ?1 AND name = ?2 ORDER BY id"
		))?;
		let mut rows = Vec::new();
		for (depth, name) in pairs {
			for row in stmt.query_map(params![*depth as i64, name], node_row)? {
				rows.push(row?);
			}
		}
		Ok(rows)
	}

	pub fn node(&self, id: FolderId) -> StoreResult<Option<NodeRow>> {
		let conn = self.lock()?;
		let mut stmt =
			conn.prepare_cached(&format!("SELECT {NODE_COLUMNS} FROM folder_nodes WHERE id = ?1"))?;
		Ok(stmt.query_row(params![id], node_row).optional()?)
	}

	pub fn node_child(
		&self,
		depth: usize,
		name: &str,
		parent: Option<FolderId>,
	) -> StoreResult<Option<NodeRow>> {
		let conn = self.lock()?;
		let mut stmt = conn.prepare_cached(&format!(
			"SELECT {NODE_COLUMNS} FROM folder_nodes WHERE depth = ?1 AND name = ?2 AND parent IS ?3"
		))?;
		Ok(stmt
			.query_row(params![depth as i64, name, parent], node_row)
			.optional()?)
	}

	pub fn insert_node(
		&self,
		name: &str,
		depth: usize,
		parent: Option<FolderId>,
	) -> StoreResult<NodeRow> {
		let conn = self.lock()?;
		let inserted = conn
			.prepare_cached(
				"INSERT INTO folder_nodes (name, depth, parent) VALUES (?1, ?2, ?3) ON CONFLICT DO NOTHING",
			)?
			.execute(params![name, depth as i64, parent])?;
		if inserted == 0 {
			return Err(StoreError::UniqueViolation {
				table: "folder_nodes",
				key: format!("{} at depth {}", name, depth),
			});
		}
		Ok(NodeRow {
			id: FolderId(conn.last_insert_rowid() as u64),
			name: name.to_string(),
			depth,
			parent,
		})
	}

	// Files

	pub fn file(&self, id: FileId) -> StoreResult<Option<FileRow>> {
		let conn = self.lock()?;
		let mut stmt = conn.prepare_cached(&format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1"))?;
		Ok(stmt.query_row(params![id], file_row).optional()?)
	}

	pub fn file_in_folder(&self, folder: FolderId, name: &str) -> StoreResult<Option<FileRow>> {
		let conn = self.lock()?;
		let mut stmt = conn.prepare_cached(&format!(
			"SELECT {FILE_COLUMNS} FROM files WHERE folder = ?1 AND name = ?2"
		))?;
		Ok(stmt.query_row(params![folder, name], file_row).optional()?)
	}

	/// Files owned by a folder, ordered by id.
	pub fn files_in_folder(&self, folder: FolderId) -> StoreResult<Vec<FileRow>> {
		let conn = self.lock()?;
		let mut stmt = conn.prepare_cached(&format!(
			"SELECT {FILE_COLUMNS} FROM files WHERE folder = ?1 ORDER BY id"
		))?;
		let rows = stmt.query_map(params![folder], file_row)?;
		Ok(rows.collect::<rusqlite::Result<_>>()?)
	}

	pub fn all_files(&self) -> StoreResult<Vec<FileRow>> {
		let conn = self.lock()?;
		let mut stmt = conn.prepare_cached(&format!("SELECT {FILE_COLUMNS} FROM files ORDER BY id"))?;
		let rows = stmt.query_map([], file_row)?;
		Ok(rows.collect::<rusqlite::Result<_>>()?)
	}

	/// Files without a `key` attribute whose size is shared by another such
	/// file, ordered by size then id.
	pub fn size_collisions(&self, key: &AttributeKey) -> StoreResult<Vec<FileRow>> {
		let conn = self.lock()?;
		let mut stmt = conn.prepare_cached(&format!(
			"WITH pending AS (
				SELECT {FILE_COLUMNS} FROM files
				WHERE NOT EXISTS (SELECT 1 FROM attributes WHERE file = files.id AND key = ?1)
			)
			SELECT {FILE_COLUMNS} FROM pending
			WHERE size IN (SELECT size FROM pending GROUP BY size HAVING COUNT(*) > 1)
			ORDER BY size, id"
		))?;
		let rows = stmt.query_map(params![key], file_row)?;
		Ok(rows.collect::<rusqlite::Result<_>>()?)
	}

	// Attributes

	pub fn attributes_of(&self, file: FileId) -> StoreResult<Vec<AttributeRow>> {
		let conn = self.lock()?;
		let mut stmt = conn
			.prepare_cached("SELECT file, key, value FROM attributes WHERE file = ?1 ORDER BY key")?;
		let rows = stmt.query_map(params![file], attribute_row)?;
		Ok(rows.collect::<rusqlite::Result<_>>()?)
	}

	/// Every attribute row with the given key, ordered by file id.
	pub fn attributes_with_key(&self, key: &AttributeKey) -> StoreResult<Vec<AttributeRow>> {
		let conn = self.lock()?;
		let mut stmt = conn
			.prepare_cached("SELECT file, key, value FROM attributes WHERE key = ?1 ORDER BY file")?;
		let rows = stmt.query_map(params![key], attribute_row)?;
		Ok(rows.collect::<rusqlite::Result<_>>()?)
	}

	/// Files sharing a `key` value with at least one other file: one group per
	/// value, groups ordered by value, ids ascending within a group.
	pub fn value_groups(&self, key: &AttributeKey) -> StoreResult<Vec<Vec<FileId>>> {
		let conn = self.lock()?;
		let mut stmt = conn.prepare_cached(
			"SELECT value, file FROM attributes
			 WHERE key = ?1
			   AND value IN (SELECT value FROM attributes WHERE key = ?1 GROUP BY value HAVING COUNT(*) > 1)
			 ORDER BY value, file",
		)?;
		let mut rows = stmt.query(params![key])?;
		let mut groups: Vec<Vec<FileId>> = Vec::new();
		let mut current: Option<String> = None;
		while let Some(row) = rows.next()? {
			let value: String = row.get(0)?;
			let file: FileId = row.get(1)?;
			match groups.last_mut() {
				Some(group) if current.as_deref() == Some(value.as_str()) => group.push(file),
				_ => {
					groups.push(vec![file]);
					current = Some(value);
				}
			}
		}
		Ok(groups)
	}

	pub fn counts(&self) -> StoreResult<StoreCounts> {
		let conn = self.lock()?;
		let count = |table: &str| -> StoreResult<usize> {
			let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
			Ok(n as usize)
		};
		Ok(StoreCounts {
			names: count("folder_names")?,
			folders: count("folders")?,
			nodes: count("folder_nodes")?,
			files: count("files")?,
			attributes: count("attributes")?,
		})
	}

	/// Start a transaction. Nothing is visible to readers until [`Transaction::commit`].
	pub fn begin(&self) -> Transaction<'_> {
		Transaction {
			store: self,
			ops: Vec::new(),
		}
	}
}

/// Staged file/attribute writes. Dropping without committing discards them.
#[derive(Debug)]
pub struct Transaction<'a> {
	store: &'a Store,
	ops: Vec<WriteOp>,
}

impl Transaction<'_> {
	/// Stage a new file row and return the id it will have once committed.
	pub fn insert_file(
		&mut self,
		folder: FolderId,
		name: &str,
		size: u64,
		modified: DateTime<Utc>,
	) -> FileId {
		let id = self.store.allocate_file_id();
		self.ops.push(WriteOp::InsertFile(FileRow {
			id,
			folder,
			name: name.to_string(),
			size,
			modified,
		}));
		id
	}

	pub fn delete_file(&mut self, id: FileId) {
		self.ops.push(WriteOp::DeleteFile(id));
	}

	pub fn delete_attributes(&mut self, file: FileId) {
		self.ops.push(WriteOp::DeleteAttributes(file));
	}

	pub fn upsert_attribute(&mut self, file: FileId, key: &AttributeKey, value: impl Into<String>) {
		self.ops.push(WriteOp::UpsertAttribute {
			file,
			key: key.clone(),
			value: value.into(),
		});
	}

	pub fn len(&self) -> usize {
		self.ops.len()
	}

	pub fn is_empty(&self) -> bool {
		self.ops.is_empty()
	}

	/// Apply every staged op in one SQLite transaction. The first failing op
	/// rolls the whole transaction back.
	pub fn commit(self) -> StoreResult<()> {
		if self.ops.is_empty() {
			return Ok(());
		}
		let mut conn = self.store.lock()?;
		let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
		for op in &self.ops {
			if let Err(e) = op.apply(&tx) {
				debug!("Store: rolling back {} staged ops: {}", self.ops.len(), e);
				return Err(e);
			}
		}
		tx.commit()?;
		trace!("Store: committed {} ops", self.ops.len());
		Ok(())
	}
}
