//! On-disk database: connection setup and versioned schema migrations
//!
//! The schema version lives in SQLite's `user_version` pragma. Opening a
//! database applies every migration newer than that version, each inside its
//! own transaction. A database written by a newer build is refused.

use rusqlite::Connection;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{PersistError, PersistResult};
use crate::paths::MAX_FOLDER_DEPTH;

pub const SCHEMA_VERSION: u32 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Column names of the positional folder levels, `l0` … `l{MAX_FOLDER_DEPTH - 1}`.
pub fn level_columns() -> Vec<String> {
	(0..MAX_FOLDER_DEPTH).map(|level| format!("l{level}")).collect()
}

fn schema_v1() -> String {
	let levels = level_columns();
	let level_defs: String = levels
		.iter()
		.map(|column| format!("\t{column} INTEGER NOT NULL DEFAULT 0,\n"))
		.collect();
	format!(
		"CREATE TABLE folder_names (
	id INTEGER PRIMARY KEY AUTOINCREMENT,
	name TEXT NOT NULL UNIQUE
);

CREATE TABLE folders (
	id INTEGER PRIMARY KEY AUTOINCREMENT,
	depth INTEGER NOT NULL,
{level_defs}	UNIQUE (depth, {level_list})
);

CREATE TABLE folder_nodes (
	id INTEGER PRIMARY KEY AUTOINCREMENT,
	name TEXT NOT NULL,
	depth INTEGER NOT NULL,
	parent INTEGER REFERENCES folder_nodes(id)
);
CREATE UNIQUE INDEX folder_nodes_child ON folder_nodes(depth, name, IFNULL(parent, 0));
CREATE INDEX folder_nodes_bucket ON folder_nodes(depth, name);

CREATE TABLE files (
	id INTEGER PRIMARY KEY AUTOINCREMENT,
	folder INTEGER NOT NULL,
	name TEXT NOT NULL,
	size INTEGER NOT NULL,
	modified TEXT NOT NULL,
	UNIQUE (folder, name)
);
CREATE INDEX files_size ON files(size);

CREATE TABLE attributes (
	file INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
	key TEXT NOT NULL,
	value TEXT NOT NULL,
	PRIMARY KEY (file, key)
);
CREATE INDEX attributes_key_value ON attributes(key, value);
",
		level_list = levels.join(", "),
	)
}

/// Every migration, oldest first. A version is applied once and never edited.
fn migrations() -> Vec<(u32, String)> {
	vec![(1, schema_v1())]
}

fn configure(conn: &Connection) -> PersistResult<()> {
	conn.busy_timeout(BUSY_TIMEOUT)?;
	conn.pragma_update(None, "foreign_keys", true)?;
	Ok(())
}

/// Open (or create) the database file and bring its schema up to date.
pub fn open(path: &Path) -> PersistResult<Connection> {
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent)?;
	}
	let mut conn = Connection::open(path)?;
	configure(&conn)?;
	let mode: String =
		conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
	conn.pragma_update(None, "synchronous", "NORMAL")?;
	debug!("Database: opened {} (journal mode {})", path.display(), mode);
	migrate(&mut conn)?;
	Ok(conn)
}

/// A private database that disappears with the connection.
pub fn open_in_memory() -> PersistResult<Connection> {
	let mut conn = Connection::open_in_memory()?;
	configure(&conn)?;
	migrate(&mut conn)?;
	Ok(conn)
}

pub fn schema_version(conn: &Connection) -> PersistResult<u32> {
	Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Apply pending migrations. Returns the resulting schema version.
pub fn migrate(conn: &mut Connection) -> PersistResult<u32> {
	let current = schema_version(conn)?;
	if current > SCHEMA_VERSION {
		return Err(PersistError::VersionMismatch {
			expected: SCHEMA_VERSION,
			found: current,
		});
	}
	for (version, sql) in migrations() {
		if version <= current {
			continue;
		}
		let tx = conn.transaction()?;
		tx.execute_batch(&sql)?;
		tx.pragma_update(None, "user_version", version)?;
		tx.commit()?;
		info!("Database: migrated schema to version {}", version);
	}
	Ok(SCHEMA_VERSION)
}
