//! Parent-pointer folder index
//!
//! Each folder row holds its own name, its depth and its parent id, so there is
//! no depth bound. Resolution fetches every row whose (depth, name) matches a
//! segment of the path, then walks from each deepest candidate up through the
//! parent links and moves on to the next candidate when the chain breaks.
//! More than one surviving chain is reported as [`DedupError::AmbiguousPath`].

use std::collections::HashMap;
use tracing::{debug, trace, warn};

use super::FolderIndex;
use crate::error::{DedupError, DedupResult, StoreError};
use crate::paths::FolderPath;
use crate::store::{FolderId, NodeRow, Store};

#[derive(Debug, Default)]
pub struct AdjacencyFolderIndex;

/// Candidate rows bucketed by depth.
struct Buckets<'a> {
	by_depth: HashMap<usize, Vec<&'a NodeRow>>,
}

impl<'a> Buckets<'a> {
	fn new(rows: &'a [NodeRow]) -> Self {
		let mut by_depth: HashMap<usize, Vec<&NodeRow>> = HashMap::new();
		for row in rows {
			by_depth.entry(row.depth).or_default().push(row);
		}
		Self { by_depth }
	}

	fn at(&self, depth: usize) -> &[&'a NodeRow] {
		self.by_depth.get(&depth).map(Vec::as_slice).unwrap_or_default()
	}

	/// Does `node` at `depth` have an ancestor chain spelling `segments[..depth]`?
	fn chain_matches(&self, node: &NodeRow, depth: usize, segments: &[String]) -> bool {
		if node.name != segments[depth] {
			return false;
		}
		if depth == 0 {
			return node.parent.is_none();
		}
		let Some(parent) = node.parent else {
			return false;
		};
		self.at(depth - 1)
			.iter()
			.filter(|candidate| candidate.id == parent)
			.any(|candidate| self.chain_matches(candidate, depth - 1, segments))
	}
}

impl AdjacencyFolderIndex {
	pub fn new() -> Self {
		Self
	}

	fn child_or_insert(
		store: &Store,
		name: &str,
		depth: usize,
		parent: Option<FolderId>,
	) -> DedupResult<FolderId> {
		if let Some(row) = store.node_child(depth, name, parent)? {
			return Ok(row.id);
		}
		match store.insert_node(name, depth, parent) {
			Ok(row) => Ok(row.id),
			Err(StoreError::UniqueViolation { table, key }) => {
				trace!("AdjacencyIndex: '{}' created concurrently, re-reading", name);
				store
					.node_child(depth, name, parent)?
					.map(|row| row.id)
					.ok_or_else(|| StoreError::UniqueViolation { table, key }.into())
			}
			Err(e) => Err(e.into()),
		}
	}
}

impl FolderIndex for AdjacencyFolderIndex {
	fn name(&self) -> &'static str {
		"adjacency"
	}

	fn resolve(&self, store: &Store, path: &FolderPath) -> DedupResult<Option<FolderId>> {
		let segments = path.segments_unbounded()?;
		let Some(leaf_depth) = segments.len().checked_sub(1) else {
			return Ok(None);
		};
		let pairs: Vec<(usize, &str)> = segments
			.iter()
			.enumerate()
			.map(|(depth, name)| (depth, name.as_str()))
			.collect();
		let rows = store.nodes_matching(&pairs)?;
		let buckets = Buckets::new(&rows);

		let matches: Vec<FolderId> = buckets
			.at(leaf_depth)
			.iter()
			.filter(|candidate| buckets.chain_matches(candidate, leaf_depth, &segments))
			.map(|candidate| candidate.id)
			.collect();

		match matches.as_slice() {
			[] => Ok(None),
			[id] => Ok(Some(*id)),
			_ => {
				warn!(
					"AdjacencyIndex: {} chains match {}, refusing to pick one",
					matches.len(),
					path
				);
				Err(DedupError::AmbiguousPath {
					path: path.to_string(),
					matches: matches.len(),
				})
			}
		}
	}

	fn create(&self, store: &Store, path: &FolderPath) -> DedupResult<FolderId> {
		let segments = path.segments_unbounded()?;
		let mut parent = None;
		for (depth, name) in segments.iter().enumerate() {
			parent = Some(Self::child_or_insert(store, name, depth, parent)?);
		}
		let id = parent.ok_or_else(|| DedupError::InvalidPath {
			path: path.to_string(),
			reason: "a folder path needs at least one segment".to_string(),
		})?;
		debug!("AdjacencyIndex: folder {} -> {:?}", path, id);
		Ok(id)
	}

	fn folder_path(&self, store: &Store, id: FolderId) -> DedupResult<Option<FolderPath>> {
		let mut names = Vec::new();
		let mut current = Some(id);
		while let Some(id) = current {
			let Some(row) = store.node(id)? else {
				return Ok(None);
			};
			current = row.parent;
			names.push(row.name);
		}
		names.reverse();
		Ok(Some(FolderPath::from_segments(&names)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::paths::MAX_FOLDER_DEPTH;

	fn folder(rel: &str) -> FolderPath {
		FolderPath::new(std::env::temp_dir().join(rel)).unwrap()
	}

	#[test_log::test]
	fn test_same_name_same_depth_disambiguated() {
		let store = Store::in_memory().unwrap();
		let index = AdjacencyFolderIndex::new();
		let ax = index.create(&store, &folder("a/x")).unwrap();
		let bx = index.create(&store, &folder("b/x")).unwrap();
		assert_ne!(ax, bx);

		assert_eq!(index.resolve(&store, &folder("a/x")).unwrap(), Some(ax));
		assert_eq!(index.resolve(&store, &folder("b/x")).unwrap(), Some(bx));
		assert_eq!(index.resolve(&store, &folder("c/x")).unwrap(), None);
		assert_eq!(index.folder_path(&store, bx).unwrap(), Some(folder("b/x")));
	}

	#[test_log::test]
	fn test_create_is_idempotent() {
		let store = Store::in_memory().unwrap();
		let index = AdjacencyFolderIndex::new();
		let first = index.create(&store, &folder("p/q/r")).unwrap();
		let nodes = store.counts().unwrap().nodes;
		assert_eq!(index.create(&store, &folder("p/q/r")).unwrap(), first);
		assert_eq!(store.counts().unwrap().nodes, nodes);
	}

	#[test_log::test]
	fn test_no_depth_bound() {
		let store = Store::in_memory().unwrap();
		let index = AdjacencyFolderIndex::new();
		let deep = folder(&vec!["d"; MAX_FOLDER_DEPTH + 5].join("/"));
		let id = index.create(&store, &deep).unwrap();
		assert_eq!(index.resolve(&store, &deep).unwrap(), Some(id));
	}

	#[test_log::test]
	fn test_matcher_reports_every_surviving_chain() {
		let segments: Vec<String> = ["/", "a", "b"].iter().map(|s| s.to_string()).collect();
		let node = |id: u64, name: &str, depth: usize, parent: Option<u64>| NodeRow {
			id: FolderId(id),
			name: name.to_string(),
			depth,
			parent: parent.map(FolderId),
		};
		// Two "a" rows under the same root; rows like these only exist if the
		// store's unique index was bypassed.
		let rows = vec![
			node(1, "/", 0, None),
			node(2, "a", 1, Some(1)),
			node(3, "a", 1, Some(1)),
			node(4, "b", 2, Some(2)),
			node(5, "b", 2, Some(3)),
			node(6, "b", 2, Some(99)),
		];
		let buckets = Buckets::new(&rows);
		let matching: Vec<u64> = buckets
			.at(2)
			.iter()
			.filter(|candidate| buckets.chain_matches(candidate, 2, &segments))
			.map(|candidate| candidate.id.0)
			.collect();
		assert_eq!(matching, vec![4, 5]);
	}
}
