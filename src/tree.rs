//! Per-layer file tree.
//!
//! A [`FileTree`] holds the files of exactly one layer archive. Nodes live in an
//! arena owned by the tree and are addressed by [`NodeId`]; each node keeps its
//! parent id for upward navigation and a name-keyed map of children.
//!
//! Whiteout handling is deliberately shallow:
//! - paths containing an opaque-whiteout segment (`.wh..wh..`) are dropped at
//!   insertion time and never become nodes;
//! - plain whiteouts (`.wh.<name>`) are stored like any other file. Interpreting
//!   them as deletions only makes sense when layers are composed, which this
//!   crate does not do.

use std::collections::BTreeMap;

use log::trace;
use thiserror::Error;
use uuid::Uuid;

pub const WHITEOUT_PREFIX: &str = ".wh.";
pub const OPAQUE_WHITEOUT_PREFIX: &str = ".wh..wh..";

const ROOT: NodeId = NodeId(0);

#[derive(Error, Debug)]
pub enum TreeError {
    #[error("path does not exist: {0}")]
    NotFound(String),
    #[error("invalid path: {0:?}")]
    InvalidPath(String),
    #[error("cannot remove the tree root")]
    RemoveRoot,
    #[error("node {0} is not part of the tree")]
    StaleNode(usize),
}

/// Handle to a node inside one [`FileTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    HardLink,
    Other,
}

/// Archive entry metadata carried by a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub link_name: Option<String>,
    pub kind: EntryKind,
    pub mode: u32,
}

impl FileInfo {
    /// Placeholder payload for directories that only exist as path prefixes.
    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size: 0,
            link_name: None,
            kind: EntryKind::Directory,
            mode: 0o755,
        }
    }

    pub fn regular(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            link_name: None,
            kind: EntryKind::Regular,
            mode: 0o644,
        }
    }

    pub fn is_link(&self) -> bool {
        matches!(self.kind, EntryKind::Symlink | EntryKind::HardLink)
    }
}

#[derive(Debug, Clone)]
pub struct FileNode {
    name: String,
    parent: Option<NodeId>,
    children: BTreeMap<String, NodeId>,
    info: FileInfo,
}

impl FileNode {
    /// Final path segment; empty for the root.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Children in name order.
    pub fn children(&self) -> impl Iterator<Item = (&str, NodeId)> + '_ {
        self.children.iter().map(|(name, id)| (name.as_str(), *id))
    }

    pub fn child(&self, name: &str) -> Option<NodeId> {
        self.children.get(name).copied()
    }

    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn is_whiteout(&self) -> bool {
        self.name.starts_with(WHITEOUT_PREFIX)
    }
}

/// Outcome of [`FileTree::add_path`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedPath {
    /// The node holding the payload, `None` when the entry was dropped.
    pub node: Option<NodeId>,
    /// Nodes that did not exist before the call, outermost first.
    pub created: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct FileTree {
    id: Uuid,
    name: String,
    nodes: Vec<Option<FileNode>>,
    size: usize,
    file_size: u64,
}

impl Default for FileTree {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTree {
    pub fn new() -> Self {
        Self::named("")
    }

    /// Creates an empty tree labelled with the archive it was read from.
    pub fn named(name: impl Into<String>) -> Self {
        let root = FileNode {
            name: String::new(),
            parent: None,
            children: BTreeMap::new(),
            info: FileInfo::directory("/"),
        };
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            nodes: vec![Some(root)],
            size: 0,
            file_size: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> NodeId {
        ROOT
    }

    /// Number of nodes, not counting the root.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Sum of the declared sizes of every entry read into this tree.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub(crate) fn accumulate(&mut self, bytes: u64) {
        self.file_size += bytes;
    }

    pub fn get(&self, id: NodeId) -> Option<&FileNode> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    fn node(&self, id: NodeId) -> Result<&FileNode, TreeError> {
        self.get(id).ok_or(TreeError::StaleNode(id.0))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut FileNode, TreeError> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(TreeError::StaleNode(id.0))
    }

    fn insert_child(&mut self, parent: NodeId, name: &str, info: FileInfo) -> Result<NodeId, TreeError> {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(FileNode {
            name: name.to_string(),
            parent: Some(parent),
            children: BTreeMap::new(),
            info,
        }));
        self.node_mut(parent)?.children.insert(name.to_string(), id);
        self.size += 1;
        Ok(id)
    }

    /// Inserts `path`, creating missing intermediate directories.
    ///
    /// Only the final segment receives `info`. An existing node keeps its
    /// children and just has its payload replaced. Paths with an opaque-whiteout
    /// segment are dropped without error.
    pub fn add_path(&mut self, path: &str, info: FileInfo) -> Result<AddedPath, TreeError> {
        let names = segments(path)?;
        let mut created = Vec::new();

        if names
            .iter()
            .any(|name| name.starts_with(OPAQUE_WHITEOUT_PREFIX))
        {
            trace!("dropping opaque whiteout entry {}", path);
            return Ok(AddedPath {
                node: None,
                created,
            });
        }
        if names.is_empty() {
            return Ok(AddedPath {
                node: Some(ROOT),
                created,
            });
        }

        let mut current = ROOT;
        for (idx, name) in names.iter().enumerate() {
            current = match self.node(current)?.child(name) {
                Some(child) => child,
                None => {
                    let placeholder = FileInfo::directory(format!("/{}", names[..=idx].join("/")));
                    let child = self.insert_child(current, name, placeholder)?;
                    created.push(child);
                    child
                }
            };
        }

        self.node_mut(current)?.info = info;
        Ok(AddedPath {
            node: Some(current),
            created,
        })
    }

    /// Resolves a slash-delimited path (`/a/node/path`) to its node.
    pub fn get_node(&self, path: &str) -> Result<NodeId, TreeError> {
        let mut current = ROOT;
        for name in segments(path)? {
            current = self
                .node(current)?
                .child(name)
                .ok_or_else(|| TreeError::NotFound(path.to_string()))?;
        }
        Ok(current)
    }

    /// Removes a node and everything beneath it.
    pub fn remove(&mut self, id: NodeId) -> Result<(), TreeError> {
        if id == ROOT {
            return Err(TreeError::RemoveRoot);
        }
        let (name, parent) = {
            let node = self.node(id)?;
            (node.name.clone(), node.parent)
        };
        if let Some(parent) = parent {
            self.node_mut(parent)?.children.remove(&name);
        }

        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            if let Some(node) = self.nodes.get_mut(next.0).and_then(Option::take) {
                pending.extend(node.children.into_values());
                self.size -= 1;
            }
        }
        Ok(())
    }

    pub fn remove_path(&mut self, path: &str) -> Result<(), TreeError> {
        let id = self.get_node(path)?;
        self.remove(id)
    }

    /// Absolute path of a node, `/` for the root.
    pub fn path_of(&self, id: NodeId) -> Result<String, TreeError> {
        let mut names = Vec::new();
        let mut current = Some(id);
        while let Some(next) = current {
            let node = self.node(next)?;
            if node.parent.is_some() {
                names.push(node.name.as_str());
            }
            current = node.parent;
        }
        names.reverse();
        Ok(format!("/{}", names.join("/")))
    }

    /// Visits every node after its children, in name order.
    ///
    /// When `evaluator` is given, the visitor only runs for nodes it accepts;
    /// traversal itself is unaffected. The root is never visited.
    pub fn visit_depth_child_first<E, V>(
        &self,
        mut visitor: V,
        evaluator: Option<&dyn Fn(&FileNode) -> bool>,
    ) -> Result<(), E>
    where
        V: FnMut(NodeId, &FileNode) -> Result<(), E>,
    {
        let mut stack = vec![(ROOT, false)];
        while let Some((id, expanded)) = stack.pop() {
            let Some(node) = self.get(id) else {
                continue;
            };
            if expanded {
                if id != ROOT && evaluator.map_or(true, |accept| accept(node)) {
                    visitor(id, node)?;
                }
                continue;
            }
            stack.push((id, true));
            stack.extend(node.children.values().rev().map(|child| (*child, false)));
        }
        Ok(())
    }

    /// Total declared size of a node and all of its descendants.
    pub fn subtree_size(&self, id: NodeId) -> Result<u64, TreeError> {
        let mut total = 0;
        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            let node = self.node(next)?;
            total += node.info.size;
            pending.extend(node.children.values().copied());
        }
        Ok(total)
    }
}

fn segments(path: &str) -> Result<Vec<&str>, TreeError> {
    let mut names = Vec::new();
    for name in path.split('/') {
        match name {
            "" | "." => continue,
            ".." => return Err(TreeError::InvalidPath(path.to_string())),
            _ => names.push(name),
        }
    }
    Ok(names)
}
