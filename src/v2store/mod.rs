//! Legacy hierarchical store.
//!
//! A tree of directories and string values addressed by `/`-separated paths.
//! Two top-level directories always exist: `/0` holds cluster metadata and
//! `/1` holds user keys. Snapshots carry the whole tree as JSON.

use crate::error::{Result, TesseraError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Directory holding cluster metadata.
pub const CLUSTER_PREFIX: &str = "/0";
/// Directory holding user keys.
pub const KEYS_PREFIX: &str = "/1";

/// How far the legacy store has been retired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum V2DeprecationLevel {
    /// User content is still tolerated.
    NotYet,
    /// Only metadata may be present.
    #[default]
    WriteOnly,
    /// As `WriteOnly`, and user content is dropped on upgrade.
    WriteOnlyDrop,
    /// The store is not used at all.
    Gone,
}

impl fmt::Display for V2DeprecationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            V2DeprecationLevel::NotYet => "not-yet",
            V2DeprecationLevel::WriteOnly => "write-only",
            V2DeprecationLevel::WriteOnlyDrop => "write-only-drop",
            V2DeprecationLevel::Gone => "gone",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
enum Node {
    Dir(BTreeMap<String, Node>),
    Value(String),
}

/// The hierarchical store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Store {
    root: BTreeMap<String, Node>,
    /// Bumped on every modification.
    index: u64,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Create a store holding only the two top-level directories.
    pub fn new() -> Self {
        let mut root = BTreeMap::new();
        root.insert("0".to_string(), Node::Dir(BTreeMap::new()));
        root.insert("1".to_string(), Node::Dir(BTreeMap::new()));
        Self { root, index: 0 }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    /// Set `path` to `value`, creating parent directories as needed.
    pub fn set(&mut self, path: &str, value: impl Into<String>) -> Result<()> {
        let (parents, leaf) = split_leaf(path)?;
        let dir = self.dir_mut(&parents, true)?;
        if let Some(Node::Dir(_)) = dir.get(leaf) {
            return Err(TesseraError::Storage(format!("{} is a directory", path)));
        }
        dir.insert(leaf.to_string(), Node::Value(value.into()));
        self.index += 1;
        Ok(())
    }

    /// Create the directory at `path` and its parents. Existing directories are kept.
    pub fn create_dir(&mut self, path: &str) -> Result<()> {
        let parts = components(path);
        self.dir_mut(&parts, true)?;
        self.index += 1;
        Ok(())
    }

    /// Value stored at `path`.
    pub fn get(&self, path: &str) -> Option<&str> {
        match self.node(path)? {
            Node::Value(v) => Some(v),
            Node::Dir(_) => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.node(path).is_some()
    }

    /// Names of the children of the directory at `path`, sorted.
    pub fn list(&self, path: &str) -> Vec<String> {
        match self.node(path) {
            Some(Node::Dir(children)) => children.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Remove the node at `path` and everything under it.
    pub fn delete(&mut self, path: &str) -> Result<()> {
        let (parents, leaf) = split_leaf(path)?;
        let dir = self.dir_mut(&parents, false)?;
        if dir.remove(leaf).is_none() {
            return Err(TesseraError::NotFound(path.to_string()));
        }
        self.index += 1;
        Ok(())
    }

    /// Serialize the whole tree.
    pub fn save(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Replace the tree with one produced by [`Store::save`].
    pub fn recovery(&mut self, data: &[u8]) -> Result<()> {
        let recovered: Store = serde_json::from_slice(data)
            .map_err(|e| TesseraError::Deserialization(format!("v2 store: {}", e)))?;
        *self = recovered;
        debug!(index = self.index, "Recovered v2 store");
        Ok(())
    }

    /// Whether anything other than cluster metadata is stored.
    pub fn has_user_data(&self) -> bool {
        self.root.iter().any(|(name, node)| {
            name != "0"
                && match node {
                    Node::Dir(children) => !children.is_empty(),
                    Node::Value(_) => true,
                }
        })
    }

    fn node(&self, path: &str) -> Option<&Node> {
        let parts = components(path);
        let (first, rest) = parts.split_first()?;
        let mut node = self.root.get(*first)?;
        for part in rest {
            match node {
                Node::Dir(children) => node = children.get(*part)?,
                Node::Value(_) => return None,
            }
        }
        Some(node)
    }

    fn dir_mut(&mut self, parts: &[&str], create: bool) -> Result<&mut BTreeMap<String, Node>> {
        let mut dir = &mut self.root;
        for part in parts {
            if create {
                dir.entry(part.to_string())
                    .or_insert_with(|| Node::Dir(BTreeMap::new()));
            }
            dir = match dir.get_mut(*part) {
                Some(Node::Dir(children)) => children,
                Some(Node::Value(_)) => {
                    return Err(TesseraError::Storage(format!("{} is not a directory", part)))
                }
                None => return Err(TesseraError::NotFound(part.to_string())),
            };
        }
        Ok(dir)
    }
}

fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|p| !p.is_empty()).collect()
}

fn split_leaf(path: &str) -> Result<(Vec<&str>, &str)> {
    let mut parts = components(path);
    let leaf = parts
        .pop()
        .ok_or_else(|| TesseraError::Storage("cannot modify the root".to_string()))?;
    Ok((parts, leaf))
}

/// Fail if `store` holds user content the deprecation `level` forbids.
pub fn assert_no_v2_store_content(store: &Store, level: V2DeprecationLevel) -> Result<()> {
    if !store.has_user_data() || level < V2DeprecationLevel::WriteOnly {
        return Ok(());
    }
    Err(TesseraError::Config(format!(
        "detected disallowed custom content in v2 store for stage --v2-deprecation={}",
        level
    )))
}
