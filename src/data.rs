//! Lazy, read-only data tree over one or more directories.
//!
//! Any directory of documents can be exposed to templates as a key-addressable
//! namespace. Nothing is scanned up front: a node is just a set of directory
//! layers plus a relative path, and a lookup costs one `stat` per layer for
//! each path component.
//!
//! ```text
//! _data/                      data(path="posts")          → directory node
//! ├── posts/                  data(path="posts/first.md") → document node
//! │   ├── first.md
//! │   └── second.md
//! └── authors.yml
//! ```
//!
//! In a template the result is bound before use, since Tera does not allow
//! attribute access on a function call:
//!
//! ```text
//! {% set first = data(path="posts/first.md") %}{{ first.data.title }}
//! ```
//!
//! ## Overlays
//!
//! A [`CompositeDataTree`] stacks several roots. Lookups probe the roots in
//! registration order and the first hit wins, at every depth: when two roots
//! both have a `posts/` directory, the merged `posts` node sees the union of
//! their entries, with the earlier root's entry winning for duplicate names.
//! A file in an earlier root shadows a directory of the same name in a later
//! one, and vice versa.
//!
//! ## Documents
//!
//! A [`DocumentNode`] wraps a file path. Its front matter is parsed on first
//! access and cached by absolute path for the lifetime of the tree, so every
//! render that touches the same document shares one parse.
//!
//! ## Read-only
//!
//! Nodes never hold references to their parents or siblings, and nothing can
//! write through them: every write-style operation on the [`ReadOnly`] trait
//! fails with [`DataError::ImmutableWrite`].

use crate::frontmatter::{self, FrontMatterError};
use crate::naming::{is_hidden, normalize_key, slash_path};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, trace};

/// Template-name prefix under which data documents can be rendered as templates.
pub const DATA_NAMESPACE: &str = "@data/";

#[derive(Error, Debug)]
pub enum DataError {
    #[error("cannot {operation} '{key}' on read-only {target}")]
    ImmutableWrite {
        operation: &'static str,
        target: String,
        key: String,
    },
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("front matter error in {path}: {source}")]
    FrontMatter {
        path: PathBuf,
        #[source]
        source: FrontMatterError,
    },
}

/// Parsed contents of a data document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub data: Option<Value>,
    pub body: String,
}

type DocumentCache = Arc<Mutex<HashMap<PathBuf, Arc<Document>>>>;

/// Write-style operations, which always fail on data nodes.
pub trait ReadOnly {
    /// Human-readable description used in error messages.
    fn describe(&self) -> String;

    fn set(&self, key: &str, _value: Value) -> Result<(), DataError> {
        Err(DataError::ImmutableWrite {
            operation: "set",
            target: self.describe(),
            key: key.to_string(),
        })
    }

    fn delete(&self, key: &str) -> Result<(), DataError> {
        Err(DataError::ImmutableWrite {
            operation: "delete",
            target: self.describe(),
            key: key.to_string(),
        })
    }
}

/// A node in the data tree.
#[derive(Debug, Clone)]
pub enum DataNode {
    Directory(DirectoryNode),
    Document(DocumentNode),
}

impl DataNode {
    /// Final path component of the node (empty for a tree root).
    pub fn name(&self) -> String {
        match self {
            DataNode::Directory(dir) => dir.name(),
            DataNode::Document(doc) => doc.name(),
        }
    }

    pub fn as_document(&self) -> Option<&DocumentNode> {
        match self {
            DataNode::Document(doc) => Some(doc),
            DataNode::Directory(_) => None,
        }
    }

    pub fn as_directory(&self) -> Option<&DirectoryNode> {
        match self {
            DataNode::Directory(dir) => Some(dir),
            DataNode::Document(_) => None,
        }
    }

    /// Convert the node to a template value.
    ///
    /// Documents become `{name, path, template, is_dir, data}`. Directories
    /// become `{name, path, is_dir, entries}` where `entries` lists the
    /// immediate children only (subdirectories without their own entries).
    /// `visit` is called with every file whose data is read and with every
    /// layer directory that was listed, so additions and removals show up as
    /// a changed directory.
    pub fn to_value(&self, visit: &mut dyn FnMut(&Path)) -> Result<Value, DataError> {
        match self {
            DataNode::Document(doc) => document_value(doc, visit),
            DataNode::Directory(dir) => {
                for layer in dir.layers() {
                    visit(layer);
                }
                let mut entries = Vec::new();
                for child in dir.entries()? {
                    match &child {
                        DataNode::Document(doc) => entries.push(document_value(doc, visit)?),
                        DataNode::Directory(sub) => entries.push(directory_stub(sub)),
                    }
                }
                let mut map = directory_stub_map(dir);
                map.insert("entries".into(), Value::Array(entries));
                Ok(Value::Object(map))
            }
        }
    }
}

impl ReadOnly for DataNode {
    fn describe(&self) -> String {
        match self {
            DataNode::Directory(dir) => dir.describe(),
            DataNode::Document(doc) => doc.describe(),
        }
    }
}

fn document_value(doc: &DocumentNode, visit: &mut dyn FnMut(&Path)) -> Result<Value, DataError> {
    visit(doc.path());
    let mut map = Map::new();
    map.insert("name".into(), Value::String(doc.name()));
    map.insert("path".into(), Value::String(slash_path(doc.relative())));
    map.insert("template".into(), Value::String(doc.template_name()));
    map.insert("is_dir".into(), Value::Bool(false));
    map.insert(
        "data".into(),
        doc.data()?.unwrap_or_else(|| Value::Object(Map::new())),
    );
    Ok(Value::Object(map))
}

fn directory_stub_map(dir: &DirectoryNode) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("name".into(), Value::String(dir.name()));
    map.insert("path".into(), Value::String(slash_path(dir.relative())));
    map.insert("is_dir".into(), Value::Bool(true));
    map
}

fn directory_stub(dir: &DirectoryNode) -> Value {
    Value::Object(directory_stub_map(dir))
}

/// A directory in the data tree, possibly merged from several layers.
#[derive(Debug, Clone)]
pub struct DirectoryNode {
    /// Absolute directories backing this node, highest priority first.
    layers: Vec<PathBuf>,
    /// Path relative to the tree root.
    relative: PathBuf,
    cache: DocumentCache,
}

/// Open a single directory as a data tree.
pub fn open(root: impl Into<PathBuf>) -> DirectoryNode {
    DirectoryNode {
        layers: vec![root.into()],
        relative: PathBuf::new(),
        cache: DocumentCache::default(),
    }
}

impl DirectoryNode {
    pub fn name(&self) -> String {
        self.relative
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn relative(&self) -> &Path {
        &self.relative
    }

    /// Absolute directories backing this node, highest priority first.
    pub fn layers(&self) -> &[PathBuf] {
        &self.layers
    }

    /// Look up a child by `/`-separated key.
    ///
    /// Returns `None` when no layer has an entry at `key` or when the key
    /// tries to escape the tree.
    pub fn lookup(&self, key: &str) -> Option<DataNode> {
        let key = normalize_key(key)?;
        let mut components = key.iter().peekable();
        let mut dir = self.clone();
        while let Some(name) = components.next() {
            let child = dir.child(Path::new(name))?;
            if components.peek().is_none() {
                return Some(child);
            }
            match child {
                DataNode::Directory(next) => dir = next,
                DataNode::Document(_) => return None,
            }
        }
        None
    }

    /// Resolve one path component across the layers, first match wins.
    fn child(&self, name: &Path) -> Option<DataNode> {
        let mut dirs = Vec::new();
        for layer in &self.layers {
            let candidate = layer.join(name);
            let Ok(meta) = fs::metadata(&candidate) else {
                continue;
            };
            if meta.is_dir() {
                dirs.push(candidate);
            } else if !dirs.is_empty() {
                // A file shadows every lower layer, directories included.
                break;
            } else {
                trace!(path = %candidate.display(), "data lookup hit document");
                return Some(DataNode::Document(DocumentNode {
                    path: candidate,
                    relative: self.relative.join(name),
                    cache: Arc::clone(&self.cache),
                }));
            }
        }
        if dirs.is_empty() {
            return None;
        }
        Some(DataNode::Directory(DirectoryNode {
            layers: dirs,
            relative: self.relative.join(name),
            cache: Arc::clone(&self.cache),
        }))
    }

    /// Whether any layer has an entry at `key`.
    pub fn exists(&self, key: &str) -> bool {
        let Some(key) = normalize_key(key) else {
            return false;
        };
        self.lookup(&slash_path(&key)).is_some()
    }

    /// Immediate children, sorted by name, hidden entries skipped.
    ///
    /// A name present in several layers appears once, resolved with the
    /// same first-match rule as [`lookup`](Self::lookup).
    pub fn entries(&self) -> Result<Vec<DataNode>, DataError> {
        let mut names = BTreeSet::new();
        for layer in &self.layers {
            let read = fs::read_dir(layer).map_err(|source| DataError::Io {
                path: layer.clone(),
                source,
            })?;
            for entry in read {
                let entry = entry.map_err(|source| DataError::Io {
                    path: layer.clone(),
                    source,
                })?;
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    debug!(path = %entry.path().display(), "skipping non UTF-8 data entry");
                    continue;
                };
                if !is_hidden(&name) {
                    names.insert(name);
                }
            }
        }
        Ok(names.iter().filter_map(|name| self.lookup(name)).collect())
    }

    /// Only the document children, in name order.
    pub fn documents(&self) -> Result<Vec<DocumentNode>, DataError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter_map(|node| match node {
                DataNode::Document(doc) => Some(doc),
                DataNode::Directory(_) => None,
            })
            .collect())
    }
}

impl ReadOnly for DirectoryNode {
    fn describe(&self) -> String {
        format!("data directory '{}'", slash_path(&self.relative))
    }
}

/// A leaf of the data tree wrapping one file.
#[derive(Debug, Clone)]
pub struct DocumentNode {
    path: PathBuf,
    relative: PathBuf,
    cache: DocumentCache,
}

impl DocumentNode {
    /// File name of the document.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Absolute path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path relative to the tree root.
    pub fn relative(&self) -> &Path {
        &self.relative
    }

    /// Identifier under which the template engine renders this document's body.
    pub fn template_name(&self) -> String {
        format!("{DATA_NAMESPACE}{}", slash_path(&self.relative))
    }

    /// The parsed document, read and parsed on first access only.
    pub fn document(&self) -> Result<Arc<Document>, DataError> {
        if let Some(doc) = self.lock_cache().get(&self.path) {
            return Ok(Arc::clone(doc));
        }
        let bytes = fs::read(&self.path).map_err(|source| DataError::Io {
            path: self.path.clone(),
            source,
        })?;
        let parsed = frontmatter::parse_bytes(&bytes).map_err(|source| DataError::FrontMatter {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), "parsed data document");
        let doc = Arc::new(Document {
            data: parsed.data,
            body: parsed.body,
        });
        let mut cache = self.lock_cache();
        Ok(Arc::clone(cache.entry(self.path.clone()).or_insert(doc)))
    }

    /// Front matter payload, `None` when the document has none.
    pub fn data(&self) -> Result<Option<Value>, DataError> {
        Ok(self.document()?.data.clone())
    }

    /// Document body with the front matter removed.
    pub fn body(&self) -> Result<String, DataError> {
        Ok(self.document()?.body.clone())
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Arc<Document>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ReadOnly for DocumentNode {
    fn describe(&self) -> String {
        format!("data document '{}'", slash_path(&self.relative))
    }
}

/// Several data roots overlaid with first-match-wins semantics.
#[derive(Debug, Clone)]
pub struct CompositeDataTree {
    root: DirectoryNode,
}

impl CompositeDataTree {
    /// Overlay `roots` in priority order. Roots that are not directories are
    /// dropped.
    pub fn open<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let layers = roots
            .into_iter()
            .map(Into::into)
            .filter(|root: &PathBuf| {
                let is_dir = root.is_dir();
                if !is_dir {
                    debug!(root = %root.display(), "ignoring missing data root");
                }
                is_dir
            })
            .collect();
        Self {
            root: DirectoryNode {
                layers,
                relative: PathBuf::new(),
                cache: DocumentCache::default(),
            },
        }
    }

    /// A tree with no roots: every lookup misses.
    pub fn empty() -> Self {
        Self::open(Vec::<PathBuf>::new())
    }

    pub fn roots(&self) -> &[PathBuf] {
        self.root.layers()
    }

    /// The merged root directory.
    pub fn root(&self) -> &DirectoryNode {
        &self.root
    }

    pub fn lookup(&self, key: &str) -> Option<DataNode> {
        self.root.lookup(key)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.root.exists(key)
    }

    pub fn entries(&self) -> Result<Vec<DataNode>, DataError> {
        self.root.entries()
    }

    /// Resolve a pointer such as `/posts` or `/authors/ada.md`.
    ///
    /// The empty pointer and `/` resolve to the root directory.
    pub fn resolve_pointer(&self, pointer: &str) -> Option<DataNode> {
        if pointer.trim_matches('/').is_empty() {
            return Some(DataNode::Directory(self.root.clone()));
        }
        self.root.lookup(pointer)
    }

    /// Find a document by its `@data/` template name.
    pub fn document_for_template(&self, name: &str) -> Option<DocumentNode> {
        let key = name.strip_prefix(DATA_NAMESPACE)?;
        match self.root.lookup(key)? {
            DataNode::Document(doc) => Some(doc),
            DataNode::Directory(_) => None,
        }
    }
}

impl ReadOnly for CompositeDataTree {
    fn describe(&self) -> String {
        "data tree".to_string()
    }
}
