//! Per-directory configuration cascade.
//!
//! Any directory in the source tree may contain a special file (`_dir.yml` by
//! default) whose top-level keys name registered extensions. The configuration
//! that applies to a directory is the merge of every special file from the
//! source root down to that directory:
//!
//! ```text
//! site/
//! ├── _dir.yml              context: {layout: page}
//! └── blog/
//!     ├── _dir.yml          context: {layout: post}, generator: {source: /posts}
//!     └── 2024/             (no special file)
//!
//! resolve(site/blog/2024):
//!   context   ← [ {layout: page}, {layout: post} ]   (root first)
//!   generator ← [ {source: /posts} ]
//!   draft     ← [ ]
//! ```
//!
//! How the per-level values combine (override, append, reject) is up to each
//! extension's [`process_config`](crate::extension::Extension::process_config).
//! Every registered extension is resolved for every directory, with an empty
//! layer list when no special file mentions it.
//!
//! ## Caching
//!
//! A resolver lives for one build. It keeps two caches:
//!
//! - special files by absolute path, including "not there" answers, so each
//!   file is probed and parsed at most once no matter how many directories
//!   share it as an ancestor;
//! - resolved configuration by directory, consulted before anything else, so
//!   resolving the same directory twice touches the filesystem once.

use crate::extension::{ExtensionSet, SchemaError};
use crate::naming::slash_path;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use serde_yaml::Mapping;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{path} must contain a mapping of extension names")]
    NotAMapping { path: PathBuf },
    #[error("unknown extension '{extension}' configured in {path}")]
    UnknownExtension { extension: String, path: PathBuf },
    #[error("invalid '{extension}' configuration for '{directory}': {source}")]
    Schema {
        extension: String,
        directory: String,
        #[source]
        source: SchemaError,
    },
}

/// Validated configuration for one directory, keyed by extension name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedConfig {
    values: IndexMap<String, Value>,
    origins: IndexMap<String, PathBuf>,
    sources: Vec<PathBuf>,
    candidates: Vec<PathBuf>,
}

impl ResolvedConfig {
    /// Resolved value for an extension.
    pub fn get(&self, extension: &str) -> Option<&Value> {
        self.values.get(extension)
    }

    /// Resolved value for an extension, deserialized.
    pub fn get_as<T: DeserializeOwned>(&self, extension: &str) -> Result<Option<T>, serde_json::Error> {
        self.values
            .get(extension)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
    }

    /// Deepest directory (relative to the source root) whose special file
    /// mentions `extension`, or `None` when no special file does.
    pub fn origin(&self, extension: &str) -> Option<&Path> {
        self.origins.get(extension).map(PathBuf::as_path)
    }

    /// Special files that contributed, root first.
    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    /// Every special-file path probed, root first, whether it existed or not.
    pub fn candidates(&self) -> &[PathBuf] {
        &self.candidates
    }

    /// Probed special-file paths that did not exist.
    pub fn missing(&self) -> impl Iterator<Item = &PathBuf> {
        self.candidates
            .iter()
            .filter(|path| !self.sources.contains(path))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Resolves and caches the cascade for directories under one source root.
#[derive(Debug)]
pub struct ConfigCascade {
    root: PathBuf,
    special_file: String,
    extensions: ExtensionSet,
    files: HashMap<PathBuf, Option<Rc<Mapping>>>,
    resolved: HashMap<PathBuf, Rc<ResolvedConfig>>,
    probes: usize,
    parses: usize,
}

impl ConfigCascade {
    pub fn new(root: impl Into<PathBuf>, special_file: impl Into<String>, extensions: ExtensionSet) -> Self {
        Self {
            root: root.into(),
            special_file: special_file.into(),
            extensions,
            files: HashMap::new(),
            resolved: HashMap::new(),
            probes: 0,
            parses: 0,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn special_file(&self) -> &str {
        &self.special_file
    }

    /// Number of special-file existence checks performed so far.
    pub fn probe_count(&self) -> usize {
        self.probes
    }

    /// Number of special files parsed so far.
    pub fn parse_count(&self) -> usize {
        self.parses
    }

    /// Resolve the configuration for `directory`.
    ///
    /// `directory` may be absolute or relative to the source root. The walk
    /// climbs towards the root and stops after the root itself; a directory
    /// outside the root resolves to the extensions' defaults.
    pub fn resolve(&mut self, directory: &Path) -> Result<Rc<ResolvedConfig>, CascadeError> {
        let directory = if directory.is_absolute() {
            directory.to_path_buf()
        } else {
            self.root.join(directory)
        };
        if let Some(resolved) = self.resolved.get(&directory) {
            return Ok(Rc::clone(resolved));
        }

        // Leaf to root while walking; reversed before merging.
        let mut layers: IndexMap<String, Vec<(PathBuf, serde_yaml::Value)>> = IndexMap::new();
        let mut sources = Vec::new();
        let mut candidates = Vec::new();
        let mut level = Some(directory.as_path());
        while let Some(dir) = level {
            if !dir.starts_with(&self.root) {
                break;
            }
            let file = dir.join(&self.special_file);
            candidates.push(file.clone());
            if let Some(mapping) = self.load(&file)? {
                let relative = dir.strip_prefix(&self.root).unwrap_or(dir).to_path_buf();
                for (key, value) in mapping.iter() {
                    let Some(name) = key.as_str() else {
                        return Err(CascadeError::UnknownExtension {
                            extension: format!("{key:?}"),
                            path: file,
                        });
                    };
                    if !self.extensions.contains(name) {
                        return Err(CascadeError::UnknownExtension {
                            extension: name.to_string(),
                            path: file,
                        });
                    }
                    layers
                        .entry(name.to_string())
                        .or_default()
                        .push((relative.clone(), value.clone()));
                }
                sources.push(file);
            }
            level = dir.parent();
        }
        sources.reverse();
        candidates.reverse();

        let mut resolved = ResolvedConfig {
            sources,
            candidates,
            ..ResolvedConfig::default()
        };
        for extension in self.extensions.iter() {
            let name = extension.name();
            let mut levels = layers.shift_remove(name).unwrap_or_default();
            levels.reverse();
            if let Some((origin, _)) = levels.last() {
                resolved.origins.insert(name.to_string(), origin.clone());
            }
            let values = levels.into_iter().map(|(_, value)| value).collect();
            let value = extension
                .process_config(values)
                .map_err(|source| CascadeError::Schema {
                    extension: name.to_string(),
                    directory: slash_path(directory.strip_prefix(&self.root).unwrap_or(&directory)),
                    source,
                })?;
            resolved.values.insert(name.to_string(), value);
        }

        debug!(
            directory = %directory.display(),
            sources = resolved.sources.len(),
            "resolved directory config"
        );
        let resolved = Rc::new(resolved);
        self.resolved.insert(directory, Rc::clone(&resolved));
        Ok(resolved)
    }

    /// Probe and parse a special file, at most once per path.
    fn load(&mut self, file: &Path) -> Result<Option<Rc<Mapping>>, CascadeError> {
        if let Some(cached) = self.files.get(file) {
            return Ok(cached.clone());
        }
        self.probes += 1;
        let loaded = if file.is_file() {
            self.parses += 1;
            trace!(path = %file.display(), "parsing special file");
            let content = fs::read_to_string(file).map_err(|source| CascadeError::Io {
                path: file.to_path_buf(),
                source,
            })?;
            let value: serde_yaml::Value =
                serde_yaml::from_str(&content).map_err(|source| CascadeError::Parse {
                    path: file.to_path_buf(),
                    source,
                })?;
            match value {
                serde_yaml::Value::Mapping(mapping) => Some(Rc::new(mapping)),
                // An empty file configures nothing.
                serde_yaml::Value::Null => Some(Rc::new(Mapping::new())),
                _ => {
                    return Err(CascadeError::NotAMapping {
                        path: file.to_path_buf(),
                    });
                }
            }
        } else {
            None
        };
        self.files.insert(file.to_path_buf(), loaded.clone());
        Ok(loaded)
    }
}
