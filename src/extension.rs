//! Extension contract and the built-in extensions.
//!
//! An extension is two things at once:
//!
//! 1. A **schema processor** for its own key in per-directory special files.
//!    The cascade hands it every value found for that key from the source root
//!    down to the directory being resolved, and it returns one validated,
//!    merged configuration value (see [`crate::cascade`]).
//! 2. A **subscriber** to the five build lifecycle events (see
//!    [`crate::events`]). Hooks default to doing nothing.
//!
//! ```text
//! _dir.yml                     extension          resolved value
//! ─────────────────────────    ───────────────    ─────────────────────
//! generator: {source: /posts}  generator          {"source": "/posts"}
//! context: {layout: post}      context            {"layout": "post"}
//! draft: true                  draft              true
//! ```
//!
//! ## Built-ins
//!
//! | Key | Effect |
//! |-----|--------|
//! | `generator` | Renders one output per document under a data pointer into the declaring directory |
//! | `context` | Default render context variables, merged down the cascade |
//! | `draft` | `true` skips the directory and everything below it |

use crate::build::BuildError;
use crate::data::DataNode;
use crate::events::{
    DirectoryEnterEvent, OldFileEvent, RenderEvent, RenderRequest, SetupEvent, TeardownEvent,
};
use crate::naming::strip_template_suffix;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::rc::Rc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("{0}")]
    Invalid(#[from] serde_yaml::Error),
    #[error("{0}")]
    Encode(#[from] serde_json::Error),
    #[error("{0}")]
    Validation(String),
}

/// A pluggable participant in the build.
pub trait Extension {
    /// Key under which this extension is configured in special files.
    fn name(&self) -> &str;

    /// Merge and validate the cascade for this extension.
    ///
    /// `layers` is ordered from the source root down to the directory being
    /// resolved and is empty when no special file mentions the extension.
    fn process_config(&self, layers: Vec<serde_yaml::Value>) -> Result<Value, SchemaError>;

    fn setup(&self, _event: &mut SetupEvent<'_>) -> Result<(), BuildError> {
        Ok(())
    }

    fn directory_enter(&self, _event: &mut DirectoryEnterEvent<'_>) -> Result<(), BuildError> {
        Ok(())
    }

    fn old_file(&self, _event: &mut OldFileEvent) -> Result<(), BuildError> {
        Ok(())
    }

    fn render(&self, _event: &mut RenderEvent<'_>) -> Result<(), BuildError> {
        Ok(())
    }

    fn teardown(&self, _event: &mut TeardownEvent<'_>) -> Result<(), BuildError> {
        Ok(())
    }
}

/// Registered extensions, in registration order.
#[derive(Clone, Default)]
pub struct ExtensionSet {
    extensions: IndexMap<String, Rc<dyn Extension>>,
}

impl ExtensionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The set every [`Builder`](crate::build::Builder) starts with.
    pub fn with_builtins() -> Self {
        let mut set = Self::new();
        set.register(Rc::new(GeneratorExtension));
        set.register(Rc::new(ContextExtension));
        set.register(Rc::new(DraftExtension));
        set
    }

    /// Add an extension. Returns `false` (and leaves the set unchanged) when
    /// the name is already taken.
    pub fn register(&mut self, extension: Rc<dyn Extension>) -> bool {
        let name = extension.name().to_string();
        if self.extensions.contains_key(&name) {
            return false;
        }
        self.extensions.insert(name, extension);
        true
    }

    pub fn get(&self, name: &str) -> Option<&Rc<dyn Extension>> {
        self.extensions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.extensions.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<dyn Extension>> {
        self.extensions.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.extensions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}

impl fmt::Debug for ExtensionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.extensions.keys()).finish()
    }
}

// =============================================================================
// Layer merging
// =============================================================================

/// Recursively merge `overlay` on top of `base`.
///
/// Mappings merge key by key; anything else in `overlay` replaces `base`.
pub fn merge_yaml(base: serde_yaml::Value, overlay: serde_yaml::Value) -> serde_yaml::Value {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(mut base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, overlay_val) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_val) => merge_yaml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_map.insert(key, merged);
            }
            serde_yaml::Value::Mapping(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Deep-merge cascade layers root to leaf and deserialize the result.
///
/// No layers yields `T::default()`.
pub fn merge_layers<T>(layers: Vec<serde_yaml::Value>) -> Result<T, SchemaError>
where
    T: DeserializeOwned + Default,
{
    let merged = layers.into_iter().reduce(merge_yaml);
    match merged {
        Some(value) => Ok(serde_yaml::from_value(value)?),
        None => Ok(T::default()),
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Value, SchemaError> {
    Ok(serde_json::to_value(value)?)
}

// =============================================================================
// generator
// =============================================================================

/// Per-directory generator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneratorConfig {
    /// Pointer into the data tree, e.g. `/posts`.
    pub source: String,
}

/// Renders every document under a data pointer into the directory that
/// declares it.
///
/// Each document is rendered as a template (its body, through the `@data/`
/// namespace) with its own front matter as context. The output file is named
/// after the document with any template suffix removed, so
/// `_data/posts/hello.html.twig` becomes `<dir>/hello.html`.
#[derive(Debug, Default)]
pub struct GeneratorExtension;

impl Extension for GeneratorExtension {
    fn name(&self) -> &str {
        "generator"
    }

    fn process_config(&self, layers: Vec<serde_yaml::Value>) -> Result<Value, SchemaError> {
        let config: Option<GeneratorConfig> = merge_layers(layers)?;
        if let Some(config) = &config
            && !config.source.starts_with('/')
        {
            return Err(SchemaError::Validation(format!(
                "generator.source must be a pointer starting with '/', got '{}'",
                config.source
            )));
        }
        encode(&config)
    }

    fn directory_enter(&self, event: &mut DirectoryEnterEvent<'_>) -> Result<(), BuildError> {
        // Only the directory whose own special file declares the generator
        // renders; descendants inherit the value but not the work.
        if event.config.origin(self.name()) != Some(event.relative) {
            return Ok(());
        }
        let config: Option<GeneratorConfig> = event
            .config
            .get_as(self.name())
            .map_err(|e| BuildError::extension(self.name(), e))?
            .flatten();
        let Some(config) = config else {
            return Ok(());
        };

        let node = event.data.resolve_pointer(&config.source);
        let Some(DataNode::Directory(dir)) = node else {
            debug!(source = %config.source, "generator source is not a data directory");
            return Ok(());
        };

        let suffixes = event.template_suffixes.to_vec();
        for doc in dir.documents().map_err(|e| BuildError::extension(self.name(), e))? {
            let name = doc.name();
            let file_name = strip_template_suffix(&name, &suffixes);
            let context = match doc.data().map_err(|e| BuildError::extension(self.name(), e))? {
                Some(Value::Object(map)) => map,
                _ => Map::new(),
            };
            event.render(RenderRequest {
                template: doc.template_name(),
                output: event.relative.join(file_name),
                context,
            });
        }
        Ok(())
    }
}

// =============================================================================
// context
// =============================================================================

/// Default context variables for every render in a directory subtree.
///
/// Values set by a deeper directory override its ancestors key by key; a
/// file's own front matter always wins.
#[derive(Debug, Default)]
pub struct ContextExtension;

impl Extension for ContextExtension {
    fn name(&self) -> &str {
        "context"
    }

    fn process_config(&self, layers: Vec<serde_yaml::Value>) -> Result<Value, SchemaError> {
        let defaults: Map<String, Value> = merge_layers(layers)?;
        encode(&defaults)
    }

    fn render(&self, event: &mut RenderEvent<'_>) -> Result<(), BuildError> {
        let Some(Value::Object(defaults)) = event.config.get(self.name()) else {
            return Ok(());
        };
        for (key, value) in defaults {
            event
                .context
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        Ok(())
    }
}

// =============================================================================
// draft
// =============================================================================

/// Marks a directory subtree as unpublished.
#[derive(Debug, Default)]
pub struct DraftExtension;

impl Extension for DraftExtension {
    fn name(&self) -> &str {
        "draft"
    }

    fn process_config(&self, layers: Vec<serde_yaml::Value>) -> Result<Value, SchemaError> {
        let draft: bool = merge_layers(layers)?;
        encode(&draft)
    }

    fn directory_enter(&self, event: &mut DirectoryEnterEvent<'_>) -> Result<(), BuildError> {
        if event.config.get(self.name()) == Some(&Value::Bool(true)) {
            debug!(directory = %event.relative.display(), "skipping draft directory");
            event.skip();
        }
        Ok(())
    }
}
