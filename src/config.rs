//! Project configuration module.
//!
//! Handles loading, validating, and merging the project's `site.toml`. This is
//! the file that says where things are; per-directory behaviour lives in the
//! YAML special files handled by [`crate::cascade`].
//!
//! ## Config File Location
//!
//! ```text
//! site/
//! ├── site.toml            # Project config (optional, `--config` to rename)
//! ├── _dir.yml             # Per-directory config, cascades downwards
//! ├── _templates/          # Auto-detected template directory
//! ├── _data/               # Auto-detected data directory
//! └── index.html.twig
//! ```
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! [site]
//! name = ""                 # Exposed to templates as `site.name`
//! description = ""
//! url = ""
//!
//! [build]
//! # output = "_site"       # Output directory, relative to the source root
//! special_file = "_dir.yml" # Per-directory config file name
//! excludes = []             # Paths or globs relative to the source root
//! templates = []            # Template directories (default: _templates/ if present)
//! data = []                 # Data directories (default: _data/ if present)
//! ignore_dotfiles = false
//! template_suffixes = ["twig", "tera"]
//! markdown = true           # Convert rendered .md outputs to HTML
//! ```
//!
//! ## Precedence
//!
//! For template and data directories, command-line values replace `site.toml`
//! values, which replace the `_templates/` and `_data/` conventions. Excludes
//! are the union of every source plus the output directory, the config file
//! and every resolved template and data directory.
//!
//! Unknown keys are rejected to catch typos early.

use crate::build::{BuildOptions, DEFAULT_SPECIAL_FILE, DEFAULT_TEMPLATE_SUFFIXES};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Config file looked up at the source root when none is named.
pub const DEFAULT_CONFIG_FILE: &str = "site.toml";
pub const DEFAULT_OUTPUT_DIR: &str = "_site";
pub const CONVENTIONAL_TEMPLATES_DIR: &str = "_templates";
pub const CONVENTIONAL_DATA_DIR: &str = "_data";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config file not found: {0}")]
    NotFound(PathBuf),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Project configuration loaded from `site.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SiteConfig {
    /// Site metadata, available to every template as `site`.
    pub site: SiteMeta,
    /// Where sources, templates, data and output live.
    pub build: BuildConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SiteMeta {
    pub name: String,
    pub description: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// Output directory relative to the source root. Defaults to `_site`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub special_file: String,
    pub excludes: Vec<String>,
    pub templates: Vec<String>,
    pub data: Vec<String>,
    pub ignore_dotfiles: bool,
    pub template_suffixes: Vec<String>,
    pub markdown: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            output: None,
            special_file: DEFAULT_SPECIAL_FILE.to_string(),
            excludes: Vec::new(),
            templates: Vec::new(),
            data: Vec::new(),
            ignore_dotfiles: false,
            template_suffixes: DEFAULT_TEMPLATE_SUFFIXES.iter().map(|s| s.to_string()).collect(),
            markdown: true,
        }
    }
}

impl SiteConfig {
    /// Validate config values are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let special = &self.build.special_file;
        if special.is_empty() || special.contains(['/', '\\']) {
            return Err(ConfigError::Validation(
                "build.special_file must be a plain file name".into(),
            ));
        }
        if self.build.output.as_deref().is_some_and(str::is_empty) {
            return Err(ConfigError::Validation(
                "build.output must not be empty".into(),
            ));
        }
        if let Some(bad) = self
            .build
            .template_suffixes
            .iter()
            .find(|s| s.is_empty() || s.starts_with('.'))
        {
            return Err(ConfigError::Validation(format!(
                "build.template_suffixes entries are extensions without a dot, got {bad:?}"
            )));
        }
        if let Some(bad) = self.build.excludes.iter().find(|e| e.is_empty()) {
            return Err(ConfigError::Validation(format!(
                "build.excludes entries must not be empty, got {bad:?}"
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
///
/// This is the base layer user overrides are merged on top of.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    Ok(toml::Value::try_from(SiteConfig::default())?)
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Load a config file as a raw TOML value.
///
/// Returns `Ok(None)` if the file does not exist, `Err` if it exists but is
/// not valid TOML.
pub fn load_raw_config(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    if !path.is_file() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Path of the config file for a source root: `file` if given (relative to
/// the working directory), otherwise `<root>/site.toml`.
pub fn config_path(root: &Path, file: Option<&Path>) -> PathBuf {
    match file {
        Some(file) => file.to_path_buf(),
        None => root.join(DEFAULT_CONFIG_FILE),
    }
}

/// Load the project config for `root`.
///
/// Merges user values on top of stock defaults, rejects unknown keys, and
/// validates the result. A missing `site.toml` yields the defaults; a
/// missing explicitly named `file` is an error.
pub fn load_config(root: &Path, file: Option<&Path>) -> Result<SiteConfig, ConfigError> {
    let path = config_path(root, file);
    let overlay = match load_raw_config(&path)? {
        Some(value) => {
            debug!(path = %path.display(), "loaded project config");
            Some(value)
        }
        None if file.is_some() => return Err(ConfigError::NotFound(path)),
        None => None,
    };
    let base = stock_defaults_value()?;
    let merged = match overlay {
        Some(overlay) => merge_toml(base, overlay),
        None => base,
    };
    let config: SiteConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Returns a fully-commented stock `site.toml` with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# sitecascade project configuration
# ==================================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults.
#
# Per-directory behaviour (drafts, generators, template context) is not set
# here but in the special file of each directory (`_dir.yml` by default).
# Unknown keys will cause an error.

# ---------------------------------------------------------------------------
# Site metadata
# ---------------------------------------------------------------------------
[site]
# Available in every template as `site.name`, `site.description`, `site.url`.
name = ""
description = ""
url = ""

# ---------------------------------------------------------------------------
# Build layout
# ---------------------------------------------------------------------------
[build]
# Output directory, relative to the source root. The command line wins.
# output = "_site"

# Name of the per-directory config file. Never rendered or copied.
special_file = "_dir.yml"

# Paths (or globs, when they contain * ? or [) relative to the source root
# that are neither rendered nor copied.
excludes = []

# Template directories searched after the source root.
# Empty means `_templates/` when that directory exists.
templates = []

# Data directories, highest priority first, visible to templates as data().
# Empty means `_data/` when that directory exists.
data = []

# Skip files and directories whose name starts with a dot.
ignore_dotfiles = false

# Suffixes removed from rendered file names: index.html.twig -> index.html
template_suffixes = ["twig", "tera"]

# Convert rendered .md / .markdown outputs to HTML.
markdown = true
"##
}

// =============================================================================
// Resolving build options
// =============================================================================

/// Values given on the command line. Empty lists mean "not given".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildOverrides {
    pub config: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub templates: Vec<PathBuf>,
    pub data: Vec<PathBuf>,
    pub excludes: Vec<String>,
    pub ignore_dotfiles: bool,
    pub incremental: bool,
}

/// Combine the project config and command-line overrides into the options
/// of one build rooted at `root`.
pub fn resolve_options(
    root: &Path,
    config: &SiteConfig,
    overrides: &BuildOverrides,
) -> Result<BuildOptions, ConfigError> {
    let build = &config.build;
    let output = match (&overrides.output, &build.output) {
        (Some(cli), _) => cli.clone(),
        (None, Some(configured)) => root.join(configured),
        (None, None) => root.join(DEFAULT_OUTPUT_DIR),
    };

    let mut options = BuildOptions::new(root, &output);
    options.template_dirs = pick_dirs(root, &overrides.templates, &build.templates, CONVENTIONAL_TEMPLATES_DIR);
    options.data_dirs = pick_dirs(root, &overrides.data, &build.data, CONVENTIONAL_DATA_DIR);
    options.special_file = build.special_file.clone();
    options.template_suffixes = build.template_suffixes.clone();
    options.markdown = build.markdown;
    options.ignore_dotfiles = overrides.ignore_dotfiles || build.ignore_dotfiles;
    options.incremental = overrides.incremental;
    options.site = serde_json::to_value(&config.site)?;

    for exclude in overrides.excludes.iter().chain(&build.excludes) {
        if is_glob(exclude) {
            options.exclude_globs.push(exclude.clone());
        } else {
            options.excludes.push(PathBuf::from(exclude));
        }
    }
    options.excludes.push(output);
    options.excludes.push(config_path(root, overrides.config.as_deref()));
    options.excludes.extend(options.template_dirs.iter().cloned());
    options.excludes.extend(options.data_dirs.iter().cloned());
    Ok(options)
}

fn pick_dirs(root: &Path, cli: &[PathBuf], configured: &[String], convention: &str) -> Vec<PathBuf> {
    if !cli.is_empty() {
        return cli.to_vec();
    }
    if !configured.is_empty() {
        return configured.iter().map(|dir| root.join(dir)).collect();
    }
    let conventional = root.join(convention);
    if conventional.is_dir() {
        vec![conventional]
    } else {
        Vec::new()
    }
}

fn is_glob(exclude: &str) -> bool {
    exclude.contains(['*', '?', '['])
}
