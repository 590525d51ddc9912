//! Template engine adapter.
//!
//! Wraps [Tera](https://keats.github.io/tera/) with the loading rules the build
//! needs:
//!
//! - **Names are paths.** `blog/index.html.twig` is looked up under each
//!   search path in order (source root first, then template directories).
//!   Names under `@data/` are documents in the data tree, so any data file can
//!   be rendered as a template.
//! - **Front matter is stripped** before Tera sees the source and kept on the
//!   [`LoadedTemplate`] for the orchestrator to use as render context.
//! - **Sub-templates load first.** String-literal `extends`, `include` and
//!   `import` references are resolved and loaded before the referencing
//!   template, and each loaded template remembers the full set of templates it
//!   pulled in. Later loads reuse that set instead of walking again.
//! - **Data reads are recorded.** The `data()` template function resolves
//!   keys in the data tree and reports every document it hands out, and every
//!   directory it lists, to the active [`AccessRecorder`]. That is how a
//!   render's [`DependencySet`] learns about data files.
//!
//! ```text
//! {% extends "base.html" %}
//! {% block body %}
//!   {% set posts = data(path="posts") %}
//!   {% for post in posts.entries %}
//!     <a href="{{ post.name }}">{{ post.data.title }}</a>
//!   {% endfor %}
//! {% endblock %}
//! ```
//!
//! Output types are unknown to the engine, so autoescaping is off.

use crate::data::{CompositeDataTree, DATA_NAMESPACE, DataError, DocumentNode};
use crate::freshness::{AccessRecorder, DependencySet, TemplateStatus, unmodified_since};
use crate::frontmatter::{self, FrontMatterError};
use crate::naming::normalize_key;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::error::Error as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::SystemTime;
use tera::{Context, Tera};
use thiserror::Error;
use tracing::{debug, trace};

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\{%-?\s*(?:extends|include|import)\s+(?:"([^"]+)"|'([^']+)')"#)
        .expect("template reference pattern is valid")
});

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("template not found: {name}")]
    NotFound { name: String },
    #[error("circular template reference: {chain}")]
    Circular { chain: String },
    #[error("failed to parse template '{name}': {}", error_chain(.source))]
    Parse {
        name: String,
        #[source]
        source: tera::Error,
    },
    #[error("failed to render '{name}': {}", error_chain(.source))]
    Render {
        name: String,
        #[source]
        source: tera::Error,
    },
    #[error("IO error reading template {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("front matter error in template {path}: {source}")]
    FrontMatter {
        path: PathBuf,
        #[source]
        source: FrontMatterError,
    },
    #[error("Data error: {0}")]
    Data(#[from] DataError),
}

/// Tera reports the useful part of an error in its source chain.
fn error_chain(error: &tera::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

/// A template that has been added to the engine.
#[derive(Debug, Clone)]
pub struct LoadedTemplate {
    pub name: String,
    /// File the template was read from.
    pub path: PathBuf,
    pub front_matter: Option<Value>,
    /// Every template this one references, transitively.
    pub templates: BTreeSet<String>,
}

/// Output of one render together with what it consulted.
#[derive(Debug, Clone)]
pub struct Rendered {
    pub output: String,
    pub dependencies: DependencySet,
}

enum Source {
    File(PathBuf),
    Data(DocumentNode),
}

impl Source {
    fn path(&self) -> &Path {
        match self {
            Source::File(path) => path,
            Source::Data(doc) => doc.path(),
        }
    }
}

pub struct TemplateEngine {
    tera: Tera,
    search_paths: Vec<PathBuf>,
    data: CompositeDataTree,
    recorder: AccessRecorder,
    loaded: HashMap<String, LoadedTemplate>,
    loading: Vec<String>,
}

impl TemplateEngine {
    /// Create an engine resolving names under `search_paths` (in priority
    /// order) and `@data/` names in `data`.
    pub fn new(search_paths: Vec<PathBuf>, data: CompositeDataTree) -> Self {
        let recorder = AccessRecorder::new();
        let mut tera = Tera::default();
        tera.autoescape_on(vec![]);
        tera.register_function("data", data_function(data.clone(), recorder.clone()));
        tera.register_function("exists", exists_function(data.clone()));
        Self {
            tera,
            search_paths,
            data,
            recorder,
            loaded: HashMap::new(),
            loading: Vec::new(),
        }
    }

    pub fn data(&self) -> &CompositeDataTree {
        &self.data
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// File `name` currently resolves to, loaded or not.
    pub fn template_file(&self, name: &str) -> Option<PathBuf> {
        self.locate(name).map(|source| source.path().to_path_buf())
    }

    /// File backing an already loaded template.
    pub fn template_path(&self, name: &str) -> Option<&Path> {
        self.loaded.get(name).map(|t| t.path.as_path())
    }

    fn locate(&self, name: &str) -> Option<Source> {
        if name.starts_with(DATA_NAMESPACE) {
            return self.data.document_for_template(name).map(Source::Data);
        }
        let key = normalize_key(name)?;
        self.search_paths
            .iter()
            .map(|dir| dir.join(&key))
            .find(|path| path.is_file())
            .map(Source::File)
    }

    /// Load a template and everything it references. Each name loads once
    /// per engine.
    pub fn load(&mut self, name: &str) -> Result<&LoadedTemplate, TemplateError> {
        if self.loaded.contains_key(name) {
            return Ok(&self.loaded[name]);
        }
        if self.loading.iter().any(|n| n == name) {
            let mut chain = self.loading.clone();
            chain.push(name.to_string());
            return Err(TemplateError::Circular {
                chain: chain.join(" -> "),
            });
        }
        let source = self.locate(name).ok_or_else(|| TemplateError::NotFound {
            name: name.to_string(),
        })?;
        let (front_matter, body) = match &source {
            Source::File(path) => {
                let content = fs::read_to_string(path).map_err(|source| TemplateError::Io {
                    path: path.clone(),
                    source,
                })?;
                let parsed = frontmatter::parse(&content).map_err(|source| {
                    TemplateError::FrontMatter {
                        path: path.clone(),
                        source,
                    }
                })?;
                (parsed.data, parsed.body)
            }
            Source::Data(doc) => {
                let document = doc.document()?;
                (document.data.clone(), document.body.clone())
            }
        };

        self.loading.push(name.to_string());
        let templates = self.load_references(name, &body);
        self.loading.pop();
        let templates = templates?;

        self.tera
            .add_raw_template(name, &body)
            .map_err(|source| TemplateError::Parse {
                name: name.to_string(),
                source,
            })?;
        debug!(template = name, path = %source.path().display(), "loaded template");

        let loaded = LoadedTemplate {
            name: name.to_string(),
            path: source.path().to_path_buf(),
            front_matter,
            templates,
        };
        Ok(&*self.loaded.entry(name.to_string()).or_insert(loaded))
    }

    fn load_references(&mut self, name: &str, body: &str) -> Result<BTreeSet<String>, TemplateError> {
        let mut templates = BTreeSet::new();
        for reference in references(body) {
            if !self.loading.iter().any(|n| n == &reference) && self.locate(&reference).is_none() {
                // Left for Tera to report, or to ignore with `ignore missing`.
                trace!(template = name, reference = %reference, "unresolved reference");
                continue;
            }
            let sub = self.load(&reference)?;
            let nested = sub.templates.clone();
            templates.insert(reference);
            templates.extend(nested);
        }
        Ok(templates)
    }

    /// Render a template, recording what it consulted.
    pub fn render(&mut self, name: &str, context: &Map<String, Value>) -> Result<Rendered, TemplateError> {
        let templates = self.load(name)?.templates.clone();
        let context = Context::from_serialize(context).map_err(|source| TemplateError::Render {
            name: name.to_string(),
            source,
        })?;

        self.recorder.begin();
        let output = self.tera.render(name, &context);
        let data_files = self.recorder.finish();
        let output = output.map_err(|source| TemplateError::Render {
            name: name.to_string(),
            source,
        })?;

        Ok(Rendered {
            output,
            dependencies: DependencySet {
                template: name.to_string(),
                templates,
                data_files,
                absent: BTreeSet::new(),
            },
        })
    }
}

impl TemplateStatus for TemplateEngine {
    fn is_template_fresh(&self, name: &str, since: SystemTime) -> bool {
        self.locate(name)
            .is_some_and(|source| unmodified_since(source.path(), since))
    }
}

/// String-literal template references in source order, deduplicated.
fn references(body: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    REFERENCE
        .captures_iter(body)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| m.as_str().to_string())
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

fn path_arg<'a>(args: &'a HashMap<String, Value>, function: &str) -> tera::Result<&'a str> {
    match args.get("path") {
        None => Ok(""),
        Some(Value::String(path)) => Ok(path),
        Some(other) => Err(tera::Error::msg(format!(
            "{function}(): `path` must be a string, got {other}"
        ))),
    }
}

/// `data(path="posts/a.md")`: the node at `path`, or null when there is none.
fn data_function(
    tree: CompositeDataTree,
    recorder: AccessRecorder,
) -> impl Fn(&HashMap<String, Value>) -> tera::Result<Value> + Send + Sync {
    move |args: &HashMap<String, Value>| -> tera::Result<Value> {
        let path = path_arg(args, "data")?;
        let Some(node) = tree.resolve_pointer(path) else {
            return Ok(Value::Null);
        };
        node.to_value(&mut |path| recorder.record(path))
            .map_err(|e| tera::Error::msg(format!("data(path=\"{path}\"): {e}")))
    }
}

/// `exists(path="posts/a.md")`
fn exists_function(tree: CompositeDataTree) -> impl Fn(&HashMap<String, Value>) -> tera::Result<Value> + Send + Sync {
    move |args: &HashMap<String, Value>| -> tera::Result<Value> {
        let path = path_arg(args, "exists")?;
        Ok(Value::Bool(tree.exists(path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{set_mtime, write_tree};
    use std::time::Duration;
    use tempfile::TempDir;

    fn engine(root: &Path) -> TemplateEngine {
        TemplateEngine::new(
            vec![root.join("src"), root.join("templates")],
            CompositeDataTree::open([root.join("data")]),
        )
    }

    fn context(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    // =========================================================================
    // Loading
    // =========================================================================

    #[test]
    fn references_found_in_order() {
        let body = r#"{% extends "base.html" %}{%- include 'nav.html' %}{% import "macros.html" as m %}{% include "nav.html" %}"#;
        assert_eq!(references(body), vec!["base.html", "nav.html", "macros.html"]);
    }

    #[test]
    fn search_paths_in_priority_order() {
        let tmp = TempDir::new().unwrap();
        write_tree(
            tmp.path(),
            &[("src/page.html", "from src"), ("templates/page.html", "from templates")],
        );
        let mut engine = engine(tmp.path());
        let rendered = engine.render("page.html", &Map::new()).unwrap();
        assert_eq!(rendered.output, "from src");
    }

    #[test]
    fn front_matter_stripped_and_kept() {
        let tmp = TempDir::new().unwrap();
        write_tree(tmp.path(), &[("src/index.html.twig", "---\ntitle: Home\n---\n{{ title }}")]);
        let mut engine = engine(tmp.path());
        let loaded = engine.load("index.html.twig").unwrap();
        assert_eq!(loaded.front_matter.as_ref().unwrap()["title"], "Home");

        let rendered = engine
            .render("index.html.twig", &context(&[("title", Value::from("Home"))]))
            .unwrap();
        assert!(rendered.output.contains("Home"));
        assert!(!rendered.output.contains("title:"));
    }

    #[test]
    fn sub_templates_recorded_transitively() {
        let tmp = TempDir::new().unwrap();
        write_tree(
            tmp.path(),
            &[
                ("src/page.html", r#"{% extends "layout.html" %}{% block body %}page{% endblock %}"#),
                ("templates/layout.html", r#"{% include "nav.html" %}{% block body %}{% endblock %}"#),
                ("templates/nav.html", "nav|"),
            ],
        );
        let mut engine = engine(tmp.path());
        let rendered = engine.render("page.html", &Map::new()).unwrap();
        assert_eq!(rendered.output, "nav|page");
        let expected: BTreeSet<String> = ["layout.html", "nav.html"].iter().map(|s| s.to_string()).collect();
        assert_eq!(rendered.dependencies.templates, expected);
        assert_eq!(rendered.dependencies.template, "page.html");
    }

    #[test]
    fn circular_references_detected() {
        let tmp = TempDir::new().unwrap();
        write_tree(
            tmp.path(),
            &[
                ("templates/a.html", r#"{% include "b.html" %}"#),
                ("templates/b.html", r#"{% include "a.html" %}"#),
            ],
        );
        let mut engine = engine(tmp.path());
        let err = engine.load("a.html").unwrap_err();
        match err {
            TemplateError::Circular { chain } => assert_eq!(chain, "a.html -> b.html -> a.html"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_template_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let mut engine = engine(tmp.path());
        assert!(matches!(
            engine.render("nope.html", &Map::new()),
            Err(TemplateError::NotFound { .. })
        ));
        assert!(matches!(
            engine.load("../escape.html"),
            Err(TemplateError::NotFound { .. })
        ));
    }

    #[test]
    fn render_errors_surface() {
        let tmp = TempDir::new().unwrap();
        write_tree(tmp.path(), &[("src/bad.html", "{{ missing_variable }}")]);
        let mut engine = engine(tmp.path());
        let err = engine.render("bad.html", &Map::new()).unwrap_err();
        assert!(matches!(err, TemplateError::Render { .. }));
        assert!(err.to_string().contains("bad.html"));
    }

    #[test]
    fn autoescape_is_off() {
        let tmp = TempDir::new().unwrap();
        write_tree(tmp.path(), &[("src/raw.html", "{{ html }}")]);
        let mut engine = engine(tmp.path());
        let rendered = engine
            .render("raw.html", &context(&[("html", Value::from("<b>x</b>"))]))
            .unwrap();
        assert_eq!(rendered.output, "<b>x</b>");
    }

    // =========================================================================
    // Data access
    // =========================================================================

    #[test]
    fn data_documents_render_as_templates() {
        let tmp = TempDir::new().unwrap();
        write_tree(tmp.path(), &[("data/posts/a.html.twig", "---\ntitle: A\n---\n<h1>{{ title }}</h1>")]);
        let mut engine = engine(tmp.path());
        let rendered = engine
            .render("@data/posts/a.html.twig", &context(&[("title", Value::from("A"))]))
            .unwrap();
        assert_eq!(rendered.output.trim(), "<h1>A</h1>");
        assert_eq!(
            engine.template_path("@data/posts/a.html.twig"),
            Some(tmp.path().join("data/posts/a.html.twig").as_path())
        );
    }

    #[test]
    fn data_function_records_documents() {
        let tmp = TempDir::new().unwrap();
        write_tree(
            tmp.path(),
            &[
                ("data/posts/a.md", "---\ntitle: Alpha\n---\n"),
                ("data/posts/b.md", "---\ntitle: Beta\n---\n"),
                ("data/site.yml", "---\nname: Example\n---\n"),
                (
                    "src/list.html",
                    r#"{% set posts = data(path="posts") %}{% for p in posts.entries %}{{ p.data.title }};{% endfor %}"#,
                ),
                ("src/other.html", "static"),
            ],
        );
        let mut engine = engine(tmp.path());
        let rendered = engine.render("list.html", &Map::new()).unwrap();
        assert_eq!(rendered.output, "Alpha;Beta;");
        // Both documents plus the listed directory.
        assert_eq!(rendered.dependencies.data_files.len(), 3);
        assert!(rendered
            .dependencies
            .data_files
            .contains(&tmp.path().join("data/posts/a.md")));
        assert!(rendered
            .dependencies
            .data_files
            .contains(&tmp.path().join("data/posts")));

        // Nothing leaks into the next render.
        let other = engine.render("other.html", &Map::new()).unwrap();
        assert!(other.dependencies.data_files.is_empty());
    }

    #[test]
    fn data_function_missing_key_is_null() {
        let tmp = TempDir::new().unwrap();
        write_tree(
            tmp.path(),
            &[(
                "src/maybe.html",
                r#"{% set d = data(path="nope") %}{% if d %}yes{% else %}no{% endif %}|{{ exists(path="nope") }}"#,
            )],
        );
        let mut engine = engine(tmp.path());
        assert_eq!(engine.render("maybe.html", &Map::new()).unwrap().output, "no|false");
    }

    // =========================================================================
    // Template status
    // =========================================================================

    #[test]
    fn template_status_uses_mtime() {
        let tmp = TempDir::new().unwrap();
        write_tree(tmp.path(), &[("src/page.html", "x")]);
        let engine = engine(tmp.path());
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(10_000);
        set_mtime(&tmp.path().join("src/page.html"), t);

        assert!(engine.is_template_fresh("page.html", t));
        assert!(!engine.is_template_fresh("page.html", t - Duration::from_secs(1)));
        assert!(!engine.is_template_fresh("missing.html", t));
    }
}
