//! Build orchestrator.
//!
//! One build is a single synchronous pass through six phases:
//!
//! ```text
//! Init         canonicalize roots, open the data tree, create the cascade
//!              resolver and the template engine for this build
//! Cleanup      (only if the output directory already existed) pair every
//!              output entry with its source, fire OldFileEvent, delete what
//!              is still old
//! Enumerate    fire SetupEvent, walk the source tree once
//! Render       per file, in enumeration order:
//!                enter unvisited directories root-down (resolve cascade,
//!                fire DirectoryEnterEvent, render queued requests)
//!                Special → skip, Binary → copy, Text → render
//! WriteAssets  flush assets deferred by subscribers
//! Teardown     fire TeardownEvent with the report
//! ```
//!
//! ## Directory decisions
//!
//! Each directory is entered exactly once, the first time a file at or below
//! it is met. Entering resolves its configuration and lets subscribers mark
//! it skipped. A skipped directory's descendants are never entered: their
//! files are dropped without resolving configuration or firing events.
//!
//! ## Output names
//!
//! Text files are written under their source path with the template suffix
//! removed (`blog/index.html.twig` → `blog/index.html`). When Markdown
//! conversion is on, rendered `.md`/`.markdown` outputs are converted to HTML
//! and keep their name.
//!
//! ## Incremental builds
//!
//! A [`Builder`] remembers the dependency set of every output it rendered.
//! With [`BuildOptions::incremental`] set, a later build skips any render
//! whose previous dependencies (templates, data documents, and the special
//! files of its directory) are all unmodified since the output was written,
//! and any copy whose destination is at least as new as its source.
//!
//! ## Watch paths
//!
//! [`BuildReport::paths`] lists every absolute path the build consulted:
//! source files, existing special files, template files, data documents read,
//! plus the source, template and data roots. A watch loop subscribes to
//! exactly that set.

use crate::cascade::{CascadeError, ConfigCascade, ResolvedConfig};
use crate::data::{CompositeDataTree, DataError};
use crate::events::{
    DeferredAsset, DirectoryEnterEvent, EventDispatcher, ExtensionSubscriber, OldFileEvent,
    RenderEvent, SetupEvent, Subscriber, TeardownEvent,
};
use crate::extension::{Extension, ExtensionSet};
use crate::freshness::FreshnessTracker;
use crate::naming::{output_path, slash_path, source_candidates};
use crate::scan::{Enumeration, FileEntry, FileKind, ScanError};
use crate::templates::{TemplateEngine, TemplateError};
use indexmap::{IndexMap, IndexSet};
use serde_json::{Map, Value};
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, info, trace};
use walkdir::WalkDir;

/// Default per-directory special file name.
pub const DEFAULT_SPECIAL_FILE: &str = "_dir.yml";

/// Default suffixes stripped from rendered file names.
pub const DEFAULT_TEMPLATE_SUFFIXES: &[&str] = &["twig", "tera"];

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("source root is not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("Config error: {0}")]
    Cascade(#[from] CascadeError),
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),
    #[error("Data error: {0}")]
    Data(#[from] DataError),
    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),
    #[error("extension '{name}' failed: {message}")]
    Extension { name: String, message: String },
    #[error("extension '{0}' is already registered")]
    DuplicateExtension(String),
    #[error("asset path must stay inside the output directory: {0}")]
    AssetPath(PathBuf),
}

impl BuildError {
    /// Wrap a failure raised inside an extension or subscriber.
    pub fn extension(name: impl Into<String>, message: impl fmt::Display) -> Self {
        BuildError::Extension {
            name: name.into(),
            message: message.to_string(),
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> BuildError + '_ {
    move |source| BuildError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Init,
    Cleanup,
    Enumerate,
    Render,
    WriteAssets,
    Teardown,
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildPhase::Init => "init",
            BuildPhase::Cleanup => "cleanup",
            BuildPhase::Enumerate => "enumerate",
            BuildPhase::Render => "render",
            BuildPhase::WriteAssets => "write-assets",
            BuildPhase::Teardown => "teardown",
        };
        f.write_str(name)
    }
}

/// Everything a build needs to know, already resolved to concrete paths.
///
/// Usually produced by [`crate::config::resolve_options`].
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOptions {
    pub source: PathBuf,
    pub output: PathBuf,
    pub special_file: String,
    /// Extra template search paths, after the source root.
    pub template_dirs: Vec<PathBuf>,
    /// Data roots, highest priority first.
    pub data_dirs: Vec<PathBuf>,
    /// Excluded paths; relative ones are under the source root.
    pub excludes: Vec<PathBuf>,
    pub exclude_globs: Vec<String>,
    pub ignore_dotfiles: bool,
    pub template_suffixes: Vec<String>,
    /// Convert rendered Markdown outputs to HTML.
    pub markdown: bool,
    /// Skip work whose inputs did not change since the previous build.
    pub incremental: bool,
    /// Exposed to every template as `site`.
    pub site: Value,
}

impl BuildOptions {
    pub fn new(source: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            output: output.into(),
            special_file: DEFAULT_SPECIAL_FILE.to_string(),
            template_dirs: Vec::new(),
            data_dirs: Vec::new(),
            excludes: Vec::new(),
            exclude_globs: Vec::new(),
            ignore_dotfiles: false,
            template_suffixes: DEFAULT_TEMPLATE_SUFFIXES.iter().map(|s| s.to_string()).collect(),
            markdown: true,
            incremental: false,
            site: Value::Object(Map::new()),
        }
    }
}

/// What a build did. Paths are relative to the output directory unless noted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildReport {
    /// Canonical source root.
    pub source: PathBuf,
    /// Canonical output root.
    pub output: PathBuf,
    pub phases: Vec<BuildPhase>,
    pub rendered: Vec<PathBuf>,
    pub copied: Vec<PathBuf>,
    /// Renders and copies skipped because their output was fresh.
    pub fresh: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
    /// Old entries an observer chose to keep.
    pub kept: Vec<PathBuf>,
    /// Skipped source directories, relative to the source root.
    pub skipped: Vec<PathBuf>,
    pub assets: Vec<PathBuf>,
    /// Absolute paths consulted, for change detection.
    pub paths: IndexSet<PathBuf>,
}

/// Per-build state, created in the init phase and dropped at the end.
struct Session {
    source: PathBuf,
    output: PathBuf,
    output_existed: bool,
    template_dirs: Vec<PathBuf>,
    data_dirs: Vec<PathBuf>,
    data: CompositeDataTree,
    cascade: ConfigCascade,
    engine: TemplateEngine,
    visits: IndexMap<PathBuf, bool>,
    assets: Vec<DeferredAsset>,
    report: BuildReport,
}

/// Runs builds for one set of options. Reusable: repeated builds share the
/// registered extensions, subscribers and freshness records.
pub struct Builder {
    options: BuildOptions,
    extensions: ExtensionSet,
    dispatcher: EventDispatcher,
    freshness: FreshnessTracker,
}

impl Builder {
    /// A builder with the built-in extensions registered.
    pub fn new(options: BuildOptions) -> Self {
        let extensions = ExtensionSet::with_builtins();
        let mut dispatcher = EventDispatcher::new();
        for extension in extensions.iter() {
            dispatcher.subscribe(ExtensionSubscriber(Rc::clone(extension)));
        }
        Self {
            options,
            extensions,
            dispatcher,
            freshness: FreshnessTracker::new(),
        }
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut BuildOptions {
        &mut self.options
    }

    pub fn extensions(&self) -> &ExtensionSet {
        &self.extensions
    }

    pub fn freshness(&self) -> &FreshnessTracker {
        &self.freshness
    }

    /// Register an extension: its key becomes valid in special files and its
    /// hooks join the subscribers, after those registered so far.
    pub fn register_extension(&mut self, extension: impl Extension + 'static) -> Result<(), BuildError> {
        let extension: Rc<dyn Extension> = Rc::new(extension);
        if !self.extensions.register(Rc::clone(&extension)) {
            return Err(BuildError::DuplicateExtension(extension.name().to_string()));
        }
        self.dispatcher.subscribe(ExtensionSubscriber(extension));
        Ok(())
    }

    pub fn subscribe(&mut self, subscriber: impl Subscriber + 'static) {
        self.dispatcher.subscribe(subscriber);
    }

    pub fn on_setup<F>(&mut self, f: F)
    where
        F: FnMut(&mut SetupEvent<'_>) -> Result<(), BuildError> + 'static,
    {
        self.dispatcher.on_setup(f);
    }

    pub fn on_directory_enter<F>(&mut self, f: F)
    where
        F: FnMut(&mut DirectoryEnterEvent<'_>) -> Result<(), BuildError> + 'static,
    {
        self.dispatcher.on_directory_enter(f);
    }

    pub fn on_old_file<F>(&mut self, f: F)
    where
        F: FnMut(&mut OldFileEvent) -> Result<(), BuildError> + 'static,
    {
        self.dispatcher.on_old_file(f);
    }

    pub fn on_render<F>(&mut self, f: F)
    where
        F: FnMut(&mut RenderEvent<'_>) -> Result<(), BuildError> + 'static,
    {
        self.dispatcher.on_render(f);
    }

    pub fn on_teardown<F>(&mut self, f: F)
    where
        F: FnMut(&mut TeardownEvent<'_>) -> Result<(), BuildError> + 'static,
    {
        self.dispatcher.on_teardown(f);
    }

    /// Run one build.
    pub fn build(&mut self) -> Result<BuildReport, BuildError> {
        let mut session = self.init()?;
        info!(
            source = %session.source.display(),
            output = %session.output.display(),
            "building"
        );
        session.report.phases.push(BuildPhase::Init);

        if session.output_existed {
            self.cleanup(&mut session)?;
            session.report.phases.push(BuildPhase::Cleanup);
        }

        let files = self.enumerate(&mut session)?;
        session.report.phases.push(BuildPhase::Enumerate);

        for entry in &files {
            self.process_file(&mut session, entry)?;
        }
        session.report.phases.push(BuildPhase::Render);

        self.write_assets(&mut session)?;
        session.report.phases.push(BuildPhase::WriteAssets);

        session.report.phases.push(BuildPhase::Teardown);
        let mut event = TeardownEvent {
            report: &session.report,
        };
        self.dispatcher.teardown(&mut event)?;

        info!(
            rendered = session.report.rendered.len(),
            copied = session.report.copied.len(),
            fresh = session.report.fresh.len(),
            deleted = session.report.deleted.len(),
            "build complete"
        );
        Ok(session.report)
    }

    // =========================================================================
    // Init
    // =========================================================================

    fn init(&self) -> Result<Session, BuildError> {
        let options = &self.options;
        let source = fs::canonicalize(&options.source).map_err(io_error(&options.source))?;
        if !source.is_dir() {
            return Err(BuildError::NotADirectory(source));
        }
        let output_existed = options.output.exists();
        fs::create_dir_all(&options.output).map_err(io_error(&options.output))?;
        let output = fs::canonicalize(&options.output).map_err(io_error(&options.output))?;

        let template_dirs = existing_dirs(&options.template_dirs);
        let data_dirs = existing_dirs(&options.data_dirs);
        let data = CompositeDataTree::open(data_dirs.iter().cloned());

        let mut search_paths = vec![source.clone()];
        search_paths.extend(template_dirs.iter().cloned());
        let engine = TemplateEngine::new(search_paths, data.clone());
        let cascade = ConfigCascade::new(&source, &options.special_file, self.extensions.clone());

        let mut report = BuildReport {
            source: source.clone(),
            output: output.clone(),
            ..BuildReport::default()
        };
        report.paths.insert(source.clone());
        report.paths.extend(template_dirs.iter().cloned());
        report.paths.extend(data_dirs.iter().cloned());

        Ok(Session {
            source,
            output,
            output_existed,
            template_dirs,
            data_dirs,
            data,
            cascade,
            engine,
            visits: IndexMap::new(),
            assets: Vec::new(),
            report,
        })
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    fn cleanup(&mut self, s: &mut Session) -> Result<(), BuildError> {
        let mut doomed: Vec<OldFileEvent> = Vec::new();
        let mut survivors: Vec<PathBuf> = Vec::new();

        for entry in WalkDir::new(&s.output).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(ScanError::from)?;
            let is_dir = entry.file_type().is_dir();
            let destination = entry.into_path();
            let relative = destination
                .strip_prefix(&s.output)
                .unwrap_or(&destination)
                .to_path_buf();
            let (source, old) = self.pair_source(&s.source, &relative, is_dir);

            let mut event = OldFileEvent::new(destination, source, relative, is_dir);
            if !old {
                event.keep();
            }
            self.dispatcher.old_file(&mut event)?;

            if event.is_old() {
                doomed.push(event);
            } else {
                if old {
                    debug!(path = %event.relative.display(), "old file kept by observer");
                    s.report.kept.push(event.relative.clone());
                }
                survivors.push(event.destination);
            }
        }

        // Deepest first, so a directory is only considered once its
        // contents are gone.
        for event in doomed.into_iter().rev() {
            let path = &event.destination;
            if event.is_dir {
                if survivors.iter().any(|kept| kept.starts_with(path)) {
                    debug!(path = %event.relative.display(), "keeping directory with kept entries");
                    continue;
                }
                if path.exists() {
                    fs::remove_dir_all(path).map_err(io_error(path))?;
                }
            } else if path.symlink_metadata().is_ok() {
                fs::remove_file(path).map_err(io_error(path))?;
            }
            debug!(path = %event.relative.display(), "deleted old output");
            s.report.deleted.push(event.relative);
        }
        Ok(())
    }

    /// Source path for an output entry, and whether the entry is old.
    ///
    /// Pairing looks at paths only. An output whose source still exists but
    /// is now excluded, or sits in a skipped directory, is not old; an
    /// `OldFileEvent` subscriber can still `mark_old` it.
    fn pair_source(&self, source: &Path, relative: &Path, is_dir: bool) -> (PathBuf, bool) {
        if is_dir {
            let path = source.join(relative);
            let old = !path.is_dir();
            return (path, old);
        }
        source_candidates(relative, &self.options.template_suffixes)
            .into_iter()
            .map(|candidate| source.join(candidate))
            .find(|path| path.is_file())
            .map(|path| (path, false))
            .unwrap_or_else(|| (source.join(relative), true))
    }

    // =========================================================================
    // Enumerate
    // =========================================================================

    fn enumerate(&mut self, s: &mut Session) -> Result<Vec<FileEntry>, BuildError> {
        let mut enumeration = Enumeration::new(&s.source);
        enumeration.ignore_dotfiles(self.options.ignore_dotfiles);
        enumeration.exclude_path(&s.output);
        for dir in s.template_dirs.iter().chain(&s.data_dirs) {
            enumeration.exclude_path(dir);
        }
        for path in &self.options.excludes {
            let path = s.source.join(path);
            enumeration.exclude_path(fs::canonicalize(&path).unwrap_or(path));
        }
        for pattern in &self.options.exclude_globs {
            enumeration.exclude_glob(pattern)?;
        }

        let mut event = SetupEvent {
            enumeration: &mut enumeration,
        };
        self.dispatcher.setup(&mut event)?;

        let files = enumeration.files(&self.options.special_file)?;
        debug!(files = files.len(), "enumerated source tree");
        Ok(files)
    }

    // =========================================================================
    // Render
    // =========================================================================

    fn process_file(&mut self, s: &mut Session, entry: &FileEntry) -> Result<(), BuildError> {
        if !self.enter(s, &entry.directory)? {
            trace!(path = %entry.relative.display(), "skipped with its directory");
            return Ok(());
        }
        s.report.paths.insert(entry.path.clone());
        match entry.kind {
            FileKind::Special => Ok(()),
            FileKind::Binary => self.copy(s, entry),
            FileKind::Text => self.render_source(s, entry),
        }
    }

    /// Enter `directory` and its ancestors, root first. Returns whether files
    /// in `directory` should be processed.
    fn enter(&mut self, s: &mut Session, directory: &Path) -> Result<bool, BuildError> {
        let mut chain = vec![PathBuf::new()];
        let mut current = PathBuf::new();
        for component in directory.components() {
            current.push(component);
            chain.push(current.clone());
        }
        for dir in chain {
            match s.visits.get(&dir) {
                Some(false) => return Ok(false),
                Some(true) => continue,
                None => {}
            }
            let render = self.visit_directory(s, &dir)?;
            s.visits.insert(dir, render);
            if !render {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn visit_directory(&mut self, s: &mut Session, relative: &Path) -> Result<bool, BuildError> {
        let absolute = s.source.join(relative);
        let config = s.cascade.resolve(&absolute)?;
        s.report.paths.extend(config.sources().iter().cloned());

        let mut event = DirectoryEnterEvent {
            directory: &absolute,
            relative,
            config: &config,
            data: &s.data,
            template_suffixes: &self.options.template_suffixes,
            skip: false,
            renders: Vec::new(),
            assets: &mut s.assets,
        };
        self.dispatcher.directory_enter(&mut event)?;
        let skip = event.skip;
        let renders = std::mem::take(&mut event.renders);

        if skip {
            info!(directory = %slash_path(relative), "skipping directory");
            s.report.skipped.push(relative.to_path_buf());
            return Ok(false);
        }
        for request in renders {
            let mut context = request.context;
            context.insert("path".into(), Value::String(slash_path(&request.output)));
            self.render_to(s, &config, &request.template, request.output, context)?;
        }
        Ok(true)
    }

    fn render_source(&mut self, s: &mut Session, entry: &FileEntry) -> Result<(), BuildError> {
        let config = s.cascade.resolve(&s.source.join(&entry.directory))?;
        let template = slash_path(&entry.relative);
        let output = output_path(&entry.relative, &self.options.template_suffixes);

        let mut context = match &s.engine.load(&template)?.front_matter {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        context.insert("path".into(), Value::String(template.clone()));
        self.render_to(s, &config, &template, output, context)
    }

    fn render_to(
        &mut self,
        s: &mut Session,
        config: &ResolvedConfig,
        template: &str,
        output: PathBuf,
        mut context: Map<String, Value>,
    ) -> Result<(), BuildError> {
        let destination = s.output.join(&output);
        if self.options.incremental && self.freshness.is_output_fresh(&destination, &s.engine) {
            if let Some(deps) = self.freshness.get(&destination) {
                record_paths(s, deps.templates.iter().chain([&deps.template]), &deps.data_files);
            }
            trace!(output = %output.display(), "output is fresh");
            s.report.fresh.push(output);
            return Ok(());
        }

        context.insert("output".into(), Value::String(slash_path(&output)));
        context.insert("site".into(), self.options.site.clone());
        let mut event = RenderEvent {
            template,
            output: &output,
            config,
            context: &mut context,
            assets: &mut s.assets,
        };
        self.dispatcher.render(&mut event)?;

        let rendered = s.engine.render(template, &context)?;
        let mut dependencies = rendered.dependencies;
        dependencies.data_files.extend(config.sources().iter().cloned());
        dependencies.absent.extend(config.missing().cloned());

        let body = if self.options.markdown && is_markdown(&output) {
            markdown_to_html(&rendered.output)
        } else {
            rendered.output
        };
        write_file(&destination, body.as_bytes())?;
        debug!(template, output = %output.display(), "rendered");

        record_paths(
            s,
            dependencies.templates.iter().chain([&dependencies.template]),
            &dependencies.data_files,
        );
        self.freshness.record(destination, dependencies);
        s.report.rendered.push(output);
        Ok(())
    }

    fn copy(&mut self, s: &mut Session, entry: &FileEntry) -> Result<(), BuildError> {
        let destination = s.output.join(&entry.relative);
        if self.options.incremental && is_copy_fresh(&entry.path, &destination) {
            s.report.fresh.push(entry.relative.clone());
            return Ok(());
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        fs::copy(&entry.path, &destination).map_err(io_error(&destination))?;
        trace!(path = %entry.relative.display(), "copied");
        s.report.copied.push(entry.relative.clone());
        Ok(())
    }

    // =========================================================================
    // Write assets
    // =========================================================================

    fn write_assets(&mut self, s: &mut Session) -> Result<(), BuildError> {
        for asset in std::mem::take(&mut s.assets) {
            if asset.path.as_os_str().is_empty()
                || asset
                    .path
                    .components()
                    .any(|c| !matches!(c, Component::Normal(_)))
            {
                return Err(BuildError::AssetPath(asset.path));
            }
            write_file(&s.output.join(&asset.path), &asset.contents)?;
            debug!(path = %asset.path.display(), "wrote deferred asset");
            s.report.assets.push(asset.path);
        }
        Ok(())
    }
}

fn record_paths<'a>(
    s: &mut Session,
    templates: impl Iterator<Item = &'a String>,
    data_files: &std::collections::BTreeSet<PathBuf>,
) {
    for name in templates {
        if let Some(path) = s.engine.template_file(name) {
            s.report.paths.insert(path);
        }
    }
    s.report.paths.extend(data_files.iter().cloned());
}

fn existing_dirs(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = Vec::new();
    for dir in dirs {
        match fs::canonicalize(dir) {
            Ok(path) if path.is_dir() => {
                if !found.contains(&path) {
                    found.push(path);
                }
            }
            _ => debug!(dir = %dir.display(), "ignoring missing directory"),
        }
    }
    found
}

fn write_file(path: &Path, contents: &[u8]) -> Result<(), BuildError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    fs::write(path, contents).map_err(io_error(path))
}

fn is_copy_fresh(source: &Path, destination: &Path) -> bool {
    let (Ok(src), Ok(dst)) = (fs::metadata(source), fs::metadata(destination)) else {
        return false;
    };
    match (src.modified(), dst.modified()) {
        (Ok(src_time), Ok(dst_time)) => src.len() == dst.len() && dst_time >= src_time,
        _ => false,
    }
}

fn is_markdown(output: &Path) -> bool {
    output
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| ext == "md" || ext == "markdown")
}

fn markdown_to_html(source: &str) -> String {
    let parser = pulldown_cmark::Parser::new_ext(source, pulldown_cmark::Options::all());
    let mut html = String::new();
    pulldown_cmark::html::push_html(&mut html, parser);
    html
}
