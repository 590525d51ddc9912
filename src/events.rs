//! Build lifecycle events.
//!
//! The orchestrator fires five events, each carrying a mutable payload that
//! subscribers may change before the build proceeds:
//!
//! | Event | Fired | Subscribers may |
//! |-------|-------|-----------------|
//! | [`SetupEvent`] | once, before enumeration | narrow the enumeration |
//! | [`DirectoryEnterEvent`] | once per source directory, before its files | skip the subtree, queue renders, defer assets |
//! | [`OldFileEvent`] | per output entry with no matching source | veto the deletion |
//! | [`RenderEvent`] | per render, before the template runs | edit the context, defer assets |
//! | [`TeardownEvent`] | once, after assets are written | inspect the report |
//!
//! Subscribers run synchronously in registration order. A subscriber error
//! aborts the build.

use crate::build::{BuildError, BuildReport};
use crate::cascade::ResolvedConfig;
use crate::data::CompositeDataTree;
use crate::extension::Extension;
use crate::scan::Enumeration;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// A render queued by a subscriber instead of discovered by enumeration.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderRequest {
    /// Template name, e.g. `@data/posts/hello.html.twig`.
    pub template: String,
    /// Output path relative to the output directory.
    pub output: PathBuf,
    pub context: Map<String, Value>,
}

/// Bytes to be written into the output directory once every file is done.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredAsset {
    /// Path relative to the output directory.
    pub path: PathBuf,
    pub contents: Vec<u8>,
}

pub struct SetupEvent<'a> {
    pub enumeration: &'a mut Enumeration,
}

pub struct DirectoryEnterEvent<'a> {
    /// Absolute source directory.
    pub directory: &'a Path,
    /// Source directory relative to the source root (empty for the root).
    pub relative: &'a Path,
    pub config: &'a ResolvedConfig,
    pub data: &'a CompositeDataTree,
    pub template_suffixes: &'a [String],
    pub(crate) skip: bool,
    pub(crate) renders: Vec<RenderRequest>,
    pub(crate) assets: &'a mut Vec<DeferredAsset>,
}

impl DirectoryEnterEvent<'_> {
    /// Skip this directory and everything below it.
    pub fn skip(&mut self) {
        self.skip = true;
    }

    pub fn is_skipped(&self) -> bool {
        self.skip
    }

    /// Queue an extra render for this directory.
    pub fn render(&mut self, request: RenderRequest) {
        self.renders.push(request);
    }

    pub fn renders(&self) -> &[RenderRequest] {
        &self.renders
    }

    pub fn defer_asset(&mut self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) {
        self.assets.push(DeferredAsset {
            path: path.into(),
            contents: contents.into(),
        });
    }
}

/// An output entry without a matching source entry.
#[derive(Debug, Clone, PartialEq)]
pub struct OldFileEvent {
    /// Absolute path in the output directory.
    pub destination: PathBuf,
    /// Absolute source path it was paired with.
    pub source: PathBuf,
    /// Path relative to the output directory.
    pub relative: PathBuf,
    pub is_dir: bool,
    pub(crate) old: bool,
}

impl OldFileEvent {
    pub fn new(destination: PathBuf, source: PathBuf, relative: PathBuf, is_dir: bool) -> Self {
        Self {
            destination,
            source,
            relative,
            is_dir,
            old: true,
        }
    }

    /// Veto the deletion.
    pub fn keep(&mut self) {
        self.old = false;
    }

    pub fn mark_old(&mut self) {
        self.old = true;
    }

    pub fn is_old(&self) -> bool {
        self.old
    }
}

pub struct RenderEvent<'a> {
    pub template: &'a str,
    /// Output path relative to the output directory.
    pub output: &'a Path,
    pub config: &'a ResolvedConfig,
    pub context: &'a mut Map<String, Value>,
    pub(crate) assets: &'a mut Vec<DeferredAsset>,
}

impl RenderEvent<'_> {
    pub fn defer_asset(&mut self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) {
        self.assets.push(DeferredAsset {
            path: path.into(),
            contents: contents.into(),
        });
    }
}

pub struct TeardownEvent<'a> {
    pub report: &'a BuildReport,
}

/// Receiver of lifecycle events. Every handler defaults to a no-op.
pub trait Subscriber {
    fn setup(&mut self, _event: &mut SetupEvent<'_>) -> Result<(), BuildError> {
        Ok(())
    }

    fn directory_enter(&mut self, _event: &mut DirectoryEnterEvent<'_>) -> Result<(), BuildError> {
        Ok(())
    }

    fn old_file(&mut self, _event: &mut OldFileEvent) -> Result<(), BuildError> {
        Ok(())
    }

    fn render(&mut self, _event: &mut RenderEvent<'_>) -> Result<(), BuildError> {
        Ok(())
    }

    fn teardown(&mut self, _event: &mut TeardownEvent<'_>) -> Result<(), BuildError> {
        Ok(())
    }
}

/// Forwards events to a registered extension.
pub(crate) struct ExtensionSubscriber(pub Rc<dyn Extension>);

impl Subscriber for ExtensionSubscriber {
    fn setup(&mut self, event: &mut SetupEvent<'_>) -> Result<(), BuildError> {
        self.0.setup(event)
    }

    fn directory_enter(&mut self, event: &mut DirectoryEnterEvent<'_>) -> Result<(), BuildError> {
        self.0.directory_enter(event)
    }

    fn old_file(&mut self, event: &mut OldFileEvent) -> Result<(), BuildError> {
        self.0.old_file(event)
    }

    fn render(&mut self, event: &mut RenderEvent<'_>) -> Result<(), BuildError> {
        self.0.render(event)
    }

    fn teardown(&mut self, event: &mut TeardownEvent<'_>) -> Result<(), BuildError> {
        self.0.teardown(event)
    }
}

struct OnSetup<F>(F);

impl<F> Subscriber for OnSetup<F>
where
    F: FnMut(&mut SetupEvent<'_>) -> Result<(), BuildError>,
{
    fn setup(&mut self, event: &mut SetupEvent<'_>) -> Result<(), BuildError> {
        (self.0)(event)
    }
}

struct OnDirectoryEnter<F>(F);

impl<F> Subscriber for OnDirectoryEnter<F>
where
    F: FnMut(&mut DirectoryEnterEvent<'_>) -> Result<(), BuildError>,
{
    fn directory_enter(&mut self, event: &mut DirectoryEnterEvent<'_>) -> Result<(), BuildError> {
        (self.0)(event)
    }
}

struct OnOldFile<F>(F);

impl<F> Subscriber for OnOldFile<F>
where
    F: FnMut(&mut OldFileEvent) -> Result<(), BuildError>,
{
    fn old_file(&mut self, event: &mut OldFileEvent) -> Result<(), BuildError> {
        (self.0)(event)
    }
}

struct OnRender<F>(F);

impl<F> Subscriber for OnRender<F>
where
    F: FnMut(&mut RenderEvent<'_>) -> Result<(), BuildError>,
{
    fn render(&mut self, event: &mut RenderEvent<'_>) -> Result<(), BuildError> {
        (self.0)(event)
    }
}

struct OnTeardown<F>(F);

impl<F> Subscriber for OnTeardown<F>
where
    F: FnMut(&mut TeardownEvent<'_>) -> Result<(), BuildError>,
{
    fn teardown(&mut self, event: &mut TeardownEvent<'_>) -> Result<(), BuildError> {
        (self.0)(event)
    }
}

/// Ordered list of subscribers.
#[derive(Default)]
pub struct EventDispatcher {
    subscribers: Vec<Box<dyn Subscriber>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, subscriber: impl Subscriber + 'static) {
        self.subscribers.push(Box::new(subscriber));
    }

    pub fn on_setup<F>(&mut self, f: F)
    where
        F: FnMut(&mut SetupEvent<'_>) -> Result<(), BuildError> + 'static,
    {
        self.subscribe(OnSetup(f));
    }

    pub fn on_directory_enter<F>(&mut self, f: F)
    where
        F: FnMut(&mut DirectoryEnterEvent<'_>) -> Result<(), BuildError> + 'static,
    {
        self.subscribe(OnDirectoryEnter(f));
    }

    pub fn on_old_file<F>(&mut self, f: F)
    where
        F: FnMut(&mut OldFileEvent) -> Result<(), BuildError> + 'static,
    {
        self.subscribe(OnOldFile(f));
    }

    pub fn on_render<F>(&mut self, f: F)
    where
        F: FnMut(&mut RenderEvent<'_>) -> Result<(), BuildError> + 'static,
    {
        self.subscribe(OnRender(f));
    }

    pub fn on_teardown<F>(&mut self, f: F)
    where
        F: FnMut(&mut TeardownEvent<'_>) -> Result<(), BuildError> + 'static,
    {
        self.subscribe(OnTeardown(f));
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn setup(&mut self, event: &mut SetupEvent<'_>) -> Result<(), BuildError> {
        self.subscribers.iter_mut().try_for_each(|s| s.setup(event))
    }

    pub fn directory_enter(&mut self, event: &mut DirectoryEnterEvent<'_>) -> Result<(), BuildError> {
        self.subscribers
            .iter_mut()
            .try_for_each(|s| s.directory_enter(event))
    }

    pub fn old_file(&mut self, event: &mut OldFileEvent) -> Result<(), BuildError> {
        self.subscribers.iter_mut().try_for_each(|s| s.old_file(event))
    }

    pub fn render(&mut self, event: &mut RenderEvent<'_>) -> Result<(), BuildError> {
        self.subscribers.iter_mut().try_for_each(|s| s.render(event))
    }

    pub fn teardown(&mut self, event: &mut TeardownEvent<'_>) -> Result<(), BuildError> {
        self.subscribers.iter_mut().try_for_each(|s| s.teardown(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn old_file() -> OldFileEvent {
        OldFileEvent::new(
            PathBuf::from("/out/old.html"),
            PathBuf::from("/src/old.html"),
            PathBuf::from("old.html"),
            false,
        )
    }

    #[test]
    fn old_file_defaults_to_old() {
        let mut event = old_file();
        assert!(event.is_old());
        event.keep();
        assert!(!event.is_old());
        event.mark_old();
        assert!(event.is_old());
    }

    #[test]
    fn subscribers_run_in_registration_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut dispatcher = EventDispatcher::new();
        for label in ["first", "second", "third"] {
            let log = Rc::clone(&log);
            dispatcher.on_old_file(move |_| {
                log.borrow_mut().push(label);
                Ok(())
            });
        }
        dispatcher.old_file(&mut old_file()).unwrap();
        assert_eq!(*log.borrow(), vec!["first", "second", "third"]);
    }

    #[test]
    fn later_subscribers_see_earlier_decisions() {
        let mut dispatcher = EventDispatcher::new();
        dispatcher.on_old_file(|event| {
            event.keep();
            Ok(())
        });
        let seen = Rc::new(RefCell::new(None));
        let seen_in = Rc::clone(&seen);
        dispatcher.on_old_file(move |event| {
            *seen_in.borrow_mut() = Some(event.is_old());
            Ok(())
        });

        let mut event = old_file();
        dispatcher.old_file(&mut event).unwrap();
        assert_eq!(*seen.borrow(), Some(false));
        assert!(!event.is_old());
    }

    #[test]
    fn error_stops_dispatch() {
        let mut dispatcher = EventDispatcher::new();
        dispatcher.on_old_file(|_| Err(BuildError::extension("test", "refused")));
        let reached = Rc::new(RefCell::new(false));
        let reached_in = Rc::clone(&reached);
        dispatcher.on_old_file(move |_| {
            *reached_in.borrow_mut() = true;
            Ok(())
        });

        assert!(dispatcher.old_file(&mut old_file()).is_err());
        assert!(!*reached.borrow());
    }

    #[test]
    fn handlers_for_other_events_are_not_called() {
        let mut dispatcher = EventDispatcher::new();
        dispatcher.on_render(|_| Err(BuildError::extension("test", "should not run")));
        assert!(dispatcher.old_file(&mut old_file()).is_ok());
        assert_eq!(dispatcher.len(), 1);
    }
}
