//! Dependency recording and freshness checks for rendered outputs.
//!
//! Every render produces a [`DependencySet`]: the template itself, every
//! sub-template it pulled in (transitively), and every data document it read.
//! An output is fresh as of time `T` when none of those changed after `T`:
//!
//! ```text
//! index.html  (mtime T)
//! ├── template   index.html.twig     mtime ≤ T ?
//! ├── templates  base.html           mtime ≤ T ?
//! │              nav.html            mtime ≤ T ?
//! ├── data       _data/posts/        exists and mtime ≤ T ?  (listed)
//! │              _data/posts/a.md    exists and mtime ≤ T ?
//! │              _dir.yml            exists and mtime ≤ T ?
//! └── absent     blog/_dir.yml       still missing ?
//! ```
//!
//! Reads are recorded whether or not they reach the output, so the check can
//! only err towards rebuilding.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

/// The template engine's view of whether a template changed.
pub trait TemplateStatus {
    /// `true` when the named template still exists and has not been modified
    /// after `since`.
    fn is_template_fresh(&self, name: &str, since: SystemTime) -> bool;
}

/// Everything one render consulted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencySet {
    /// The rendered template.
    pub template: String,
    /// Sub-templates loaded on its behalf, transitively.
    pub templates: BTreeSet<String>,
    /// Absolute paths of data files read and directories listed during the
    /// render.
    pub data_files: BTreeSet<PathBuf>,
    /// Paths that were looked for and missing, such as special files of the
    /// directory and its ancestors. Any of them appearing makes the output
    /// stale.
    pub absent: BTreeSet<PathBuf>,
}

impl DependencySet {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            ..Self::default()
        }
    }

    /// Whether nothing this render depended on changed after `since`.
    pub fn is_fresh(&self, since: SystemTime, status: &impl TemplateStatus) -> bool {
        status.is_template_fresh(&self.template, since)
            && self
                .templates
                .iter()
                .all(|name| status.is_template_fresh(name, since))
            && self
                .data_files
                .iter()
                .all(|path| unmodified_since(path, since))
            && self.absent.iter().all(|path| !path.exists())
    }
}

/// `true` when `path` exists and was last modified at or before `since`.
pub fn unmodified_since(path: &Path, since: SystemTime) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .is_ok_and(|modified| modified <= since)
}

/// Collects data files touched while a render is in progress.
///
/// Cloned into template functions; recording is a no-op outside a
/// [`begin`](Self::begin)/[`finish`](Self::finish) pair.
#[derive(Debug, Clone, Default)]
pub struct AccessRecorder {
    active: Arc<Mutex<Option<BTreeSet<PathBuf>>>>,
}

impl AccessRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) {
        *self.lock() = Some(BTreeSet::new());
    }

    pub fn record(&self, path: &Path) {
        if let Some(paths) = self.lock().as_mut() {
            paths.insert(path.to_path_buf());
        }
    }

    /// Stop recording and return what was seen since [`begin`](Self::begin).
    pub fn finish(&self) -> BTreeSet<PathBuf> {
        self.lock().take().unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<BTreeSet<PathBuf>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Dependency sets of previously rendered outputs, keyed by absolute output
/// path. Survives across builds of one builder.
#[derive(Debug, Clone, Default)]
pub struct FreshnessTracker {
    outputs: HashMap<PathBuf, DependencySet>,
}

impl FreshnessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, output: impl Into<PathBuf>, dependencies: DependencySet) {
        self.outputs.insert(output.into(), dependencies);
    }

    pub fn get(&self, output: &Path) -> Option<&DependencySet> {
        self.outputs.get(output)
    }

    pub fn forget(&mut self, output: &Path) {
        self.outputs.remove(output);
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Whether `output` exists and none of its recorded dependencies changed
    /// after it was written. Unknown outputs are never fresh.
    pub fn is_output_fresh(&self, output: &Path, status: &impl TemplateStatus) -> bool {
        let Some(dependencies) = self.outputs.get(output) else {
            return false;
        };
        let Ok(written) = fs::metadata(output).and_then(|meta| meta.modified()) else {
            return false;
        };
        dependencies.is_fresh(written, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::set_mtime;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Template status backed by files in one directory.
    struct Dir<'a>(&'a Path);

    impl TemplateStatus for Dir<'_> {
        fn is_template_fresh(&self, name: &str, since: SystemTime) -> bool {
            unmodified_since(&self.0.join(name), since)
        }
    }

    fn epoch(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn fixture() -> (TempDir, DependencySet) {
        let tmp = TempDir::new().unwrap();
        for name in ["page.twig", "base.twig", "post.md"] {
            fs::write(tmp.path().join(name), name).unwrap();
            set_mtime(&tmp.path().join(name), epoch(1_000));
        }
        let mut deps = DependencySet::new("page.twig");
        deps.templates.insert("base.twig".into());
        deps.data_files.insert(tmp.path().join("post.md"));
        (tmp, deps)
    }

    // =========================================================================
    // DependencySet
    // =========================================================================

    #[test]
    fn fresh_when_everything_is_older() {
        let (tmp, deps) = fixture();
        assert!(deps.is_fresh(epoch(2_000), &Dir(tmp.path())));
    }

    #[test]
    fn equal_mtime_is_still_fresh() {
        let (tmp, deps) = fixture();
        assert!(deps.is_fresh(epoch(1_000), &Dir(tmp.path())));
    }

    #[test]
    fn newer_data_file_is_stale() {
        let (tmp, deps) = fixture();
        set_mtime(&tmp.path().join("post.md"), epoch(3_000));
        assert!(!deps.is_fresh(epoch(2_000), &Dir(tmp.path())));
    }

    #[test]
    fn newer_sub_template_is_stale() {
        let (tmp, deps) = fixture();
        set_mtime(&tmp.path().join("base.twig"), epoch(3_000));
        assert!(!deps.is_fresh(epoch(2_000), &Dir(tmp.path())));
    }

    #[test]
    fn newer_template_is_stale() {
        let (tmp, deps) = fixture();
        set_mtime(&tmp.path().join("page.twig"), epoch(3_000));
        assert!(!deps.is_fresh(epoch(2_000), &Dir(tmp.path())));
    }

    #[test]
    fn appearing_absent_path_is_stale() {
        let (tmp, mut deps) = fixture();
        let special = tmp.path().join("_dir.yml");
        deps.absent.insert(special.clone());
        assert!(deps.is_fresh(epoch(2_000), &Dir(tmp.path())));

        fs::write(&special, "draft: true\n").unwrap();
        set_mtime(&special, epoch(1_000));
        assert!(!deps.is_fresh(epoch(2_000), &Dir(tmp.path())));
    }

    #[test]
    fn missing_data_file_is_stale() {
        let (tmp, deps) = fixture();
        fs::remove_file(tmp.path().join("post.md")).unwrap();
        assert!(!deps.is_fresh(epoch(2_000), &Dir(tmp.path())));
    }

    // =========================================================================
    // AccessRecorder
    // =========================================================================

    #[test]
    fn recorder_only_records_between_begin_and_finish() {
        let recorder = AccessRecorder::new();
        recorder.record(Path::new("/ignored"));
        recorder.begin();
        let clone = recorder.clone();
        clone.record(Path::new("/a"));
        clone.record(Path::new("/a"));
        clone.record(Path::new("/b"));
        let seen = recorder.finish();
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(Path::new("/a")));
        recorder.record(Path::new("/after"));
        assert!(recorder.finish().is_empty());
    }

    // =========================================================================
    // FreshnessTracker
    // =========================================================================

    #[test]
    fn tracker_compares_against_output_mtime() {
        let (tmp, deps) = fixture();
        let output = tmp.path().join("out.html");
        fs::write(&output, "rendered").unwrap();
        set_mtime(&output, epoch(2_000));

        let mut tracker = FreshnessTracker::new();
        assert!(!tracker.is_output_fresh(&output, &Dir(tmp.path())));

        tracker.record(&output, deps);
        assert!(tracker.is_output_fresh(&output, &Dir(tmp.path())));

        set_mtime(&tmp.path().join("post.md"), epoch(2_500));
        assert!(!tracker.is_output_fresh(&output, &Dir(tmp.path())));
    }

    #[test]
    fn tracker_missing_output_is_stale() {
        let (tmp, deps) = fixture();
        let output = tmp.path().join("gone.html");
        let mut tracker = FreshnessTracker::new();
        tracker.record(&output, deps);
        assert!(!tracker.is_output_fresh(&output, &Dir(tmp.path())));
        tracker.forget(&output);
        assert!(tracker.get(&output).is_none());
    }
}
