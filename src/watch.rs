//! Rebuild-on-change loop.
//!
//! ```text
//! ┌─► build ──► report.paths ──► watch parent dirs ──► wait ─┐
//! │   (errors logged, loop goes on)                           │
//! └───────────────── change (debounced) ◄─────────────────────┘
//!                    cancel / --exec child exit ──► stop
//! ```
//!
//! Only directories that hold something the last build consulted are watched,
//! each non-recursively, together with their ancestors up to the source,
//! template or data root they belong to. Events under the output directory
//! are ignored so the build cannot trigger itself. When native notification
//! is unavailable the loop sleeps the poll interval and rebuilds; incremental
//! builds make that cheap.
//!
//! The loop runs on the calling thread. Stopping it is cooperative: the
//! [`CancelToken`] and the optional child process are checked every 100 ms.

use crate::build::{BuildReport, Builder};
use indexmap::IndexSet;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const TICK: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared stop flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOptions {
    /// Quiet period that ends a burst of change events.
    pub debounce: Duration,
    /// Rebuild interval when native notification is unavailable.
    pub poll_interval: Duration,
    /// Shell command run alongside the loop; its exit stops the loop.
    pub exec: Option<String>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(200),
            poll_interval: Duration::from_secs(1),
            exec: None,
        }
    }
}

enum Wake {
    Changed,
    Stop,
}

/// Build, then rebuild whenever a consulted path changes, until `cancel` is
/// tripped or the `exec` child exits. `on_build` sees every successful build.
pub fn watch<F>(
    builder: &mut Builder,
    options: &WatchOptions,
    cancel: &CancelToken,
    mut on_build: F,
) -> Result<(), WatchError>
where
    F: FnMut(&BuildReport),
{
    let mut child = options.exec.as_deref().map(spawn).transpose()?;
    let mut paths: IndexSet<PathBuf> = IndexSet::new();
    let mut output = absolute(&builder.options().output);
    let source = absolute(&builder.options().source);

    let result = loop {
        if cancel.is_cancelled() {
            break Ok(());
        }
        match builder.build() {
            Ok(report) => {
                on_build(&report);
                paths = report.paths;
                output = report.output;
            }
            // Keep the previous paths: the broken file is still among them.
            Err(e) => error!(error = %e, "build failed"),
        }
        let dirs = watch_dirs(&paths, &source, &output);
        match wait_for_change(&dirs, &output, options, cancel, &mut child) {
            Ok(Wake::Changed) => continue,
            Ok(Wake::Stop) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    if let Some(mut child) = child {
        let _ = child.kill();
        let _ = child.wait();
    }
    result
}

fn spawn(command: &str) -> Result<Child, WatchError> {
    #[cfg(windows)]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    };
    #[cfg(not(windows))]
    let mut cmd = {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    };
    info!(command, "starting command");
    cmd.spawn().map_err(|source| WatchError::Spawn {
        command: command.to_string(),
        source,
    })
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Directories to watch for a set of consulted paths.
///
/// Directories among `paths` are roots. Every other path contributes its
/// parent and the ancestors up to the closest root. With nothing to go on,
/// `fallback` is watched recursively.
fn watch_dirs(paths: &IndexSet<PathBuf>, fallback: &Path, output: &Path) -> Vec<(PathBuf, RecursiveMode)> {
    let roots: Vec<&PathBuf> = paths.iter().filter(|p| p.is_dir()).collect();
    let mut dirs: IndexSet<PathBuf> = IndexSet::new();
    for path in paths {
        let start = if path.is_dir() {
            path.as_path()
        } else {
            match path.parent() {
                Some(parent) => parent,
                None => continue,
            }
        };
        let root = roots
            .iter()
            .filter(|root| start.starts_with(root))
            .max_by_key(|root| root.components().count());
        match root {
            Some(root) => {
                for dir in start.ancestors() {
                    dirs.insert(dir.to_path_buf());
                    if dir == root.as_path() {
                        break;
                    }
                }
            }
            None => {
                dirs.insert(start.to_path_buf());
            }
        }
    }
    dirs.retain(|dir| !dir.starts_with(output) && dir.is_dir());
    if dirs.is_empty() {
        return vec![(fallback.to_path_buf(), RecursiveMode::Recursive)];
    }
    dirs.into_iter()
        .map(|dir| (dir, RecursiveMode::NonRecursive))
        .collect()
}

/// Whether a notification should trigger a rebuild.
fn is_relevant(event: &Event, output: &Path) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    event.paths.is_empty() || event.paths.iter().any(|path| !path.starts_with(output))
}

fn stop_requested(cancel: &CancelToken, child: &mut Option<Child>) -> Result<bool, WatchError> {
    if cancel.is_cancelled() {
        return Ok(true);
    }
    if let Some(child) = child.as_mut()
        && let Some(status) = child.try_wait()?
    {
        info!(%status, "command exited, stopping");
        return Ok(true);
    }
    Ok(false)
}

fn wait_for_change(
    dirs: &[(PathBuf, RecursiveMode)],
    output: &Path,
    options: &WatchOptions,
    cancel: &CancelToken,
    child: &mut Option<Child>,
) -> Result<Wake, WatchError> {
    let (tx, rx) = mpsc::channel();
    let ignored = output.to_path_buf();
    let watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            if let Ok(event) = res
                && is_relevant(&event, &ignored)
            {
                let _ = tx.send(());
            }
        },
        notify::Config::default(),
    );
    let mut watcher = match watcher {
        Ok(watcher) => watcher,
        Err(e) => {
            warn!(error = %e, "file notification unavailable, polling");
            return poll(options, cancel, child);
        }
    };

    let mut watched = 0;
    for (dir, mode) in dirs {
        match watcher.watch(dir, *mode) {
            Ok(()) => watched += 1,
            Err(e) => debug!(dir = %dir.display(), error = %e, "cannot watch directory"),
        }
    }
    if watched == 0 {
        warn!("no directory could be watched, polling");
        return poll(options, cancel, child);
    }
    debug!(directories = watched, "waiting for changes");

    loop {
        if stop_requested(cancel, child)? {
            return Ok(Wake::Stop);
        }
        match rx.recv_timeout(TICK) {
            Ok(()) => {
                // Drain the burst.
                while rx.recv_timeout(options.debounce).is_ok() {}
                debug!("change detected");
                return Ok(Wake::Changed);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                warn!("file notification stopped, polling");
                return poll(options, cancel, child);
            }
        }
    }
}

fn poll(options: &WatchOptions, cancel: &CancelToken, child: &mut Option<Child>) -> Result<Wake, WatchError> {
    let deadline = Instant::now() + options.poll_interval;
    loop {
        if stop_requested(cancel, child)? {
            return Ok(Wake::Stop);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(Wake::Changed);
        }
        thread::sleep(TICK.min(deadline - now));
    }
}
