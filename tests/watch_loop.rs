//! Watch loop behaviour against a real filesystem.
//!
//! The loop runs on the test thread; a helper thread edits sources and trips
//! the cancel token once it has seen what it waited for (or gave up).

use sitecascade::build::{BuildOptions, Builder};
use sitecascade::watch::{CancelToken, WatchOptions, watch};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tempfile::TempDir;

fn options() -> WatchOptions {
    WatchOptions {
        debounce: Duration::from_millis(50),
        poll_interval: Duration::from_millis(200),
        exec: None,
    }
}

fn builder(root: &Path) -> Builder {
    let mut options = BuildOptions::new(root.join("src"), root.join("out"));
    options.incremental = true;
    Builder::new(options)
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

fn contents(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default()
}

/// Rewrite a source and push its mtime past anything the build wrote.
fn edit(path: &PathBuf, text: &str) {
    fs::write(path, text).unwrap();
    fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::now() + Duration::from_secs(5))
        .unwrap();
}

#[test]
fn rebuilds_after_a_source_change() {
    let tmp = TempDir::new().unwrap();
    fs::create_dir_all(tmp.path().join("src")).unwrap();
    let source = tmp.path().join("src/index.html");
    let output = tmp.path().join("out/index.html");
    fs::write(&source, "v1").unwrap();

    let cancel = CancelToken::new();
    let stop = cancel.clone();
    let helper = thread::spawn(move || {
        let first = wait_until(Duration::from_secs(10), || contents(&output) == "v1");
        thread::sleep(Duration::from_millis(300));
        edit(&source, "v2");
        let second = wait_until(Duration::from_secs(10), || contents(&output) == "v2");
        stop.cancel();
        first && second
    });

    let mut builds = 0;
    let mut builder = builder(tmp.path());
    watch(&mut builder, &options(), &cancel, |_| builds += 1).unwrap();

    assert!(helper.join().unwrap(), "output never caught up with the source");
    assert!(builds >= 2);
}

#[test]
fn failed_build_keeps_watching() {
    let tmp = TempDir::new().unwrap();
    fs::create_dir_all(tmp.path().join("src")).unwrap();
    let source = tmp.path().join("src/page.html");
    let output = tmp.path().join("out/page.html");
    fs::write(&source, "{{ broken").unwrap();

    let cancel = CancelToken::new();
    let stop = cancel.clone();
    let helper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(500));
        edit(&source, "fixed");
        let ok = wait_until(Duration::from_secs(10), || contents(&output) == "fixed");
        stop.cancel();
        ok
    });

    let mut successful = 0;
    let mut builder = builder(tmp.path());
    watch(&mut builder, &options(), &cancel, |_| successful += 1).unwrap();

    assert!(helper.join().unwrap());
    assert!(successful >= 1);
}

#[cfg(unix)]
#[test]
fn exec_exit_ends_the_loop() {
    let tmp = TempDir::new().unwrap();
    fs::create_dir_all(tmp.path().join("src")).unwrap();
    fs::write(tmp.path().join("src/a.html"), "a").unwrap();

    let options = WatchOptions {
        exec: Some("exit 0".to_string()),
        ..options()
    };
    let cancel = CancelToken::new();
    let start = Instant::now();
    let mut builds = 0;
    let mut builder = builder(tmp.path());
    watch(&mut builder, &options, &cancel, |_| builds += 1).unwrap();

    assert_eq!(builds, 1);
    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(!cancel.is_cancelled());
}

#[test]
fn empty_exec_command_still_honours_cancel() {
    let tmp = TempDir::new().unwrap();
    fs::create_dir_all(tmp.path().join("src")).unwrap();
    let options = WatchOptions {
        exec: Some(String::new()),
        ..options()
    };
    let cancel = CancelToken::new();
    cancel.cancel();
    // Spawning `sh -c ""` succeeds; the cancelled token then ends the loop.
    let mut builder = builder(tmp.path());
    assert!(watch(&mut builder, &options, &cancel, |_| {}).is_ok());
}
