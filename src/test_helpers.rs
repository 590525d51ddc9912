//! Shared test utilities.
//!
//! Trees are described as `(relative path, contents)` pairs so a fixture reads
//! like the directory it creates:
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let tmp = TempDir::new().unwrap();
//! write_tree(tmp.path(), &[
//!     ("src/_dir.yml", "draft: true"),
//!     ("src/index.html.twig", "{{ title }}"),
//! ]);
//! let out = read_tree(&tmp.path().join("out"));
//! assert_eq!(out["index.html"], "Home");
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::SystemTime;
use walkdir::WalkDir;

use crate::naming::slash_path;

// =========================================================================
// Fixture setup
// =========================================================================

/// Write every `(path, contents)` pair under `root`, creating parents.
pub fn write_tree(root: &Path, files: &[(&str, &str)]) {
    for (path, contents) in files {
        let path = root.join(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
    }
}

/// Set a file's modification time.
pub fn set_mtime(path: &Path, time: SystemTime) {
    fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(time)
        .unwrap();
}

// =========================================================================
// Inspection
// =========================================================================

/// Every file under `root` keyed by slash-separated relative path. Non-UTF-8
/// contents are read lossily.
pub fn read_tree(root: &Path) -> BTreeMap<String, String> {
    WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .map(|entry| entry.unwrap())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            let relative = slash_path(entry.path().strip_prefix(root).unwrap());
            let contents = String::from_utf8_lossy(&fs::read(entry.path()).unwrap()).into_owned();
            (relative, contents)
        })
        .collect()
}
