//! Source tree enumeration and file classification.
//!
//! The build walks the source root exactly once, in a stable order (entries
//! sorted by file name, directories descended as they are met), and every
//! file comes out classified:
//!
//! ```text
//! site/                      kind
//! ├── _dir.yml               Special   (never rendered, never copied)
//! ├── _site/                 (output directory, excluded)
//! ├── index.html.twig        Text      (rendered through the template engine)
//! ├── img/
//! │   └── logo.png           Binary    (copied byte for byte)
//! └── .git/                  (dotfile, excluded when configured)
//! ```
//!
//! ## Classification
//!
//! Classification never looks at extensions. A file named like the special
//! file is [`FileKind::Special`]; otherwise the first 8 KiB are sniffed:
//! a NUL byte or invalid UTF-8 makes it [`FileKind::Binary`], anything else
//! is [`FileKind::Text`]. A multi-byte character cut in half by the sniff
//! window does not count as invalid.

use crate::naming::{is_hidden, slash_path};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::trace;
use walkdir::{DirEntry, WalkDir};

/// Bytes read from the start of a file to decide text versus binary.
pub const SNIFF_LEN: usize = 8192;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("Invalid exclude pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Special,
    Binary,
    Text,
}

/// A file discovered under the source root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Absolute path.
    pub path: PathBuf,
    /// Path relative to the source root.
    pub relative: PathBuf,
    /// Containing directory relative to the source root (empty at the root).
    pub directory: PathBuf,
    pub kind: FileKind,
}

/// What to enumerate under a source root.
#[derive(Debug, Clone)]
pub struct Enumeration {
    root: PathBuf,
    excludes: Vec<PathBuf>,
    globs: Vec<glob::Pattern>,
    ignore_dotfiles: bool,
}

impl Enumeration {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            excludes: Vec::new(),
            globs: Vec::new(),
            ignore_dotfiles: false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ignore_dotfiles(&mut self, ignore: bool) -> &mut Self {
        self.ignore_dotfiles = ignore;
        self
    }

    /// Exclude a path and, for a directory, everything under it.
    ///
    /// Relative paths are taken relative to the source root.
    pub fn exclude_path(&mut self, path: impl AsRef<Path>) -> &mut Self {
        let path = path.as_ref();
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        if !self.excludes.contains(&path) {
            self.excludes.push(path);
        }
        self
    }

    /// Exclude every entry whose root-relative path matches `pattern`.
    pub fn exclude_glob(&mut self, pattern: &str) -> Result<&mut Self, ScanError> {
        self.globs.push(glob::Pattern::new(pattern)?);
        Ok(self)
    }

    pub fn excludes(&self) -> &[PathBuf] {
        &self.excludes
    }

    fn is_excluded(&self, entry: &DirEntry) -> bool {
        let path = entry.path();
        if path == self.root {
            return false;
        }
        if self.ignore_dotfiles && is_hidden(&entry.file_name().to_string_lossy()) {
            return true;
        }
        if self.excludes.iter().any(|ex| path.starts_with(ex)) {
            return true;
        }
        if self.globs.is_empty() {
            return false;
        }
        let relative = slash_path(path.strip_prefix(&self.root).unwrap_or(path));
        self.globs.iter().any(|g| g.matches(&relative))
    }

    /// Every non-excluded file, classified, in enumeration order.
    pub fn files(&self, special_file: &str) -> Result<Vec<FileEntry>, ScanError> {
        let mut files = Vec::new();
        let walker = WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !self.is_excluded(e));
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.into_path();
            let relative = path.strip_prefix(&self.root).unwrap_or(&path).to_path_buf();
            let directory = relative.parent().map(Path::to_path_buf).unwrap_or_default();
            let kind = classify(&path, special_file)?;
            trace!(path = %relative.display(), ?kind, "enumerated");
            files.push(FileEntry {
                path,
                relative,
                directory,
                kind,
            });
        }
        Ok(files)
    }
}

/// Classify a file. Predicates are checked in order: special name, then content.
pub fn classify(path: &Path, special_file: &str) -> Result<FileKind, ScanError> {
    if path.file_name().is_some_and(|name| name == special_file) {
        return Ok(FileKind::Special);
    }
    let io_err = |source| ScanError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut buf = Vec::with_capacity(SNIFF_LEN);
    File::open(path)
        .map_err(io_err)?
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut buf)
        .map_err(io_err)?;
    Ok(sniff(&buf))
}

/// Decide text versus binary from the leading bytes of a file.
pub fn sniff(buf: &[u8]) -> FileKind {
    if buf.contains(&0) {
        return FileKind::Binary;
    }
    match std::str::from_utf8(buf) {
        Ok(_) => FileKind::Text,
        // Incomplete sequence at the very end of a full window.
        Err(e) if e.error_len().is_none() && buf.len() == SNIFF_LEN => FileKind::Text,
        Err(_) => FileKind::Binary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::write_tree;
    use std::fs;
    use tempfile::TempDir;

    fn relatives(files: &[FileEntry]) -> Vec<String> {
        files.iter().map(|f| slash_path(&f.relative)).collect()
    }

    // =========================================================================
    // Classification
    // =========================================================================

    #[test]
    fn sniff_text_and_binary() {
        assert_eq!(sniff(b"<h1>{{ title }}</h1>"), FileKind::Text);
        assert_eq!(sniff("caf\u{e9}".as_bytes()), FileKind::Text);
        assert_eq!(sniff(b""), FileKind::Text);
        assert_eq!(sniff(b"\x89PNG\r\n\x1a\n\0\0"), FileKind::Binary);
        assert_eq!(sniff(b"\xff\xfe latin junk"), FileKind::Binary);
    }

    #[test]
    fn sniff_tolerates_truncated_char_at_window_edge() {
        let mut buf = vec![b'a'; SNIFF_LEN - 1];
        buf.push(0xC3); // first byte of 'é'
        assert_eq!(sniff(&buf), FileKind::Text);
        // The same truncation in a short file is just invalid.
        assert_eq!(sniff(&[b'a', 0xC3]), FileKind::Binary);
    }

    #[test]
    fn classify_ignores_extensions() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("looks.png"), "plain text").unwrap();
        fs::write(tmp.path().join("looks.txt"), [0u8, 1, 2, 3]).unwrap();
        assert_eq!(
            classify(&tmp.path().join("looks.png"), "_dir.yml").unwrap(),
            FileKind::Text
        );
        assert_eq!(
            classify(&tmp.path().join("looks.txt"), "_dir.yml").unwrap(),
            FileKind::Binary
        );
    }

    #[test]
    fn special_file_wins_over_content() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("_dir.yml"), "draft: true").unwrap();
        assert_eq!(
            classify(&tmp.path().join("_dir.yml"), "_dir.yml").unwrap(),
            FileKind::Special
        );
    }

    // =========================================================================
    // Enumeration
    // =========================================================================

    #[test]
    fn files_sorted_depth_first() {
        let tmp = TempDir::new().unwrap();
        write_tree(
            tmp.path(),
            &[("b.txt", "b"), ("a/z.txt", "z"), ("a/y.txt", "y"), ("c/_dir.yml", "")],
        );
        let files = Enumeration::new(tmp.path()).files("_dir.yml").unwrap();
        assert_eq!(relatives(&files), vec!["a/y.txt", "a/z.txt", "b.txt", "c/_dir.yml"]);
        assert_eq!(files[0].directory, PathBuf::from("a"));
        assert_eq!(files[2].directory, PathBuf::new());
        assert_eq!(files[3].kind, FileKind::Special);
    }

    #[test]
    fn excluded_paths_prune_subtrees() {
        let tmp = TempDir::new().unwrap();
        write_tree(
            tmp.path(),
            &[("index.html", "i"), ("_site/index.html", "old"), ("_templates/base.html", "t")],
        );
        let mut enumeration = Enumeration::new(tmp.path());
        enumeration
            .exclude_path(tmp.path().join("_site"))
            .exclude_path("_templates");
        let files = enumeration.files("_dir.yml").unwrap();
        assert_eq!(relatives(&files), vec!["index.html"]);
    }

    #[test]
    fn globs_match_relative_paths() {
        let tmp = TempDir::new().unwrap();
        write_tree(
            tmp.path(),
            &[("keep.html", ""), ("notes.bak", ""), ("drafts/one.html", "")],
        );
        let mut enumeration = Enumeration::new(tmp.path());
        enumeration.exclude_glob("*.bak").unwrap();
        enumeration.exclude_glob("drafts").unwrap();
        let files = enumeration.files("_dir.yml").unwrap();
        assert_eq!(relatives(&files), vec!["keep.html"]);
    }

    #[test]
    fn invalid_glob_is_an_error() {
        let mut enumeration = Enumeration::new("/tmp");
        assert!(matches!(
            enumeration.exclude_glob("[unclosed"),
            Err(ScanError::Pattern(_))
        ));
    }

    #[test]
    fn dotfiles_only_skipped_when_configured() {
        let tmp = TempDir::new().unwrap();
        write_tree(tmp.path(), &[(".htaccess", "deny"), (".git/HEAD", "ref"), ("index.html", "")]);

        let all = Enumeration::new(tmp.path()).files("_dir.yml").unwrap();
        assert_eq!(relatives(&all), vec![".git/HEAD", ".htaccess", "index.html"]);

        let mut enumeration = Enumeration::new(tmp.path());
        enumeration.ignore_dotfiles(true);
        let visible = enumeration.files("_dir.yml").unwrap();
        assert_eq!(relatives(&visible), vec!["index.html"]);
    }
}
