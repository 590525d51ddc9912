//! Centralized path naming conventions.
//!
//! Every identifier that crosses a module boundary (template names, data
//! keys, output paths) is a `/`-separated path relative to some root. This
//! module is the single place that converts between those strings and
//! filesystem paths, and that knows how template suffixes map source files
//! to output files:
//!
//! - `index.html.twig` → `index.html` (suffix stripped)
//! - `feed.xml.tera` → `feed.xml`
//! - `style.css` → `style.css` (no template suffix, unchanged)
//! - `posts/first.md` → `posts/first.md`

use std::path::{Component, Path, PathBuf};

/// Render a relative path as a `/`-separated identifier.
///
/// Only normal components are kept, so `./a/b` and `a/b` produce the same
/// identifier on every platform.
pub fn slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Parse a `/`-separated key into a relative path.
///
/// Leading, trailing and doubled slashes and `.` segments are ignored.
/// Returns `None` for keys that would escape their root (`..`) or that
/// name nothing at all.
pub fn normalize_key(key: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for part in key.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            part => out.push(part),
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Whether a single file name is hidden (dot-prefixed).
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Strip the first matching template suffix from a file name.
///
/// A file consisting only of the suffix (`.twig`) is left alone, so the
/// stripped name is never empty.
pub fn strip_template_suffix<'a>(name: &'a str, suffixes: &[String]) -> &'a str {
    for suffix in suffixes {
        if let Some(stem) = name.strip_suffix(suffix.as_str())
            && let Some(stem) = stem.strip_suffix('.')
            && !stem.is_empty()
        {
            return stem;
        }
    }
    name
}

/// Map a relative source path to its relative output path.
///
/// Only the final component is affected.
pub fn output_path(relative: &Path, suffixes: &[String]) -> PathBuf {
    let Some(name) = relative.file_name().map(|n| n.to_string_lossy()) else {
        return relative.to_path_buf();
    };
    let stripped = strip_template_suffix(&name, suffixes);
    if stripped.len() == name.len() {
        relative.to_path_buf()
    } else {
        relative.with_file_name(stripped)
    }
}

/// Every relative source path that could have produced `output`.
///
/// The exact path comes first, followed by one candidate per suffix.
pub fn source_candidates(output: &Path, suffixes: &[String]) -> Vec<PathBuf> {
    let mut candidates = vec![output.to_path_buf()];
    if let Some(name) = output.file_name().map(|n| n.to_string_lossy().into_owned()) {
        for suffix in suffixes {
            candidates.push(output.with_file_name(format!("{name}.{suffix}")));
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suffixes() -> Vec<String> {
        vec!["twig".to_string(), "tera".to_string()]
    }

    #[test]
    fn slash_path_joins_components() {
        assert_eq!(slash_path(Path::new("a/b/c.txt")), "a/b/c.txt");
        assert_eq!(slash_path(Path::new("./a/b")), "a/b");
        assert_eq!(slash_path(Path::new("")), "");
    }

    #[test]
    fn normalize_key_ignores_redundant_separators() {
        assert_eq!(normalize_key("/posts/"), Some(PathBuf::from("posts")));
        assert_eq!(normalize_key("posts//a.md"), Some(PathBuf::from("posts/a.md")));
        assert_eq!(normalize_key("./posts"), Some(PathBuf::from("posts")));
    }

    #[test]
    fn normalize_key_rejects_escapes_and_empty() {
        assert_eq!(normalize_key("../secret"), None);
        assert_eq!(normalize_key("posts/../../x"), None);
        assert_eq!(normalize_key(""), None);
        assert_eq!(normalize_key("/"), None);
    }

    #[test]
    fn hidden_names() {
        assert!(is_hidden(".git"));
        assert!(!is_hidden("index.html"));
    }

    #[test]
    fn strips_known_suffixes_only() {
        assert_eq!(strip_template_suffix("index.html.twig", &suffixes()), "index.html");
        assert_eq!(strip_template_suffix("feed.xml.tera", &suffixes()), "feed.xml");
        assert_eq!(strip_template_suffix("style.css", &suffixes()), "style.css");
        assert_eq!(strip_template_suffix("mytwig", &suffixes()), "mytwig");
        assert_eq!(strip_template_suffix(".twig", &suffixes()), ".twig");
    }

    #[test]
    fn output_path_only_touches_file_name() {
        assert_eq!(
            output_path(Path::new("blog.twig/index.html.twig"), &suffixes()),
            PathBuf::from("blog.twig/index.html")
        );
        assert_eq!(
            output_path(Path::new("img/logo.png"), &suffixes()),
            PathBuf::from("img/logo.png")
        );
    }

    #[test]
    fn source_candidates_exact_first() {
        let candidates = source_candidates(Path::new("a/index.html"), &suffixes());
        assert_eq!(
            candidates,
            vec![
                PathBuf::from("a/index.html"),
                PathBuf::from("a/index.html.twig"),
                PathBuf::from("a/index.html.tera"),
            ]
        );
    }
}
