//! CLI output formatting for builds.
//!
//! # Output Format
//!
//! ```text
//! Rendered
//!     index.html
//!     posts/first.html
//! Copied
//!     img/logo.png
//! Deleted
//!     old.html
//! Skipped
//!     drafts/
//!
//! Built 3 files (2 rendered, 1 copied, 0 fresh), 1 deleted
//! ```
//!
//! Sections with nothing in them are left out. Fresh outputs are only counted,
//! since in watch mode they are most of the site.
//!
//! # Architecture
//!
//! Each report has a `format_*` function (returns `Vec<String>`) for
//! testability and a `print_*` wrapper that writes to stdout. Format functions
//! are pure: no I/O, no side effects.

use crate::build::BuildReport;
use crate::naming::slash_path;
use std::path::PathBuf;

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

fn section(lines: &mut Vec<String>, title: &str, paths: &[PathBuf], suffix: &str) {
    if paths.is_empty() {
        return;
    }
    lines.push(title.to_string());
    for path in paths {
        lines.push(format!("{}{}{}", indent(1), slash_path(path), suffix));
    }
}

fn plural(count: usize, one: &str, many: &str) -> String {
    if count == 1 {
        format!("{count} {one}")
    } else {
        format!("{count} {many}")
    }
}

/// Format a finished build.
pub fn format_build_report(report: &BuildReport) -> Vec<String> {
    let mut lines = Vec::new();
    section(&mut lines, "Rendered", &report.rendered, "");
    section(&mut lines, "Copied", &report.copied, "");
    section(&mut lines, "Assets", &report.assets, "");
    section(&mut lines, "Deleted", &report.deleted, "");
    section(&mut lines, "Kept", &report.kept, "");
    section(&mut lines, "Skipped", &report.skipped, "/");

    if !lines.is_empty() {
        lines.push(String::new());
    }
    let built = report.rendered.len() + report.copied.len() + report.fresh.len();
    let mut summary = format!(
        "Built {} ({} rendered, {} copied, {} fresh)",
        plural(built, "file", "files"),
        report.rendered.len(),
        report.copied.len(),
        report.fresh.len()
    );
    if !report.deleted.is_empty() {
        summary.push_str(&format!(", {} deleted", report.deleted.len()));
    }
    lines.push(summary);
    lines
}

/// Print a finished build to stdout.
pub fn print_build_report(report: &BuildReport) {
    for line in format_build_report(report) {
        println!("{}", line);
    }
}

/// Format the line shown while the watch loop waits.
pub fn format_watch_status(report: &BuildReport) -> String {
    format!(
        "Watching {} for changes (Ctrl+C to stop)",
        plural(report.paths.len(), "path", "paths")
    )
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(items: &[&str]) -> Vec<PathBuf> {
        items.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn empty_report_is_just_a_summary() {
        let lines = format_build_report(&BuildReport::default());
        assert_eq!(lines, vec!["Built 0 files (0 rendered, 0 copied, 0 fresh)"]);
    }

    #[test]
    fn sections_in_order() {
        let report = BuildReport {
            rendered: paths(&["index.html", "blog/post.html"]),
            copied: paths(&["img/logo.png"]),
            deleted: paths(&["old.html"]),
            skipped: paths(&["drafts"]),
            ..BuildReport::default()
        };
        let lines = format_build_report(&report);
        assert_eq!(
            lines,
            vec![
                "Rendered",
                "    index.html",
                "    blog/post.html",
                "Copied",
                "    img/logo.png",
                "Deleted",
                "    old.html",
                "Skipped",
                "    drafts/",
                "",
                "Built 3 files (2 rendered, 1 copied, 0 fresh), 1 deleted",
            ]
        );
    }

    #[test]
    fn fresh_outputs_only_counted() {
        let report = BuildReport {
            fresh: paths(&["a.html"]),
            ..BuildReport::default()
        };
        let lines = format_build_report(&report);
        assert_eq!(lines, vec!["Built 1 file (0 rendered, 0 copied, 1 fresh)"]);
    }

    #[test]
    fn watch_status_counts_paths() {
        let mut report = BuildReport::default();
        report.paths.insert(PathBuf::from("/site"));
        assert_eq!(
            format_watch_status(&report),
            "Watching 1 path for changes (Ctrl+C to stop)"
        );
    }
}
