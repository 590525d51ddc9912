//! # sitecascade
//!
//! A static site builder. Every text file under the source root is a
//! template, every binary file is copied, and any directory may carry a
//! special file whose settings cascade to everything below it.
//!
//! # Architecture: One Pass, Many Listeners
//!
//! A build walks the source tree once and announces what it is doing through
//! lifecycle events. Everything that varies per directory (drafts, generated
//! pages, default template variables) is an extension listening to those
//! events and configured through the cascade:
//!
//! ```text
//! site.toml ──► BuildOptions
//!                   │
//!                   ▼
//! Builder ── Init ── Cleanup ── Enumerate ── Render ── WriteAssets ── Teardown
//!                      │            │           │
//!                 OldFileEvent  SetupEvent  DirectoryEnterEvent ◄── ConfigCascade (_dir.yml)
//!                                           RenderEvent        ◄── TemplateEngine ◄── data tree
//! ```
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`build`] | Orchestrator: phases, directory decisions, cleanup, incremental builds |
//! | [`cascade`] | Per-directory special files, merged root to leaf and handed to extensions |
//! | [`extension`] | Extension contract, registry, and the `generator`, `context`, `draft` built-ins |
//! | [`events`] | Lifecycle event payloads, the `Subscriber` trait, and the dispatcher |
//! | [`scan`] | Source enumeration with excludes, and text/binary/special classification |
//! | [`templates`] | Tera adapter: path-named templates, sub-template discovery, recorded data reads |
//! | [`data`] | Lazy, read-only, multi-root data tree of front-matter documents |
//! | [`freshness`] | Dependency sets of rendered outputs and the "unchanged since" check |
//! | [`frontmatter`] | YAML front matter splitting |
//! | [`naming`] | Path keys, template suffixes, output names |
//! | [`config`] | `site.toml` loading, validation, merging, and option resolution |
//! | [`watch`] | Rebuild-on-change loop |
//! | [`output`] | CLI output formatting of build reports |
//! | [`logging`] | `tracing` subscriber setup for the binary |
//!
//! # Design Decisions
//!
//! ## Directories Decide Before Their Files
//!
//! A directory is entered (config resolved, `DirectoryEnterEvent` fired) the
//! first time a file at or below it comes up, and its ancestors are entered
//! first. A skipped directory's decision is inherited by its whole subtree
//! without resolving anything further, which makes `draft: true` cheap on
//! large trees.
//!
//! ## Unknown Directory Keys Are Errors
//!
//! Every top-level key of a special file must name a registered extension,
//! and each extension validates its merged configuration. A typo in `_dir.yml`
//! fails the build instead of silently doing nothing.
//!
//! ## The Data Tree Is Read-Only
//!
//! Templates see data documents through `data(path=...)`. Nodes reject writes
//! with an error, and each document is parsed once per build no matter how
//! many templates read it.
//!
//! ## Freshness Errs Towards Rebuilding
//!
//! Every document a render looked at becomes a dependency, whether or not it
//! ended up in the output. Listed data directories are dependencies too, and
//! so are the special files the cascade looked for and did not find. Watch
//! mode may rebuild more than strictly needed, never less.

pub mod build;
pub mod cascade;
pub mod config;
pub mod data;
pub mod events;
pub mod extension;
pub mod freshness;
pub mod frontmatter;
pub mod logging;
pub mod naming;
pub mod output;
pub mod scan;
pub mod templates;
pub mod watch;

#[cfg(test)]
pub(crate) mod test_helpers;
