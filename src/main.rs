use clap::{ArgAction, Parser, Subcommand};
use sitecascade::build::Builder;
use sitecascade::config::{self, BuildOverrides};
use sitecascade::watch::{self, CancelToken, WatchOptions};
use sitecascade::{logging, output};
use std::path::PathBuf;
use std::time::Duration;

/// Flags shared by `build` and `watch`.
#[derive(clap::Args, Clone)]
struct BuildArgs {
    /// Source root
    #[arg(default_value = ".")]
    root: PathBuf,

    /// Output directory [default: build.output from site.toml, else ROOT/_site]
    output: Option<PathBuf>,

    /// Project config file [default: ROOT/site.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory (repeatable, earlier ones win)
    #[arg(short = 'd', long = "data")]
    data: Vec<PathBuf>,

    /// Template directory searched after the source root (repeatable)
    #[arg(short = 't', long = "templates")]
    templates: Vec<PathBuf>,

    /// Path or glob under the source root to leave out (repeatable)
    #[arg(short = 'e', long = "exclude")]
    excludes: Vec<String>,

    /// Skip files and directories whose name starts with a dot
    #[arg(long)]
    ignore_dotfiles: bool,
}

#[derive(clap::Args, Clone)]
struct WatchArgs {
    #[command(flatten)]
    build: BuildArgs,

    /// Command to run alongside the watcher (e.g. a dev server); the watch
    /// stops when it exits
    #[arg(long)]
    exec: Option<String>,

    /// Quiet period after a change before rebuilding, in milliseconds
    #[arg(long, default_value_t = 200)]
    debounce_ms: u64,

    /// Rebuild interval when file notification is unavailable, in seconds
    #[arg(long, default_value_t = 1)]
    poll_secs: u64,
}

#[derive(Parser)]
#[command(name = "sitecascade")]
#[command(about = "Static site builder with cascading directory config")]
#[command(long_about = "\
Static site builder with cascading directory config

Every text file under the source root is rendered as a template, binary files
are copied, and each directory may carry a special file whose settings apply
to it and everything below it.

Source structure:

  site/
  ├── site.toml                    # Project config (optional)
  ├── _dir.yml                     # Directory config, cascades to children
  ├── _templates/                  # Layouts and partials (auto-detected)
  │   └── base.html
  ├── _data/                       # Data documents, read with data(path=...)
  │   └── posts/
  │       └── hello.html.twig      # Front matter + body, renderable
  ├── index.html.twig              # → index.html
  ├── blog/
  │   └── _dir.yml                 # generator: { source: /posts }
  ├── drafts/
  │   └── _dir.yml                 # draft: true  (subtree skipped)
  └── img/logo.png                 # Copied as is

Directory config keys:
  context:    default template variables (front matter wins)
  draft:      true skips the directory and everything below
  generator:  { source: /pointer } renders every data document under the
              pointer into this directory

Run 'sitecascade gen-config' to generate a documented site.toml.")]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build the site once
    Build(BuildArgs),
    /// Build, then rebuild whenever a source, template or data file changes
    Watch(WatchArgs),
    /// Print a stock site.toml with all options documented
    GenConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command {
        Command::Build(args) => {
            let mut builder = prepare(&args, false)?;
            let report = builder.build()?;
            output::print_build_report(&report);
        }
        Command::Watch(args) => {
            let mut builder = prepare(&args.build, true)?;
            let options = WatchOptions {
                debounce: Duration::from_millis(args.debounce_ms),
                poll_interval: Duration::from_secs(args.poll_secs.max(1)),
                exec: args.exec,
            };
            let cancel = CancelToken::new();
            cancel_on_ctrl_c(cancel.clone());
            watch::watch(&mut builder, &options, &cancel, |report| {
                output::print_build_report(report);
                println!("{}", output::format_watch_status(report));
            })?;
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}

fn prepare(args: &BuildArgs, incremental: bool) -> Result<Builder, Box<dyn std::error::Error>> {
    let site_config = config::load_config(&args.root, args.config.as_deref())?;
    let overrides = BuildOverrides {
        config: args.config.clone(),
        output: args.output.clone(),
        templates: args.templates.clone(),
        data: args.data.clone(),
        excludes: args.excludes.clone(),
        ignore_dotfiles: args.ignore_dotfiles,
        incremental,
    };
    let options = config::resolve_options(&args.root, &site_config, &overrides)?;
    Ok(Builder::new(options))
}

/// Trip `cancel` on Ctrl+C. The signal is awaited on its own thread so the
/// watch loop stays synchronous.
fn cancel_on_ctrl_c(cancel: CancelToken) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for Ctrl+C");
                return;
            }
        };
        if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
            tracing::info!("interrupted, stopping");
            cancel.cancel();
        }
    });
}
