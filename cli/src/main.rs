use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing::{Level, info, subscriber::set_global_default};
fn init_tracing(verbosity: u8) {
    // Map -q/-v to tracing levels; default INFO
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let env_filter = EnvFilter::from_default_env()
        .add_directive(level.into());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr) // logs to stderr
        .with_target(false)
        .with_level(true)
        .compact()
        .finish();

    // Ignore error if already set in tests or env
    let _ = set_global_default(subscriber);
}

use dupwatch::paths::default_cache_dir;
use dupwatch::{ContentHashPlugin, Engine, FileId, FolderKind, FolderPath, IndexKind, PluginReport, Settings};

fn main() {
    let opts = Opts::parse();
    init_tracing((1 + opts.verbose).saturating_sub(opts.quiet));
    smol::block_on(async move {
        if let Err(e) = run(opts).await {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    });
}

async fn run(opts: Opts) -> anyhow::Result<()> {
    let settings = settings(&opts)?;
    match &opts.command {
        Command::Scan { paths } => {
            let engine = engine(settings, paths, &opts.ignore)?;
            let report = engine.scan_once()?;
            let added: usize = report.scans.iter().map(|s| s.added).sum();
            let removed: usize = report.scans.iter().map(|s| s.removed).sum();
            println!("Files added: {added}, removed: {removed}");
            print_groups(&engine, &report.plugins)?;
        }
        Command::Watch { paths, interval } => {
            let mut engine = engine(settings, paths, &opts.ignore)?;
            engine.start()?;
            println!("Watching {} folders, press Enter to stop", paths.len());

            let mut stop = smol::unblock(|| {
                let mut line = String::new();
                let _ = std::io::stdin().read_line(&mut line);
            });
            loop {
                let stopped = smol::future::or(
                    async {
                        (&mut stop).await;
                        true
                    },
                    async {
                        smol::Timer::after(Duration::from_secs(*interval)).await;
                        false
                    },
                )
                .await;
                if stopped {
                    break;
                }
                let groups: usize = engine.last_reports().iter().map(|r| r.groups.len()).sum();
                info!("{} duplicate groups so far, rescanning", groups);
                engine.rescan();
            }

            engine.stop().await;
            print_groups(&engine, &engine.last_reports())?;
        }
    }
    Ok(())
}

/// Defaults, then `--config`, then flags.
fn settings(opts: &Opts) -> anyhow::Result<Settings> {
    let mut settings = match &opts.config {
        Some(path) => Settings::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Settings::default(),
    };
    if let Some(store) = &opts.store {
        settings.store_path = Some(store.clone());
    } else if opts.persist && settings.store_path.is_none() {
        let dir = default_cache_dir().context("no cache directory on this platform")?;
        settings.store_path = Some(dir.join("store.db"));
    }
    if let Some(index) = opts.index {
        settings.index = match index {
            IndexArg::Flat => IndexKind::Flat,
            IndexArg::Adjacency => IndexKind::Adjacency,
        };
    }
    settings.validate()?;
    Ok(settings)
}

fn folder(path: &Path) -> anyhow::Result<FolderPath> {
    let absolute = std::fs::canonicalize(path).with_context(|| format!("resolving {}", path.display()))?;
    Ok(FolderPath::new(absolute)?)
}

fn engine(settings: Settings, inputs: &[PathBuf], ignore: &[PathBuf]) -> anyhow::Result<Engine> {
    let mut engine = Engine::new(settings)?;
    engine.add_plugin(Arc::new(ContentHashPlugin::new()))?;
    for path in ignore {
        engine.add_folder(folder(path)?, FolderKind::Ignore);
    }
    for path in inputs {
        engine.add_folder(folder(path)?, FolderKind::Input);
    }
    Ok(engine)
}

fn print_groups(engine: &Engine, reports: &[PluginReport]) -> anyhow::Result<()> {
    let path_of = |id: &FileId| -> anyhow::Result<String> {
        let row = engine.registry().store().file(*id)?;
        let path = match row {
            Some(row) => engine.registry().path_store().file_path(&row)?,
            None => None,
        };
        Ok(path.map(|p| p.to_string()).unwrap_or_else(|| format!("<removed #{}>", id.0)))
    };

    for report in reports {
        println!("{}: {} duplicate groups", report.plugin, report.groups.len());
        for (i, group) in report.groups.iter().enumerate() {
            println!("  group {}:", i + 1);
            for id in group {
                println!("    {}", path_of(id)?);
            }
        }
        for failure in &report.failures {
            println!("  failed: {} ({})", failure.path, failure.reason);
        }
    }
    Ok(())
}

#[derive(Parser)]
#[command(version, about = "Watch folders and group duplicate files")]
pub struct Opts {
    /// Increase verbosity (-v, -vv). Default INFO.
    #[arg(short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
    /// Decrease verbosity (-q). Each -q reduces level by one step.
    #[arg(short = 'q', action = clap::ArgAction::Count, global = true)]
    pub quiet: u8,

    /// Settings file (JSON)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// SQLite database for the store; memory-only when absent
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,
    /// Keep the store in the default cache directory
    #[arg(long, global = true, conflicts_with = "store")]
    pub persist: bool,
    /// Folder index strategy
    #[arg(long, value_enum, global = true)]
    pub index: Option<IndexArg>,
    /// Folder to skip, repeatable
    #[arg(long, global = true)]
    pub ignore: Vec<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum IndexArg {
    Flat,
    Adjacency,
}

#[derive(Subcommand)]
pub enum Command {
    /// Scan once and print duplicate groups
    Scan {
        /// Input folders
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Keep rescanning until Enter is pressed
    Watch {
        /// Input folders
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Seconds between rescans
        #[arg(long, default_value_t = 30)]
        interval: u64,
    },
}
