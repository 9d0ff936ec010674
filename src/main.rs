//! mediadex: media catalog and metadata probing engine.
//!
//! Thin binary entry point. All logic lives in the `mediadex-core` crate.

use anyhow::Context;
use clap::{Parser, Subcommand};
use mediadex_core::config::SandboxCommand;
use mediadex_core::model::Category;
use mediadex_core::probe::NativeProber;
use mediadex_core::sandbox::worker;
use mediadex_core::{Config, MediaLibrary};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// How often `scan` reports progress while waiting for the catalog.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "mediadex", version, about = "Home media catalog and metadata prober")]
struct Cli {
    /// JSON configuration file; defaults are used when omitted.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Run probes in a child `sandbox-worker` process of this binary when
    /// the configuration names no sandbox.
    #[arg(long, global = true)]
    sandboxed: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one full catalog pass and print a summary.
    Scan,
    /// Probe files and print their records as JSON.
    Probe {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Serve the sandbox protocol on stdin/stdout.
    SandboxWorker {
        #[arg(long)]
        ffprobe: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs always go to stderr; stdout carries the worker protocol or JSON.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::SandboxWorker { ffprobe } => {
            let prober = NativeProber::new(ffprobe);
            let stdin = std::io::stdin();
            let stdout = std::io::stdout();
            worker::serve(stdin.lock(), stdout.lock(), &prober)?;
            Ok(())
        }
        Command::Scan => {
            let config = load_config(cli.config, cli.sandboxed)?;
            run_scan(config)
        }
        Command::Probe { paths } => {
            let config = load_config(cli.config, cli.sandboxed)?;
            run_probe(config, &paths)
        }
    }
}

fn load_config(path: Option<PathBuf>, sandboxed: bool) -> anyhow::Result<Config> {
    let mut config = match path {
        Some(path) => {
            Config::load(&path).with_context(|| format!("loading config {}", path.display()))?
        }
        None => Config::default(),
    };
    if sandboxed && config.sandbox.is_none() {
        let program = std::env::current_exe().context("locating the mediadex binary")?;
        let mut args = vec!["sandbox-worker".to_owned()];
        if let Some(ffprobe) = &config.ffprobe {
            args.push("--ffprobe".to_owned());
            args.push(ffprobe.display().to_string());
        }
        config.sandbox = Some(SandboxCommand { program, args });
    }
    Ok(config)
}

fn run_scan(config: Config) -> anyhow::Result<()> {
    tracing::info!("mediadex scan starting");
    let library = MediaLibrary::builder(config).without_watcher().build()?;
    library.scan()?;

    let catalog = library.catalog();
    while !catalog.wait_idle(PROGRESS_INTERVAL) {
        let counters = catalog.counters();
        tracing::info!(
            "Scanning: {} dirs scanned, {}/{} files probed",
            counters.scans_completed,
            counters.probes_completed,
            counters.probes_enqueued
        );
    }

    let counters = catalog.counters();
    println!("Directories scanned: {}", counters.scans_completed);
    println!("Files probed:        {}", counters.probes_completed);
    println!("Files catalogued:    {}", catalog.file_count()?);
    for category in Category::ALL {
        let albums = catalog.albums(category)?;
        if albums.is_empty() {
            continue;
        }
        let files: usize = albums
            .iter()
            .map(|album| catalog.count_album_files(category, album))
            .sum::<mediadex_core::Result<usize>>()?;
        println!("{:<20} {} albums, {} files", category.name(), albums.len(), files);
    }
    library.shutdown();
    Ok(())
}

fn run_probe(config: Config, paths: &[PathBuf]) -> anyhow::Result<()> {
    let library = MediaLibrary::builder(config).without_watcher().build()?;
    let mut failed = 0;
    for path in paths {
        match library.read_full_content(path) {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => {
                eprintln!("{}: no metadata", path.display());
                failed += 1;
            }
        }
    }
    library.shutdown();
    if failed > 0 {
        anyhow::bail!("{failed} of {} paths could not be probed", paths.len());
    }
    Ok(())
}
