mod commands;
mod monitor;

use clap::{Parser, Subcommand};
use common::{Environment, setup_logging};
use framebus::BusConfig;
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    flag,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Inspect and exercise shared-memory frame buffers.
#[derive(Parser, Debug)]
#[command(name = "framebus-diag", version, about, long_about = None)]
struct Cli {
    /// Directory holding the shared memory segments (overrides FRAMEBUS_SHM_DIR)
    #[arg(long, global = true)]
    shm_dir: Option<PathBuf>,

    /// Semaphore name prefix (overrides FRAMEBUS_NAMESPACE)
    #[arg(long, global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read the latest frame of each buffer and print its statistics
    Inspect {
        /// Buffer names; defaults to the well-known camera overlays
        names: Vec<String>,
    },
    /// Sample a buffer repeatedly and report whether its writer is alive
    Monitor {
        /// Buffer name; defaults to the first active well-known camera overlay
        name: Option<String>,
        #[arg(long, visible_alias = "duration", default_value_t = 30)]
        duration_secs: u64,
        #[arg(long, default_value_t = 100)]
        interval_ms: u64,
        /// Wait this long for the buffer to appear before giving up
        #[arg(long)]
        wait_secs: Option<u64>,
    },
    /// Save the latest frame as a JPEG, or the placeholder when there is none
    Snapshot { name: String, output: PathBuf },
    /// Publish synthetic frames and tracking metadata
    Publish {
        name: String,
        #[arg(long, default_value_t = 640)]
        width: usize,
        #[arg(long, default_value_t = 480)]
        height: usize,
        #[arg(long, default_value_t = 15)]
        fps: u32,
        /// Stop after this many frames; runs until interrupted otherwise
        #[arg(long)]
        frames: Option<u64>,
        /// Leave the segments in place on exit
        #[arg(long)]
        keep: bool,
    },
    /// Unlink the ring buffers and metadata regions of the given names
    Cleanup {
        #[arg(required = true)]
        names: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(Environment::from_env(), "warn")?;

    let mut config = BusConfig::from_env();
    if let Some(shm_dir) = cli.shm_dir {
        config.shm_dir = shm_dir;
    }
    if let Some(namespace) = cli.namespace {
        config.namespace = namespace;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGTERM, Arc::clone(&shutdown))?;
    flag::register(SIGINT, Arc::clone(&shutdown))?;

    match cli.command {
        Command::Inspect { names } => commands::inspect(config, &names),
        Command::Monitor {
            name,
            duration_secs,
            interval_ms,
            wait_secs,
        } => commands::monitor(
            config,
            name,
            commands::MonitorOptions {
                duration_secs,
                interval_ms,
                wait_secs,
            },
            &shutdown,
        ),
        Command::Snapshot { name, output } => commands::snapshot(config, &name, &output),
        Command::Publish {
            name,
            width,
            height,
            fps,
            frames,
            keep,
        } => commands::publish(
            config,
            &name,
            commands::PublishOptions {
                width,
                height,
                fps,
                frames,
                keep,
            },
            &shutdown,
        ),
        Command::Cleanup { names } => commands::cleanup(config, &names),
    }
}
