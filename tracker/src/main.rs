//! Celltrack production tracker.
//!
//! Thin binary over the core engine: acquires the output-directory lock,
//! opens the scan source, and dispatches to one of the four operating
//! modes. In watch mode a producer thread monitors the input file and
//! feeds the control mailbox; the main loop polls it without blocking and
//! clears the ready flag only after each scan transition has fully
//! committed.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use celltrack_core::{Tracker, TrackerConfig};
use celltrack_env::{
    ControlRequest, DirLock, JsonScanSource, Mailbox, OperatingMode, Signal,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Re-track the entire scan file from scratch
    Retrack,
    /// Initialize the store and track scan 0 only
    PrepareNew,
    /// Resume or initialize, then track all remaining scans
    PrepareAppend,
    /// Prepare, then keep tracking new scans as the producer appends them
    Watch,
}

/// Storm-cell lineage tracker
#[derive(Parser, Debug)]
#[command(name = "celltrack")]
#[command(about = "Track storm-cell lineages across radar scans", long_about = None)]
struct Args {
    /// Scan input file (JSON array of scans)
    #[arg(short, long)]
    input: PathBuf,

    /// Output directory for the lineage store
    #[arg(short, long)]
    data_dir: PathBuf,

    /// Operating mode
    #[arg(short, long, value_enum, default_value = "retrack")]
    mode: Mode,

    /// Tracking parameters file (JSON); defaults apply when omitted
    #[arg(short, long)]
    params: Option<PathBuf>,

    /// Poll interval in watch mode (seconds)
    #[arg(long, default_value = "2")]
    poll_secs: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    let config = load_config(args.params.as_deref())?;

    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("cannot create {}", args.data_dir.display()))?;

    // One tracker per output directory, no retries: a held lock is fatal.
    let _lock = DirLock::acquire(&args.data_dir)
        .with_context(|| format!("cannot lock {}", args.data_dir.display()))?;

    let source = JsonScanSource::open(&args.input)
        .with_context(|| format!("cannot open scan source {}", args.input.display()))?;
    let mut tracker = Tracker::new(config, &args.data_dir, source);

    match args.mode {
        Mode::Retrack => {
            tracker.retrack().context("retrack failed")?;
            info!("retrack complete");
        }
        Mode::PrepareNew => {
            tracker.prepare_new().context("prepare failed")?;
            info!("prepared new store at scan 0");
        }
        Mode::PrepareAppend => {
            tracker.prepare_for_append().context("append tracking failed")?;
            info!("append tracking complete");
        }
        Mode::Watch => {
            watch(&args, &mut tracker)?;
        }
    }

    Ok(())
}

/// Steady-state mode: prepare, then track the newest scan whenever the
/// producer signals one.
fn watch(args: &Args, tracker: &mut Tracker<JsonScanSource>) -> Result<()> {
    tracker
        .prepare_for_append()
        .context("cannot prepare store for watching")?;

    let mailbox = Mailbox::new();
    spawn_file_producer(
        mailbox.clone(),
        args.input.clone(),
        Duration::from_secs(args.poll_secs),
    );

    info!("watching {} for new scans", args.input.display());
    let mut idle_polls: u64 = 0;

    loop {
        match mailbox.poll() {
            Some(Signal::Shutdown) => {
                // No cancellation mid-scan: any in-progress transition has
                // already committed by the time we observe the flag.
                info!("shutdown requested, exiting");
                return Ok(());
            }
            Some(Signal::DataReady(request)) => {
                idle_polls = 0;
                match tracker.track_last_scan() {
                    Ok(()) => {
                        // The durable write is complete; only now may the
                        // ready flag drop.
                        mailbox.clear_ready();
                        info!(input = %request.input_path.display(), "tracked newest scan");
                    }
                    Err(e) => {
                        error!("tracking failed: {}", e);
                        return Err(e.into());
                    }
                }
            }
            None => {
                idle_polls += 1;
                // Liveness heartbeat roughly once a minute of idling.
                if idle_polls % 60 == 0 {
                    info!(idle_polls, "tracker idle, waiting for scans");
                }
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }
}

/// Producer side of the mailbox: watches the input file's modification
/// time and raises the ready flag when it changes; a vanished input file
/// becomes a shutdown request.
fn spawn_file_producer(mailbox: Mailbox, input: PathBuf, poll: Duration) {
    std::thread::spawn(move || {
        // The scans present at startup were handled by the prepare pass;
        // only subsequent modifications signal.
        let mut last_mtime = std::fs::metadata(&input).and_then(|m| m.modified()).ok();
        loop {
            match std::fs::metadata(&input).and_then(|m| m.modified()) {
                Ok(mtime) => {
                    if last_mtime != Some(mtime) {
                        last_mtime = Some(mtime);
                        mailbox.signal_ready(ControlRequest {
                            input_path: input.clone(),
                            mode: OperatingMode::TrackLast,
                            auto_restart: false,
                        });
                    }
                }
                Err(e) => {
                    warn!("scan input {} unreadable ({}), requesting shutdown", input.display(), e);
                    mailbox.request_shutdown();
                    return;
                }
            }
            std::thread::sleep(poll);
        }
    });
}

fn load_config(path: Option<&std::path::Path>) -> Result<TrackerConfig> {
    match path {
        None => Ok(TrackerConfig::default()),
        Some(path) => {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read params {}", path.display()))?;
            serde_json::from_str(&data)
                .with_context(|| format!("cannot parse params {}", path.display()))
        }
    }
}
