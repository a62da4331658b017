#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use dalle_showcase::app::{AppContext, Outcome, PretrainedModels};
use dalle_showcase::config::AppConfig;
use dalle_showcase::tracking::{LocalTracker, TrackerSettings};
use dalle_showcase::{device, ErrorKind};

/// Exit code for failures worth retrying, `EX_TEMPFAIL`.
const EXIT_TRANSIENT: u8 = 75;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Number of devices to shard the generation over, all available GPUs by
    /// default.
    #[arg(long)]
    devices: Option<usize>,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,

    /// JSON configuration, any missing field keeps its default.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding the run and version marker files.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Root of the local tracking store.
    #[arg(long)]
    tracking_dir: Option<PathBuf>,

    /// Seed for the per-batch sampling seeds.
    #[arg(long)]
    seed: Option<u64>,

    /// Font used for the strip captions.
    #[arg(long)]
    font: Option<PathBuf>,
}

impl Args {
    fn app_config(&self) -> Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::from_json_file(path)?,
            None => AppConfig::default(),
        };
        if let Some(dir) = &self.state_dir {
            config.state.dir = dir.clone();
        }
        if let Some(dir) = &self.tracking_dir {
            config.tracking.root = dir.clone();
        }
        if self.seed.is_some() {
            config.generation.seed = self.seed;
        }
        if self.font.is_some() {
            config.report.font = self.font.clone();
        }
        Ok(config)
    }
}

fn run(args: &Args) -> Result<Outcome> {
    let config = args.app_config()?;
    let settings = TrackerSettings::default().with_env();
    let tracker = LocalTracker::open(&config.tracking.root, settings)?;
    let devices = device::devices(args.cpu, args.devices)?;
    let app = AppContext::new(config, tracker);
    Ok(app.run(&PretrainedModels::new(devices))?)
}

fn main() -> ExitCode {
    let args = Args::parse();

    let (chrome_layer, _guard) = if args.tracing {
        let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new().build();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(chrome_layer)
        .init();

    match run(&args) {
        Ok(Outcome::UpToDate { version }) => {
            tracing::info!(version, "model version already logged, nothing to do");
            ExitCode::SUCCESS
        }
        Ok(Outcome::Completed { version, strips }) => {
            tracing::info!(version, strips, "done");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!("{err:?}");
            let transient = err
                .downcast_ref::<dalle_showcase::Error>()
                .is_some_and(|e| e.kind() == ErrorKind::Transient);
            if transient {
                ExitCode::from(EXIT_TRANSIENT)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
