//! Job orchestration: resolve, load, generate, rank and report.
use std::path::Path;

use candle::Device;

use crate::config::AppConfig;
use crate::generator::{DalleReplica, ImageGenerator, Replica};
use crate::loader;
use crate::ranker::{ClipScorer, ImageScorer};
use crate::reporter::{ReportSettings, Reporter};
use crate::resolver::{self, Resolution};
use crate::strip::CaptionStyle;
use crate::tracking::{TrackedRun, Tracker};
use crate::Result;

/// How a job ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A new model version was processed and `strips` images were logged.
    Completed { version: String, strips: usize },
    /// The model version was already processed, nothing was loaded.
    UpToDate { version: String },
}

/// Builds the per-device replicas and the scorer for a downloaded artifact.
pub trait ModelFactory {
    type Replica: Replica;
    type Scorer: ImageScorer;

    fn load(
        &self,
        config: &AppConfig,
        artifact_dir: &Path,
    ) -> Result<(Vec<Self::Replica>, Self::Scorer)>;
}

/// Loads the pretrained models on a fixed set of devices.
pub struct PretrainedModels {
    devices: Vec<Device>,
}

impl PretrainedModels {
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }
}

impl ModelFactory for PretrainedModels {
    type Replica = DalleReplica;
    type Scorer = ClipScorer;

    fn load(&self, config: &AppConfig, artifact_dir: &Path) -> Result<(Vec<DalleReplica>, ClipScorer)> {
        let models = loader::load(config, artifact_dir, &self.devices)?;
        Ok((models.replicas, models.scorer))
    }
}

/// Everything a job needs, built once at startup.
pub struct AppContext<T> {
    pub config: AppConfig,
    pub tracker: T,
    pub caption: CaptionStyle,
}

impl<T: Tracker> AppContext<T> {
    pub fn new(config: AppConfig, tracker: T) -> Self {
        let caption = CaptionStyle::load(
            config.report.font.as_deref(),
            config.report.font_size,
            config.report.caption_height,
        );
        Self::with_caption(config, tracker, caption)
    }

    pub fn with_caption(config: AppConfig, tracker: T, caption: CaptionStyle) -> Self {
        Self {
            config,
            tracker,
            caption,
        }
    }

    pub fn report_settings(&self) -> ReportSettings {
        ReportSettings {
            num_images: self.config.generation.num_images,
            top_k: self.config.ranking.top_k,
            rows: self.config.report.rows,
        }
    }

    pub fn run<F: ModelFactory>(&self, factory: &F) -> Result<Outcome> {
        let config = &self.config;
        let resolution = resolver::resolve(&self.tracker, &config.tracking, &config.state)?;
        let (mut run, artifact) = match resolution {
            Resolution::UpToDate { run, version } => {
                run.finish()?;
                return Ok(Outcome::UpToDate { version });
            }
            Resolution::Proceed { run, artifact } => (run, artifact),
        };
        let artifact_dir = run
            .download(&artifact)
            .map_err(|e| e.context(format!("downloading {}:{}", artifact.name, artifact.version)))?;
        let (replicas, scorer) = factory.load(config, &artifact_dir)?;
        let mut generator = ImageGenerator::new(replicas, config.generation.seed)?;
        tracing::info!(
            devices = generator.device_count(),
            prompts = config.prompts.len(),
            "starting generation"
        );
        let mut reporter = Reporter {
            generator: &mut generator,
            scorer: &scorer,
            style: &self.caption,
            settings: self.report_settings(),
        };
        let strips = reporter.report(&mut run, &config.prompts, &artifact.version)?;
        run.finish()?;
        Ok(Outcome::Completed {
            version: artifact.version,
            strips,
        })
    }
}
