//! Job configuration.
//!
//! The defaults reproduce the fixed showcase job: same tracking project,
//! same model sources, same prompt list. A JSON file can override any
//! subset of the fields.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ranker::ClipPreprocess;
use crate::Result;

pub const DEFAULT_PROMPTS: [&str; 8] = [
    "white snow covered mountain under blue sky during daytime",
    "aerial view of beach during daytime",
    "aerial view of beach at night",
    "an armchair in the shape of an avocado",
    "young woman riding her bike trough a forest",
    "rice fields by the mediterranean coast",
    "white houses on the hill of a greek coastline",
    "illustration of a shark with a baby shark",
];

/// Where a pretrained model (or tokenizer) comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    /// A repository on the model hub, fetched into the local hub cache.
    Hub { repo: String, revision: String },
    /// A local directory, or a single file for tokenizers.
    Local(PathBuf),
}

impl ModelSource {
    pub fn hub(repo: &str) -> Self {
        Self::Hub {
            repo: repo.to_string(),
            revision: "main".to_string(),
        }
    }

    pub fn hub_with_revision(repo: &str, revision: &str) -> Self {
        Self::Hub {
            repo: repo.to_string(),
            revision: revision.to_string(),
        }
    }
}

impl std::fmt::Display for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hub { repo, revision } => write!(f, "{repo}@{revision}"),
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Root directory of the tracking store.
    pub root: PathBuf,
    pub entity: String,
    pub project: String,
    pub job_type: String,
    /// Fully qualified artifact path, `entity/project/name:alias`.
    pub artifact: String,
    pub artifact_type: String,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("tracking"),
            entity: "wandb".to_string(),
            project: "hf-flax-dalle-mini".to_string(),
            job_type: "predictions".to_string(),
            artifact: "wandb/hf-flax-dalle-mini/model-13clbm7t:latest".to_string(),
            artifact_type: "bart_model".to_string(),
        }
    }
}

/// Local marker files used to resume the run and skip processed versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub dir: PathBuf,
    pub run_file: String,
    pub version_file: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            run_file: "wandb_examples_run".to_string(),
            version_file: "last_logged_model.txt".to_string(),
        }
    }
}

impl StateConfig {
    pub fn run_path(&self) -> PathBuf {
        self.dir.join(&self.run_file)
    }

    pub fn version_path(&self) -> PathBuf {
        self.dir.join(&self.version_file)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSources {
    /// Prompt tokenizer. Earlier checkpoints ship without one, so the base
    /// model's tokenizer is used.
    pub tokenizer: ModelSource,
    pub vqgan: ModelSource,
    pub clip: ModelSource,
    pub clip_tokenizer: ModelSource,
}

impl Default for ModelSources {
    fn default() -> Self {
        Self {
            tokenizer: ModelSource::hub("facebook/bart-large-cnn"),
            vqgan: ModelSource::hub("dalle-mini/vqgan_imagenet_f16_16384"),
            clip: ModelSource::hub_with_revision("openai/clip-vit-base-patch32", "refs/pr/15"),
            clip_tokenizer: ModelSource::hub_with_revision(
                "openai/clip-vit-base-patch32",
                "refs/pr/15",
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Candidates generated per prompt, must be a multiple of the device count.
    pub num_images: usize,
    /// Prompts are padded and truncated to this many tokens.
    pub max_input_length: usize,
    /// Generated sequence length, including the decoder start token.
    pub max_length: usize,
    pub eos_token_id: u32,
    pub pad_token_id: u32,
    pub top_k: usize,
    pub temperature: f64,
    /// Fixes the per-batch seed stream, mostly useful for debugging.
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            num_images: 32,
            max_input_length: 128,
            max_length: 257,
            eos_token_id: 50000,
            pad_token_id: 50000,
            top_k: 50,
            temperature: 1.0,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    pub top_k: usize,
    pub preprocess: ClipPreprocess,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            top_k: 8,
            preprocess: ClipPreprocess::Normalized,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub rows: usize,
    pub caption_height: u32,
    pub font: Option<PathBuf>,
    pub font_size: f32,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            rows: 1,
            caption_height: 48,
            font: Some(PathBuf::from(
                "/usr/share/fonts/truetype/liberation2/LiberationMono-Bold.ttf",
            )),
            font_size: 40.,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub tracking: TrackingConfig,
    pub state: StateConfig,
    pub models: ModelSources,
    pub generation: GenerationConfig,
    pub ranking: RankingConfig,
    pub report: ReportConfig,
    pub prompts: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tracking: TrackingConfig::default(),
            state: StateConfig::default(),
            models: ModelSources::default(),
            generation: GenerationConfig::default(),
            ranking: RankingConfig::default(),
            report: ReportConfig::default(),
            prompts: DEFAULT_PROMPTS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl AppConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&config)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() -> Result<()> {
        let config: AppConfig = serde_json::from_str(
            r#"{
                "generation": { "num_images": 16, "seed": 42 },
                "models": { "vqgan": { "local": "/models/vqgan" } },
                "prompts": ["a red bicycle"]
            }"#,
        )?;
        assert_eq!(config.generation.num_images, 16);
        assert_eq!(config.generation.seed, Some(42));
        assert_eq!(config.generation.max_length, 257);
        assert_eq!(
            config.models.vqgan,
            ModelSource::Local(PathBuf::from("/models/vqgan"))
        );
        assert_eq!(config.models.tokenizer, ModelSource::hub("facebook/bart-large-cnn"));
        assert_eq!(config.prompts, vec!["a red bicycle".to_string()]);
        assert_eq!(config.ranking.top_k, 8);
        Ok(())
    }

    #[test]
    fn defaults_match_the_showcase_job() {
        let config = AppConfig::default();
        assert_eq!(config.prompts.len(), 8);
        assert_eq!(config.generation.num_images, 32);
        assert_eq!(config.ranking.top_k, 8);
        assert_eq!(config.state.run_path(), PathBuf::from("./wandb_examples_run"));
        assert_eq!(config.tracking.artifact_type, "bart_model");
    }
}
