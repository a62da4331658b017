//! Loads the sequence model, the VQGAN decoder and the CLIP scorer.
//!
//! The sequence model and the decoder are loaded once per device so every
//! device owns a full replica. CLIP only scores on the first device.
use std::path::{Path, PathBuf};

use candle::{DType, Device};
use candle_nn::VarBuilder;
use candle_transformers::models::clip::{ClipConfig, ClipModel};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer;

use crate::config::{AppConfig, GenerationConfig, ModelSource};
use crate::generator::{configure_prompt_tokenizer, DalleReplica};
use crate::models::dalle_bart::{DalleBart, DalleBartConfig, SampleConfig};
use crate::models::vqgan::{VqganConfig, VqganDecoder};
use crate::ranker::ClipScorer;
use crate::{Error, Result};

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Resolves `file` within a model source, downloading it from the hub into
/// the local cache when needed.
pub fn fetch(source: &ModelSource, file: &str) -> Result<PathBuf> {
    match source {
        ModelSource::Hub { repo, revision } => {
            let api = Api::new()?;
            let repo = api.repo(Repo::with_revision(
                repo.clone(),
                RepoType::Model,
                revision.clone(),
            ));
            Ok(repo.get(file)?)
        }
        ModelSource::Local(path) if path.is_dir() => Ok(path.join(file)),
        ModelSource::Local(path) => Ok(path.clone()),
    }
}

fn read_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let config = std::fs::read_to_string(path)
        .map_err(|e| Error::from(e).context(format!("reading {}", path.display())))?;
    Ok(serde_json::from_str(&config)?)
}

/// Sequence model config from the artifact, with the legacy decoding
/// overrides applied.
pub fn load_dalle_config(artifact_dir: &Path) -> Result<DalleBartConfig> {
    let mut config: DalleBartConfig = read_config(&artifact_dir.join(CONFIG_FILE))?;
    config.apply_legacy_overrides();
    Ok(config)
}

pub fn load_prompt_tokenizer(source: &ModelSource, generation: &GenerationConfig) -> Result<Tokenizer> {
    let file = fetch(source, TOKENIZER_FILE)?;
    let mut tokenizer = Tokenizer::from_file(&file).map_err(Error::tokenizer)?;
    let pad_token = "<pad>";
    let pad_id = tokenizer.token_to_id(pad_token).unwrap_or(1);
    configure_prompt_tokenizer(&mut tokenizer, generation.max_input_length, pad_id, pad_token)?;
    Ok(tokenizer)
}

pub fn sample_config(generation: &GenerationConfig) -> SampleConfig {
    SampleConfig {
        max_length: generation.max_length,
        eos_token_id: generation.eos_token_id,
        pad_token_id: generation.pad_token_id,
        top_k: generation.top_k,
        temperature: generation.temperature,
    }
}

/// Models needed by the generate and rank loop.
pub struct LoadedModels {
    pub replicas: Vec<DalleReplica>,
    pub scorer: ClipScorer,
}

pub fn load_replicas(
    config: &AppConfig,
    artifact_dir: &Path,
    devices: &[Device],
) -> Result<Vec<DalleReplica>> {
    let dalle_config = load_dalle_config(artifact_dir)?;
    let dalle_weights = artifact_dir.join(WEIGHTS_FILE);
    let vqgan_config: VqganConfig = read_config(&fetch(&config.models.vqgan, CONFIG_FILE)?)?;
    let vqgan_weights = fetch(&config.models.vqgan, WEIGHTS_FILE)?;
    let tokenizer = load_prompt_tokenizer(&config.models.tokenizer, &config.generation)?;
    let params = sample_config(&config.generation);

    let mut replicas = Vec::with_capacity(devices.len());
    for (idx, device) in devices.iter().enumerate() {
        let _span = tracing::info_span!("replica", idx).entered();
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&dalle_weights], DType::F32, device)?
        };
        let bart = DalleBart::new(&dalle_config, vb)
            .map_err(|e| Error::from(e).context("loading the sequence model"))?;
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&vqgan_weights], DType::F32, device)?
        };
        let vqgan = VqganDecoder::new(&vqgan_config, vb)
            .map_err(|e| Error::from(e).context("loading the vqgan decoder"))?;
        replicas.push(DalleReplica::new(
            device.clone(),
            tokenizer.clone(),
            bart,
            vqgan,
            params.clone(),
        ));
    }
    tracing::info!(count = replicas.len(), "replicated generator and decoder");
    Ok(replicas)
}

pub fn load_scorer(config: &AppConfig, device: &Device) -> Result<ClipScorer> {
    let weights = fetch(&config.models.clip, WEIGHTS_FILE)?;
    let tokenizer_file = fetch(&config.models.clip_tokenizer, TOKENIZER_FILE)?;
    let tokenizer = Tokenizer::from_file(&tokenizer_file).map_err(Error::tokenizer)?;
    let clip_config = ClipConfig::vit_base_patch32();
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device)? };
    let model = ClipModel::new(vb, &clip_config)
        .map_err(|e| Error::from(e).context("loading clip"))?;
    Ok(ClipScorer::new(
        model,
        tokenizer,
        clip_config,
        config.ranking.preprocess,
        device.clone(),
    ))
}

pub fn load(config: &AppConfig, artifact_dir: &Path, devices: &[Device]) -> Result<LoadedModels> {
    let first = devices
        .first()
        .ok_or_else(|| Error::NoDevice("nothing to load the models on".to_string()))?;
    let start = std::time::Instant::now();
    let replicas = load_replicas(config, artifact_dir, devices)?;
    let scorer = load_scorer(config, first)?;
    tracing::info!("loaded models in {:.2}s", start.elapsed().as_secs_f32());
    Ok(LoadedModels { replicas, scorer })
}
