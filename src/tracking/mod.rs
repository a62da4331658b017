//! Experiment tracking contract.
//!
//! A tracker hands out runs; a run resolves versioned artifacts and receives
//! history rows. [`local::LocalTracker`] keeps everything on disk.
use std::collections::BTreeMap;
use std::path::PathBuf;

use image::RgbImage;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub mod local;

pub use local::LocalTracker;

const RUN_ID_LEN: usize = 8;
const RUN_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let id = (0..RUN_ID_LEN)
            .map(|_| RUN_ID_CHARSET[rng.gen_range(0..RUN_ID_CHARSET.len())] as char)
            .collect::<String>();
        Self(id)
    }

    /// Validates an id read back from disk: lowercase ascii letters and
    /// digits only, so it is always a single path component.
    pub fn parse(id: &str) -> Result<Self> {
        let valid = !id.is_empty()
            && id
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
        if !valid {
            return Err(Error::MalformedRunId { id: id.to_string() });
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a run is filed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub entity: String,
    pub project: String,
    pub job_type: String,
}

/// Controls the tracker's own console chatter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerSettings {
    /// Hides the tracker's startup messages.
    pub silent: bool,
    /// Echoes every logged row to the console and to the run's `output.log`.
    pub console: bool,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            silent: true,
            console: false,
        }
    }
}

impl TrackerSettings {
    /// Applies the `WANDB_SILENT` and `WANDB_CONSOLE` toggles when present.
    pub fn with_env(self) -> Self {
        let silent = match std::env::var("WANDB_SILENT") {
            Ok(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"),
            Err(_) => self.silent,
        };
        let console = match std::env::var("WANDB_CONSOLE") {
            Ok(v) => !matches!(v.to_lowercase().as_str(), "off" | "false" | "0"),
            Err(_) => self.console,
        };
        Self { silent, console }
    }
}

/// `entity/project/name:alias`, with `latest` as the default alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPath {
    pub entity: String,
    pub project: String,
    pub name: String,
    pub alias: String,
}

impl std::str::FromStr for ArtifactPath {
    type Err = Error;

    fn from_str(path: &str) -> Result<Self> {
        let malformed = || Error::MalformedArtifactPath {
            path: path.to_string(),
        };
        let parts: Vec<&str> = path.split('/').collect();
        let [entity, project, name] = parts.as_slice() else {
            return Err(malformed());
        };
        let (name, alias) = match name.split_once(':') {
            Some((name, alias)) => (name, alias),
            None => (*name, "latest"),
        };
        if [*entity, *project, name, alias].iter().any(|s| s.is_empty()) {
            return Err(malformed());
        }
        Ok(Self {
            entity: entity.to_string(),
            project: project.to_string(),
            name: name.to_string(),
            alias: alias.to_string(),
        })
    }
}

impl std::fmt::Display for ArtifactPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}:{}", self.entity, self.project, self.name, self.alias)
    }
}

/// A resolved artifact version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub version: String,
    pub artifact_type: String,
    pub(crate) location: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LoggedImage {
    pub image: RgbImage,
    pub caption: Option<String>,
}

#[derive(Debug, Clone)]
pub enum LogValue {
    Images(Vec<LoggedImage>),
    Text(String),
}

/// One `log` call worth of values.
#[derive(Debug, Clone, Default)]
pub struct HistoryRow {
    pub values: BTreeMap<String, LogValue>,
}

impl HistoryRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: LogValue) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }
}

pub trait Tracker {
    type Run: TrackedRun;

    /// Opens a run with resume mode "allow": an existing id is resumed, an
    /// unknown id is created as is, no id creates a fresh one.
    fn init(&self, spec: &RunSpec, resume: Option<&RunId>) -> Result<Self::Run>;
}

pub trait TrackedRun {
    fn id(&self) -> &RunId;

    /// Whether `init` picked up an already existing run.
    fn resumed(&self) -> bool;

    /// Resolves an artifact and records it as an input of this run.
    fn use_artifact(&mut self, path: &ArtifactPath, artifact_type: &str) -> Result<Artifact>;

    /// Makes the artifact contents available locally.
    fn download(&mut self, artifact: &Artifact) -> Result<PathBuf>;

    fn log(&mut self, row: HistoryRow) -> Result<()>;

    fn finish(self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_single_path_components() -> Result<()> {
        assert_eq!(RunId::parse("13clbm7t")?.as_str(), "13clbm7t");
        assert_eq!(RunId::generate().as_str().len(), RUN_ID_LEN);
        RunId::parse(RunId::generate().as_str())?;
        for bad in ["", "../../outside", "abc/def", "ABCD1234", "run 1", ".."] {
            assert!(
                matches!(RunId::parse(bad), Err(Error::MalformedRunId { .. })),
                "{bad:?}"
            );
        }
        Ok(())
    }

    #[test]
    fn parse_artifact_path() -> Result<()> {
        let path: ArtifactPath = "wandb/hf-flax-dalle-mini/model-13clbm7t:latest".parse()?;
        assert_eq!(path.entity, "wandb");
        assert_eq!(path.project, "hf-flax-dalle-mini");
        assert_eq!(path.name, "model-13clbm7t");
        assert_eq!(path.alias, "latest");
        assert_eq!(
            path.to_string(),
            "wandb/hf-flax-dalle-mini/model-13clbm7t:latest"
        );

        let path: ArtifactPath = "e/p/model-1".parse()?;
        assert_eq!(path.alias, "latest");
        let path: ArtifactPath = "e/p/model-1:v3".parse()?;
        assert_eq!(path.alias, "v3");
        Ok(())
    }

    #[test]
    fn reject_malformed_artifact_paths() {
        for path in ["model-1:latest", "e/model-1", "e/p/", "e/p/model:", "a/b/c/d"] {
            let err = path.parse::<ArtifactPath>().unwrap_err();
            assert!(matches!(err, Error::MalformedArtifactPath { .. }), "{path}");
        }
    }

    #[test]
    fn generated_run_ids() {
        let id = RunId::generate();
        assert_eq!(id.as_str().len(), RUN_ID_LEN);
        assert!(id
            .as_str()
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
    }
}
