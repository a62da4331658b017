//! Filesystem-backed tracking store.
//!
//! Layout, relative to the store root:
//!
//! ```text
//! <entity>/<project>/runs/<id>/run.json
//! <entity>/<project>/runs/<id>/history.jsonl
//! <entity>/<project>/runs/<id>/media/images/<key>_<step>_<n>.png
//! <entity>/<project>/artifacts/<name>/artifact.json
//! <entity>/<project>/artifacts/<name>/v<N>/...
//! ```
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{
    Artifact, ArtifactPath, HistoryRow, LogValue, RunId, RunSpec, TrackedRun, Tracker,
    TrackerSettings,
};
use crate::{Error, Result};

const RUN_FILE: &str = "run.json";
const HISTORY_FILE: &str = "history.jsonl";
const ARTIFACT_FILE: &str = "artifact.json";
const CONSOLE_FILE: &str = "output.log";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Finished,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub entity: String,
    pub project: String,
    pub job_type: String,
    pub state: RunState,
    pub created_at: f64,
    #[serde(default)]
    pub resumes: u32,
    #[serde(default)]
    pub used_artifacts: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ArtifactManifest {
    #[serde(rename = "type")]
    artifact_type: String,
    #[serde(default)]
    aliases: BTreeMap<String, String>,
}

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.)
}

fn parse_version(dir_name: &str) -> Option<u32> {
    dir_name.strip_prefix('v')?.parse().ok()
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct LocalTracker {
    root: PathBuf,
    settings: TrackerSettings,
}

impl LocalTracker {
    /// Opens (or creates) a store rooted at `root`.
    pub fn open<P: AsRef<Path>>(root: P, settings: TrackerSettings) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root, settings })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn project_dir(&self, entity: &str, project: &str) -> PathBuf {
        self.root.join(entity).join(project)
    }

    fn run_dir(&self, entity: &str, project: &str, id: &RunId) -> PathBuf {
        self.project_dir(entity, project).join("runs").join(id.as_str())
    }

    fn artifact_dir(&self, entity: &str, project: &str, name: &str) -> PathBuf {
        self.project_dir(entity, project).join("artifacts").join(name)
    }

    /// Stores `files` as the next version of an artifact and moves the
    /// `latest` alias to it. Returns the new version string.
    pub fn publish_artifact(
        &self,
        entity: &str,
        project: &str,
        name: &str,
        artifact_type: &str,
        files: &[(&str, &[u8])],
    ) -> Result<String> {
        let dir = self.artifact_dir(entity, project, name);
        fs::create_dir_all(&dir)?;
        let manifest_path = dir.join(ARTIFACT_FILE);
        let mut manifest = if manifest_path.exists() {
            serde_json::from_str::<ArtifactManifest>(&fs::read_to_string(&manifest_path)?)?
        } else {
            ArtifactManifest {
                artifact_type: artifact_type.to_string(),
                ..Default::default()
            }
        };
        if manifest.artifact_type != artifact_type {
            return Err(Error::ArtifactTypeMismatch {
                name: name.to_string(),
                expected: artifact_type.to_string(),
                got: manifest.artifact_type,
            });
        }
        let next = latest_version(&dir)?.map_or(0, |v| v + 1);
        let version = format!("v{next}");
        let version_dir = dir.join(&version);
        fs::create_dir_all(&version_dir)?;
        for (file_name, contents) in files {
            fs::write(version_dir.join(file_name), contents)?;
        }
        manifest
            .aliases
            .insert("latest".to_string(), version.clone());
        write_json(&manifest_path, &manifest)?;
        Ok(version)
    }

    /// Reads back every logged row of a run.
    pub fn history(&self, entity: &str, project: &str, id: &RunId) -> Result<Vec<Value>> {
        let path = self.run_dir(entity, project, id).join(HISTORY_FILE);
        if !path.exists() {
            return Ok(vec![]);
        }
        fs::read_to_string(path)?
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| Ok(serde_json::from_str(line)?))
            .collect()
    }

    pub fn run_record(&self, entity: &str, project: &str, id: &RunId) -> Result<RunRecord> {
        let path = self.run_dir(entity, project, id).join(RUN_FILE);
        if !path.exists() {
            return Err(Error::RunNotFound {
                id: id.to_string(),
                root: self.root.clone(),
            });
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

fn latest_version(artifact_dir: &Path) -> Result<Option<u32>> {
    if !artifact_dir.exists() {
        return Ok(None);
    }
    let mut latest = None;
    for entry in fs::read_dir(artifact_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(v) = entry.file_name().to_str().and_then(parse_version) {
            latest = latest.max(Some(v));
        }
    }
    Ok(latest)
}

impl Tracker for LocalTracker {
    type Run = LocalRun;

    fn init(&self, spec: &RunSpec, resume: Option<&RunId>) -> Result<LocalRun> {
        let id = match resume {
            Some(id) => RunId::parse(id.as_str())?,
            None => RunId::generate(),
        };
        let dir = self.run_dir(&spec.entity, &spec.project, &id);
        let record_path = dir.join(RUN_FILE);
        let (record, resumed) = if record_path.exists() {
            let mut record: RunRecord = serde_json::from_str(&fs::read_to_string(&record_path)?)?;
            record.state = RunState::Running;
            record.resumes += 1;
            (record, true)
        } else {
            fs::create_dir_all(&dir)?;
            let record = RunRecord {
                id: id.clone(),
                entity: spec.entity.clone(),
                project: spec.project.clone(),
                job_type: spec.job_type.clone(),
                state: RunState::Running,
                created_at: now(),
                resumes: 0,
                used_artifacts: vec![],
            };
            (record, false)
        };
        write_json(&record_path, &record)?;
        let step = LocalTracker::history(self, &spec.entity, &spec.project, &id)?.len() as u64;
        if !self.settings.silent {
            tracing::info!(
                run = %id,
                resumed,
                "tracking run at {}",
                dir.display()
            );
        }
        Ok(LocalRun {
            tracker: self.clone(),
            dir,
            record,
            resumed,
            step,
        })
    }
}

#[derive(Debug)]
pub struct LocalRun {
    tracker: LocalTracker,
    dir: PathBuf,
    record: RunRecord,
    resumed: bool,
    step: u64,
}

impl LocalRun {
    pub fn record(&self) -> &RunRecord {
        &self.record
    }

    /// Short console summary of a logged row, mirrored to `output.log`.
    fn echo(&self, row: &HistoryRow) -> Result<()> {
        let summary = row
            .values
            .iter()
            .map(|(key, value)| match value {
                LogValue::Text(text) => format!("{key}={text}"),
                LogValue::Images(images) => format!("{key}=<{} images>", images.len()),
            })
            .collect::<Vec<_>>()
            .join(" ");
        tracing::info!(run = %self.record.id, step = self.step, "{summary}");
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(CONSOLE_FILE))?;
        writeln!(file, "step {}: {summary}", self.step)?;
        Ok(())
    }

    fn save_record(&self) -> Result<()> {
        write_json(&self.dir.join(RUN_FILE), &self.record)
    }

    fn log_value(&self, key: &str, value: &LogValue) -> Result<Value> {
        let value = match value {
            LogValue::Text(text) => Value::String(text.clone()),
            LogValue::Images(images) => {
                let media_dir = self.dir.join("media").join("images");
                fs::create_dir_all(&media_dir)?;
                let mut filenames = Vec::with_capacity(images.len());
                let mut captions = Vec::with_capacity(images.len());
                for (idx, logged) in images.iter().enumerate() {
                    let file_name = format!("{key}_{}_{idx}.png", self.step);
                    logged.image.save(media_dir.join(&file_name))?;
                    filenames.push(format!("media/images/{file_name}"));
                    captions.push(logged.caption.clone());
                }
                json!({
                    "_type": "images/separated",
                    "count": images.len(),
                    "filenames": filenames,
                    "captions": captions,
                })
            }
        };
        Ok(value)
    }
}

impl TrackedRun for LocalRun {
    fn id(&self) -> &RunId {
        &self.record.id
    }

    fn resumed(&self) -> bool {
        self.resumed
    }

    fn use_artifact(&mut self, path: &ArtifactPath, artifact_type: &str) -> Result<Artifact> {
        let dir = self
            .tracker
            .artifact_dir(&path.entity, &path.project, &path.name);
        let not_found = || Error::ArtifactNotFound {
            name: path.name.clone(),
            alias: path.alias.clone(),
            root: self.tracker.root.clone(),
        };
        if !dir.exists() {
            return Err(not_found());
        }
        let manifest_path = dir.join(ARTIFACT_FILE);
        let manifest = if manifest_path.exists() {
            Some(serde_json::from_str::<ArtifactManifest>(
                &fs::read_to_string(&manifest_path)?,
            )?)
        } else {
            None
        };
        if let Some(manifest) = &manifest {
            if manifest.artifact_type != artifact_type {
                return Err(Error::ArtifactTypeMismatch {
                    name: path.name.clone(),
                    expected: artifact_type.to_string(),
                    got: manifest.artifact_type.clone(),
                });
            }
        }
        let version = if parse_version(&path.alias).is_some() {
            path.alias.clone()
        } else {
            match manifest.as_ref().and_then(|m| m.aliases.get(&path.alias)) {
                Some(version) => version.clone(),
                None if path.alias == "latest" => match latest_version(&dir)? {
                    Some(v) => format!("v{v}"),
                    None => return Err(not_found()),
                },
                None => return Err(not_found()),
            }
        };
        let location = dir.join(&version);
        if !location.is_dir() {
            return Err(not_found());
        }
        let used = format!("{}:{version}", path.name);
        if !self.record.used_artifacts.contains(&used) {
            self.record.used_artifacts.push(used);
            self.save_record()?;
        }
        Ok(Artifact {
            name: path.name.clone(),
            version,
            artifact_type: artifact_type.to_string(),
            location,
        })
    }

    fn download(&mut self, artifact: &Artifact) -> Result<PathBuf> {
        if !artifact.location.is_dir() {
            return Err(Error::ArtifactNotFound {
                name: artifact.name.clone(),
                alias: artifact.version.clone(),
                root: self.tracker.root.clone(),
            });
        }
        Ok(artifact.location.clone())
    }

    fn log(&mut self, row: HistoryRow) -> Result<()> {
        let mut line = Map::new();
        for (key, value) in row.values.iter() {
            line.insert(key.clone(), self.log_value(key, value)?);
        }
        line.insert("_step".to_string(), json!(self.step));
        line.insert("_timestamp".to_string(), json!(now()));
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(HISTORY_FILE))?;
        writeln!(file, "{}", Value::Object(line))?;
        if self.tracker.settings.console {
            self.echo(&row)?;
        }
        self.step += 1;
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        self.record.state = RunState::Finished;
        self.save_record()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::LoggedImage;

    fn spec() -> RunSpec {
        RunSpec {
            entity: "wandb".to_string(),
            project: "showcase".to_string(),
            job_type: "predictions".to_string(),
        }
    }

    #[test]
    fn create_then_resume() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let tracker = LocalTracker::open(dir.path(), TrackerSettings::default())?;

        let run = tracker.init(&spec(), None)?;
        assert!(!run.resumed());
        let id = run.id().clone();
        run.finish()?;

        let run = tracker.init(&spec(), Some(&id))?;
        assert!(run.resumed());
        assert_eq!(run.id(), &id);
        assert_eq!(run.record().resumes, 1);
        assert_eq!(run.record().state, RunState::Running);

        let unknown = RunId::new("abcd1234");
        let run = tracker.init(&spec(), Some(&unknown))?;
        assert!(!run.resumed());
        assert_eq!(run.id(), &unknown);
        Ok(())
    }

    #[test]
    fn latest_alias_follows_publishing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let tracker = LocalTracker::open(dir.path(), TrackerSettings::default())?;
        let v0 = tracker.publish_artifact("wandb", "showcase", "model-x", "bart_model", &[])?;
        let v1 = tracker.publish_artifact(
            "wandb",
            "showcase",
            "model-x",
            "bart_model",
            &[("config.json", b"{}")],
        )?;
        assert_eq!((v0.as_str(), v1.as_str()), ("v0", "v1"));

        let mut run = tracker.init(&spec(), None)?;
        let artifact = run.use_artifact(&"wandb/showcase/model-x:latest".parse()?, "bart_model")?;
        assert_eq!(artifact.version, "v1");
        let local = run.download(&artifact)?;
        assert!(local.join("config.json").exists());

        let pinned = run.use_artifact(&"wandb/showcase/model-x:v0".parse()?, "bart_model")?;
        assert_eq!(pinned.version, "v0");
        assert_eq!(
            run.record().used_artifacts,
            vec!["model-x:v1".to_string(), "model-x:v0".to_string()]
        );
        Ok(())
    }

    #[test]
    fn artifact_errors() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let tracker = LocalTracker::open(dir.path(), TrackerSettings::default())?;
        let mut run = tracker.init(&spec(), None)?;
        let err = run
            .use_artifact(&"wandb/showcase/missing".parse()?, "bart_model")
            .unwrap_err();
        assert!(matches!(err, Error::ArtifactNotFound { .. }));

        tracker.publish_artifact("wandb", "showcase", "model-x", "bart_model", &[])?;
        let err = run
            .use_artifact(&"wandb/showcase/model-x".parse()?, "dataset")
            .unwrap_err();
        assert!(matches!(err, Error::ArtifactTypeMismatch { .. }));
        let err = run
            .use_artifact(&"wandb/showcase/model-x:v7".parse()?, "bart_model")
            .unwrap_err();
        assert!(matches!(err, Error::ArtifactNotFound { .. }));
        Ok(())
    }

    #[test]
    fn log_writes_rows_and_images() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let tracker = LocalTracker::open(dir.path(), TrackerSettings::default())?;
        let mut run = tracker.init(&spec(), None)?;
        let id = run.id().clone();
        let images = (0..3)
            .map(|i| LoggedImage {
                image: image::RgbImage::from_pixel(4, 2, image::Rgb([i * 10, 0, 0])),
                caption: Some(format!("prompt {i}")),
            })
            .collect();
        run.log(
            HistoryRow::new()
                .with("images", LogValue::Images(images))
                .with("version", LogValue::Text("v3".to_string())),
        )?;
        run.log(HistoryRow::new().with("loss", LogValue::Text("0.5".to_string())))?;
        run.finish()?;

        let history = tracker.history("wandb", "showcase", &id)?;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["version"], "v3");
        assert_eq!(history[0]["images"]["count"], 3);
        assert_eq!(history[0]["images"]["captions"][2], "prompt 2");
        assert_eq!(history[0]["_step"], 0);
        assert_eq!(history[1]["_step"], 1);
        let first = history[0]["images"]["filenames"][0].as_str().unwrap_or_default();
        let saved = image::open(tracker.run_dir("wandb", "showcase", &id).join(first))?;
        assert_eq!((saved.width(), saved.height()), (4, 2));

        let record = tracker.run_record("wandb", "showcase", &id)?;
        assert_eq!(record.state, RunState::Finished);

        // Steps keep counting after a resume.
        let mut run = tracker.init(&spec(), Some(&id))?;
        run.log(HistoryRow::new().with("loss", LogValue::Text("0.25".to_string())))?;
        let history = tracker.history("wandb", "showcase", &id)?;
        assert_eq!(history[2]["_step"], 2);
        Ok(())
    }

    #[test]
    fn console_echo_follows_settings() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let row = || HistoryRow::new().with("version", LogValue::Text("v2".to_string()));

        let quiet = LocalTracker::open(dir.path().join("quiet"), TrackerSettings::default())?;
        let mut run = quiet.init(&spec(), None)?;
        run.log(row())?;
        assert!(!run.dir.join(CONSOLE_FILE).exists());

        let settings = TrackerSettings {
            silent: true,
            console: true,
        };
        let loud = LocalTracker::open(dir.path().join("loud"), settings)?;
        let mut run = loud.init(&spec(), None)?;
        run.log(row())?;
        run.log(row())?;
        let output = fs::read_to_string(run.dir.join(CONSOLE_FILE))?;
        assert_eq!(output.lines().collect::<Vec<_>>(), ["step 0: version=v2", "step 1: version=v2"]);
        Ok(())
    }

    #[test]
    fn resume_rejects_ids_outside_the_store() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let tracker = LocalTracker::open(dir.path().join("store"), TrackerSettings::default())?;
        let escape = RunId::new("../../../outside");
        let err = tracker.init(&spec(), Some(&escape)).unwrap_err();
        assert!(matches!(err, Error::MalformedRunId { .. }));
        assert!(!dir.path().join("outside").exists());
        Ok(())
    }

    #[test]
    fn publish_type_mismatch_names_the_requested_type() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let tracker = LocalTracker::open(dir.path(), TrackerSettings::default())?;
        tracker.publish_artifact("wandb", "showcase", "model-x", "bart_model", &[])?;
        let err = tracker
            .publish_artifact("wandb", "showcase", "model-x", "dataset", &[])
            .unwrap_err();
        match err {
            Error::ArtifactTypeMismatch { expected, got, .. } => {
                assert_eq!((expected.as_str(), got.as_str()), ("dataset", "bart_model"))
            }
            other => panic!("unexpected error {other:?}"),
        }
        Ok(())
    }
}
