//! Run and artifact resolution.
//!
//! Decides whether the job has anything to do: the run is resumed from the
//! id stored on disk and the artifact version is compared against the last
//! processed one.
use std::path::Path;

use crate::config::{StateConfig, TrackingConfig};
use crate::tracking::{Artifact, ArtifactPath, RunId, RunSpec, TrackedRun, Tracker};
use crate::Result;

#[derive(Debug)]
pub enum Resolution<R> {
    /// The artifact version was already processed, nothing to do.
    UpToDate { run: R, version: String },
    /// A new version; the marker file already records it.
    Proceed { run: R, artifact: Artifact },
}

/// Reads a marker file, a missing or blank file reads as `None`.
pub fn read_marker<P: AsRef<Path>>(path: P) -> Result<Option<String>> {
    match std::fs::read_to_string(path.as_ref()) {
        Ok(contents) => {
            let contents = contents.trim();
            Ok((!contents.is_empty()).then(|| contents.to_string()))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub fn write_marker<P: AsRef<Path>>(path: P, value: &str) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, value)?;
    Ok(())
}

pub fn resolve<T: Tracker>(
    tracker: &T,
    tracking: &TrackingConfig,
    state: &StateConfig,
) -> Result<Resolution<T::Run>> {
    let run_path = state.run_path();
    let previous = read_marker(&run_path)?
        .map(|id| RunId::parse(&id))
        .transpose()
        .map_err(|e| e.context(format!("reading {}", run_path.display())))?;
    let spec = RunSpec {
        entity: tracking.entity.clone(),
        project: tracking.project.clone(),
        job_type: tracking.job_type.clone(),
    };
    let mut run = tracker
        .init(&spec, previous.as_ref())
        .map_err(|e| e.context("opening tracking run"))?;
    if previous.as_ref() != Some(run.id()) {
        write_marker(&run_path, run.id().as_str())?;
    }
    tracing::info!(run = %run.id(), resumed = run.resumed(), "tracking run ready");

    let path: ArtifactPath = tracking.artifact.parse()?;
    let artifact = run
        .use_artifact(&path, &tracking.artifact_type)
        .map_err(|e| e.context(format!("resolving artifact {path}")))?;

    let version_path = state.version_path();
    let last = read_marker(&version_path)?;
    if last.as_deref() == Some(artifact.version.as_str()) {
        tracing::info!(version = %artifact.version, "no new model version");
        return Ok(Resolution::UpToDate {
            run,
            version: artifact.version,
        });
    }
    // Recorded before any heavy work so a crash does not retry the same version forever.
    write_marker(&version_path, &artifact.version)?;
    tracing::info!(
        version = %artifact.version,
        previous = last.as_deref().unwrap_or("none"),
        "new model version"
    );
    Ok(Resolution::Proceed { run, artifact })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::{LocalTracker, TrackerSettings};
    use crate::Error;

    #[test]
    fn markers() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("marker.txt");
        assert_eq!(read_marker(&path)?, None);
        write_marker(&path, "v3")?;
        assert_eq!(read_marker(&path)?.as_deref(), Some("v3"));
        std::fs::write(&path, "  v4\n")?;
        assert_eq!(read_marker(&path)?.as_deref(), Some("v4"));
        std::fs::write(&path, "\n")?;
        assert_eq!(read_marker(&path)?, None);
        Ok(())
    }

    #[test]
    fn first_run_then_up_to_date() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let tracker = LocalTracker::open(dir.path().join("store"), TrackerSettings::default())?;
        let tracking = TrackingConfig {
            artifact: "wandb/hf-flax-dalle-mini/model-1:latest".to_string(),
            ..Default::default()
        };
        let state = StateConfig {
            dir: dir.path().join("state"),
            ..Default::default()
        };
        tracker.publish_artifact("wandb", "hf-flax-dalle-mini", "model-1", "bart_model", &[])?;

        let first = resolve(&tracker, &tracking, &state)?;
        let Resolution::Proceed { run, artifact } = first else {
            panic!("expected a new version")
        };
        assert_eq!(artifact.version, "v0");
        assert_eq!(read_marker(state.version_path())?.as_deref(), Some("v0"));
        let run_id = read_marker(state.run_path())?;
        assert_eq!(run_id.as_deref(), Some(run.id().as_str()));
        run.finish()?;

        let second = resolve(&tracker, &tracking, &state)?;
        let Resolution::UpToDate { run, version } = second else {
            panic!("expected the version to be up to date")
        };
        assert!(run.resumed());
        assert_eq!(version, "v0");
        assert_eq!(read_marker(state.run_path())?, run_id);
        assert_eq!(read_marker(state.version_path())?.as_deref(), Some("v0"));
        Ok(())
    }

    #[test]
    fn rejects_tampered_run_marker() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let tracker = LocalTracker::open(dir.path().join("store"), TrackerSettings::default())?;
        let state = StateConfig {
            dir: dir.path().join("state"),
            ..Default::default()
        };
        write_marker(state.run_path(), "../../../../outside")?;
        let err = resolve(&tracker, &TrackingConfig::default(), &state).unwrap_err();
        match err {
            Error::Context { inner, .. } => {
                assert!(matches!(*inner, Error::MalformedRunId { .. }));
                assert!(!inner.is_transient());
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!dir.path().join("outside").exists());
        assert_eq!(read_marker(state.version_path())?, None);
        Ok(())
    }
}
