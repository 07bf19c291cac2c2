//! Per-phase checkpoint storage.
//!
//! Layout under the pipeline output directory:
//!
//! ```text
//! <root>/<phase_name>/model.json     model the optimizer was given
//! <root>/<phase_name>/summary.json   posterior summary (best, uncertainty, evidence)
//! <root>/<phase_name>/result.json    full result, used to rebuild the collection on resume
//! <root>/<phase_name>/<artifact>     optional diagnostic data (e.g. grid.json)
//! <root>/<phase_name>/.complete      completion marker, written last
//! ```
//!
//! A phase directory without the marker is treated as never having run.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use pf_types::{CheckpointError, FitResult, Model, PfResult};

pub const MODEL_FILE: &str = "model.json";
pub const SUMMARY_FILE: &str = "summary.json";
pub const RESULT_FILE: &str = "result.json";
pub const COMPLETE_MARKER: &str = ".complete";

/// Contents of the completion marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMarker {
    pub phase: String,
    pub completed_at: DateTime<Utc>,
    pub evidence: f64,
}

/// A completed phase read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPhase {
    pub model: Model,
    pub result: FitResult,
    pub marker: CompletionMarker,
}

/// Filesystem checkpoint store rooted at one pipeline output directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(root: P) -> PfResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn phase_dir(&self, phase: &str) -> PathBuf {
        self.root.join(phase)
    }

    pub fn is_complete(&self, phase: &str) -> bool {
        self.phase_dir(phase).join(COMPLETE_MARKER).is_file()
    }

    /// Drop the completion marker so the phase reads as never run until the
    /// next [`CheckpointStore::save`].
    pub fn invalidate(&self, phase: &str) -> PfResult<()> {
        let marker = self.phase_dir(phase).join(COMPLETE_MARKER);
        if marker.is_file() {
            std::fs::remove_file(&marker)?;
            tracing::debug!(phase = %phase, "checkpoint invalidated");
        }
        Ok(())
    }

    /// Write an auxiliary file into the phase directory. Artifacts must be
    /// written before [`CheckpointStore::save`] so the marker stays last.
    pub fn write_artifact<T: Serialize>(&self, phase: &str, file: &str, value: &T) -> PfResult<()> {
        let dir = self.phase_dir(phase);
        std::fs::create_dir_all(&dir)?;
        write_json(&dir.join(file), value)
    }

    pub fn read_artifact<T: DeserializeOwned>(&self, phase: &str, file: &str) -> PfResult<Option<T>> {
        let path = self.phase_dir(phase).join(file);
        if !path.is_file() {
            return Ok(None);
        }
        read_json(phase, &path).map(Some)
    }

    /// Persist a completed phase and mark it complete.
    pub fn save(&self, phase: &str, model: &Model, result: &FitResult) -> PfResult<CompletionMarker> {
        let dir = self.phase_dir(phase);
        std::fs::create_dir_all(&dir)?;
        self.invalidate(phase)?;

        write_json(&dir.join(MODEL_FILE), model)?;
        write_json(&dir.join(SUMMARY_FILE), &result.summary())?;
        write_json(&dir.join(RESULT_FILE), result)?;

        let marker = CompletionMarker {
            phase: phase.to_string(),
            completed_at: Utc::now(),
            evidence: result.evidence,
        };
        write_json(&dir.join(COMPLETE_MARKER), &marker)?;

        tracing::debug!(phase = %phase, dir = %dir.display(), "checkpoint written");
        Ok(marker)
    }

    /// Load a completed phase; `Ok(None)` when it has no completion marker.
    pub fn load(&self, phase: &str) -> PfResult<Option<StoredPhase>> {
        if !self.is_complete(phase) {
            return Ok(None);
        }
        let dir = self.phase_dir(phase);
        let marker: CompletionMarker = read_json(phase, &dir.join(COMPLETE_MARKER))?;
        let model: Model = read_required(phase, &dir, MODEL_FILE)?;
        let result: FitResult = read_required(phase, &dir, RESULT_FILE)?;

        result.validate().map_err(|e| CheckpointError::Corrupt {
            phase: phase.to_string(),
            message: e.to_string(),
        })?;

        Ok(Some(StoredPhase {
            model,
            result,
            marker,
        }))
    }

    /// Markers of every completed phase, oldest first.
    pub fn completed(&self) -> PfResult<Vec<CompletionMarker>> {
        let mut markers = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let marker_path = entry.path().join(COMPLETE_MARKER);
            if marker_path.is_file() {
                let phase = entry.file_name().to_string_lossy().into_owned();
                markers.push(read_json::<CompletionMarker>(&phase, &marker_path)?);
            }
        }
        markers.sort_by(|a, b| a.completed_at.cmp(&b.completed_at).then(a.phase.cmp(&b.phase)));
        Ok(markers)
    }
}

fn read_required<T: DeserializeOwned>(phase: &str, dir: &Path, file: &str) -> PfResult<T> {
    let path = dir.join(file);
    if !path.is_file() {
        return Err(CheckpointError::MissingFile {
            phase: phase.to_string(),
            file: file.to_string(),
        }
        .into());
    }
    read_json(phase, &path)
}

fn read_json<T: DeserializeOwned>(phase: &str, path: &Path) -> PfResult<T> {
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| {
        CheckpointError::Corrupt {
            phase: phase.to_string(),
            message: format!("{}: {e}", path.display()),
        }
        .into()
    })
}

/// Write through a temporary file and rename so readers never see a
/// half-written file.
fn write_json<T: Serialize>(path: &Path, value: &T) -> PfResult<()> {
    let tmp = path.with_extension("tmp");
    let bytes = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pf_types::{PfError, Prior};
    use tempfile::TempDir;

    fn sample() -> (Model, FitResult) {
        let model = Model::builder()
            .component("lens", "sie")
            .param("einstein_radius", Prior::uniform(0.5, 2.0))
            .build()
            .unwrap();
        let constant = model.fixed_at(|_, _| 1.2);
        let variable = Model::builder()
            .component("lens", "sie")
            .param("einstein_radius", Prior::gaussian(1.2, 0.05))
            .build()
            .unwrap();
        (model, FitResult::new(constant, variable, -40.0))
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let (model, result) = sample();

        assert!(!store.is_complete("phase_1"));
        assert!(store.load("phase_1").unwrap().is_none());

        let marker = store.save("phase_1", &model, &result).unwrap();
        assert_eq!(marker.evidence, -40.0);
        assert!(store.is_complete("phase_1"));
        assert!(store.phase_dir("phase_1").join(SUMMARY_FILE).is_file());

        store.invalidate("phase_1").unwrap();
        assert!(store.load("phase_1").unwrap().is_none());
        store.save("phase_1", &model, &result).unwrap();

        let stored = store.load("phase_1").unwrap().unwrap();
        assert_eq!(stored.model, model);
        assert_eq!(stored.result, result);
        assert_eq!(stored.marker.phase, "phase_1");
    }

    #[test]
    fn floats_survive_the_round_trip_bit_for_bit() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let (model, mut result) = sample();
        // Not the shortest decimal for its neighbourhood; a lossy parser
        // reads back -3.7777777777777777.
        result.evidence = -3.7777777777777772;
        result.variable = Model::builder()
            .component("lens", "sie")
            .param("einstein_radius", Prior::gaussian(1.0 / 3.0, 0.1 + 0.2))
            .build()
            .unwrap();

        store.save("phase_1", &model, &result).unwrap();
        let stored = store.load("phase_1").unwrap().unwrap();
        assert_eq!(stored.result.evidence.to_bits(), result.evidence.to_bits());
        assert_eq!(stored.marker.evidence.to_bits(), result.evidence.to_bits());
        assert_eq!(stored.result, result);
    }

    #[test]
    fn directory_without_marker_is_incomplete() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let (_, result) = sample();
        store.write_artifact("phase_1", RESULT_FILE, &result).unwrap();

        assert!(!store.is_complete("phase_1"));
        assert!(store.load("phase_1").unwrap().is_none());
        assert!(store.completed().unwrap().is_empty());
    }

    #[test]
    fn missing_result_with_marker_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let (model, result) = sample();
        store.save("phase_1", &model, &result).unwrap();
        std::fs::remove_file(store.phase_dir("phase_1").join(RESULT_FILE)).unwrap();

        let err = store.load("phase_1").unwrap_err();
        assert!(matches!(
            err,
            PfError::Checkpoint(CheckpointError::MissingFile { .. })
        ));
    }

    #[test]
    fn garbage_result_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let (model, result) = sample();
        store.save("phase_1", &model, &result).unwrap();
        std::fs::write(store.phase_dir("phase_1").join(RESULT_FILE), b"{not json").unwrap();

        let err = store.load("phase_1").unwrap_err();
        assert!(matches!(err, PfError::Checkpoint(CheckpointError::Corrupt { .. })));
    }

    #[test]
    fn artifacts_and_completed_listing() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let (model, result) = sample();

        store
            .write_artifact("grid_phase", "grid.json", &vec![1.0, 2.0])
            .unwrap();
        store.save("grid_phase", &model, &result).unwrap();
        store.save("refine", &model, &result).unwrap();

        let grid: Option<Vec<f64>> = store.read_artifact("grid_phase", "grid.json").unwrap();
        assert_eq!(grid, Some(vec![1.0, 2.0]));
        let missing: Option<Vec<f64>> = store.read_artifact("refine", "grid.json").unwrap();
        assert!(missing.is_none());

        let names: Vec<String> = store.completed().unwrap().into_iter().map(|m| m.phase).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"grid_phase".to_string()));
        assert!(names.contains(&"refine".to_string()));
    }
}
