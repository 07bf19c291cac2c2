// Run configuration passed explicitly to the pipeline

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use pf_optimizer::RetryPolicy;
use pf_types::{config_error, PfResult};

/// Environment variable that overrides the default output root.
pub const OUTPUT_ROOT_ENV: &str = "PHASEFIT_OUTPUT_ROOT";

/// Separator between the pipeline name and its tags in the output folder.
const TAG_SEPARATOR: &str = "__";

/// Configuration for one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Directory every pipeline writes under.
    pub output_root: PathBuf,
    /// Intermediate folders between the output root and the pipeline folder,
    /// usually naming the dataset.
    pub phase_folders: Vec<String>,
    /// Settings tags appended (sorted) to the pipeline folder name.
    pub tags: Vec<String>,
    /// Worker pool size for grid-search cells.
    pub max_workers: usize,
    /// Deadline for each optimizer call unless a phase sets its own.
    pub default_timeout_ms: Option<u64>,
    pub retry: RetryPolicy,
    /// Reuse completed phase checkpoints instead of re-running them.
    pub resume: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        let output_root = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("phasefit");

        Self {
            output_root,
            phase_folders: Vec::new(),
            tags: Vec::new(),
            max_workers: 4,
            default_timeout_ms: None,
            retry: RetryPolicy::default(),
            resume: true,
        }
    }
}

impl RunConfig {
    /// Defaults with the output root taken from `PHASEFIT_OUTPUT_ROOT` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(root) = std::env::var(OUTPUT_ROOT_ENV) {
            if !root.is_empty() {
                config.output_root = PathBuf::from(root);
            }
        }
        config
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> PfResult<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let config: Self = serde_json::from_slice(&bytes).map_err(|e| {
            config_error!("invalid run config {}: {e}", path.as_ref().display())
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_output_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.output_root = root.into();
        self
    }

    pub fn with_phase_folder(mut self, folder: impl Into<String>) -> Self {
        self.phase_folders.push(folder.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> PfResult<()> {
        if self.max_workers == 0 {
            return Err(config_error!("max_workers must be at least 1"));
        }
        if !(self.retry.relax_factor.is_finite() && self.retry.relax_factor > 0.0) {
            return Err(config_error!(
                "retry relax_factor must be positive, got {}",
                self.retry.relax_factor
            ));
        }
        for folder in &self.phase_folders {
            check_path_segment("phase folder", folder)?;
        }
        for tag in &self.tags {
            check_path_segment("tag", tag)?;
            if tag.contains(TAG_SEPARATOR) {
                return Err(config_error!("tag '{tag}' must not contain '{TAG_SEPARATOR}'"));
            }
        }
        Ok(())
    }

    /// Pipeline folder name: `name` followed by the sorted tags, e.g.
    /// `lens_sie__bin_up_2__pos_0.1`.
    pub fn tagged_name(&self, name: &str) -> String {
        let mut tags: Vec<&str> = self.tags.iter().map(String::as_str).collect();
        tags.sort_unstable();
        tags.dedup();
        std::iter::once(name)
            .chain(tags)
            .collect::<Vec<_>>()
            .join(TAG_SEPARATOR)
    }

    /// `output_root/phase_folders.../tagged_name`; phase directories live
    /// directly below it.
    pub fn pipeline_dir(&self, name: &str) -> PathBuf {
        let mut dir = self.output_root.clone();
        for folder in &self.phase_folders {
            dir.push(folder);
        }
        dir.push(self.tagged_name(name));
        dir
    }
}

/// Reject names that would escape or split a directory.
pub(crate) fn check_path_segment(what: &str, value: &str) -> PfResult<()> {
    if value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\'])
    {
        return Err(config_error!("{what} '{value}' is not a valid directory name"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pf_types::ErrorKind;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = RunConfig::default();
        assert!(config.output_root.ends_with("phasefit"));
        assert_eq!(config.max_workers, 4);
        assert!(config.resume);
        assert_eq!(config.retry.max_retries, 0);
        assert!(config.default_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tagged_name_sorts_tags() {
        let config = RunConfig::default()
            .with_tag("pos_0.1")
            .with_tag("bin_up_2")
            .with_tag("pos_0.1");
        assert_eq!(config.tagged_name("lens_sie"), "lens_sie__bin_up_2__pos_0.1");
        assert_eq!(RunConfig::default().tagged_name("lens_sie"), "lens_sie");
    }

    #[test]
    fn test_pipeline_dir_layout() {
        let config = RunConfig::default()
            .with_output_root("/tmp/out")
            .with_phase_folder("slacs1430")
            .with_phase_folder("f814w")
            .with_tag("sub_2");
        assert_eq!(
            config.pipeline_dir("lens_sie"),
            PathBuf::from("/tmp/out/slacs1430/f814w/lens_sie__sub_2")
        );
    }

    #[test]
    fn test_invalid_config() {
        let bad_workers = RunConfig::default().with_max_workers(0);
        assert_eq!(bad_workers.validate().unwrap_err().kind(), ErrorKind::Config);

        let bad_tag = RunConfig::default().with_tag("a__b");
        assert!(bad_tag.validate().is_err());

        let bad_folder = RunConfig::default().with_phase_folder("../up");
        assert!(bad_folder.validate().is_err());
    }

    #[test]
    fn test_from_json_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(
            &path,
            r#"{"output_root": "/data/fits", "max_workers": 8, "default_timeout_ms": 1500,
                "retry": {"max_retries": 2, "relax_factor": 0.5, "relax_keys": ["n_live_points"]}}"#,
        )
        .unwrap();

        let config = RunConfig::from_json_file(&path).unwrap();
        assert_eq!(config.output_root, PathBuf::from("/data/fits"));
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.default_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.retry.max_retries, 2);
        assert!(config.resume);
        assert!(config.tags.is_empty());

        std::fs::write(&path, "{\"max_workers\": \"many\"}").unwrap();
        assert_eq!(
            RunConfig::from_json_file(&path).unwrap_err().kind(),
            ErrorKind::Config
        );
    }
}
