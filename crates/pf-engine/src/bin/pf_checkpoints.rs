use anyhow::Context;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pf_data::{CheckpointStore, SUMMARY_FILE};
use pf_engine::{RunConfig, RunReport, REPORT_FILE};
use pf_types::PosteriorSummary;

/// List the completed phases of a pipeline output directory.
///
/// Usage: `pf-checkpoints [PIPELINE_DIR]`. Without an argument the output
/// root (`PHASEFIT_OUTPUT_ROOT` or the platform data directory) is used.
fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pf_engine=info,pf_data=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let dir = match std::env::args_os().nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => RunConfig::from_env().output_root,
    };
    anyhow::ensure!(dir.is_dir(), "{} is not a directory", dir.display());

    let store = CheckpointStore::new(&dir)
        .with_context(|| format!("opening checkpoints in {}", dir.display()))?;
    let markers = store.completed().context("reading completion markers")?;
    tracing::debug!(dir = %dir.display(), completed = markers.len(), "scanned checkpoints");

    if markers.is_empty() {
        println!("no completed phases in {}", dir.display());
    }
    for marker in &markers {
        println!(
            "{:<32} evidence {:>14.4}  completed {}",
            marker.phase,
            marker.evidence,
            marker.completed_at.format("%Y-%m-%d %H:%M:%S")
        );
        let summary: Option<PosteriorSummary> = store
            .read_artifact(&marker.phase, SUMMARY_FILE)
            .with_context(|| format!("reading summary of {}", marker.phase))?;
        if let Some(summary) = summary {
            for param in &summary.parameters {
                println!(
                    "    {:<36} {:>12.5} +/- {:.5}",
                    param.path.to_string(),
                    param.best,
                    param.uncertainty
                );
            }
            if let Some(evidence) = summary.hyper_combined_evidence {
                println!("    hyper combined evidence {evidence:.4}");
            }
        }
    }

    let report_path = dir.join(REPORT_FILE);
    if report_path.is_file() {
        let bytes = std::fs::read(&report_path)?;
        let report: RunReport = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", report_path.display()))?;
        let status = if report.is_success() { "finished" } else { "incomplete" };
        println!(
            "last run of {} {status}: {} phase(s), {} optimizer attempt(s)",
            report.pipeline,
            report.phases.len(),
            report.total_attempts()
        );
        for record in report.phases.iter().filter(|r| r.error.is_some()) {
            println!(
                "    {} failed ({}): {}",
                record.phase,
                record.error_kind.map(|k| k.to_string()).unwrap_or_default(),
                record.error.as_deref().unwrap_or_default()
            );
        }
    }

    Ok(())
}
