//! Pass summaries and the per-run report with an output manifest.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tdir_storage::file_digest;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub pass: String,
    pub processed: usize,
    pub updated: usize,
    pub still_missing: usize,
}

impl PassSummary {
    pub fn new(pass: &str) -> Self {
        Self {
            pass: pass.to_string(),
            processed: 0,
            updated: 0,
            still_missing: 0,
        }
    }

    pub fn log(&self) {
        info!(
            pass = %self.pass,
            processed = self.processed,
            updated = self.updated,
            still_missing = self.still_missing,
            "pass complete"
        );
    }
}

impl fmt::Display for PassSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} complete: processed={} updated={} still_missing={}",
            self.pass, self.processed, self.updated, self.still_missing
        )
    }
}

/// A pass's summary plus the files it wrote.
#[derive(Debug, Clone)]
pub struct PassOutcome {
    pub summary: PassSummary,
    pub outputs: Vec<(String, PathBuf)>,
}

impl PassOutcome {
    pub fn new(summary: PassSummary) -> Self {
        Self {
            summary,
            outputs: Vec::new(),
        }
    }

    pub fn with_output(mut self, name: &str, path: &Path) -> Self {
        self.outputs.push((name.to_string(), path.to_path_buf()));
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestEntry {
    pub name: String,
    pub path: String,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summary: PassSummary,
    pub outputs: Vec<ManifestEntry>,
}

impl RunReport {
    pub fn from_outcome(started_at: DateTime<Utc>, outcome: &PassOutcome) -> Result<Self> {
        let mut outputs = Vec::with_capacity(outcome.outputs.len());
        for (name, path) in &outcome.outputs {
            if !path.exists() {
                warn!(name = %name, path = %path.display(), "output missing from manifest");
                continue;
            }
            let (bytes, sha256) = file_digest(path)?;
            outputs.push(ManifestEntry {
                name: name.clone(),
                path: path.display().to_string(),
                bytes,
                sha256,
            });
        }
        Ok(Self {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: Utc::now(),
            summary: outcome.summary.clone(),
            outputs,
        })
    }

    /// Write `<reports_root>/<run_id>/summary.json` and return its path.
    pub async fn write(&self, reports_root: &Path) -> Result<PathBuf> {
        let run_dir = reports_root.join(self.run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;
        let path = run_dir.join("summary.json");
        let bytes = serde_json::to_vec_pretty(self).context("serializing run report")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn report_lists_existing_outputs_with_digests() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("directory.csv");
        std::fs::write(&out, "hello world").unwrap();

        let mut summary = PassSummary::new("backfill");
        summary.processed = 3;
        let outcome = PassOutcome::new(summary)
            .with_output("directory", &out)
            .with_output("missing", &dir.path().join("never-written.csv"));

        let report = RunReport::from_outcome(Utc::now(), &outcome).unwrap();
        assert_eq!(report.outputs.len(), 1);
        assert_eq!(report.outputs[0].bytes, 11);
        assert_eq!(
            report.outputs[0].sha256,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );

        let path = report.write(&dir.path().join("reports")).await.unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["summary"]["pass"], "backfill");
        assert_eq!(json["summary"]["processed"], 3);
    }

    #[test]
    fn summary_line_names_every_count() {
        let summary = PassSummary {
            pass: "refresh".into(),
            processed: 10,
            updated: 4,
            still_missing: 2,
        };
        assert_eq!(
            summary.to_string(),
            "refresh complete: processed=10 updated=4 still_missing=2"
        );
    }
}
