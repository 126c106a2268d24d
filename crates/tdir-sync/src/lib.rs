//! Reconciliation passes over the tool directory: merge engine, resumable
//! scanner, enrichment pools and run reports.

pub mod config;
pub mod engine;
pub mod enrich;
pub mod passes;
pub mod report;
pub mod scanner;

use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};

pub use config::{ReconcileConfig, RegistryError, ScanSource, SourceConfig, SourceRegistry};
pub use engine::{
    merge, merge_into, Directory, LifecycleRules, MergeOutcome, MergePolicy, RedirectClass,
};
pub use enrich::{Enricher, HttpPageClient, PageClient, Pool, SnapshotRef};
pub use report::{PassOutcome, PassSummary, RunReport};
pub use scanner::{collect_latest, LatestCandidates, ResumableScanner, ScanReport};

pub const CRATE_NAME: &str = "tdir-sync";

/// Log the pass summary and write its run report under the workspace's
/// `reports/` directory.
pub async fn finish_pass(
    config: &ReconcileConfig,
    started_at: DateTime<Utc>,
    outcome: &PassOutcome,
) -> Result<PathBuf> {
    outcome.summary.log();
    let report = RunReport::from_outcome(started_at, outcome)?;
    report.write(&config.reports_dir()).await
}
