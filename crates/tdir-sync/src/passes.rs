//! One function per reconciliation pass. Each loads what it needs, does
//! all fallible work, and only then rewrites its outputs.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use tdir_core::{canonicalize, unwrap_archive_link, EntityKey, Lifecycle};
use tdir_storage::directory::parse_flag;
use tdir_storage::{
    load_directory, read_key_list, write_atomic, write_directory, write_key_list, ChunkedReader,
};
use tracing::{info, warn};

use crate::config::ScanSource;
use crate::engine::{Directory, LifecycleRules, MergePolicy, RedirectClass};
use crate::enrich::{apply_results, needs_enrichment, select_targets, Enricher};
use crate::report::{PassOutcome, PassSummary};
use crate::scanner::{collect_latest, LatestCandidates, ResumableScanner};

pub const URL_COLUMN: &str = "url";
pub const TOOL_ID_COLUMN: &str = "tool_id";

/// Pull entity URLs out of a panel column, unwrapping archive links and
/// keeping only keys on `site_host`, in first-seen order.
pub fn extract_urls(
    input: &Path,
    column: &str,
    output: &Path,
    site_host: &str,
    chunk_size: usize,
) -> Result<PassOutcome> {
    let reader = ChunkedReader::open(input, chunk_size)?;
    if !reader.header().contains(column) {
        anyhow::bail!("{} has no `{column}` column", input.display());
    }

    let mut summary = PassSummary::new("extract-urls");
    let mut seen = HashSet::new();
    let mut keys: Vec<EntityKey> = Vec::new();
    for chunk in reader {
        for row in chunk? {
            let Some(raw) = row.get(column) else {
                continue;
            };
            summary.processed += 1;
            let original = unwrap_archive_link(raw).map_or(raw, |(_, original)| original);
            let Some(key) = canonicalize(original) else {
                continue;
            };
            if key.host() != site_host {
                continue;
            }
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }
    }
    summary.updated = keys.len();
    write_key_list(output, URL_COLUMN, &keys)?;
    Ok(PassOutcome::new(summary).with_output("urls", output))
}

pub struct BuildPaths<'a> {
    pub targets: &'a Path,
    pub checkpoint: &'a Path,
    pub output: &'a Path,
    pub missing: &'a Path,
    /// Also rewrite this directory file from the finished bulk output.
    pub directory: Option<&'a Path>,
}

/// Resumable multi-source build of the bulk output.
pub fn build(
    sources: Vec<ScanSource>,
    chunk_size: usize,
    batch_size: usize,
    paths: &BuildPaths<'_>,
    limit: Option<usize>,
) -> Result<PassOutcome> {
    let targets = read_key_list(paths.targets, URL_COLUMN)?;
    let mut scanner =
        ResumableScanner::open(sources, chunk_size, batch_size, paths.checkpoint, paths.output)?;
    let report = scanner.run(&targets, limit)?;

    let mut summary = PassSummary::new("build");
    summary.processed = report.scanned;
    summary.updated = report.resolved;
    let mut outcome_outputs = vec![("bulk", paths.output)];

    if report.remaining > 0 {
        // partial output is never materialized as if complete
        warn!(remaining = report.remaining, "scan stopped early; rerun to resume");
        summary.still_missing = report.remaining;
    } else {
        let records = load_directory(paths.output)
            .with_context(|| format!("re-reading bulk output {}", paths.output.display()))?;
        let missing: Vec<EntityKey> = records
            .iter()
            .filter(|r| !r.is_resolved())
            .map(|r| r.key.clone())
            .collect();
        summary.still_missing = missing.len();
        write_key_list(paths.missing, URL_COLUMN, &missing)?;
        outcome_outputs.push(("missing", paths.missing));
        if let Some(directory) = paths.directory {
            write_directory(directory, &records)?;
            outcome_outputs.push(("directory", directory));
        }
    }

    Ok(outcome_outputs
        .into_iter()
        .fold(PassOutcome::new(summary), |outcome, (name, path)| {
            outcome.with_output(name, path)
        }))
}

/// Fill still-missing entities from one archive source, latest snapshot
/// first. Entities that are already resolved are left alone.
pub fn backfill(
    directory_path: &Path,
    missing_path: &Path,
    source: &ScanSource,
    chunk_size: usize,
    still_missing_path: &Path,
) -> Result<PassOutcome> {
    let mut directory = Directory::load(directory_path)?;
    let missing = read_key_list(missing_path, URL_COLUMN)?;
    let wanted: HashSet<EntityKey> = missing.iter().cloned().collect();
    let mut candidates = collect_latest(source, chunk_size, &wanted)?;

    let mut summary = PassSummary::new("backfill");
    let mut still_missing = Vec::new();
    for key in &missing {
        summary.processed += 1;
        directory.ensure(key);
        if let Some(candidate) = candidates.take(key) {
            if directory.apply(&candidate, MergePolicy::Backfill).changed() {
                summary.updated += 1;
            }
        }
        if directory.get(key).is_some_and(|r| !r.is_resolved()) {
            still_missing.push(key.clone());
        }
    }
    summary.still_missing = still_missing.len();

    directory.save(directory_path)?;
    write_key_list(still_missing_path, URL_COLUMN, &still_missing)?;
    Ok(PassOutcome::new(summary)
        .with_output("directory", directory_path)
        .with_output("still_missing", still_missing_path))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LivenessRow {
    key: EntityKey,
    alive: bool,
}

fn read_liveness(path: &Path, chunk_size: usize) -> Result<Vec<LivenessRow>> {
    let reader = ChunkedReader::open(path, chunk_size)?;
    if !reader.header().contains("link") {
        anyhow::bail!("{} has no `link` column", path.display());
    }
    let mut rows = Vec::new();
    for chunk in reader {
        for row in chunk? {
            let Some(key) = row.get("link").and_then(canonicalize) else {
                continue;
            };
            rows.push(LivenessRow {
                key,
                alive: row.get("name").is_some(),
            });
        }
    }
    Ok(rows)
}

/// Apply a liveness check: blank names exit, live entities refresh from the
/// fresher live export, falling back to their latest archive snapshot.
pub fn refresh(
    directory_path: &Path,
    liveness_path: &Path,
    live: Option<&ScanSource>,
    archive: Option<&ScanSource>,
    chunk_size: usize,
) -> Result<PassOutcome> {
    let mut directory = Directory::load(directory_path)?;
    let liveness = read_liveness(liveness_path, chunk_size)?;

    let mut summary = PassSummary::new("refresh");
    let mut alive = Vec::new();
    for row in &liveness {
        if !directory.contains(&row.key) {
            continue;
        }
        summary.processed += 1;
        if row.alive {
            alive.push(row.key.clone());
        } else if directory.mark_exited(&row.key) {
            summary.updated += 1;
        }
    }

    let wanted: HashSet<EntityKey> = alive.iter().cloned().collect();
    let collect = |source: Option<&ScanSource>| -> Result<LatestCandidates> {
        match source {
            Some(source) => collect_latest(source, chunk_size, &wanted),
            None => Ok(LatestCandidates::default()),
        }
    };
    let mut live_candidates = collect(live)?;
    let mut archive_candidates = collect(archive)?;

    for key in &alive {
        let candidate = live_candidates
            .take(key)
            .or_else(|| archive_candidates.take(key));
        match candidate {
            Some(candidate) => {
                if directory.apply(&candidate, MergePolicy::Refresh).changed() {
                    summary.updated += 1;
                }
            }
            None => summary.still_missing += 1,
        }
    }

    directory.save(directory_path)?;
    Ok(PassOutcome::new(summary).with_output("directory", directory_path))
}

/// Apply a redirect status file (`url`, `is_redirected`, `redirected_to`).
pub fn redirects(
    directory_path: &Path,
    status_path: &Path,
    rules: &LifecycleRules,
    chunk_size: usize,
) -> Result<PassOutcome> {
    let mut directory = Directory::load(directory_path)?;
    let mut summary = PassSummary::new("redirects");
    let (mut renames, mut exits) = (0usize, 0usize);

    for chunk in ChunkedReader::open(status_path, chunk_size)? {
        for row in chunk? {
            if !parse_flag(row.get("is_redirected")) {
                continue;
            }
            let (Some(source), Some(target)) = (
                row.get(URL_COLUMN).and_then(canonicalize),
                row.get("redirected_to"),
            ) else {
                continue;
            };
            summary.processed += 1;
            match directory.apply_redirect(&source, target, rules) {
                RedirectClass::Rename(_) => renames += 1,
                RedirectClass::Exit if directory.contains(&source) => exits += 1,
                _ => {}
            }
        }
    }
    summary.updated = renames + exits;
    info!(renames, exits, "redirects classified");

    directory.save(directory_path)?;
    Ok(PassOutcome::new(summary).with_output("directory", directory_path))
}

/// Run both enrichment pools to completion, then gap-fill the directory.
pub async fn enrich(directory_path: &Path, enricher: &Enricher) -> Result<PassOutcome> {
    let mut directory = Directory::load(directory_path)?;
    let (live, archive) = select_targets(&directory);
    let results = enricher.fetch_all(live, archive).await;

    let mut summary = PassSummary::new("enrich");
    summary.processed = results.attempted();
    summary.updated = apply_results(&mut directory, &results);
    summary.still_missing = directory.records().filter(|r| needs_enrichment(r)).count();

    directory.save(directory_path)?;
    Ok(PassOutcome::new(summary).with_output("directory", directory_path))
}

/// Export keys of exited entities and of entities renamed to another key.
pub fn inactive(directory_path: &Path, output: &Path) -> Result<PassOutcome> {
    let directory = Directory::load(directory_path)?;
    let keys: Vec<&EntityKey> = directory
        .records()
        .filter(|r| r.is_inactive())
        .map(|r| &r.key)
        .collect();

    let (mut unknown, mut found, mut exited, mut renamed) = (0usize, 0usize, 0usize, 0usize);
    for record in directory.records() {
        match record.lifecycle() {
            Lifecycle::Unknown => unknown += 1,
            Lifecycle::Found => found += 1,
            Lifecycle::Exited => exited += 1,
            Lifecycle::Renamed => renamed += 1,
        }
    }
    info!(unknown, found, exited, renamed, "lifecycle states");

    let mut summary = PassSummary::new("inactive");
    summary.processed = directory.len();
    summary.updated = keys.len();
    write_key_list(output, TOOL_ID_COLUMN, keys)?;
    Ok(PassOutcome::new(summary).with_output("inactive", output))
}

pub const LISTING_COLUMNS: [&str; 3] = ["year", "tool_name", "tool_url"];

/// Append directory entities named in `reference` (a `tool_id` list) to a
/// year/name/url listing, starting from the rows of `base` when given. Keys
/// already listed are not added twice.
pub fn export_listing(
    directory_path: &Path,
    reference_path: &Path,
    base: Option<&Path>,
    output: &Path,
    chunk_size: usize,
) -> Result<PassOutcome> {
    let directory = Directory::load(directory_path)?;
    let reference = read_key_list(reference_path, TOOL_ID_COLUMN)?;

    let mut rows: Vec<[String; 3]> = Vec::new();
    let mut listed = HashSet::new();
    if let Some(base) = base {
        let reader = ChunkedReader::open(base, chunk_size)?;
        if let Some(column) = LISTING_COLUMNS
            .iter()
            .copied()
            .find(|column| !reader.header().contains(column))
        {
            anyhow::bail!("{} has no `{column}` column", base.display());
        }
        for chunk in reader {
            for row in chunk? {
                let cell = |column: &str| row.get(column).unwrap_or_default().to_string();
                if let Some(key) = row.get("tool_url").and_then(canonicalize) {
                    listed.insert(key);
                }
                rows.push([cell("year"), cell("tool_name"), cell("tool_url")]);
            }
        }
    }

    let mut summary = PassSummary::new("export-listing");
    for key in &reference {
        summary.processed += 1;
        let Some(record) = directory.get(key) else {
            summary.still_missing += 1;
            continue;
        };
        if !listed.insert(key.clone()) {
            continue;
        }
        rows.push([
            record
                .release_date
                .get()
                .map(|d| d.year().to_string())
                .unwrap_or_default(),
            record.name.get().cloned().unwrap_or_default(),
            key.to_string(),
        ]);
        summary.updated += 1;
    }

    write_atomic(output, &LISTING_COLUMNS, &rows)?;
    Ok(PassOutcome::new(summary).with_output("listing", output))
}

/// Today's date for live observations.
pub fn today() -> NaiveDate {
    chrono::Utc::now().date_naive()
}
