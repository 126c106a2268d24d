//! Chunked multi-source scan with an append-only checkpoint.
//!
//! One entity is the unit of atomicity: its merged row is appended to the
//! bulk output, then its key and the new output length are appended to the
//! checkpoint log. On restart the output is cut back to the last committed
//! length and checkpointed entities are skipped.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use tdir_core::{CanonicalRecord, EntityKey, SourceRecord};
use tdir_storage::{record_to_row, AppendSink, Checkpoint, CheckpointLog, ChunkedReader, DIRECTORY_COLUMNS};
use tracing::{debug, info};

use crate::config::ScanSource;
use crate::engine::{merge, MergePolicy};

/// Bounded-memory reduction to the latest candidate per key.
#[derive(Debug, Default)]
pub struct LatestCandidates {
    best: HashMap<EntityKey, SourceRecord>,
}

impl LatestCandidates {
    /// Keep `record` if it is strictly newer than the current candidate;
    /// on a tie the first one seen stays.
    pub fn offer(&mut self, record: SourceRecord) -> bool {
        match self.best.get(&record.key) {
            Some(current) if current.recency >= record.recency => false,
            _ => {
                self.best.insert(record.key.clone(), record);
                true
            }
        }
    }

    pub fn get(&self, key: &EntityKey) -> Option<&SourceRecord> {
        self.best.get(key)
    }

    pub fn take(&mut self, key: &EntityKey) -> Option<SourceRecord> {
        self.best.remove(key)
    }

    pub fn len(&self) -> usize {
        self.best.len()
    }

    pub fn is_empty(&self) -> bool {
        self.best.is_empty()
    }
}

/// Stream `source` and keep the latest row for every key in `wanted`.
///
/// Rows the adapter cannot place are dropped; an unreadable file is fatal.
pub fn collect_latest(
    source: &ScanSource,
    chunk_size: usize,
    wanted: &HashSet<EntityKey>,
) -> Result<LatestCandidates> {
    let source_id = source.adapter.source_id();
    let reader = ChunkedReader::open(&source.path, chunk_size)
        .with_context(|| format!("opening source {source_id}"))?;

    let mut candidates = LatestCandidates::default();
    let mut rows = 0usize;
    for chunk in reader {
        let chunk = chunk.with_context(|| format!("scanning source {source_id}"))?;
        rows += chunk.len();
        for row in &chunk {
            let Some((key, _)) = source.adapter.locate(row) else {
                continue;
            };
            if !wanted.contains(&key) {
                continue;
            }
            if let Some(record) = source.adapter.adapt(row) {
                candidates.offer(record);
            }
        }
        debug!(source_id, rows, candidates = candidates.len(), "chunk scanned");
    }
    Ok(candidates)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Entities scanned and committed by this run.
    pub scanned: usize,
    /// Of those, entities with at least one candidate.
    pub resolved: usize,
    /// Entities skipped because an earlier run already committed them.
    pub already_done: usize,
    /// Entities still pending when the run stopped early.
    pub remaining: usize,
}

pub struct ResumableScanner {
    sources: Vec<ScanSource>,
    chunk_size: usize,
    batch_size: usize,
    log: CheckpointLog,
    checkpoint: Checkpoint,
    sink: AppendSink,
}

impl ResumableScanner {
    pub fn open(
        sources: Vec<ScanSource>,
        chunk_size: usize,
        batch_size: usize,
        checkpoint_path: impl AsRef<Path>,
        output_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let (log, checkpoint) = CheckpointLog::open(checkpoint_path)?;
        let sink = AppendSink::open(output_path, &DIRECTORY_COLUMNS, checkpoint.committed_offset)?;
        if !checkpoint.is_empty() {
            info!(
                done = checkpoint.len(),
                committed_offset = checkpoint.committed_offset,
                "resuming scan"
            );
        }
        Ok(Self {
            sources,
            chunk_size: chunk_size.max(1),
            batch_size: batch_size.max(1),
            log,
            checkpoint,
            sink,
        })
    }

    /// Scan every pending target. Targets must be distinct, as
    /// `read_key_list` guarantees. `limit` stops the run after that many
    /// entities, leaving the rest for a later resume.
    pub fn run(&mut self, targets: &[EntityKey], limit: Option<usize>) -> Result<ScanReport> {
        let pending: Vec<&EntityKey> = targets
            .iter()
            .filter(|k| !self.checkpoint.contains(k))
            .collect();
        let mut report = ScanReport {
            already_done: targets.len() - pending.len(),
            ..ScanReport::default()
        };
        let budget = limit.unwrap_or(usize::MAX).min(pending.len());
        report.remaining = pending.len() - budget;
        info!(
            pending = pending.len(),
            budget,
            already_done = report.already_done,
            "scan starting"
        );

        for batch in pending[..budget].chunks(self.batch_size) {
            let wanted: HashSet<EntityKey> = batch.iter().map(|k| (*k).clone()).collect();
            let mut per_source = Vec::with_capacity(self.sources.len());
            for source in &self.sources {
                per_source.push(collect_latest(source, self.chunk_size, &wanted)?);
            }

            for key in batch {
                let mut candidates: Vec<SourceRecord> = per_source
                    .iter_mut()
                    .filter_map(|c| c.take(key))
                    .collect();
                // stable: equal recency keeps registry order
                candidates.sort_by_key(|c| c.recency);

                let mut record: Option<CanonicalRecord> = None;
                for candidate in &candidates {
                    record = Some(merge(record, candidate, MergePolicy::Refresh).0);
                }
                if record.is_some() {
                    report.resolved += 1;
                }
                let record = record.unwrap_or_else(|| CanonicalRecord::empty((*key).clone()));
                self.commit(&record)?;
                report.scanned += 1;
            }
            info!(scanned = report.scanned, resolved = report.resolved, "batch committed");
        }

        Ok(report)
    }

    fn commit(&mut self, record: &CanonicalRecord) -> Result<()> {
        let offset = self.sink.append(record_to_row(record))?;
        self.log.append(&record.key, offset)?;
        self.checkpoint.keys.insert(record.key.clone());
        self.checkpoint.committed_offset = offset;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tdir_adapters::{SourceAdapter, SourceSchema};
    use tdir_core::{canonicalize, FieldSet};
    use tempfile::tempdir;

    fn key(raw: &str) -> EntityKey {
        canonicalize(raw).unwrap()
    }

    fn record(name: &str, day: u32) -> SourceRecord {
        SourceRecord {
            source_id: "wb".to_string(),
            key: key("https://example.com/ai/x"),
            recency: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            fields: FieldSet {
                name: Some(name.to_string()),
                ..FieldSet::default()
            },
        }
    }

    #[test]
    fn latest_candidate_wins_and_first_seen_breaks_ties() {
        let mut candidates = LatestCandidates::default();
        assert!(candidates.offer(record("a", 2)));
        assert!(!candidates.offer(record("older", 1)));
        assert!(!candidates.offer(record("tie", 2)));
        assert!(candidates.offer(record("newest", 5)));
        let best = candidates.get(&key("https://example.com/ai/x")).unwrap();
        assert_eq!(best.fields.name.as_deref(), Some("newest"));
    }

    #[test]
    fn collect_latest_only_keeps_wanted_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wb.csv");
        std::fs::write(
            &path,
            "link,name\n\
             https://web.archive.org/web/20240101000000/https://example.com/ai/a,A1\n\
             https://web.archive.org/web/20240301000000/https://example.com/ai/a/,A3\n\
             https://web.archive.org/web/20240201000000/https://example.com/ai/a,A2\n\
             https://web.archive.org/web/20240201000000/https://example.com/ai/b,B\n\
             not-a-link,junk\n",
        )
        .unwrap();
        let source = ScanSource {
            adapter: SourceAdapter::new("wb", SourceSchema::Archive2025, None, "example.com").unwrap(),
            path,
        };
        let wanted = HashSet::from([key("https://example.com/ai/a")]);
        let candidates = collect_latest(&source, 2, &wanted).unwrap();
        assert_eq!(candidates.len(), 1);
        let best = candidates.get(&key("https://example.com/ai/a")).unwrap();
        assert_eq!(best.fields.name.as_deref(), Some("A3"));
    }
}
