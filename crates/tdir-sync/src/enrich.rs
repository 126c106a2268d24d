//! Gap-filling enrichment from live pages and archived snapshots.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use futures::stream::{self, StreamExt};
use serde_json::Value as JsonValue;
use tdir_adapters::{EraPolicy, PageExtractor};
use tdir_core::{parse_capture_date, CanonicalRecord, EntityKey, SourceRecord};
use tdir_storage::{FetchError, HttpFetcher};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ReconcileConfig;
use crate::engine::{Directory, MergePolicy};

pub const LIVE_PAGE_SOURCE: &str = "live-page";
pub const ARCHIVE_PAGE_SOURCE: &str = "archive-page";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    Live,
    Archive,
}

impl Pool {
    pub fn as_str(self) -> &'static str {
        match self {
            Pool::Live => "live",
            Pool::Archive => "archive",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRef {
    pub url: String,
    pub capture_date: NaiveDate,
}

/// Network seam for the enrichment pools.
#[async_trait]
pub trait PageClient: Send + Sync {
    async fn fetch_page(&self, url: &str, pool: Pool) -> Result<String, FetchError>;

    /// Most recent 200/HTML snapshot of `key`, or `None` when the archive
    /// has never captured it.
    async fn latest_snapshot(&self, key: &EntityKey) -> Result<Option<SnapshotRef>, FetchError>;
}

/// Latest capture timestamp in a CDX JSON response (`[["timestamp"],
/// ["2024..."], ...]`). An empty body or a header-only table means no capture.
pub fn parse_index_response(body: &str) -> Result<Option<String>, FetchError> {
    if body.trim().is_empty() {
        return Ok(None);
    }
    let decode = |reason: String| FetchError::Decode {
        url: "archive index".to_string(),
        reason,
    };
    let value: JsonValue = serde_json::from_str(body).map_err(|e| decode(e.to_string()))?;
    let rows = value
        .as_array()
        .ok_or_else(|| decode("expected a JSON array".to_string()))?;
    Ok(rows
        .iter()
        .skip(1)
        .filter_map(|row| row.get(0).and_then(JsonValue::as_str))
        .filter(|ts| ts.len() == 14 && ts.chars().all(|c| c.is_ascii_digit()))
        .max()
        .map(ToString::to_string))
}

pub struct HttpPageClient {
    live: HttpFetcher,
    archive: HttpFetcher,
    live_timeout: Duration,
    archive_timeout: Duration,
    index_timeout: Duration,
    index_url: String,
    base_url: String,
}

impl HttpPageClient {
    pub fn from_config(config: &ReconcileConfig) -> anyhow::Result<Self> {
        Ok(Self {
            live: HttpFetcher::new("live", config.live_http())?,
            archive: HttpFetcher::new("archive", config.archive_http())?,
            live_timeout: config.live_timeout,
            archive_timeout: config.archive_timeout,
            index_timeout: config.index_timeout,
            index_url: config.archive_index_url.clone(),
            base_url: config.archive_base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn index_query(&self, key: &EntityKey) -> Result<Url, FetchError> {
        Url::parse_with_params(
            &self.index_url,
            &[
                ("url", key.as_str()),
                ("output", "json"),
                ("filter", "statuscode:200"),
                ("filter", "mimetype:text/html"),
                ("fl", "timestamp"),
                ("limit", "-1"),
            ],
        )
        .map_err(|e| FetchError::Decode {
            url: self.index_url.clone(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl PageClient for HttpPageClient {
    async fn fetch_page(&self, url: &str, pool: Pool) -> Result<String, FetchError> {
        match pool {
            Pool::Live => self.live.get_text(url, self.live_timeout).await,
            Pool::Archive => self.archive.get_text(url, self.archive_timeout).await,
        }
    }

    async fn latest_snapshot(&self, key: &EntityKey) -> Result<Option<SnapshotRef>, FetchError> {
        let query = self.index_query(key)?;
        // one blocking call with its own timeout, no retries
        let body = self
            .archive
            .get_text_once(query.as_str(), self.index_timeout)
            .await?;
        let Some(timestamp) = parse_index_response(&body)? else {
            return Ok(None);
        };
        let capture_date = parse_capture_date(&timestamp).map_err(|e| FetchError::Decode {
            url: query.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(SnapshotRef {
            url: format!("{}/{timestamp}/{key}", self.base_url),
            capture_date,
        }))
    }
}

/// Entities lacking a name or a release date.
pub fn needs_enrichment(record: &CanonicalRecord) -> bool {
    !record.name.is_present() || !record.release_date.is_present()
}

/// Targets split into the live pool (not exited) and the archive pool.
pub fn select_targets(directory: &Directory) -> (Vec<EntityKey>, Vec<EntityKey>) {
    directory
        .records()
        .filter(|r| needs_enrichment(r))
        .map(|r| (r.key.clone(), r.exited))
        .fold((Vec::new(), Vec::new()), |(mut live, mut archive), (key, exited)| {
            if exited {
                archive.push(key);
            } else {
                live.push(key);
            }
            (live, archive)
        })
}

#[derive(Debug, Default)]
pub struct EnrichmentResults {
    pub live_attempted: usize,
    pub archive_attempted: usize,
    pub updates: BTreeMap<EntityKey, SourceRecord>,
}

impl EnrichmentResults {
    pub fn attempted(&self) -> usize {
        self.live_attempted + self.archive_attempted
    }
}

pub struct Enricher {
    client: Box<dyn PageClient>,
    extractor: Box<dyn PageExtractor>,
    era: EraPolicy,
    live_workers: usize,
    archive_workers: usize,
    today: NaiveDate,
}

impl Enricher {
    pub fn new(
        client: Box<dyn PageClient>,
        extractor: Box<dyn PageExtractor>,
        era: EraPolicy,
        live_workers: usize,
        archive_workers: usize,
        today: NaiveDate,
    ) -> Self {
        Self {
            client,
            extractor,
            era,
            live_workers: live_workers.max(1),
            archive_workers: archive_workers.max(1),
            today,
        }
    }

    /// Run both pools to completion. Nothing is applied here; callers apply
    /// the drained results in one step.
    pub async fn fetch_all(&self, live: Vec<EntityKey>, archive: Vec<EntityKey>) -> EnrichmentResults {
        let mut results = EnrichmentResults {
            live_attempted: live.len(),
            archive_attempted: archive.len(),
            ..EnrichmentResults::default()
        };
        info!(live = live.len(), archive = archive.len(), "enrichment pools starting");

        let live_pool = stream::iter(live)
            .map(|key| self.fetch_live(key))
            .buffer_unordered(self.live_workers)
            .collect::<Vec<_>>();
        let archive_pool = stream::iter(archive)
            .map(|key| self.fetch_archived(key))
            .buffer_unordered(self.archive_workers)
            .collect::<Vec<_>>();
        let (live_done, archive_done) = tokio::join!(live_pool, archive_pool);

        for record in live_done.into_iter().chain(archive_done).flatten() {
            results.updates.insert(record.key.clone(), record);
        }
        results
    }

    async fn fetch_live(&self, key: EntityKey) -> Option<SourceRecord> {
        let html = match self.client.fetch_page(key.as_str(), Pool::Live).await {
            Ok(html) => html,
            Err(err) => {
                debug!(key = %key, pool = Pool::Live.as_str(), error = %err, "no data");
                return None;
            }
        };
        self.extract(key, &html, None, self.today, LIVE_PAGE_SOURCE)
    }

    async fn fetch_archived(&self, key: EntityKey) -> Option<SourceRecord> {
        let snapshot = match self.client.latest_snapshot(&key).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                debug!(key = %key, "no archived snapshot");
                return None;
            }
            Err(err) => {
                warn!(key = %key, error = %err, "archive index lookup failed");
                return None;
            }
        };
        let html = match self.client.fetch_page(&snapshot.url, Pool::Archive).await {
            Ok(html) => html,
            Err(err) => {
                debug!(key = %key, pool = Pool::Archive.as_str(), error = %err, "no data");
                return None;
            }
        };
        let year = snapshot.capture_date.year();
        self.extract(key, &html, Some(year), snapshot.capture_date, ARCHIVE_PAGE_SOURCE)
    }

    fn extract(
        &self,
        key: EntityKey,
        html: &str,
        capture_year: Option<i32>,
        recency: NaiveDate,
        source_id: &str,
    ) -> Option<SourceRecord> {
        let page = self.extractor.extract(html, self.era.era_for(capture_year));
        if page.is_empty() {
            return None;
        }
        Some(SourceRecord {
            source_id: source_id.to_string(),
            key,
            recency,
            fields: page.into_fields(),
        })
    }
}

/// Apply drained results with the gap-filling policy; returns how many
/// entities changed.
pub fn apply_results(directory: &mut Directory, results: &EnrichmentResults) -> usize {
    let mut changed = 0;
    for record in results.updates.values() {
        // enrichment never introduces new entities
        if !directory.contains(&record.key) {
            continue;
        }
        if directory.apply(record, MergePolicy::FillGaps).changed() {
            changed += 1;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use tdir_adapters::TemplateExtractor;
    use tdir_core::{canonicalize, Field};

    fn key(raw: &str) -> EntityKey {
        canonicalize(raw).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[derive(Default)]
    struct FakeClient {
        pages: HashMap<String, String>,
        snapshots: HashMap<EntityKey, SnapshotRef>,
    }

    #[async_trait]
    impl PageClient for FakeClient {
        async fn fetch_page(&self, url: &str, _pool: Pool) -> Result<String, FetchError> {
            self.pages.get(url).cloned().ok_or(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })
        }

        async fn latest_snapshot(&self, key: &EntityKey) -> Result<Option<SnapshotRef>, FetchError> {
            Ok(self.snapshots.get(key).cloned())
        }
    }

    const MODERN_PAGE: &str = r#"<h1 class="title_inner">Live Tool v3</h1>
        <div class="version"><span class="changelog_title">May 2, 2025</span></div>"#;
    const LEGACY_PAGE: &str = r#"<h1 class="title_inner">Gone Tool</h1>
        <div class="version"><span class="changelog_title">May 2, 2025</span></div>
        <span class="launch_date_top">2021-04-09</span>"#;

    fn directory() -> Directory {
        let live = CanonicalRecord::empty(key("https://example.com/ai/live"));
        let mut gone = CanonicalRecord::empty(key("https://example.com/ai/gone"));
        gone.exited = true;
        let mut complete = CanonicalRecord::empty(key("https://example.com/ai/done"));
        complete.name = Field::with_value_and_provenance("Done".to_string(), None);
        complete.release_date = Field::with_value_and_provenance(date(2020, 1, 1), None);
        let unknown = CanonicalRecord::empty(key("https://example.com/ai/unknown"));
        Directory::from_records([live, gone, complete, unknown]).unwrap()
    }

    fn enricher(client: FakeClient) -> Enricher {
        Enricher::new(
            Box::new(client),
            Box::new(TemplateExtractor::new().unwrap()),
            EraPolicy::default(),
            3,
            2,
            date(2026, 10, 16),
        )
    }

    #[test]
    fn targets_split_by_exited_flag() {
        let (live, archive) = select_targets(&directory());
        assert_eq!(
            live,
            vec![key("https://example.com/ai/live"), key("https://example.com/ai/unknown")]
        );
        assert_eq!(archive, vec![key("https://example.com/ai/gone")]);
    }

    #[test]
    fn index_responses_pick_the_latest_capture() {
        assert_eq!(parse_index_response("").unwrap(), None);
        assert_eq!(parse_index_response("[]").unwrap(), None);
        assert_eq!(parse_index_response(r#"[["timestamp"]]"#).unwrap(), None);
        assert_eq!(
            parse_index_response(r#"[["timestamp"],["20230101000000"],["20240505120000"]]"#)
                .unwrap()
                .as_deref(),
            Some("20240505120000")
        );
        assert!(parse_index_response("<html>").is_err());
    }

    #[tokio::test]
    async fn pools_fill_gaps_with_era_specific_dates() {
        let gone = key("https://example.com/ai/gone");
        let snapshot_url =
            "https://web.archive.org/web/20240610000000/https://example.com/ai/gone".to_string();
        let client = FakeClient {
            pages: HashMap::from([
                ("https://example.com/ai/live".to_string(), MODERN_PAGE.to_string()),
                (snapshot_url.clone(), LEGACY_PAGE.to_string()),
            ]),
            snapshots: HashMap::from([(
                gone.clone(),
                SnapshotRef {
                    url: snapshot_url,
                    capture_date: date(2024, 6, 10),
                },
            )]),
        };

        let mut directory = directory();
        let (live, archive) = select_targets(&directory);
        let results = enricher(client).fetch_all(live, archive).await;
        assert_eq!(results.attempted(), 3);
        assert_eq!(results.updates.len(), 2, "unknown page fetch fails");

        let changed = apply_results(&mut directory, &results);
        assert_eq!(changed, 2);

        let live = directory.get(&key("https://example.com/ai/live")).unwrap();
        assert_eq!(live.name.get().map(String::as_str), Some("Live Tool"));
        assert_eq!(live.release_date.get(), Some(&date(2025, 5, 2)));
        assert_eq!(live.last_date, Some(date(2026, 10, 16)));

        let gone = directory.get(&gone).unwrap();
        assert_eq!(gone.name.get().map(String::as_str), Some("Gone Tool"));
        assert_eq!(gone.release_date.get(), Some(&date(2021, 4, 9)), "legacy marker");
        assert_eq!(gone.last_date, Some(date(2024, 6, 10)));
        assert!(gone.exited);

        let unknown = directory.get(&key("https://example.com/ai/unknown")).unwrap();
        assert!(!unknown.is_resolved());
    }

    #[tokio::test]
    async fn archive_entities_without_snapshots_are_not_fetched() {
        let client = FakeClient::default();
        let enricher = enricher(client);
        let results = enricher
            .fetch_all(Vec::new(), vec![key("https://example.com/ai/gone")])
            .await;
        assert!(results.updates.is_empty());
    }
}
