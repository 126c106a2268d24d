//! Environment-driven run configuration and the YAML source registry.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use serde::Deserialize;
use tdir_adapters::{AdapterError, EraPolicy, SourceAdapter, SourceSchema};
use tdir_storage::{BackoffPolicy, HttpClientConfig, TokenBucketConfig};
use thiserror::Error;

use crate::engine::LifecycleRules;

pub const REGISTRY_FILE: &str = "sources.yaml";

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub site_host: String,
    pub entity_prefix: String,
    pub exit_markers: Vec<String>,
    pub user_agent: String,
    pub live_timeout: Duration,
    pub archive_timeout: Duration,
    pub index_timeout: Duration,
    pub live_workers: usize,
    pub archive_workers: usize,
    /// Refill interval of the archive lane's token bucket; unset means unthrottled.
    pub archive_refill: Option<Duration>,
    pub backoff: BackoffPolicy,
    pub chunk_size: usize,
    pub batch_size: usize,
    pub modern_era_year: i32,
    pub archive_index_url: String,
    pub archive_base_url: String,
    pub workspace_root: PathBuf,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl ReconcileConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup. Unparseable numbers fall
    /// back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };

        Self {
            site_host: text("TDIR_SITE_HOST", "theresanaiforthat.com").to_ascii_lowercase(),
            entity_prefix: text("TDIR_ENTITY_PREFIX", "/ai/"),
            exit_markers: text("TDIR_EXIT_MARKERS", "/task/,/s/")
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(ToString::to_string)
                .collect(),
            user_agent: text("TDIR_USER_AGENT", "DirectoryBot/FINAL"),
            live_timeout: Duration::from_secs(number("TDIR_LIVE_TIMEOUT_SECS", 20)),
            archive_timeout: Duration::from_secs(number("TDIR_ARCHIVE_TIMEOUT_SECS", 30)),
            index_timeout: Duration::from_secs(number("TDIR_INDEX_TIMEOUT_SECS", 30)),
            live_workers: number("TDIR_LIVE_WORKERS", 10).max(1) as usize,
            archive_workers: number("TDIR_ARCHIVE_WORKERS", 4).max(1) as usize,
            archive_refill: lookup("TDIR_ARCHIVE_REFILL_MS")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            backoff: BackoffPolicy {
                max_retries: number("TDIR_MAX_RETRIES", 3) as usize,
                base_delay: Duration::from_millis(number("TDIR_BACKOFF_BASE_MS", 1000)),
                max_delay: Duration::from_millis(number("TDIR_BACKOFF_MAX_MS", 8000)),
            },
            chunk_size: number("TDIR_CHUNK_SIZE", 200_000).max(1) as usize,
            batch_size: number("TDIR_BATCH_SIZE", 50_000).max(1) as usize,
            modern_era_year: lookup("TDIR_MODERN_ERA_YEAR")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(2025),
            archive_index_url: text(
                "TDIR_ARCHIVE_INDEX_URL",
                "https://web.archive.org/cdx/search/cdx",
            ),
            archive_base_url: text("TDIR_ARCHIVE_BASE_URL", "https://web.archive.org/web"),
            workspace_root: PathBuf::from(text("TDIR_WORKSPACE", ".")),
        }
    }

    pub fn lifecycle_rules(&self) -> LifecycleRules {
        LifecycleRules {
            site_host: self.site_host.clone(),
            entity_prefix: self.entity_prefix.clone(),
            exit_markers: self.exit_markers.clone(),
        }
    }

    pub fn era_policy(&self) -> EraPolicy {
        EraPolicy {
            modern_from_year: self.modern_era_year,
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join(REGISTRY_FILE)
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }

    pub fn live_http(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.live_timeout,
            user_agent: Some(self.user_agent.clone()),
            concurrency: self.live_workers,
            backoff: self.backoff,
            token_bucket: None,
        }
    }

    pub fn archive_http(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.archive_timeout.max(self.index_timeout),
            user_agent: Some(self.user_agent.clone()),
            concurrency: self.archive_workers,
            backoff: self.backoff,
            token_bucket: self.archive_refill.map(|refill_every| TokenBucketConfig {
                capacity: self.archive_workers as u32,
                refill_every,
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("source id `{0}` is declared twice")]
    DuplicateSource(String),
    #[error("no enabled source named `{0}`")]
    UnknownSource(String),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub path: PathBuf,
    pub schema: SourceSchema,
    #[serde(default)]
    pub pass_date: Option<NaiveDate>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// A registry entry bound to its adapter and resolved file path.
#[derive(Debug, Clone)]
pub struct ScanSource {
    pub adapter: SourceAdapter,
    pub path: PathBuf,
}

impl SourceConfig {
    pub fn to_adapter(&self, site_host: &str) -> Result<SourceAdapter, AdapterError> {
        SourceAdapter::new(
            self.source_id.clone(),
            self.schema,
            self.pass_date,
            site_host,
        )
    }

    pub fn to_scan_source(&self, root: &Path, site_host: &str) -> Result<ScanSource, AdapterError> {
        let path = if self.path.is_absolute() {
            self.path.clone()
        } else {
            root.join(&self.path)
        };
        Ok(ScanSource {
            adapter: self.to_adapter(site_host)?,
            path,
        })
    }
}

impl SourceRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text).map_err(|err| match err {
            RegistryError::Parse { source, .. } => RegistryError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn parse(text: &str) -> Result<Self, RegistryError> {
        let registry: Self = serde_yaml::from_str(text).map_err(|source| RegistryError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        let mut seen = HashSet::new();
        for source in &registry.sources {
            if !seen.insert(source.source_id.as_str()) {
                return Err(RegistryError::DuplicateSource(source.source_id.clone()));
            }
        }
        Ok(registry)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// Every enabled source in registry order, validated up front so a bad
    /// entry fails the run before any output is touched.
    pub fn scan_sources(&self, root: &Path, site_host: &str) -> Result<Vec<ScanSource>, RegistryError> {
        self.enabled()
            .map(|s| s.to_scan_source(root, site_host).map_err(RegistryError::from))
            .collect()
    }

    pub fn scan_source(
        &self,
        source_id: &str,
        root: &Path,
        site_host: &str,
    ) -> Result<ScanSource, RegistryError> {
        let config = self
            .enabled()
            .find(|s| s.source_id == source_id)
            .ok_or_else(|| RegistryError::UnknownSource(source_id.to_string()))?;
        Ok(config.to_scan_source(root, site_host)?)
    }
}
