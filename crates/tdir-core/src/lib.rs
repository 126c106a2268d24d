//! Core domain model for the tool directory: entity keys, archive links,
//! provenance-bearing fields and canonical records.

use std::fmt;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "tdir-core";

static ARCHIVE_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://web\.archive\.org/web/(\d{14})/(https?://.+)$")
        .expect("archive link pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("not an absolute http(s) url: {0}")]
    Unparseable(String),
    #[error("not an archive link: {0}")]
    NotArchiveLink(String),
    #[error("invalid capture timestamp {0}")]
    InvalidCaptureDate(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("duplicate entity key {key} in {context}")]
    DuplicateKey { key: EntityKey, context: String },
}

/// Canonical URL identifying one entity across every source and every year.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(String);

impl EntityKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn authority(&self) -> &str {
        let rest = self.rest();
        rest.split('/').next().unwrap_or(rest)
    }

    /// Host without any port suffix.
    pub fn host(&self) -> &str {
        let authority = self.authority();
        authority.split(':').next().unwrap_or(authority)
    }

    /// Path component; empty for the site root.
    pub fn path(&self) -> &str {
        let rest = self.rest();
        rest.find('/').map(|idx| &rest[idx..]).unwrap_or("")
    }

    fn rest(&self) -> &str {
        self.0.strip_prefix("https://").unwrap_or(&self.0)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EntityKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Normalize a raw entity URL into its canonical key.
///
/// The key is `https://` + lower-cased host + lower-cased path with every
/// trailing slash removed. Query strings and fragments are dropped. Returns
/// `None` for anything that is not an absolute http(s) URL with a host.
pub fn canonicalize(raw: &str) -> Option<EntityKey> {
    let lowered = raw.trim().to_lowercase();
    if lowered.is_empty() {
        return None;
    }
    let url = Url::parse(&lowered).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let host = url.host_str().filter(|h| !h.is_empty())?;
    // keys are always https, where 443 is the default port
    let authority = match url.port().filter(|port| *port != 443) {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let path = url.path().trim_end_matches('/');
    // url re-encodes some characters with upper-case hex; lower-case the
    // result so a second pass is a no-op.
    Some(EntityKey(format!("https://{authority}{path}").to_lowercase()))
}

/// Parsed archive-wrapped link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveLink {
    pub original: EntityKey,
    pub timestamp: String,
    pub capture_date: NaiveDate,
}

/// Split an archive URL into its 14-digit timestamp and the wrapped original
/// URL, without validating either.
pub fn unwrap_archive_link(url: &str) -> Option<(&str, &str)> {
    let caps = ARCHIVE_LINK_RE.captures(url.trim())?;
    let stamp = caps.get(1)?.as_str();
    let original = caps.get(2)?.as_str();
    Some((stamp, original))
}

/// Extract the canonical original key and capture date from an archive link.
///
/// An impossible calendar date in the timestamp fails the whole parse.
pub fn parse_archive_link(url: &str) -> Result<ArchiveLink, KeyError> {
    let (stamp, original) =
        unwrap_archive_link(url).ok_or_else(|| KeyError::NotArchiveLink(url.to_string()))?;
    let capture_date = parse_capture_date(stamp)?;
    let original =
        canonicalize(original).ok_or_else(|| KeyError::Unparseable(original.to_string()))?;
    Ok(ArchiveLink {
        original,
        timestamp: stamp.to_string(),
        capture_date,
    })
}

/// Parse the `YYYYMMDD` prefix of an archive timestamp.
pub fn parse_capture_date(stamp: &str) -> Result<NaiveDate, KeyError> {
    stamp
        .get(..8)
        .filter(|digits| digits.chars().all(|c| c.is_ascii_digit()))
        .and_then(|digits| NaiveDate::parse_from_str(digits, "%Y%m%d").ok())
        .ok_or_else(|| KeyError::InvalidCaptureDate(stamp.to_string()))
}

/// Where a canonical field value came from and as of when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_id: String,
    pub as_of: NaiveDate,
}

/// Canonical field wrapper with optional value + provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field<T> {
    pub value: Option<T>,
    pub provenance: Option<Provenance>,
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Field<T> {
    pub fn empty() -> Self {
        Self {
            value: None,
            provenance: None,
        }
    }

    pub fn with_value_and_provenance(value: T, provenance: Option<Provenance>) -> Self {
        Self {
            value: Some(value),
            provenance,
        }
    }

    pub fn is_present(&self) -> bool {
        self.value.is_some()
    }

    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }
}

/// The common field set every source adapter maps into.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldSet {
    pub name: Option<String>,
    pub description: Option<String>,
    pub pricing_text: Option<String>,
    pub release_date: Option<NaiveDate>,
    pub rating: Option<f64>,
    pub ratings_count: Option<u64>,
    pub saves: Option<u64>,
    pub views: Option<u64>,
    pub comments: Option<String>,
    pub comments_count: Option<u64>,
    pub input_modalities: Option<String>,
    pub output_modalities: Option<String>,
    pub tasks: Option<String>,
}

impl FieldSet {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One raw row from one source, already mapped to the common field set.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub source_id: String,
    pub key: EntityKey,
    /// Date the row is considered "as of": the pass date of a live export or
    /// the capture date of an archived snapshot.
    pub recency: NaiveDate,
    pub fields: FieldSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    Unknown,
    Found,
    Exited,
    Renamed,
}

/// The current-best row for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub key: EntityKey,
    pub name: Field<String>,
    pub description: Field<String>,
    pub pricing_text: Field<String>,
    pub release_date: Field<NaiveDate>,
    pub rating: Field<f64>,
    pub ratings_count: Field<u64>,
    pub saves: Field<u64>,
    pub views: Field<u64>,
    pub comments: Field<String>,
    pub comments_count: Field<u64>,
    pub input_modalities: Field<String>,
    pub output_modalities: Field<String>,
    pub tasks: Field<String>,
    /// Latest observation date backing the record. Never moves backward.
    pub last_date: Option<NaiveDate>,
    /// Exited entities may still get name/description backfilled from the
    /// archive; field presence does not imply the entity is live.
    pub exited: bool,
    pub name_changed: bool,
    pub new_name: Option<EntityKey>,
}

impl CanonicalRecord {
    pub fn empty(key: EntityKey) -> Self {
        Self {
            key,
            name: Field::empty(),
            description: Field::empty(),
            pricing_text: Field::empty(),
            release_date: Field::empty(),
            rating: Field::empty(),
            ratings_count: Field::empty(),
            saves: Field::empty(),
            views: Field::empty(),
            comments: Field::empty(),
            comments_count: Field::empty(),
            input_modalities: Field::empty(),
            output_modalities: Field::empty(),
            tasks: Field::empty(),
            last_date: None,
            exited: false,
            name_changed: false,
            new_name: None,
        }
    }

    /// Build a record from stored values; every present field is attributed
    /// to `provenance`.
    pub fn from_values(key: EntityKey, values: FieldSet, provenance: Option<Provenance>) -> Self {
        fn wrap<T>(value: Option<T>, provenance: &Option<Provenance>) -> Field<T> {
            match value {
                Some(v) => Field::with_value_and_provenance(v, provenance.clone()),
                None => Field::empty(),
            }
        }

        Self {
            name: wrap(values.name, &provenance),
            description: wrap(values.description, &provenance),
            pricing_text: wrap(values.pricing_text, &provenance),
            release_date: wrap(values.release_date, &provenance),
            rating: wrap(values.rating, &provenance),
            ratings_count: wrap(values.ratings_count, &provenance),
            saves: wrap(values.saves, &provenance),
            views: wrap(values.views, &provenance),
            comments: wrap(values.comments, &provenance),
            comments_count: wrap(values.comments_count, &provenance),
            input_modalities: wrap(values.input_modalities, &provenance),
            output_modalities: wrap(values.output_modalities, &provenance),
            tasks: wrap(values.tasks, &provenance),
            ..Self::empty(key)
        }
    }

    pub fn values(&self) -> FieldSet {
        FieldSet {
            name: self.name.value.clone(),
            description: self.description.value.clone(),
            pricing_text: self.pricing_text.value.clone(),
            release_date: self.release_date.value,
            rating: self.rating.value,
            ratings_count: self.ratings_count.value,
            saves: self.saves.value,
            views: self.views.value,
            comments: self.comments.value.clone(),
            comments_count: self.comments_count.value,
            input_modalities: self.input_modalities.value.clone(),
            output_modalities: self.output_modalities.value.clone(),
            tasks: self.tasks.value.clone(),
        }
    }

    /// Character count of the description, derived rather than stored.
    pub fn description_length(&self) -> Option<usize> {
        self.description.get().map(|d| d.chars().count())
    }

    pub fn is_resolved(&self) -> bool {
        self.last_date.is_some()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        if self.exited {
            Lifecycle::Exited
        } else if self.name_changed {
            Lifecycle::Renamed
        } else if self.is_resolved() {
            Lifecycle::Found
        } else {
            Lifecycle::Unknown
        }
    }

    /// Exited, or renamed to some other key.
    pub fn is_inactive(&self) -> bool {
        self.exited || (self.name_changed && self.new_name.as_ref() != Some(&self.key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> EntityKey {
        canonicalize(raw).expect("canonical key")
    }

    #[test]
    fn canonicalization_ignores_case_scheme_and_trailing_slash() {
        assert_eq!(
            canonicalize("HTTP://Example.com/X/"),
            canonicalize("https://example.com/x")
        );
        assert_eq!(key("https://example.com/x").as_str(), "https://example.com/x");
        assert_eq!(key("http://Example.com/ai/Tool//").as_str(), "https://example.com/ai/tool");
    }

    #[test]
    fn canonicalization_is_idempotent() {
        for raw in [
            "HTTP://Example.com/X/",
            "https://theresanaiforthat.com/ai/caf\u{e9}-bot/",
            "https://example.com:8443/a b/?q=1#frag",
            "https://example.com/",
            "http://example.com:443/ai/x",
            "http://example.com:80/ai/x",
        ] {
            let once = key(raw);
            let twice = key(once.as_str());
            assert_eq!(once, twice, "not idempotent for {raw}");
        }
    }

    #[test]
    fn https_default_port_is_dropped_after_scheme_promotion() {
        let plain = key("https://example.com/ai/x");
        assert_eq!(key("http://example.com:443/ai/x"), plain);
        assert_eq!(key("https://example.com:443/ai/x"), plain);
        assert_eq!(key("http://example.com:80/ai/x"), plain);
    }

    #[test]
    fn canonicalization_drops_query_and_fragment() {
        assert_eq!(
            key("https://example.com/ai/tool?ref=abc#top").as_str(),
            "https://example.com/ai/tool"
        );
    }

    #[test]
    fn canonicalization_rejects_garbage() {
        assert_eq!(canonicalize(""), None);
        assert_eq!(canonicalize("   "), None);
        assert_eq!(canonicalize("not a url"), None);
        assert_eq!(canonicalize("/ai/relative"), None);
        assert_eq!(canonicalize("ftp://example.com/x"), None);
    }

    #[test]
    fn key_exposes_host_and_path() {
        let k = key("https://Example.com:8080/ai/tool");
        assert_eq!(k.host(), "example.com");
        assert_eq!(k.authority(), "example.com:8080");
        assert_eq!(k.path(), "/ai/tool");
        assert_eq!(key("https://example.com/").path(), "");
    }

    #[test]
    fn archive_link_yields_key_and_capture_date() {
        let link = parse_archive_link("https://web.archive.org/web/20230615000000/https://example.com/x")
            .expect("archive link");
        assert_eq!(link.original.as_str(), "https://example.com/x");
        assert_eq!(link.capture_date, NaiveDate::from_ymd_opt(2023, 6, 15).unwrap());
        assert_eq!(link.timestamp, "20230615000000");
    }

    #[test]
    fn archive_link_canonicalizes_the_original() {
        let link = parse_archive_link(
            "https://web.archive.org/web/20240101120000/http://Example.com/AI/Tool/",
        )
        .expect("archive link");
        assert_eq!(link.original.as_str(), "https://example.com/ai/tool");
    }

    #[test]
    fn archive_link_with_impossible_date_fails() {
        let err = parse_archive_link("https://web.archive.org/web/20231345000000/https://example.com/x")
            .unwrap_err();
        assert!(matches!(err, KeyError::InvalidCaptureDate(_)));
    }

    #[test]
    fn non_archive_links_fail() {
        assert!(matches!(
            parse_archive_link("https://example.com/x"),
            Err(KeyError::NotArchiveLink(_))
        ));
        assert!(parse_archive_link("https://web.archive.org/web/2023/https://example.com/x").is_err());
    }

    #[test]
    fn description_length_counts_characters() {
        let mut record = CanonicalRecord::empty(key("https://example.com/ai/x"));
        assert_eq!(record.description_length(), None);
        record.description = Field::with_value_and_provenance("h\u{e9}llo".to_string(), None);
        assert_eq!(record.description_length(), Some(5));
    }

    #[test]
    fn lifecycle_and_inactivity_follow_flags() {
        let k = key("https://example.com/ai/x");
        let mut record = CanonicalRecord::empty(k.clone());
        assert_eq!(record.lifecycle(), Lifecycle::Unknown);
        record.last_date = NaiveDate::from_ymd_opt(2024, 1, 1);
        assert_eq!(record.lifecycle(), Lifecycle::Found);
        assert!(!record.is_inactive());

        record.name_changed = true;
        record.new_name = Some(k.clone());
        assert_eq!(record.lifecycle(), Lifecycle::Renamed);
        assert!(!record.is_inactive(), "rename target keeps its own key");

        record.new_name = Some(key("https://example.com/ai/y"));
        assert!(record.is_inactive());

        record.exited = true;
        assert_eq!(record.lifecycle(), Lifecycle::Exited);
    }
}
