//! Source schema adapters + the page extractor used by the enrichment pass.

use chrono::NaiveDate;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tdir_core::{canonicalize, parse_archive_link, EntityKey, FieldSet, SourceRecord};
use tdir_storage::directory::{parse_count, parse_decimal};
use tdir_storage::Row;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "tdir-adapters";

const LINK_COLUMN: &str = "link";
const VERSIONS_COLUMN: &str = "versions";
const VERSION_DATE_FORMAT: &str = "%Y-%m-%d";
const PRICING_SEPARATOR: &str = " | ";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("source {source_id}: live exports need a pass date")]
    MissingPassDate { source_id: String },
    #[error("invalid selector `{selector}`: {reason}")]
    Selector { selector: String, reason: String },
}

/// Every dataset generation the directory knows how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceSchema {
    /// Full export of the live catalog; recency is the export's pass date.
    #[serde(rename = "live_export")]
    LiveExport,
    /// Archive harvest in the current schema generation.
    #[serde(rename = "archive_2025")]
    Archive2025,
    /// Archive harvest from before the schema migration.
    #[serde(rename = "archive_2024")]
    Archive2024,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommonField {
    Name,
    Description,
    Rating,
    RatingsCount,
    Saves,
    Views,
    Comments,
    CommentsCount,
    InputModalities,
    OutputModalities,
    Tasks,
}

/// How a generation encodes the pricing concept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PricingEncoding {
    /// Several columns joined in order, skipping blanks.
    Composite(&'static [&'static str]),
    Single(&'static str),
}

type ColumnMap = &'static [(CommonField, &'static [&'static str])];

const CURRENT_COLUMNS: ColumnMap = &[
    (CommonField::Name, &["name"]),
    (CommonField::Description, &["description"]),
    (CommonField::Rating, &["rating"]),
    (CommonField::RatingsCount, &["number_of_ratings", "ratings_count"]),
    (CommonField::Saves, &["saves"]),
    (CommonField::Views, &["views"]),
    (CommonField::Comments, &["comments", "comments_json"]),
    (CommonField::CommentsCount, &["comments_count"]),
    (CommonField::InputModalities, &["modalities_inputs"]),
    (CommonField::OutputModalities, &["modalities_outputs"]),
    (CommonField::Tasks, &["task_label_name"]),
];

const LEGACY_COLUMNS: ColumnMap = &[
    (CommonField::Name, &["name"]),
    (CommonField::Description, &["description"]),
    (CommonField::Rating, &["rating"]),
    (CommonField::RatingsCount, &["number_of_ratings"]),
    (CommonField::Saves, &["saves"]),
    (CommonField::Comments, &["comments_json"]),
    (CommonField::CommentsCount, &["comments_count"]),
    (CommonField::Tasks, &["task_label_name"]),
];

const CURRENT_PRICING: &[&str] = &["pricing_model", "paid_options_from", "billing_frequency"];

impl SourceSchema {
    pub fn is_archive(self) -> bool {
        !matches!(self, SourceSchema::LiveExport)
    }

    pub fn columns(self) -> ColumnMap {
        match self {
            SourceSchema::LiveExport | SourceSchema::Archive2025 => CURRENT_COLUMNS,
            SourceSchema::Archive2024 => LEGACY_COLUMNS,
        }
    }

    pub fn pricing(self) -> PricingEncoding {
        match self {
            SourceSchema::LiveExport | SourceSchema::Archive2025 => {
                PricingEncoding::Composite(CURRENT_PRICING)
            }
            SourceSchema::Archive2024 => PricingEncoding::Single("pricing_model"),
        }
    }

    /// Candidate columns for `field` in priority order; empty when the
    /// generation never carried that field.
    pub fn candidates(self, field: CommonField) -> &'static [&'static str] {
        self.columns()
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, cols)| *cols)
            .unwrap_or(&[])
    }
}

/// First present, non-blank candidate column.
fn first_present<'r>(row: &'r Row, candidates: &[&str]) -> Option<&'r str> {
    candidates.iter().find_map(|col| row.get(col))
}

pub fn build_pricing_text(row: &Row, encoding: PricingEncoding) -> Option<String> {
    match encoding {
        PricingEncoding::Single(col) => row.get(col).map(ToString::to_string),
        PricingEncoding::Composite(cols) => {
            let parts: Vec<&str> = cols.iter().filter_map(|c| row.get(c)).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(PRICING_SEPARATOR))
            }
        }
    }
}

pub fn earliest(dates: impl IntoIterator<Item = NaiveDate>) -> Option<NaiveDate> {
    dates.into_iter().min()
}

/// Earliest valid date in a `versions` JSON list of `{version, date}`
/// objects. Malformed JSON and unparseable dates are dropped.
pub fn release_date_from_versions(versions_json: &str) -> Option<NaiveDate> {
    let value: JsonValue = match serde_json::from_str(versions_json) {
        Ok(v) => v,
        Err(err) => {
            debug!(error = %err, "ignoring malformed versions JSON");
            return None;
        }
    };
    let entries = value.as_array()?;
    earliest(entries.iter().filter_map(|entry| {
        entry
            .get("date")
            .and_then(JsonValue::as_str)
            .and_then(|d| NaiveDate::parse_from_str(d.trim(), VERSION_DATE_FORMAT).ok())
    }))
}

/// Maps raw rows of one configured source into [`SourceRecord`]s.
#[derive(Debug, Clone)]
pub struct SourceAdapter {
    source_id: String,
    schema: SourceSchema,
    pass_date: Option<NaiveDate>,
    site_host: String,
}

impl SourceAdapter {
    pub fn new(
        source_id: impl Into<String>,
        schema: SourceSchema,
        pass_date: Option<NaiveDate>,
        site_host: impl Into<String>,
    ) -> Result<Self, AdapterError> {
        let source_id = source_id.into();
        if schema == SourceSchema::LiveExport && pass_date.is_none() {
            return Err(AdapterError::MissingPassDate { source_id });
        }
        Ok(Self {
            source_id,
            schema,
            pass_date,
            site_host: site_host.into().to_ascii_lowercase(),
        })
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn schema(&self) -> SourceSchema {
        self.schema
    }

    /// Entity key and recency of a row, or `None` when the link is unusable
    /// or points outside the configured site.
    pub fn locate(&self, row: &Row) -> Option<(EntityKey, NaiveDate)> {
        let link = row.get(LINK_COLUMN)?;
        let located = if self.schema.is_archive() {
            parse_archive_link(link)
                .map(|archived| (archived.original, archived.capture_date))
                .map_err(|err| debug!(source_id = %self.source_id, error = %err, "skipping row"))
                .ok()
        } else {
            canonicalize(link).zip(self.pass_date)
        }?;
        if located.0.host() != self.site_host {
            debug!(source_id = %self.source_id, key = %located.0, "skipping out-of-domain row");
            return None;
        }
        Some(located)
    }

    pub fn map_fields(&self, row: &Row) -> FieldSet {
        let text = |field| first_present(row, self.schema.candidates(field)).map(ToString::to_string);
        let count = |field| first_present(row, self.schema.candidates(field)).and_then(parse_count);

        FieldSet {
            name: text(CommonField::Name),
            description: text(CommonField::Description),
            pricing_text: build_pricing_text(row, self.schema.pricing()),
            release_date: row.get(VERSIONS_COLUMN).and_then(release_date_from_versions),
            rating: first_present(row, self.schema.candidates(CommonField::Rating))
                .and_then(parse_decimal),
            ratings_count: count(CommonField::RatingsCount),
            saves: count(CommonField::Saves),
            views: count(CommonField::Views),
            comments: text(CommonField::Comments),
            comments_count: count(CommonField::CommentsCount),
            input_modalities: text(CommonField::InputModalities),
            output_modalities: text(CommonField::OutputModalities),
            tasks: text(CommonField::Tasks),
        }
    }

    pub fn adapt(&self, row: &Row) -> Option<SourceRecord> {
        let (key, recency) = self.locate(row)?;
        Some(SourceRecord {
            source_id: self.source_id.clone(),
            key,
            recency,
            fields: self.map_fields(row),
        })
    }
}

/// Which page template a snapshot was rendered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotEra {
    /// Current template: release dates come from the changelog.
    Modern,
    /// Pre-migration template: release dates come from the launch marker.
    Legacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EraPolicy {
    pub modern_from_year: i32,
}

impl Default for EraPolicy {
    fn default() -> Self {
        Self {
            modern_from_year: 2025,
        }
    }
}

impl EraPolicy {
    /// Live pages (no capture year) always use the current template.
    pub fn era_for(&self, capture_year: Option<i32>) -> SnapshotEra {
        match capture_year {
            Some(year) if year < self.modern_from_year => SnapshotEra::Legacy,
            _ => SnapshotEra::Modern,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedPage {
    pub name: Option<String>,
    pub release_date: Option<NaiveDate>,
}

impl ExtractedPage {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.release_date.is_none()
    }

    pub fn into_fields(self) -> FieldSet {
        FieldSet {
            name: self.name,
            release_date: self.release_date,
            ..FieldSet::default()
        }
    }
}

/// Pulls candidate field values out of a fetched page.
pub trait PageExtractor: Send + Sync {
    fn extract(&self, html: &str, era: SnapshotEra) -> ExtractedPage;
}

const NAME_SELECTOR: &str = "h1.title_inner";
const CHANGELOG_SELECTOR: &str = ".version .changelog_title";
const LAUNCH_SELECTOR: &str = "span.launch_date_top";
const CHANGELOG_FORMATS: &[&str] = &["%B %d, %Y"];
const LAUNCH_FORMATS: &[&str] = &["%Y-%m-%d", "%d %b %Y"];
const NAME_VERSION_MARKER: &str = " v";

/// Extractor for the directory's tool page template.
#[derive(Debug, Clone)]
pub struct TemplateExtractor {
    name: Selector,
    changelog: Selector,
    launch: Selector,
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn select_first_text(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<Vec<_>>().join(" ")))
}

fn select_all_texts(document: &Html, selector: &Selector) -> Vec<String> {
    document
        .select(selector)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect()
}

fn parse_any_format(text: &str, formats: &[&str]) -> Option<NaiveDate> {
    formats
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
}

impl TemplateExtractor {
    pub fn new() -> Result<Self, AdapterError> {
        Self::with_selectors(NAME_SELECTOR, CHANGELOG_SELECTOR, LAUNCH_SELECTOR)
    }

    pub fn with_selectors(name: &str, changelog: &str, launch: &str) -> Result<Self, AdapterError> {
        Ok(Self {
            name: parse_selector(name)?,
            changelog: parse_selector(changelog)?,
            launch: parse_selector(launch)?,
        })
    }
}

impl PageExtractor for TemplateExtractor {
    fn extract(&self, html: &str, era: SnapshotEra) -> ExtractedPage {
        let document = Html::parse_document(html);

        // headings read "<name> v<version>"
        let name = select_first_text(&document, &self.name).and_then(|heading| {
            let base = heading.split(NAME_VERSION_MARKER).next().unwrap_or(&heading);
            text_or_none(base.to_string())
        });

        let (selector, formats) = match era {
            SnapshotEra::Modern => (&self.changelog, CHANGELOG_FORMATS),
            SnapshotEra::Legacy => (&self.launch, LAUNCH_FORMATS),
        };
        let release_date = earliest(
            select_all_texts(&document, selector)
                .iter()
                .filter_map(|text| parse_any_format(text, formats)),
        );

        ExtractedPage { name, release_date }
    }
}
