//! The directory file: column layout, lenient decoding and key lists.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Result;
use chrono::NaiveDate;
use tdir_core::{canonicalize, CanonicalRecord, EntityKey, FieldSet, IntegrityError, Provenance};
use tracing::warn;

use crate::tabular::{write_atomic, ChunkedReader, Row};

pub const DIRECTORY_COLUMNS: [&str; 19] = [
    "tool_id",
    "name",
    "release_date",
    "pricing_text",
    "description",
    "description_length",
    "saves",
    "comments",
    "comments_count",
    "views",
    "rating",
    "ratings_count",
    "input_modalities",
    "output_modalities",
    "tasks",
    "last_date",
    "exited",
    "name_changed",
    "new_name",
];

const DIRECTORY_SOURCE_ID: &str = "directory";
const READ_CHUNK: usize = 50_000;

pub fn parse_count(value: &str) -> Option<u64> {
    let cleaned: String = value
        .trim()
        .chars()
        .filter(|c| !matches!(c, ',' | '_'))
        .collect();
    if let Ok(v) = cleaned.parse::<u64>() {
        return Some(v);
    }
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v as u64)
}

pub fn parse_decimal(value: &str) -> Option<f64> {
    value
        .trim()
        .replace(',', "")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

/// ISO date, tolerating a trailing time component.
pub fn parse_iso_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    let date_part = value.get(..10).unwrap_or(value);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

pub fn parse_flag(value: Option<&str>) -> bool {
    match value {
        Some(v) => {
            let v = v.trim().to_ascii_lowercase();
            matches!(v.as_str(), "1" | "1.0" | "true" | "yes" | "y")
        }
        None => false,
    }
}

fn owned(value: Option<&str>) -> Option<String> {
    value.map(ToString::to_string)
}

/// Decode one directory row. Rows without a usable `tool_id` yield `None`.
pub fn record_from_row(row: &Row) -> Option<CanonicalRecord> {
    let key = canonicalize(row.get("tool_id")?)?;
    let last_date = row.get("last_date").and_then(parse_iso_date);
    let values = FieldSet {
        name: owned(row.get("name")),
        description: owned(row.get("description")),
        pricing_text: owned(row.get("pricing_text")),
        release_date: row.get("release_date").and_then(parse_iso_date),
        rating: row.get("rating").and_then(parse_decimal),
        ratings_count: row.get("ratings_count").and_then(parse_count),
        saves: row.get("saves").and_then(parse_count),
        views: row.get("views").and_then(parse_count),
        comments: owned(row.get("comments")),
        comments_count: row.get("comments_count").and_then(parse_count),
        input_modalities: owned(row.get("input_modalities")),
        output_modalities: owned(row.get("output_modalities")),
        tasks: owned(row.get("tasks")),
    };
    let provenance = last_date.map(|as_of| Provenance {
        source_id: DIRECTORY_SOURCE_ID.to_string(),
        as_of,
    });

    let mut record = CanonicalRecord::from_values(key, values, provenance);
    record.last_date = last_date;
    record.exited = parse_flag(row.get("exited"));
    record.name_changed = parse_flag(row.get("name_changed"));
    record.new_name = row.get("new_name").and_then(canonicalize);
    Some(record)
}

fn text<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn flag(value: bool) -> String {
    let text = if value { "1" } else { "0" };
    text.to_string()
}

pub fn record_to_row(record: &CanonicalRecord) -> Vec<String> {
    vec![
        record.key.to_string(),
        text(record.name.get()),
        text(record.release_date.get()),
        text(record.pricing_text.get()),
        text(record.description.get()),
        text(record.description_length()),
        text(record.saves.get()),
        text(record.comments.get()),
        text(record.comments_count.get()),
        text(record.views.get()),
        text(record.rating.get()),
        text(record.ratings_count.get()),
        text(record.input_modalities.get()),
        text(record.output_modalities.get()),
        text(record.tasks.get()),
        text(record.last_date),
        flag(record.exited),
        flag(record.name_changed),
        text(record.new_name.as_ref()),
    ]
}

/// Load a directory file. A key that appears twice is an integrity violation.
pub fn load_directory(path: impl AsRef<Path>) -> Result<Vec<CanonicalRecord>> {
    let path = path.as_ref();
    let mut seen = HashSet::new();
    let mut records = Vec::new();
    for chunk in ChunkedReader::open(path, READ_CHUNK)? {
        for row in chunk? {
            let Some(record) = record_from_row(&row) else {
                warn!(path = %path.display(), tool_id = ?row.get("tool_id"), "dropping row without a canonical tool_id");
                continue;
            };
            if !seen.insert(record.key.clone()) {
                return Err(IntegrityError::DuplicateKey {
                    key: record.key,
                    context: path.display().to_string(),
                }
                .into());
            }
            records.push(record);
        }
    }
    Ok(records)
}

pub fn write_directory<'a>(
    path: impl AsRef<Path>,
    records: impl IntoIterator<Item = &'a CanonicalRecord>,
) -> Result<()> {
    write_atomic(path, &DIRECTORY_COLUMNS, records.into_iter().map(record_to_row))
}

/// Read a one-column key list, canonicalizing every entry. Two entries that
/// canonicalize to the same key are an integrity error.
pub fn read_key_list(path: impl AsRef<Path>, column: &str) -> Result<Vec<EntityKey>> {
    let path = path.as_ref();
    let reader = ChunkedReader::open(path, READ_CHUNK)?;
    if !reader.header().contains(column) {
        anyhow::bail!("{} has no `{column}` column", path.display());
    }
    let mut seen = HashSet::new();
    let mut keys = Vec::new();
    for chunk in reader {
        for row in chunk? {
            match row.get(column).and_then(canonicalize) {
                Some(key) => {
                    if !seen.insert(key.clone()) {
                        return Err(IntegrityError::DuplicateKey {
                            key,
                            context: path.display().to_string(),
                        }
                        .into());
                    }
                    keys.push(key);
                }
                None => warn!(path = %path.display(), value = ?row.get(column), "skipping unparseable key"),
            }
        }
    }
    Ok(keys)
}

pub fn write_key_list<'a>(
    path: impl AsRef<Path>,
    column: &str,
    keys: impl IntoIterator<Item = &'a EntityKey>,
) -> Result<()> {
    write_atomic(path, &[column], keys.into_iter().map(|k| [k.as_str()]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tdir_core::Field;
    use tempfile::tempdir;

    fn key(raw: &str) -> EntityKey {
        canonicalize(raw).unwrap()
    }

    #[test]
    fn lenient_number_parsing() {
        assert_eq!(parse_count("1,234"), Some(1234));
        assert_eq!(parse_count("12.0"), Some(12));
        assert_eq!(parse_count("-3"), None);
        assert_eq!(parse_count("lots"), None);
        assert_eq!(parse_decimal("4.5"), Some(4.5));
        assert_eq!(parse_decimal("n/a"), None);
        assert_eq!(
            parse_iso_date("2024-03-01 00:00:00"),
            NaiveDate::from_ymd_opt(2024, 3, 1)
        );
        assert_eq!(parse_iso_date("01/03/2024"), None);
    }

    #[test]
    fn directory_survives_a_write_and_load_cycle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("directory.csv");

        let mut record = CanonicalRecord::empty(key("https://example.com/ai/tool"));
        record.name = Field::with_value_and_provenance("Tool, \"quoted\"".to_string(), None);
        record.description = Field::with_value_and_provenance("multi\nline".to_string(), None);
        record.rating = Field::with_value_and_provenance(4.5, None);
        record.views = Field::with_value_and_provenance(10, None);
        record.last_date = NaiveDate::from_ymd_opt(2025, 5, 1);
        record.name_changed = true;
        record.new_name = Some(key("https://example.com/ai/tool-2"));

        write_directory(&path, [&record]).unwrap();
        let loaded = load_directory(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        let got = &loaded[0];
        assert_eq!(got.values(), record.values());
        assert_eq!(got.description_length(), Some(10));
        assert_eq!(got.last_date, record.last_date);
        assert!(got.name_changed);
        assert!(!got.exited);
        assert_eq!(got.new_name, record.new_name);
        assert_eq!(
            got.name.provenance.as_ref().map(|p| p.as_of),
            record.last_date,
            "loaded fields are attributed to last_date"
        );
    }

    #[test]
    fn duplicate_keys_abort_the_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("directory.csv");
        std::fs::write(
            &path,
            "tool_id,name\nhttps://example.com/ai/x,A\nHTTP://example.com/ai/X/,B\n",
        )
        .unwrap();
        let err = load_directory(&path).unwrap_err();
        assert!(err.downcast_ref::<IntegrityError>().is_some());
    }

    #[test]
    fn key_lists_are_canonical() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("urls.csv");
        std::fs::write(
            &path,
            "url\nhttps://example.com/ai/a/\nnot a url\nhttps://example.com/ai/b\n",
        )
        .unwrap();
        let keys = read_key_list(&path, "url").unwrap();
        assert_eq!(keys, vec![key("https://example.com/ai/a"), key("https://example.com/ai/b")]);

        let out = dir.path().join("out.csv");
        write_key_list(&out, "url", &keys).unwrap();
        assert_eq!(read_key_list(&out, "url").unwrap(), keys);
        assert!(read_key_list(&out, "tool_id").is_err());
    }

    #[test]
    fn key_list_entries_that_collapse_to_one_key_are_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("urls.csv");
        std::fs::write(&path, "url\nhttps://example.com/ai/a/\nhttp://EXAMPLE.com/ai/a\n").unwrap();
        let err = read_key_list(&path, "url").unwrap_err();
        assert!(err.downcast_ref::<IntegrityError>().is_some());
    }
}
