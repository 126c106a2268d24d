//! Reconciliation engine: per-field merge policies, the keyed directory
//! and lifecycle transitions.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use chrono::NaiveDate;
use tdir_core::{
    canonicalize, CanonicalRecord, EntityKey, Field, IntegrityError, Provenance,
    SourceRecord,
};
use tdir_storage::{load_directory, write_directory};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Last-writer-wins per field, by recency.
    Refresh,
    /// Like `Refresh`, but entities that are already resolved are skipped.
    Backfill,
    /// Only absent fields are written.
    FillGaps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Created,
    Updated,
    Unchanged,
    Skipped,
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        matches!(self, MergeOutcome::Created | MergeOutcome::Updated)
    }
}

#[derive(Default)]
struct WriteTally {
    took_effect: bool,
    changed: bool,
}

impl WriteTally {
    fn write<T: PartialEq>(
        &mut self,
        field: &mut Field<T>,
        incoming: Option<T>,
        provenance: &Provenance,
        policy: MergePolicy,
    ) {
        let Some(value) = incoming else {
            return;
        };
        let allowed = match (&field.value, &field.provenance, policy) {
            (None, _, _) => true,
            (Some(_), _, MergePolicy::FillGaps) => false,
            (Some(_), None, _) => true,
            (Some(_), Some(current), _) => provenance.as_of >= current.as_of,
        };
        if !allowed {
            return;
        }
        self.took_effect = true;
        let replacement = Field::with_value_and_provenance(value, Some(provenance.clone()));
        if *field != replacement {
            *field = replacement;
            self.changed = true;
        }
    }
}

/// Merge `incoming` into `record` under `policy`.
///
/// `last_date` only moves forward, and only when at least one field write
/// took effect. Lifecycle flags are never touched here.
pub fn merge_into(
    record: &mut CanonicalRecord,
    incoming: &SourceRecord,
    policy: MergePolicy,
) -> MergeOutcome {
    if policy == MergePolicy::Backfill && record.is_resolved() {
        return MergeOutcome::Skipped;
    }

    let provenance = Provenance {
        source_id: incoming.source_id.clone(),
        as_of: incoming.recency,
    };
    let fields = incoming.fields.clone();
    let mut tally = WriteTally::default();
    tally.write(&mut record.name, fields.name, &provenance, policy);
    tally.write(&mut record.description, fields.description, &provenance, policy);
    tally.write(&mut record.pricing_text, fields.pricing_text, &provenance, policy);
    tally.write(&mut record.release_date, fields.release_date, &provenance, policy);
    tally.write(&mut record.rating, fields.rating, &provenance, policy);
    tally.write(&mut record.ratings_count, fields.ratings_count, &provenance, policy);
    tally.write(&mut record.saves, fields.saves, &provenance, policy);
    tally.write(&mut record.views, fields.views, &provenance, policy);
    tally.write(&mut record.comments, fields.comments, &provenance, policy);
    tally.write(&mut record.comments_count, fields.comments_count, &provenance, policy);
    tally.write(&mut record.input_modalities, fields.input_modalities, &provenance, policy);
    tally.write(&mut record.output_modalities, fields.output_modalities, &provenance, policy);
    tally.write(&mut record.tasks, fields.tasks, &provenance, policy);

    if tally.took_effect {
        let advanced = advance(record.last_date, incoming.recency);
        if advanced != record.last_date {
            record.last_date = advanced;
            tally.changed = true;
        }
    }

    if tally.changed {
        MergeOutcome::Updated
    } else {
        MergeOutcome::Unchanged
    }
}

fn advance(current: Option<NaiveDate>, recency: NaiveDate) -> Option<NaiveDate> {
    Some(current.map_or(recency, |d| d.max(recency)))
}

/// Merge into an optional existing record. A new record takes every
/// supplied field and `last_date = recency`.
pub fn merge(
    existing: Option<CanonicalRecord>,
    incoming: &SourceRecord,
    policy: MergePolicy,
) -> (CanonicalRecord, MergeOutcome) {
    match existing {
        Some(mut record) => {
            let outcome = merge_into(&mut record, incoming, policy);
            (record, outcome)
        }
        None => (create(incoming), MergeOutcome::Created),
    }
}

fn create(incoming: &SourceRecord) -> CanonicalRecord {
    let provenance = Provenance {
        source_id: incoming.source_id.clone(),
        as_of: incoming.recency,
    };
    let mut record =
        CanonicalRecord::from_values(incoming.key.clone(), incoming.fields.clone(), Some(provenance));
    record.last_date = Some(incoming.recency);
    record
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectClass {
    Rename(EntityKey),
    Exit,
    Ignored,
}

/// Path-shape rules for classifying redirect targets.
#[derive(Debug, Clone)]
pub struct LifecycleRules {
    pub site_host: String,
    pub entity_prefix: String,
    pub exit_markers: Vec<String>,
}

impl LifecycleRules {
    pub fn is_entity_key(&self, key: &EntityKey) -> bool {
        key.host() == self.site_host
            && key
                .path()
                .strip_prefix(self.entity_prefix.as_str())
                .is_some_and(|rest| !rest.is_empty())
    }

    pub fn classify_redirect(&self, source: &EntityKey, target: &str) -> RedirectClass {
        let Some(target) = canonicalize(target) else {
            return RedirectClass::Ignored;
        };
        if target.host() != self.site_host {
            return RedirectClass::Ignored;
        }
        if self.is_entity_key(&target) {
            if &target == source {
                return RedirectClass::Ignored;
            }
            return RedirectClass::Rename(target);
        }
        // canonical paths lose their trailing slash; restore it so `/s/`
        // still matches a bare `/s` target
        let path = format!("{}/", target.path());
        if self.exit_markers.iter().any(|m| path.contains(m.as_str())) {
            RedirectClass::Exit
        } else {
            RedirectClass::Ignored
        }
    }
}

/// Canonical records keyed by entity key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Directory {
    records: BTreeMap<EntityKey, CanonicalRecord>,
}

impl Directory {
    pub fn from_records(
        records: impl IntoIterator<Item = CanonicalRecord>,
    ) -> Result<Self, IntegrityError> {
        let mut map = BTreeMap::new();
        for record in records {
            if let Some(previous) = map.insert(record.key.clone(), record) {
                return Err(IntegrityError::DuplicateKey {
                    key: previous.key,
                    context: "directory".to_string(),
                });
            }
        }
        Ok(Self { records: map })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_records(load_directory(path)?)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        write_directory(path, self.records.values())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.records.contains_key(key)
    }

    pub fn get(&self, key: &EntityKey) -> Option<&CanonicalRecord> {
        self.records.get(key)
    }

    pub fn records(&self) -> impl Iterator<Item = &CanonicalRecord> {
        self.records.values()
    }

    pub fn apply(&mut self, incoming: &SourceRecord, policy: MergePolicy) -> MergeOutcome {
        let existing = self.records.remove(&incoming.key);
        let (record, outcome) = merge(existing, incoming, policy);
        debug!(key = %record.key, source_id = %incoming.source_id, ?outcome, "merged");
        self.records.insert(record.key.clone(), record);
        outcome
    }

    /// Insert an unresolved placeholder unless the key is already known.
    pub fn ensure(&mut self, key: &EntityKey) {
        if !self.records.contains_key(key) {
            self.records
                .insert(key.clone(), CanonicalRecord::empty(key.clone()));
        }
    }

    /// Mark an entity exited. Other fields are left as they are.
    pub fn mark_exited(&mut self, key: &EntityKey) -> bool {
        match self.records.get_mut(key) {
            Some(record) if !record.exited => {
                record.exited = true;
                true
            }
            _ => false,
        }
    }

    /// Apply one redirect observation for `source`. Renames are written to
    /// both the old and the new record when each is known locally.
    pub fn apply_redirect(
        &mut self,
        source: &EntityKey,
        target: &str,
        rules: &LifecycleRules,
    ) -> RedirectClass {
        let class = rules.classify_redirect(source, target);
        match &class {
            RedirectClass::Rename(new_key) => {
                for key in [source, new_key] {
                    if let Some(record) = self.records.get_mut(key) {
                        record.name_changed = true;
                        record.new_name = Some(new_key.clone());
                    }
                }
            }
            RedirectClass::Exit => {
                self.mark_exited(source);
            }
            RedirectClass::Ignored => {}
        }
        class
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tdir_core::FieldSet;

    fn key(raw: &str) -> EntityKey {
        canonicalize(raw).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn incoming(source_id: &str, recency: NaiveDate, fields: FieldSet) -> SourceRecord {
        SourceRecord {
            source_id: source_id.to_string(),
            key: key("https://example.com/ai/tool"),
            recency,
            fields,
        }
    }

    fn named(name: &str) -> FieldSet {
        FieldSet {
            name: Some(name.to_string()),
            ..FieldSet::default()
        }
    }

    fn rules() -> LifecycleRules {
        LifecycleRules {
            site_host: "example.com".to_string(),
            entity_prefix: "/ai/".to_string(),
            exit_markers: vec!["/task/".to_string(), "/s/".to_string()],
        }
    }

    #[test]
    fn first_merge_creates_with_last_date_at_recency() {
        let rec = incoming("wb", date(2024, 5, 1), named("Tool"));
        let (record, outcome) = merge(None, &rec, MergePolicy::Refresh);
        assert_eq!(outcome, MergeOutcome::Created);
        assert_eq!(record.last_date, Some(date(2024, 5, 1)));
        assert_eq!(record.name.get().map(String::as_str), Some("Tool"));
        assert_eq!(record.name.provenance.as_ref().unwrap().source_id, "wb");
    }

    #[test]
    fn merging_twice_is_idempotent() {
        let rec = incoming(
            "live",
            date(2025, 1, 1),
            FieldSet {
                name: Some("Tool".into()),
                views: Some(5),
                ..FieldSet::default()
            },
        );
        let (once, _) = merge(None, &rec, MergePolicy::Refresh);
        let (twice, outcome) = merge(Some(once.clone()), &rec, MergePolicy::Refresh);
        assert_eq!(outcome, MergeOutcome::Unchanged);
        assert_eq!(once, twice);
    }

    #[test]
    fn older_recency_never_rewinds_or_overwrites() {
        let newer = incoming("live", date(2026, 1, 14), named("New"));
        let older = incoming(
            "wb",
            date(2024, 3, 1),
            FieldSet {
                name: Some("Old".into()),
                saves: Some(7),
                ..FieldSet::default()
            },
        );

        let (mut record, _) = merge(None, &newer, MergePolicy::Refresh);
        let outcome = merge_into(&mut record, &older, MergePolicy::Refresh);
        assert_eq!(outcome, MergeOutcome::Updated, "absent saves filled");
        assert_eq!(record.name.get().map(String::as_str), Some("New"));
        assert_eq!(record.saves.get(), Some(&7));
        assert_eq!(record.last_date, Some(date(2026, 1, 14)));
    }

    #[test]
    fn last_date_tracks_max_effective_recency() {
        let mut record = CanonicalRecord::empty(key("https://example.com/ai/tool"));
        for (day, name) in [(3, "c"), (1, "a"), (2, "b")] {
            merge_into(
                &mut record,
                &incoming("wb", date(2024, 1, day), named(name)),
                MergePolicy::Refresh,
            );
        }
        assert_eq!(record.last_date, Some(date(2024, 1, 3)));
        assert_eq!(record.name.get().map(String::as_str), Some("c"));

        // a later source that supplies nothing does not count
        merge_into(
            &mut record,
            &incoming("wb", date(2024, 9, 9), FieldSet::default()),
            MergePolicy::Refresh,
        );
        assert_eq!(record.last_date, Some(date(2024, 1, 3)));
    }

    #[test]
    fn backfill_skips_resolved_entities() {
        let (mut record, _) = merge(
            None,
            &incoming("wb", date(2024, 1, 1), named("Tool")),
            MergePolicy::Refresh,
        );
        let outcome = merge_into(
            &mut record,
            &incoming("wb", date(2025, 1, 1), named("Other")),
            MergePolicy::Backfill,
        );
        assert_eq!(outcome, MergeOutcome::Skipped);
        assert_eq!(record.name.get().map(String::as_str), Some("Tool"));
    }

    #[test]
    fn fill_gaps_never_overwrites() {
        let (mut record, _) = merge(
            None,
            &incoming("wb", date(2024, 1, 1), named("Tool")),
            MergePolicy::Refresh,
        );
        record.exited = true;
        let outcome = merge_into(
            &mut record,
            &incoming(
                "page",
                date(2025, 6, 1),
                FieldSet {
                    name: Some("Renamed".into()),
                    release_date: Some(date(2023, 2, 2)),
                    ..FieldSet::default()
                },
            ),
            MergePolicy::FillGaps,
        );
        assert_eq!(outcome, MergeOutcome::Updated);
        assert_eq!(record.name.get().map(String::as_str), Some("Tool"));
        assert_eq!(record.release_date.get(), Some(&date(2023, 2, 2)));
        assert!(record.exited, "backfilling an exited entity keeps it exited");
    }

    #[test]
    fn redirect_classification_by_path_shape() {
        let source = key("https://example.com/ai/old");
        let rules = rules();
        assert_eq!(
            rules.classify_redirect(&source, "https://example.com/ai/new/"),
            RedirectClass::Rename(key("https://example.com/ai/new"))
        );
        assert_eq!(
            rules.classify_redirect(&source, "https://example.com/task/writing"),
            RedirectClass::Exit
        );
        assert_eq!(
            rules.classify_redirect(&source, "https://example.com/s"),
            RedirectClass::Exit
        );
        assert_eq!(
            rules.classify_redirect(&source, "https://example.com/ai/old/"),
            RedirectClass::Ignored
        );
        assert_eq!(
            rules.classify_redirect(&source, "https://example.com/pricing"),
            RedirectClass::Ignored
        );
        assert_eq!(
            rules.classify_redirect(&source, "https://other.org/ai/new"),
            RedirectClass::Ignored
        );
    }

    #[test]
    fn rename_marks_both_records() {
        let old = key("https://example.com/ai/old");
        let new = key("https://example.com/ai/new");
        let mut directory = Directory::from_records([
            CanonicalRecord::empty(old.clone()),
            CanonicalRecord::empty(new.clone()),
        ])
        .unwrap();

        directory.apply_redirect(&old, "https://example.com/ai/new", &rules());
        for k in [&old, &new] {
            let record = directory.get(k).unwrap();
            assert!(record.name_changed);
            assert_eq!(record.new_name.as_ref(), Some(&new));
            assert!(!record.exited);
        }
        assert!(directory.get(&old).unwrap().is_inactive());
        assert!(!directory.get(&new).unwrap().is_inactive());
    }

    #[test]
    fn exit_leaves_rename_flags_alone() {
        let old = key("https://example.com/ai/old");
        let mut directory = Directory::from_records([CanonicalRecord::empty(old.clone())]).unwrap();
        directory.apply_redirect(&old, "https://example.com/task/images/", &rules());
        directory.apply_redirect(&old, "https://example.com/about", &rules());
        let record = directory.get(&old).unwrap();
        assert!(record.exited);
        assert!(!record.name_changed);
        assert_eq!(record.new_name, None);
    }

    #[test]
    fn duplicate_records_are_an_integrity_violation() {
        let k = key("https://example.com/ai/x");
        let err = Directory::from_records([
            CanonicalRecord::empty(k.clone()),
            CanonicalRecord::empty(k.clone()),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            IntegrityError::DuplicateKey {
                key: k,
                context: "directory".into()
            }
        );
    }
}
