use anyhow::Context;
use log::{debug, warn};
use serde::Serialize;

use crate::slots::codec::{Decoded, DecodedEvent, decode_events, encode_events};
use crate::slots::error::SlotError;
use crate::slots::model::{Interval, IntervalId, IntervalSet, Segment, Timestamp};
use crate::slots::mutation::{Applied, Command, IgnoreReason, apply};
use crate::slots::segmenter::Segmenter;
use crate::slots::storage::KeyValueStorage;

pub const DEFAULT_STORAGE_KEY: &str = "events";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub loaded: usize,
    pub dropped: usize,
    /// The persisted value was unreadable and has been reset to `[]`.
    pub reset: bool,
}

/// What an edit did to the stored collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    Changed { intervals: usize },
    Ignored(IgnoreReason),
}

/// Owns the interval collection and keeps the persisted copy in step with
/// it. Every mutation rewrites the whole collection.
pub struct IntervalStore<S: KeyValueStorage> {
    storage: S,
    key: String,
    set: IntervalSet,
    segmenter: Segmenter,
}

impl<S: KeyValueStorage> IntervalStore<S> {
    pub fn new(storage: S, key: impl Into<String>, segmenter: Segmenter) -> Self {
        Self {
            storage,
            key: key.into(),
            set: IntervalSet::new(),
            segmenter,
        }
    }

    pub fn open(
        storage: S,
        key: impl Into<String>,
        segmenter: Segmenter,
    ) -> Result<(Self, LoadReport), SlotError> {
        let mut store = Self::new(storage, key, segmenter);
        let report = store.load()?;
        Ok((store, report))
    }

    /// Rebuild the collection from storage. Unreadable data is a recovery
    /// path: the key is reset rather than an error being returned.
    pub fn load(&mut self) -> Result<LoadReport, SlotError> {
        let raw = self
            .storage
            .get(&self.key)
            .with_context(|| format!("failed to read '{}' from storage", self.key))?;
        let Some(raw) = raw else {
            self.set = IntervalSet::new();
            return Ok(LoadReport::default());
        };

        let Decoded {
            events,
            dropped,
            corrupt,
        } = decode_events(&raw);

        if corrupt {
            warn!(
                "persisted '{}' is not an event array; resetting to an empty collection",
                self.key
            );
            self.storage
                .set(&self.key, "[]")
                .with_context(|| format!("failed to reset '{}'", self.key))?;
            self.set = IntervalSet::new();
            return Ok(LoadReport {
                loaded: 0,
                dropped: 0,
                reset: true,
            });
        }

        let survivors = collect(events);
        if dropped > 0 {
            warn!("dropped {dropped} unreadable event(s) from '{}'", self.key);
            self.persist(&survivors)?;
        }
        self.set = survivors;
        if !self.set.overlapping_pairs().is_empty() {
            warn!("persisted '{}' contains overlapping intervals", self.key);
        }

        Ok(LoadReport {
            loaded: self.set.len(),
            dropped,
            reset: false,
        })
    }

    pub fn add(
        &mut self,
        start: Timestamp,
        end: Timestamp,
        label: impl Into<String>,
    ) -> Result<IntervalId, SlotError> {
        if start >= end {
            return Err(SlotError::InvalidRange { start, end });
        }
        if let Some(existing) = self.set.overlapping(start, end, None) {
            return Err(SlotError::Overlap {
                start,
                end,
                existing: existing.id,
            });
        }

        let mut next = self.set.clone();
        let id = next.push(start, end, label);
        self.commit(next)?;
        Ok(id)
    }

    pub fn replace_all(&mut self, set: IntervalSet) -> Result<(), SlotError> {
        self.commit(set)
    }

    /// Replace the collection with an imported snapshot.
    pub fn import(&mut self, events: Vec<DecodedEvent>) -> Result<usize, SlotError> {
        let set = collect(events);
        let count = set.len();
        self.replace_all(set)?;
        Ok(count)
    }

    pub fn apply(&mut self, command: &Command) -> Result<EditOutcome, SlotError> {
        match apply(&self.set, command, &self.segmenter)? {
            Applied::Changed(next) => {
                let intervals = next.len();
                self.commit(next)?;
                Ok(EditOutcome::Changed { intervals })
            }
            Applied::Ignored(reason) => Ok(EditOutcome::Ignored(reason)),
        }
    }

    pub fn remove(&mut self, id: IntervalId) -> Result<bool, SlotError> {
        let mut next = self.set.clone();
        if next.remove(id).is_none() {
            return Ok(false);
        }
        self.commit(next)?;
        Ok(true)
    }

    /// Drop the collection and the persisted key itself.
    pub fn clear(&mut self) -> Result<(), SlotError> {
        self.storage
            .remove(&self.key)
            .with_context(|| format!("failed to remove '{}'", self.key))?;
        self.set = IntervalSet::new();
        Ok(())
    }

    pub fn intervals(&self) -> &IntervalSet {
        &self.set
    }

    pub fn get(&self, id: IntervalId) -> Option<&Interval> {
        self.set.find(id)
    }

    pub fn segments(&self, id: IntervalId) -> Option<Vec<Segment>> {
        self.set
            .find(id)
            .map(|interval| self.segmenter.segment(interval))
    }

    pub fn segmenter(&self) -> &Segmenter {
        &self.segmenter
    }

    #[cfg(test)]
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// The in-memory collection only moves to `next` once it is written.
    fn commit(&mut self, next: IntervalSet) -> Result<(), SlotError> {
        self.persist(&next)?;
        self.set = next;
        Ok(())
    }

    fn persist(&mut self, set: &IntervalSet) -> Result<(), SlotError> {
        let text = encode_events(set)?;
        self.storage
            .set(&self.key, &text)
            .with_context(|| format!("failed to write '{}'", self.key))?;
        debug!("persisted {} interval(s) to '{}'", set.len(), self.key);
        Ok(())
    }
}

fn collect(events: Vec<DecodedEvent>) -> IntervalSet {
    let mut set = IntervalSet::new();
    for event in events {
        set.push(event.start, event.end, event.title);
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::model::at;
    use crate::slots::storage::MemoryStorage;

    /// Reads from memory; writes fail once `fail_writes` is set.
    #[derive(Default)]
    struct FlakyStorage {
        inner: MemoryStorage,
        fail_writes: bool,
    }

    impl KeyValueStorage for FlakyStorage {
        fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.inner.get(key)
        }

        fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
            if self.fail_writes {
                anyhow::bail!("disk full");
            }
            self.inner.set(key, value)
        }

        fn remove(&mut self, key: &str) -> anyhow::Result<()> {
            if self.fail_writes {
                anyhow::bail!("disk full");
            }
            self.inner.remove(key)
        }
    }

    fn empty_store() -> IntervalStore<MemoryStorage> {
        IntervalStore::new(MemoryStorage::new(), DEFAULT_STORAGE_KEY, Segmenter::default())
    }

    fn persisted(store: &IntervalStore<MemoryStorage>) -> Option<String> {
        store.storage().get(DEFAULT_STORAGE_KEY).expect("memory read")
    }

    #[test]
    fn add_persists_the_full_collection() {
        let mut store = empty_store();
        store
            .add(at("2024-01-01T01:00"), at("2024-01-01T03:00"), "gym")
            .expect("first add");

        assert_eq!(
            persisted(&store).as_deref(),
            Some(r#"[{"start":"2024-01-01T01:00:00","end":"2024-01-01T03:00:00","title":"gym"}]"#)
        );
    }

    #[test]
    fn add_rejects_overlap_and_does_not_persist() {
        let mut store = empty_store();
        let first = store
            .add(at("2024-01-01T01:00"), at("2024-01-01T03:00"), "gym")
            .expect("first add");
        let before = persisted(&store);

        let err = store
            .add(at("2024-01-01T02:00"), at("2024-01-01T04:00"), "run")
            .expect_err("overlap should be rejected");
        assert!(matches!(err, SlotError::Overlap { existing, .. } if existing == first));
        assert_eq!(persisted(&store), before);
        assert_eq!(store.intervals().len(), 1);
    }

    #[test]
    fn add_accepts_touching_intervals() {
        let mut store = empty_store();
        store
            .add(at("2024-01-01T01:00"), at("2024-01-01T03:00"), "a")
            .expect("first add");
        store
            .add(at("2024-01-01T03:00"), at("2024-01-01T04:00"), "b")
            .expect("touching add");
        store
            .add(at("2024-01-01T00:00"), at("2024-01-01T01:00"), "c")
            .expect("touching add");
        assert!(store.intervals().overlapping_pairs().is_empty());
    }

    #[test]
    fn add_rejects_empty_range() {
        let mut store = empty_store();
        let err = store
            .add(at("2024-01-01T03:00"), at("2024-01-01T03:00"), "zero")
            .expect_err("empty range should be rejected");
        assert!(matches!(err, SlotError::InvalidRange { .. }));
    }

    #[test]
    fn many_adds_never_leave_overlaps() {
        let mut store = empty_store();
        for hour in 0..20 {
            let start = at(&format!("2024-01-01T{hour:02}:00"));
            let end = start + chrono::Duration::minutes(90);
            let _ = store.add(start, end, format!("slot {hour}"));
        }
        assert!(store.intervals().overlapping_pairs().is_empty());
        assert!(store.intervals().len() > 1);
    }

    #[test]
    fn load_resets_non_array_root() {
        let storage = MemoryStorage::with_entry(DEFAULT_STORAGE_KEY, r#""not-an-array""#);
        let (store, report) =
            IntervalStore::open(storage, DEFAULT_STORAGE_KEY, Segmenter::default())
                .expect("load recovers");

        assert!(report.reset);
        assert!(store.intervals().is_empty());
        assert_eq!(persisted(&store).as_deref(), Some("[]"));
    }

    #[test]
    fn load_resets_malformed_text() {
        let storage = MemoryStorage::with_entry(DEFAULT_STORAGE_KEY, "[{ broken");
        let (store, report) =
            IntervalStore::open(storage, DEFAULT_STORAGE_KEY, Segmenter::default())
                .expect("load recovers");

        assert!(report.reset);
        assert_eq!(persisted(&store).as_deref(), Some("[]"));
    }

    #[test]
    fn load_drops_bad_entries_and_rewrites_survivors() {
        let storage = MemoryStorage::with_entry(
            DEFAULT_STORAGE_KEY,
            r#"[{"start":"garbage","end":"2024-01-01T03:00:00","title":"x"},{"start":"2024-01-01T05:00:00","end":"2024-01-01T06:00:00","title":"ok"}]"#,
        );
        let (store, report) =
            IntervalStore::open(storage, DEFAULT_STORAGE_KEY, Segmenter::default())
                .expect("load recovers");

        assert_eq!(
            report,
            LoadReport {
                loaded: 1,
                dropped: 1,
                reset: false,
            }
        );
        assert_eq!(
            persisted(&store).as_deref(),
            Some(r#"[{"start":"2024-01-01T05:00:00","end":"2024-01-01T06:00:00","title":"ok"}]"#)
        );
    }

    #[test]
    fn load_of_missing_key_is_empty() {
        let (store, report) =
            IntervalStore::open(MemoryStorage::new(), DEFAULT_STORAGE_KEY, Segmenter::default())
                .expect("load");
        assert_eq!(report, LoadReport::default());
        assert!(store.intervals().is_empty());
        assert_eq!(persisted(&store), None);
    }

    #[test]
    fn delete_first_segment_scenario() {
        let mut store = empty_store();
        let id = store
            .add(at("2024-01-01T01:00"), at("2024-01-01T03:00"), "gym")
            .expect("add");

        let segments = store.segments(id).expect("known interval");
        assert_eq!(segments.len(), 2);
        assert_eq!(
            (segments[0].start, segments[0].end),
            (at("2024-01-01T01:00"), at("2024-01-01T02:00"))
        );
        assert_eq!(
            (segments[1].start, segments[1].end),
            (at("2024-01-01T02:00"), at("2024-01-01T03:00"))
        );

        store
            .apply(&Command::DeleteSegment {
                owner: id,
                start: segments[0].start,
                end: segments[0].end,
            })
            .expect("delete");

        assert_eq!(
            persisted(&store).as_deref(),
            Some(r#"[{"start":"2024-01-01T02:00:00","end":"2024-01-01T03:00:00","title":"gym"}]"#)
        );
    }

    #[test]
    fn ignored_edit_does_not_persist() {
        let mut store = empty_store();
        let applied = store
            .apply(&Command::DeleteInterval {
                owner: IntervalId(99),
            })
            .expect("stale edits are not errors");
        assert!(matches!(applied, EditOutcome::Ignored(_)));
        assert_eq!(persisted(&store), None);
    }

    #[test]
    fn remove_and_clear() {
        let mut store = empty_store();
        let id = store
            .add(at("2024-01-01T01:00"), at("2024-01-01T03:00"), "gym")
            .expect("add");

        assert!(store.remove(id).expect("remove"));
        assert!(!store.remove(id).expect("second remove"));
        assert_eq!(persisted(&store).as_deref(), Some("[]"));

        store.clear().expect("clear");
        assert_eq!(persisted(&store), None);
    }

    #[test]
    fn reload_assigns_fresh_ids_in_stored_order() {
        let mut store = empty_store();
        store
            .add(at("2024-01-01T05:00"), at("2024-01-01T06:00"), "late")
            .expect("add");
        store
            .add(at("2024-01-01T01:00"), at("2024-01-01T02:00"), "early")
            .expect("add");

        store.load().expect("reload");
        let labels = store
            .intervals()
            .iter()
            .map(|i| i.label.as_str())
            .collect::<Vec<_>>();
        assert_eq!(labels, vec!["late", "early"]);
    }

    #[test]
    fn failed_writes_leave_the_collection_untouched() {
        let mut store =
            IntervalStore::new(FlakyStorage::default(), DEFAULT_STORAGE_KEY, Segmenter::default());
        let id = store
            .add(at("2024-01-01T01:00"), at("2024-01-01T03:00"), "gym")
            .expect("add while writable");
        let before = store.intervals().clone();
        store.storage.fail_writes = true;

        let err = store
            .add(at("2024-01-01T05:00"), at("2024-01-01T06:00"), "run")
            .expect_err("write fails");
        assert!(matches!(err, SlotError::Storage(_)));
        assert_eq!(store.intervals(), &before);

        store
            .apply(&Command::DeleteSegment {
                owner: id,
                start: at("2024-01-01T01:00"),
                end: at("2024-01-01T02:00"),
            })
            .expect_err("write fails");
        assert_eq!(store.intervals(), &before);

        store.remove(id).expect_err("write fails");
        store.clear().expect_err("write fails");
        store.replace_all(IntervalSet::new()).expect_err("write fails");
        assert_eq!(store.intervals(), &before);

        store.storage.fail_writes = false;
        let reloaded = store.load().expect("reload");
        assert_eq!(reloaded.loaded, 1);
    }

    #[test]
    fn applied_edit_reports_collection_size() {
        let mut store = empty_store();
        let id = store
            .add(at("2024-01-01T01:00"), at("2024-01-01T04:00"), "gym")
            .expect("add");
        let outcome = store
            .apply(&Command::DeleteSegment {
                owner: id,
                start: at("2024-01-01T02:00"),
                end: at("2024-01-01T03:00"),
            })
            .expect("delete");
        assert_eq!(outcome, EditOutcome::Changed { intervals: 2 });
    }
}
