use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Local wall-clock instant. No timezone is attached.
pub type Timestamp = NaiveDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntervalId(pub u64);

impl fmt::Display for IntervalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Interval {
    pub id: IntervalId,
    pub start: Timestamp,
    pub end: Timestamp,
    pub label: String,
}

impl Interval {
    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    /// Touching endpoints (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, start: Timestamp, end: Timestamp) -> bool {
        start < self.end && end > self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub owner: IntervalId,
    pub start: Timestamp,
    pub end: Timestamp,
}

impl Segment {
    pub fn matches(&self, start: Timestamp, end: Timestamp) -> bool {
        self.start == start && self.end == end
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditPolicy {
    /// Reproduce the observed behavior: trailing partial hours are dropped
    /// and hour moves wrap at midnight without carrying the date.
    #[default]
    Legacy,
    /// Keep remainders, carry dates across midnight and reject edits that
    /// would overlap another interval.
    Strict,
}

impl EditPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            EditPolicy::Legacy => "legacy",
            EditPolicy::Strict => "strict",
        }
    }
}

/// The interval collection together with its id allocator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalSet {
    intervals: Vec<Interval>,
    next_id: u64,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, start: Timestamp, end: Timestamp, label: impl Into<String>) -> IntervalId {
        let id = self.allocate_id();
        self.intervals.push(Interval {
            id,
            start,
            end,
            label: label.into(),
        });
        id
    }

    pub fn allocate_id(&mut self) -> IntervalId {
        let id = IntervalId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn find(&self, id: IntervalId) -> Option<&Interval> {
        self.intervals.iter().find(|interval| interval.id == id)
    }

    pub fn position(&self, id: IntervalId) -> Option<usize> {
        self.intervals.iter().position(|interval| interval.id == id)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Interval> {
        self.intervals.iter()
    }

    pub fn as_slice(&self) -> &[Interval] {
        &self.intervals
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// First interval overlapping `[start, end)`, ignoring `skip`.
    pub fn overlapping(
        &self,
        start: Timestamp,
        end: Timestamp,
        skip: Option<IntervalId>,
    ) -> Option<&Interval> {
        self.intervals
            .iter()
            .filter(|interval| Some(interval.id) != skip)
            .find(|interval| interval.overlaps(start, end))
    }

    /// Every overlapping pair, by id, in collection order.
    pub fn overlapping_pairs(&self) -> Vec<(IntervalId, IntervalId)> {
        let mut pairs = Vec::new();
        for (index, left) in self.intervals.iter().enumerate() {
            for right in &self.intervals[index + 1..] {
                if left.overlaps(right.start, right.end) {
                    pairs.push((left.id, right.id));
                }
            }
        }
        pairs
    }

    pub(crate) fn splice(&mut self, index: usize, replacement: Vec<Interval>) {
        self.intervals.splice(index..=index, replacement);
    }

    pub(crate) fn retain_valid(&mut self) -> usize {
        let before = self.intervals.len();
        self.intervals.retain(Interval::is_valid);
        before - self.intervals.len()
    }

    pub(crate) fn interval_mut(&mut self, index: usize) -> Option<&mut Interval> {
        self.intervals.get_mut(index)
    }

    pub(crate) fn remove(&mut self, id: IntervalId) -> Option<Interval> {
        let index = self.position(id)?;
        Some(self.intervals.remove(index))
    }
}

impl<'a> IntoIterator for &'a IntervalSet {
    type Item = &'a Interval;
    type IntoIter = std::slice::Iter<'a, Interval>;

    fn into_iter(self) -> Self::IntoIter {
        self.intervals.iter()
    }
}

#[cfg(test)]
pub(crate) fn at(input: &str) -> Timestamp {
    NaiveDateTime::parse_from_str(input, "%Y-%m-%dT%H:%M").expect("valid test timestamp")
}
