use chrono::Duration;

use crate::slots::model::{EditPolicy, Interval, IntervalId, IntervalSet, Segment, TimeRange};

pub const DEFAULT_GRANULARITY_MINUTES: i64 = 60;

#[derive(Debug, Clone, Copy)]
pub struct Segmenter {
    pub granularity: Duration,
    pub policy: EditPolicy,
}

impl Default for Segmenter {
    fn default() -> Self {
        Self {
            granularity: Duration::minutes(DEFAULT_GRANULARITY_MINUTES),
            policy: EditPolicy::Legacy,
        }
    }
}

impl Segmenter {
    pub fn new(granularity: Duration, policy: EditPolicy) -> Self {
        Self {
            granularity,
            policy,
        }
    }

    /// Split an interval into consecutive granularity-sized segments.
    ///
    /// Under [`EditPolicy::Legacy`] a trailing piece shorter than the
    /// granularity is not emitted, so `[01:00, 02:30)` yields only
    /// `[01:00, 02:00)`. [`EditPolicy::Strict`] emits the remainder.
    pub fn segment(&self, interval: &Interval) -> Vec<Segment> {
        let mut segments = Vec::new();
        if self.granularity <= Duration::zero() {
            return segments;
        }

        let mut cursor = interval.start;
        while cursor < interval.end {
            // Stepping past the representable range counts as overshooting the end.
            let Some(next) = cursor
                .checked_add_signed(self.granularity)
                .filter(|next| *next <= interval.end)
            else {
                if self.policy == EditPolicy::Strict {
                    segments.push(Segment {
                        owner: interval.id,
                        start: cursor,
                        end: interval.end,
                    });
                }
                break;
            };
            segments.push(Segment {
                owner: interval.id,
                start: cursor,
                end: next,
            });
            cursor = next;
        }
        segments
    }

    pub fn segment_all(&self, set: &IntervalSet) -> Vec<(IntervalId, Vec<Segment>)> {
        set.iter()
            .map(|interval| (interval.id, self.segment(interval)))
            .collect()
    }
}

/// Coalesce segments whose boundaries touch exactly into maximal ranges.
pub fn merge_continuous(mut segments: Vec<Segment>) -> Vec<TimeRange> {
    segments.sort_by_key(|segment| segment.start);

    let mut merged = Vec::new();
    let mut current: Option<TimeRange> = None;
    for segment in segments {
        if let Some(range) = current.as_mut()
            && range.end == segment.start
        {
            range.end = segment.end;
            continue;
        }
        let next = TimeRange {
            start: segment.start,
            end: segment.end,
        };
        if let Some(range) = current.replace(next) {
            merged.push(range);
        }
    }

    if let Some(range) = current {
        merged.push(range);
    }
    merged
}
