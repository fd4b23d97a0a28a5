use std::fmt;

use chrono::{NaiveDate, Timelike};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::slots::error::SlotError;
use crate::slots::model::{EditPolicy, Interval, IntervalId, IntervalSet, Timestamp, TimeRange};
use crate::slots::segmenter::{Segmenter, merge_continuous};

/// One edit made on the segment view of an interval. A segment is named by
/// its owner and its exact `[start, end)` bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    MoveDate {
        owner: IntervalId,
        start: Timestamp,
        end: Timestamp,
        date: NaiveDate,
    },
    MoveHour {
        owner: IntervalId,
        start: Timestamp,
        end: Timestamp,
        hour: u32,
    },
    DeleteSegment {
        owner: IntervalId,
        start: Timestamp,
        end: Timestamp,
    },
    DeleteInterval {
        owner: IntervalId,
    },
}

impl Command {
    pub fn owner(&self) -> IntervalId {
        match self {
            Command::MoveDate { owner, .. }
            | Command::MoveHour { owner, .. }
            | Command::DeleteSegment { owner, .. }
            | Command::DeleteInterval { owner } => *owner,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "owner", rename_all = "snake_case")]
pub enum IgnoreReason {
    UnknownInterval(IntervalId),
    UnknownSegment(IntervalId),
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnoreReason::UnknownInterval(owner) => write!(f, "interval {owner} no longer exists"),
            IgnoreReason::UnknownSegment(owner) => {
                write!(f, "interval {owner} has no matching segment")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Changed(IntervalSet),
    Ignored(IgnoreReason),
}

/// Apply one edit to a collection and return the recomputed collection.
///
/// Edits that reference an interval or segment that no longer exists are
/// ignored rather than reported. Intervals left with `start >= end` are
/// dropped before returning.
pub fn apply(
    set: &IntervalSet,
    command: &Command,
    segmenter: &Segmenter,
) -> Result<Applied, SlotError> {
    let owner = command.owner();
    let Some(index) = set.position(owner) else {
        debug!("ignoring edit for unknown interval {owner}");
        return Ok(Applied::Ignored(IgnoreReason::UnknownInterval(owner)));
    };

    let mut next = set.clone();
    let found = match command {
        Command::DeleteInterval { .. } => {
            next.splice(index, Vec::new());
            true
        }
        Command::DeleteSegment { start, end, .. } => {
            delete_segment(&mut next, index, segmenter, *start, *end)
        }
        Command::MoveDate {
            start, end, date, ..
        } => {
            let target = moved_to_date(*start, *end, *date, segmenter.policy);
            move_segment(&mut next, index, segmenter, *start, *end, target)
        }
        Command::MoveHour {
            start, end, hour, ..
        } => {
            let target = moved_to_hour(*start, *end, *hour, segmenter.policy)?;
            move_segment(&mut next, index, segmenter, *start, *end, target)
        }
    };

    if !found {
        debug!("ignoring edit for unknown segment of interval {owner}");
        return Ok(Applied::Ignored(IgnoreReason::UnknownSegment(owner)));
    }

    let discarded = next.retain_valid();
    if discarded > 0 {
        debug!("discarded {discarded} empty interval(s) after edit of {owner}");
    }

    check_overlaps(set, &next, owner, segmenter.policy)?;
    Ok(Applied::Changed(next))
}

fn delete_segment(
    set: &mut IntervalSet,
    index: usize,
    segmenter: &Segmenter,
    start: Timestamp,
    end: Timestamp,
) -> bool {
    let Some(interval) = set.as_slice().get(index).cloned() else {
        return false;
    };

    let segments = segmenter.segment(&interval);
    let before = segments.len();
    let remaining = segments
        .into_iter()
        .filter(|segment| !segment.matches(start, end))
        .collect::<Vec<_>>();
    if remaining.len() == before {
        return false;
    }

    let mut pieces = Vec::new();
    for (position, range) in merge_continuous(remaining).into_iter().enumerate() {
        let id = if position == 0 {
            interval.id
        } else {
            set.allocate_id()
        };
        pieces.push(Interval {
            id,
            start: range.start,
            end: range.end,
            label: interval.label.clone(),
        });
    }
    set.splice(index, pieces);
    true
}

fn move_segment(
    set: &mut IntervalSet,
    index: usize,
    segmenter: &Segmenter,
    start: Timestamp,
    end: Timestamp,
    target: TimeRange,
) -> bool {
    let Some(interval) = set.interval_mut(index) else {
        return false;
    };

    let mut segments = segmenter.segment(interval);
    let Some(slot) = segments
        .iter()
        .position(|segment| segment.matches(start, end))
    else {
        return false;
    };
    segments[slot].start = target.start;
    segments[slot].end = target.end;
    segments.sort_by_key(|segment| segment.start);

    if let (Some(first), Some(last)) = (segments.first(), segments.last()) {
        interval.start = first.start;
        interval.end = last.end;
    }
    true
}

/// Keep the segment's time of day and replace its calendar date.
fn moved_to_date(
    start: Timestamp,
    end: Timestamp,
    date: NaiveDate,
    policy: EditPolicy,
) -> TimeRange {
    let new_start = date.and_time(start.time());
    let new_end = match policy {
        EditPolicy::Legacy => date.and_time(end.time()),
        EditPolicy::Strict => new_start + (end - start),
    };
    TimeRange {
        start: new_start,
        end: new_end,
    }
}

/// Keep the segment's date and replace its hour of day. Under legacy the
/// end hour wraps to `(hour + 1) % 24` on the same date.
fn moved_to_hour(
    start: Timestamp,
    end: Timestamp,
    hour: u32,
    policy: EditPolicy,
) -> Result<TimeRange, SlotError> {
    if hour > 23 {
        return Err(SlotError::InvalidHour(hour));
    }
    let new_start = start.with_hour(hour).ok_or(SlotError::InvalidHour(hour))?;
    let new_end = match policy {
        EditPolicy::Legacy => start
            .date()
            .and_time(end.time())
            .with_hour((hour + 1) % 24)
            .ok_or(SlotError::InvalidHour(hour))?,
        EditPolicy::Strict => new_start + (end - start),
    };
    Ok(TimeRange {
        start: new_start,
        end: new_end,
    })
}

fn check_overlaps(
    before: &IntervalSet,
    after: &IntervalSet,
    owner: IntervalId,
    policy: EditPolicy,
) -> Result<(), SlotError> {
    let touched = |id: IntervalId| id == owner || before.find(id).is_none();

    for (left, right) in after.overlapping_pairs() {
        let (moved, other) = match (touched(left), touched(right)) {
            (true, _) => (left, right),
            (false, true) => (right, left),
            (false, false) => continue,
        };
        let Some(moved) = after.find(moved) else {
            continue;
        };

        match policy {
            EditPolicy::Strict => {
                return Err(SlotError::Overlap {
                    start: moved.start,
                    end: moved.end,
                    existing: other,
                });
            }
            EditPolicy::Legacy => {
                warn!(
                    "edit left interval {} overlapping interval {}",
                    moved.id, other
                );
            }
        }
    }
    Ok(())
}
