use thiserror::Error;

use crate::slots::model::{IntervalId, Timestamp};

#[derive(Debug, Error)]
pub enum SlotError {
    #[error("interval {start} - {end} overlaps existing interval {existing}")]
    Overlap {
        start: Timestamp,
        end: Timestamp,
        existing: IntervalId,
    },
    #[error("interval start {start} must be before end {end}")]
    InvalidRange { start: Timestamp, end: Timestamp },
    #[error("hour {0} is out of range; expected 0-23")]
    InvalidHour(u32),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
