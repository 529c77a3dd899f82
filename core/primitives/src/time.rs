use borsh::{BorshDeserialize, BorshSerialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Timestamp of a record: milliseconds since the unix epoch, as assigned by
/// the sequencer when the record was appended. Partitions, retention and
/// rebuilding windows are all expressed in record timestamps.
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    BorshSerialize,
    BorshDeserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct RecordTimestamp(pub u64);

impl RecordTimestamp {
    pub const MIN: RecordTimestamp = RecordTimestamp(0);
    pub const MAX: RecordTimestamp = RecordTimestamp(u64::MAX);

    pub fn now() -> RecordTimestamp {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis();
        RecordTimestamp(ms as u64)
    }

    pub fn from_millis(ms: u64) -> RecordTimestamp {
        RecordTimestamp(ms)
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    /// Saturating addition; MAX is treated as infinity by window logic.
    pub fn saturating_add(self, d: Duration) -> RecordTimestamp {
        RecordTimestamp(self.0.saturating_add(d.as_millis() as u64))
    }

    pub fn saturating_sub(self, d: Duration) -> RecordTimestamp {
        RecordTimestamp(self.0.saturating_sub(d.as_millis() as u64))
    }
}

impl fmt::Debug for RecordTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == RecordTimestamp::MAX {
            write!(f, "+inf")
        } else if *self == RecordTimestamp::MIN {
            write!(f, "-inf")
        } else {
            write!(f, "{}ms", self.0)
        }
    }
}

impl fmt::Display for RecordTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A half-open time interval `[start, end)`. An interval with
/// `start >= end` is empty.
#[derive(
    Copy, Clone, PartialEq, Eq, Debug, Hash, BorshSerialize, BorshDeserialize,
    serde::Serialize, serde::Deserialize,
)]
pub struct RecordTimeInterval {
    pub start: RecordTimestamp,
    pub end: RecordTimestamp,
}

impl RecordTimeInterval {
    pub fn new(start: RecordTimestamp, end: RecordTimestamp) -> RecordTimeInterval {
        RecordTimeInterval { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, ts: RecordTimestamp) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn intersects(&self, other: &RecordTimeInterval) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end && other.start < self.end
    }
}

/// Checks whether any interval in `intervals` intersects `[min, max]`
/// (a closed range, as reported by partition boundaries).
pub fn intervals_intersect_range(
    intervals: &[RecordTimeInterval],
    min: RecordTimestamp,
    max: RecordTimestamp,
) -> bool {
    let probe = RecordTimeInterval::new(min, RecordTimestamp(max.0.saturating_add(1)));
    intervals.iter().any(|i| i.intersects(&probe))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_intersection() {
        let i = RecordTimeInterval::new(RecordTimestamp(100), RecordTimestamp(200));
        assert!(i.contains(RecordTimestamp(100)));
        assert!(!i.contains(RecordTimestamp(200)));
        assert!(i.intersects(&RecordTimeInterval::new(RecordTimestamp(199), RecordTimestamp(500))));
        assert!(!i.intersects(&RecordTimeInterval::new(RecordTimestamp(200), RecordTimestamp(500))));
        assert!(RecordTimeInterval::new(RecordTimestamp(5), RecordTimestamp(5)).is_empty());
    }

    #[test]
    fn range_probe_is_inclusive() {
        let ranges = [RecordTimeInterval::new(RecordTimestamp(100), RecordTimestamp(200))];
        assert!(intervals_intersect_range(&ranges, RecordTimestamp(200), RecordTimestamp(300)) == false);
        assert!(intervals_intersect_range(&ranges, RecordTimestamp(199), RecordTimestamp(199)));
        assert!(intervals_intersect_range(&ranges, RecordTimestamp(0), RecordTimestamp(100)));
    }
}
