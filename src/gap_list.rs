//! Missing sequence-number bookkeeping for one station stream.
//!
//! A [`GapList`] holds ascending, disjoint, non-adjacent inclusive ranges. Every
//! mutation restores that shape before returning, so a snapshot can be written
//! straight into an acknowledgment frame.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

/// Inclusive range of sequence numbers, `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceRange {
    start: u64,
    end: u64,
}

impl SequenceRange {
    /// Returns `None` when `start > end`.
    pub fn new(start: u64, end: u64) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn single(seq: u64) -> Self {
        Self { start: seq, end: seq }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn contains(&self, seq: u64) -> bool {
        self.start <= seq && seq <= self.end
    }

    /// Number of sequence numbers covered, saturating for the full `u64` span.
    pub fn len(&self) -> u64 {
        (self.end - self.start).saturating_add(1)
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl fmt::Display for SequenceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    end: u64,
    touched: Instant,
}

/// Ordered set of missing sequence ranges.
#[derive(Debug, Clone, Default)]
pub struct GapList {
    // keyed by range start
    ranges: BTreeMap<u64, Entry>,
}

impl GapList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `range` into the set, coalescing anything it overlaps or touches.
    pub fn insert(&mut self, range: SequenceRange) {
        let mut start = range.start;
        let mut end = range.end;

        let merged: Vec<u64> = self
            .ranges
            .range(..=end.saturating_add(1))
            .rev()
            .take_while(|(_, entry)| entry.end >= start.saturating_sub(1))
            .map(|(&s, _)| s)
            .collect();

        for key in merged {
            if let Some(entry) = self.ranges.remove(&key) {
                start = start.min(key);
                end = end.max(entry.end);
            }
        }

        self.ranges.insert(start, Entry { end, touched: Instant::now() });
    }

    /// Remove `seq`, splitting the range that holds it.
    ///
    /// Returns `true` when `seq` was a gap member.
    pub fn remove(&mut self, seq: u64) -> bool {
        let Some((&start, &entry)) = self.ranges.range(..=seq).next_back() else {
            return false;
        };
        if entry.end < seq {
            return false;
        }

        self.ranges.remove(&start);
        let now = Instant::now();
        if start < seq {
            self.ranges.insert(start, Entry { end: seq - 1, touched: now });
        }
        if seq < entry.end {
            self.ranges.insert(seq + 1, Entry { end: entry.end, touched: now });
        }
        true
    }

    /// Remove every member of `range`, trimming or splitting ranges that straddle it.
    ///
    /// Returns how many sequence numbers were removed, saturating.
    pub fn remove_range(&mut self, range: SequenceRange) -> u64 {
        let overlapping: Vec<(u64, Entry)> = self
            .ranges
            .range(..=range.end)
            .rev()
            .take_while(|(_, entry)| entry.end >= range.start)
            .map(|(&s, &e)| (s, e))
            .collect();

        let now = Instant::now();
        let mut removed = 0u64;
        for (start, entry) in overlapping {
            self.ranges.remove(&start);
            let cut = SequenceRange { start: start.max(range.start), end: entry.end.min(range.end) };
            removed = removed.saturating_add(cut.len());
            if start < range.start {
                self.ranges.insert(start, Entry { end: range.start - 1, touched: now });
            }
            if entry.end > range.end {
                self.ranges.insert(range.end + 1, Entry { end: entry.end, touched: now });
            }
        }
        removed
    }

    pub fn contains(&self, seq: u64) -> bool {
        self.ranges.range(..=seq).next_back().is_some_and(|(_, entry)| entry.end >= seq)
    }

    /// Ordered copy of the current ranges.
    pub fn snapshot(&self) -> Vec<SequenceRange> {
        self.iter().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = SequenceRange> + '_ {
        self.ranges.iter().map(|(&start, entry)| SequenceRange { start, end: entry.end })
    }

    /// Number of disjoint ranges.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total count of missing sequence numbers, saturating.
    pub fn missing(&self) -> u64 {
        self.iter().fold(0u64, |acc, r| acc.saturating_add(r.len()))
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Drop ranges untouched for longer than `max_age`. Returns how many were dropped.
    ///
    /// Only called when gap expiry is configured.
    pub fn expire_older_than(&mut self, max_age: Duration) -> usize {
        let now = Instant::now();
        let before = self.ranges.len();
        self.ranges.retain(|_, entry| now.saturating_duration_since(entry.touched) <= max_age);
        before - self.ranges.len()
    }
}

impl PartialEq for GapList {
    fn eq(&self, other: &Self) -> bool {
        self.iter().eq(other.iter())
    }
}

impl Eq for GapList {}

impl FromIterator<SequenceRange> for GapList {
    fn from_iter<I: IntoIterator<Item = SequenceRange>>(iter: I) -> Self {
        let mut list = GapList::new();
        for range in iter {
            list.insert(range);
        }
        list
    }
}
