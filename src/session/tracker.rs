//! Sequence bookkeeping for one station stream.

use std::time::Duration;

use tracing::{debug, info};

use crate::gap_list::{GapList, SequenceRange};
use crate::types::Acknowledgment;

/// Whether a data frame's payload should be forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// First receipt of this sequence number.
    New,
    /// Already received, drop the payload.
    Duplicate,
}

/// Result of applying the provider's own acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderAck {
    Unchanged,
    /// Gaps below the provider's lowest retained frame were dropped.
    Trimmed(u64),
    /// The provider restarted its numbering; local state was cleared.
    Reset,
}

/// Highest sequence received plus the gaps below it.
///
/// The first data frame of a session establishes the baseline, so nothing before it
/// is ever reported missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceTracker {
    last_contiguous: Option<u64>,
    lowest: Option<u64>,
    gaps: GapList,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record receipt of `seq`.
    pub fn on_sequence(&mut self, seq: u64) -> Delivery {
        let Some(last) = self.last_contiguous else {
            self.last_contiguous = Some(seq);
            self.lowest = Some(seq);
            return Delivery::New;
        };

        if seq > last {
            if let Some(missing) = SequenceRange::new(last + 1, seq - 1) {
                self.gaps.insert(missing);
            }
            self.last_contiguous = Some(seq);
            return Delivery::New;
        }

        if self.gaps.remove(seq) {
            debug!(seq, "late frame filled a gap");
            Delivery::New
        } else {
            Delivery::Duplicate
        }
    }

    /// Highest sequence number received so far.
    pub fn last_contiguous(&self) -> Option<u64> {
        self.last_contiguous
    }

    pub fn lowest(&self) -> Option<u64> {
        self.lowest
    }

    pub fn gaps(&self) -> &GapList {
        &self.gaps
    }

    /// Snapshot for an outgoing acknowledgment frame.
    pub fn acknowledgment(&self, frameset_acked: String) -> Acknowledgment {
        Acknowledgment {
            frameset_acked,
            lowest_seq: self.lowest,
            highest_seq: self.last_contiguous,
            gaps: self.gaps.snapshot(),
        }
    }

    /// Apply an acknowledgment sent by the data provider.
    ///
    /// A provider whose highest sequence is below the first frame we received has
    /// restarted numbering. A provider whose lowest retained frame is above some of our
    /// gaps can never fill them.
    pub fn on_provider_ack(&mut self, ack: &Acknowledgment) -> ProviderAck {
        if let (Some(provider_high), Some(lowest)) = (ack.highest_seq, self.lowest) {
            if provider_high < lowest {
                info!(provider_high, lowest, "provider sequence numbering restarted");
                self.reset();
                return ProviderAck::Reset;
            }
        }

        match ack.lowest_seq {
            Some(provider_low) if provider_low > 0 => {
                let unrecoverable = SequenceRange::new(0, provider_low - 1);
                let trimmed = unrecoverable.map_or(0, |r| self.gaps.remove_range(r));
                if trimmed > 0 {
                    debug!(trimmed, provider_low, "dropped gaps the provider no longer holds");
                    ProviderAck::Trimmed(trimmed)
                } else {
                    ProviderAck::Unchanged
                }
            }
            _ => ProviderAck::Unchanged,
        }
    }

    pub fn expire_gaps(&mut self, max_age: Duration) -> usize {
        self.gaps.expire_older_than(max_age)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn range(start: u64, end: u64) -> SequenceRange {
        SequenceRange::new(start, end).unwrap()
    }

    fn feed(tracker: &mut SequenceTracker, seqs: &[u64]) -> Vec<Delivery> {
        seqs.iter().map(|&s| tracker.on_sequence(s)).collect()
    }

    #[test]
    fn in_order_delivery_leaves_no_gaps() {
        let mut tracker = SequenceTracker::new();
        let n = 500;
        for seq in 1..=n {
            assert_eq!(tracker.on_sequence(seq), Delivery::New);
        }
        assert!(tracker.gaps().is_empty());
        assert_eq!(tracker.last_contiguous(), Some(n));
    }

    #[test]
    fn gap_opens_then_fills() {
        let mut tracker = SequenceTracker::new();
        feed(&mut tracker, &[1, 2, 3, 6, 7]);
        assert_eq!(tracker.gaps().snapshot(), vec![range(4, 5)]);
        assert_eq!(tracker.last_contiguous(), Some(7));

        assert_eq!(tracker.on_sequence(4), Delivery::New);
        assert_eq!(tracker.on_sequence(5), Delivery::New);
        assert!(tracker.gaps().is_empty());
        assert_eq!(tracker.last_contiguous(), Some(7));
    }

    #[test]
    fn duplicates_are_flagged() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(feed(&mut tracker, &[3, 5, 5, 4, 4, 3]), vec![
            Delivery::New,
            Delivery::New,
            Delivery::Duplicate,
            Delivery::New,
            Delivery::Duplicate,
            Delivery::Duplicate,
        ]);
    }

    #[test]
    fn late_frame_splits_a_gap() {
        let mut tracker = SequenceTracker::new();
        feed(&mut tracker, &[1, 10, 5]);
        assert_eq!(tracker.gaps().snapshot(), vec![range(2, 4), range(6, 9)]);
    }

    #[test]
    fn acknowledgment_reflects_state() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.acknowledgment("A:0".into()).highest_seq, None);

        feed(&mut tracker, &[1, 2, 3, 6, 7]);
        let ack = tracker.acknowledgment("A:0".into());
        assert_eq!(ack.lowest_seq, Some(1));
        assert_eq!(ack.highest_seq, Some(7));
        assert_eq!(ack.gaps, vec![range(4, 5)]);
    }

    #[test]
    fn provider_restart_resets_state() {
        let mut tracker = SequenceTracker::new();
        feed(&mut tracker, &[100, 105]);
        let ack = Acknowledgment { highest_seq: Some(3), lowest_seq: Some(0), ..Default::default() };
        assert_eq!(tracker.on_provider_ack(&ack), ProviderAck::Reset);
        assert_eq!(tracker.last_contiguous(), None);

        assert_eq!(tracker.on_sequence(4), Delivery::New);
        assert!(tracker.gaps().is_empty());
    }

    #[test]
    fn provider_low_water_mark_trims_unfillable_gaps() {
        let mut tracker = SequenceTracker::new();
        feed(&mut tracker, &[1, 5, 10]);
        let ack = Acknowledgment { highest_seq: Some(10), lowest_seq: Some(4), ..Default::default() };
        // 2 and 3 are gone for good, the provider still holds 4
        assert_eq!(tracker.on_provider_ack(&ack), ProviderAck::Trimmed(2));
        assert_eq!(tracker.gaps().snapshot(), vec![range(4, 4), range(6, 9)]);
        assert_eq!(tracker.on_provider_ack(&ack), ProviderAck::Unchanged);
    }

    proptest! {
        #[test]
        fn any_arrival_order_forwards_each_sequence_once(
            seqs in Just((1u64..=60).collect::<Vec<_>>()).prop_shuffle(),
            repeats in prop::collection::vec(1u64..=60, 0..20),
        ) {
            let mut tracker = SequenceTracker::new();
            let mut forwarded = HashSet::new();

            let first = seqs[0];
            for &seq in seqs.iter().chain(repeats.iter()) {
                if tracker.on_sequence(seq) == Delivery::New {
                    prop_assert!(forwarded.insert(seq), "{} forwarded twice", seq);
                }
                let ranges = tracker.gaps().snapshot();
                for pair in ranges.windows(2) {
                    prop_assert!(pair[0].end() + 1 < pair[1].start());
                }
            }

            // everything at or above the first arrival was forwarded, nothing is missing
            let expected: HashSet<u64> = (first..=60).collect();
            prop_assert!(expected.is_subset(&forwarded));
            prop_assert!(tracker.gaps().is_empty());
            prop_assert_eq!(tracker.last_contiguous(), Some(60));
        }
    }
}
