//! Stream control bodies: acknowledgments and alerts.

use crate::gap_list::SequenceRange;

/// Width of the frameset name carried in an acknowledgment.
pub const FRAMESET_LEN: usize = 20;

/// Receiver state reported back to the data provider.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Acknowledgment {
    /// `creator:destination` of the acknowledged frame set.
    pub frameset_acked: String,
    /// `None` until the first data frame arrives.
    pub lowest_seq: Option<u64>,
    /// Highest contiguous sequence number received.
    pub highest_seq: Option<u64>,
    pub gaps: Vec<SequenceRange>,
}

impl Acknowledgment {
    pub fn frameset_name(creator: &str, destination: &str) -> String {
        format!("{creator}:{destination}")
    }
}

/// Free-text notice; receipt ends the stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Alert {
    pub message: String,
}

impl Alert {
    pub const SHUTDOWN: &'static str = "Shutting down.";

    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    pub fn shutdown() -> Self {
        Self::new(Self::SHUTDOWN)
    }
}
