//! Frame fixtures and a recording sink shared by unit tests, integration tests and benches.

#![cfg(any(test, feature = "benchmark"))]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::Result;
use crate::codec;
use crate::sink::{RawFrameSink, RawStationDataFrame};
use crate::types::{ChannelDescription, ChannelSubframe, DataFrame, Frame, FrameHeader, JulianTimestamp};

/// Nominal time of sequence number 0 in generated data frames.
pub const BASE_TIME_MILLIS: i64 = 1_700_000_000_000;

/// Length of each generated data frame.
pub const FRAME_LENGTH: Duration = Duration::from_secs(10);

/// A 40 Hz `s4` subframe of `samples` zero-valued samples.
pub fn sample_subframe(site: &str, channel: &str, start: JulianTimestamp, samples: u32) -> ChannelSubframe {
    ChannelSubframe {
        description: ChannelDescription {
            site: site.to_string(),
            channel: channel.to_string(),
            data_type: "s4".to_string(),
            calibration_factor: 1.0,
            calibration_period: 1.0,
            ..Default::default()
        },
        timestamp: start,
        time_length_ms: samples * 25,
        samples,
        status: Bytes::from_static(&[0, 0, 0, 0]),
        data: Bytes::from(vec![0u8; samples as usize * 4]),
        ..Default::default()
    }
}

/// Data frame `seq` of a three-channel station, timed so consecutive frames abut.
pub fn sample_data_frame(station: &str, seq: u64) -> Frame {
    let offset = i64::try_from(seq).unwrap_or(i64::MAX).saturating_mul(FRAME_LENGTH.as_millis() as i64);
    let start = JulianTimestamp::from_unix_millis(BASE_TIME_MILLIS.saturating_add(offset)).unwrap_or_default();
    let site: String = station.chars().take(5).collect();
    let subframes = ["BHZ", "BHN", "BHE"].iter().map(|chan| sample_subframe(&site, chan, start, 400)).collect();
    let body = DataFrame { frame_time_length_ms: FRAME_LENGTH.as_millis() as u32, nominal_time: start, subframes };
    Frame::new(FrameHeader::new(station, "0", seq), body)
}

/// Wire bytes of [`sample_data_frame`].
pub fn encoded_data_frame(station: &str, seq: u64) -> Bytes {
    codec::encode(&sample_data_frame(station, seq)).unwrap_or_default()
}

/// Sink that keeps everything it is given.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    frames: Arc<Mutex<Vec<RawStationDataFrame>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<RawStationDataFrame> {
        self.frames.lock().clone()
    }

    pub fn sequence_numbers(&self) -> Vec<u64> {
        self.frames.lock().iter().map(|f| f.sequence_number).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl RawFrameSink for RecordingSink {
    async fn store(&self, frame: RawStationDataFrame) -> Result<()> {
        self.frames.lock().push(frame);
        Ok(())
    }
}
