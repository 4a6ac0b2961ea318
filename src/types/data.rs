//! Data frame bodies: channel subframe header plus one subframe per channel.

use std::time::Duration;

use bytes::Bytes;

use super::JulianTimestamp;

/// Fixed 24-byte description preceding each channel's samples.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChannelDescription {
    pub authenticated: bool,
    /// Compression applied to the data field, 0 for none.
    pub transformation: u8,
    pub sensor_type: u8,
    pub calibration: bool,
    /// Up to 5 bytes.
    pub site: String,
    /// Up to 3 bytes.
    pub channel: String,
    /// Up to 2 bytes.
    pub location: String,
    /// CSS 3.0 data type, e.g. `s4`.
    pub data_type: String,
    pub calibration_factor: f32,
    pub calibration_period: f32,
}

impl ChannelDescription {
    /// `SITE.CHAN` or `SITE.CHAN.LOC` when a location code is present.
    pub fn channel_id(&self) -> String {
        if self.location.is_empty() {
            format!("{}.{}", self.site, self.channel)
        } else {
            format!("{}.{}.{}", self.site, self.channel, self.location)
        }
    }
}

/// One channel's samples within a data frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChannelSubframe {
    pub description: ChannelDescription,
    /// Time of the first sample.
    pub timestamp: JulianTimestamp,
    pub time_length_ms: u32,
    pub samples: u32,
    pub status: Bytes,
    pub data: Bytes,
    /// Digitizer-assigned counter, zero when unsupported.
    pub subframe_count: u32,
    pub auth_key_id: u32,
    pub auth_value: Bytes,
}

impl ChannelSubframe {
    /// Samples per second, `None` for a zero-length subframe.
    pub fn sample_rate(&self) -> Option<f64> {
        (self.time_length_ms > 0).then(|| f64::from(self.samples) * 1000.0 / f64::from(self.time_length_ms))
    }

    /// Time of the last sample: one sample period before the subframe's nominal end.
    pub fn end_time(&self) -> JulianTimestamp {
        let length = Duration::from_millis(u64::from(self.time_length_ms));
        let period = match self.sample_rate() {
            Some(rate) if rate > 0.0 => Duration::from_secs_f64(1.0 / rate),
            _ => Duration::ZERO,
        };
        self.timestamp.saturating_add(length.saturating_sub(period))
    }
}

/// Body of a data frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataFrame {
    pub frame_time_length_ms: u32,
    pub nominal_time: JulianTimestamp,
    pub subframes: Vec<ChannelSubframe>,
}

impl DataFrame {
    /// Channel identifiers in subframe order.
    pub fn channel_ids(&self) -> Vec<String> {
        self.subframes.iter().map(|s| s.description.channel_id()).collect()
    }

    /// Nominal start and end of the frame.
    pub fn time_bounds(&self) -> (JulianTimestamp, JulianTimestamp) {
        let end = self.nominal_time.saturating_add(Duration::from_millis(u64::from(self.frame_time_length_ms)));
        (self.nominal_time, end)
    }
}
