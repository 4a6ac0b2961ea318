//! CD-1.1 frame model.
//!
//! A [`Frame`] is a header, a [`FrameBody`] tagged by kind, and a trailer. Fields that
//! the wire derives from others (frame type, trailer offset, padded sizes, channel
//! counts, the checksum) are not stored: the codec computes them on encode and checks
//! them on decode, so a decoded frame compares equal to the one that was encoded.
//!
//! ## Usage Example
//!
//! ```rust
//! use cd11_ingest::types::{Alert, Frame, FrameHeader, FrameType};
//!
//! let frame = Frame::new(FrameHeader::new("ARCES", "0", 1), Alert::new("Shutting down."));
//! assert_eq!(frame.frame_type(), FrameType::Alert);
//! ```

mod control;
mod data;
mod frame;
mod handshake;
mod timestamp;

pub use control::{Acknowledgment, Alert, FRAMESET_LEN};
pub use data::{ChannelDescription, ChannelSubframe, DataFrame};
pub use frame::{Frame, FrameBody, FrameHeader, FrameTrailer, FrameType};
pub use handshake::{
    ConnectionRequest, ConnectionResponse, FrameOption, OPTION_STATION_NAME, ProtocolVersion, ServiceType,
};
pub use timestamp::{JulianTimestamp, TIMESTAMP_LEN};
