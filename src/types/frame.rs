//! Frame envelope: header, typed body, trailer.

use bytes::Bytes;

use super::{Acknowledgment, Alert, ConnectionRequest, ConnectionResponse, DataFrame, FrameOption};

/// Wire code of each frame kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FrameType {
    ConnectionRequest = 1,
    ConnectionResponse = 2,
    OptionRequest = 3,
    OptionResponse = 4,
    Data = 5,
    Acknowledgment = 6,
    Alert = 7,
}

impl FrameType {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => FrameType::ConnectionRequest,
            2 => FrameType::ConnectionResponse,
            3 => FrameType::OptionRequest,
            4 => FrameType::OptionResponse,
            5 => FrameType::Data,
            6 => FrameType::Acknowledgment,
            7 => FrameType::Alert,
            _ => return None,
        })
    }

    /// Frame kinds that travel on the negotiated stream rather than the handshake datagrams.
    pub fn is_streaming(self) -> bool {
        matches!(self, FrameType::Data | FrameType::Acknowledgment | FrameType::Alert)
    }
}

/// Header fields a caller controls.
///
/// Frame type and trailer offset are derived from the body at encode time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrameHeader {
    /// Up to 8 bytes.
    pub creator: String,
    /// Up to 8 bytes.
    pub destination: String,
    pub sequence_number: u64,
    pub series: u32,
}

impl FrameHeader {
    pub fn new(creator: impl Into<String>, destination: impl Into<String>, sequence_number: u64) -> Self {
        Self { creator: creator.into(), destination: destination.into(), sequence_number, series: 0 }
    }
}

/// Authentication fields of the trailer. The checksum is computed, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrameTrailer {
    pub auth_key_id: u32,
    /// Signature bytes, unpadded. Empty when the frame is unsigned.
    pub auth_value: Bytes,
}

/// Kind-specific frame payload.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    ConnectionRequest(ConnectionRequest),
    ConnectionResponse(ConnectionResponse),
    OptionRequest(Vec<FrameOption>),
    OptionResponse(Vec<FrameOption>),
    Data(DataFrame),
    Acknowledgment(Acknowledgment),
    Alert(Alert),
}

impl FrameBody {
    pub fn frame_type(&self) -> FrameType {
        match self {
            FrameBody::ConnectionRequest(_) => FrameType::ConnectionRequest,
            FrameBody::ConnectionResponse(_) => FrameType::ConnectionResponse,
            FrameBody::OptionRequest(_) => FrameType::OptionRequest,
            FrameBody::OptionResponse(_) => FrameType::OptionResponse,
            FrameBody::Data(_) => FrameType::Data,
            FrameBody::Acknowledgment(_) => FrameType::Acknowledgment,
            FrameBody::Alert(_) => FrameType::Alert,
        }
    }
}

/// One CD-1.1 protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: FrameBody,
    pub trailer: FrameTrailer,
}

impl Frame {
    /// An unsigned frame.
    pub fn new(header: FrameHeader, body: impl Into<FrameBody>) -> Self {
        Self { header, body: body.into(), trailer: FrameTrailer::default() }
    }

    pub fn with_auth(mut self, auth_key_id: u32, auth_value: impl Into<Bytes>) -> Self {
        self.trailer = FrameTrailer { auth_key_id, auth_value: auth_value.into() };
        self
    }

    pub fn frame_type(&self) -> FrameType {
        self.body.frame_type()
    }

    pub fn sequence_number(&self) -> u64 {
        self.header.sequence_number
    }

    pub fn as_data(&self) -> Option<&DataFrame> {
        match &self.body {
            FrameBody::Data(data) => Some(data),
            _ => None,
        }
    }
}

impl From<ConnectionRequest> for FrameBody {
    fn from(body: ConnectionRequest) -> Self {
        FrameBody::ConnectionRequest(body)
    }
}

impl From<ConnectionResponse> for FrameBody {
    fn from(body: ConnectionResponse) -> Self {
        FrameBody::ConnectionResponse(body)
    }
}

impl From<DataFrame> for FrameBody {
    fn from(body: DataFrame) -> Self {
        FrameBody::Data(body)
    }
}

impl From<Acknowledgment> for FrameBody {
    fn from(body: Acknowledgment) -> Self {
        FrameBody::Acknowledgment(body)
    }
}

impl From<Alert> for FrameBody {
    fn from(body: Alert) -> Self {
        FrameBody::Alert(body)
    }
}
