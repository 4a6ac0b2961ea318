//! Connection and option exchange bodies.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Option type carrying the responder's station name.
pub const OPTION_STATION_NAME: u32 = 1;

/// CD-1.1 protocol version advertised in the connection exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const CD_1_1: Self = Self { major: 1, minor: 1 };
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CD_1_1
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Transport used for the negotiated data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceType {
    #[default]
    Tcp,
    Udp,
}

impl ServiceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceType::Tcp => "TCP",
            ServiceType::Udp => "UDP",
        }
    }
}

impl FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TCP" => Ok(ServiceType::Tcp),
            "UDP" => Ok(ServiceType::Udp),
            other => Err(format!("unknown service type {other:?}")),
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sent by the data consumer to the connection manager over UDP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub version: ProtocolVersion,
    /// Up to 8 bytes.
    pub station_name: String,
    /// Up to 4 bytes, e.g. `IDC`.
    pub station_type: String,
    pub service_type: ServiceType,
    /// Where the requester listens.
    pub endpoint: SocketAddrV4,
    /// Encoded as all zeros when absent.
    pub secondary: Option<SocketAddrV4>,
}

/// Answer from the connection manager naming the data provider's endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionResponse {
    pub version: ProtocolVersion,
    /// Up to 8 bytes.
    pub responder_name: String,
    /// Up to 4 bytes.
    pub responder_type: String,
    pub service_type: ServiceType,
    pub endpoint: SocketAddrV4,
    pub secondary: Option<SocketAddrV4>,
}

impl ConnectionResponse {
    /// A response for a station the manager refuses to serve.
    pub fn rejection(version: ProtocolVersion, responder_name: impl Into<String>, responder_type: impl Into<String>) -> Self {
        Self {
            version,
            responder_name: responder_name.into(),
            responder_type: responder_type.into(),
            service_type: ServiceType::Tcp,
            endpoint: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            secondary: None,
        }
    }

    /// The manager signals refusal with an unspecified address or a zero port.
    pub fn is_rejection(&self) -> bool {
        self.endpoint.ip().is_unspecified() || self.endpoint.port() == 0
    }
}

/// One entry of an option request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameOption {
    pub option_type: u32,
    /// Unpadded value bytes.
    pub value: Bytes,
}

impl FrameOption {
    pub fn new(option_type: u32, value: impl Into<Bytes>) -> Self {
        Self { option_type, value: value.into() }
    }

    pub fn station_name(name: &str) -> Self {
        Self::new(OPTION_STATION_NAME, Bytes::copy_from_slice(name.as_bytes()))
    }
}
