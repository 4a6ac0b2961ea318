//! Receiver configuration.
//!
//! Loaded from YAML. Every field has a default so a file only needs the stations:
//!
//! ```yaml
//! connection_manager: "10.0.0.5:8041"
//! stations:
//!   - name: ARCES
//!   - name: SPITS
//!     service_type: UDP
//!     auth_key_id: 7
//! ```

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::KeyAllowList;
use crate::types::{ProtocolVersion, ServiceType};
use crate::{Cd11Error, Result};

const NAME_WIDTH: usize = 8;
const TYPE_WIDTH: usize = 4;

/// Settings for a data consumer handling many stations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReceiverConfig {
    /// UDP address of the connection manager.
    pub connection_manager: SocketAddr,
    /// Address advertised in connection requests.
    pub consumer_address: Ipv4Addr,
    pub consumer_port: u16,
    pub handshake_timeout_ms: u64,
    /// A stream silent this long is considered expired.
    pub read_timeout_ms: u64,
    pub ack_interval_ms: u64,
    pub forward_queue_capacity: usize,
    /// How long a full forward queue may block the receive loop before evicting.
    pub forward_block_ms: u64,
    /// Carry sequence state over to a station's next session.
    pub resume_gap_state: bool,
    /// Drop gap ranges untouched for this long. Off when absent.
    pub gap_expiration_secs: Option<u64>,
    /// Enforce trailer authentication. Off when absent.
    pub authentication: Option<KeyAllowList>,
    pub stations: Vec<StationConfig>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            connection_manager: SocketAddr::from(([127, 0, 0, 1], 8041)),
            consumer_address: Ipv4Addr::LOCALHOST,
            consumer_port: 0,
            handshake_timeout_ms: 10_000,
            read_timeout_ms: 120_000,
            ack_interval_ms: 5_000,
            forward_queue_capacity: 1024,
            forward_block_ms: 100,
            resume_gap_state: false,
            gap_expiration_secs: None,
            authentication: None,
            stations: Vec::new(),
        }
    }
}

/// Identity a station presents during the connection exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StationConfig {
    pub name: String,
    pub station_type: String,
    pub service_type: ServiceType,
    pub frame_creator: String,
    pub frame_destination: String,
    pub auth_key_id: u32,
    pub protocol: ProtocolVersion,
    /// Run the option request/response sub-exchange before opening the stream.
    pub request_options: bool,
    /// Overrides the receiver-wide connection manager.
    pub connection_manager: Option<SocketAddr>,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            station_type: "IDC".to_string(),
            service_type: ServiceType::Tcp,
            frame_creator: "TEST".to_string(),
            frame_destination: "0".to_string(),
            auth_key_id: 0,
            protocol: ProtocolVersion::CD_1_1,
            request_options: false,
            connection_manager: None,
        }
    }
}

impl StationConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    fn validate(&self) -> Result<()> {
        check_width("station name", &self.name, NAME_WIDTH)?;
        check_width("station type", &self.station_type, TYPE_WIDTH)?;
        check_width("frame creator", &self.frame_creator, NAME_WIDTH)?;
        check_width("frame destination", &self.frame_destination, NAME_WIDTH)?;
        if self.name.is_empty() {
            return Err(Cd11Error::config("station name must not be empty"));
        }
        Ok(())
    }
}

/// Settings for the connection manager responder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ManagerConfig {
    pub bind: SocketAddr,
    pub responder_name: String,
    pub responder_type: String,
    pub frame_creator: String,
    pub protocol: ProtocolVersion,
    pub roster: Vec<RosterEntry>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8041)),
            responder_name: "DC".to_string(),
            responder_type: "IDC".to_string(),
            frame_creator: "DC".to_string(),
            protocol: ProtocolVersion::CD_1_1,
            roster: Vec::new(),
        }
    }
}

/// Where a station's data provider listens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RosterEntry {
    pub name: String,
    pub address: Ipv4Addr,
    pub port: u16,
}

impl RosterEntry {
    pub fn endpoint(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.address, self.port)
    }
}

impl ManagerConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml).map_err(|e| Cd11Error::Config {
            reason: "manager configuration deserialization".to_string(),
            path: None,
            source: Some(Box::new(e)),
        })?;
        for entry in &config.roster {
            check_width("roster station name", &entry.name, NAME_WIDTH)?;
        }
        check_width("responder name", &config.responder_name, NAME_WIDTH)?;
        check_width("responder type", &config.responder_type, TYPE_WIDTH)?;
        Ok(config)
    }
}

impl ReceiverConfig {
    /// Parse and validate YAML text.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml).map_err(|e| Cd11Error::Config {
            reason: "receiver configuration deserialization".to_string(),
            path: None,
            source: Some(Box::new(e)),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| Cd11Error::config_file(path.to_path_buf(), "cannot read configuration", Box::new(e)))?;
        let config = Self::from_yaml_str(&yaml).map_err(|e| match e {
            Cd11Error::Config { reason, source, .. } => {
                Cd11Error::Config { reason, path: Some(path.to_path_buf()), source }
            }
            other => other,
        })?;
        debug!(path = %path.display(), stations = config.stations.len(), "loaded receiver configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.handshake_timeout_ms == 0 || self.read_timeout_ms == 0 || self.ack_interval_ms == 0 {
            return Err(Cd11Error::config("timeouts and intervals must be non-zero"));
        }
        if self.forward_queue_capacity == 0 {
            return Err(Cd11Error::config("forward queue capacity must be non-zero"));
        }
        if self.gap_expiration_secs == Some(0) {
            return Err(Cd11Error::config("gap expiration must be non-zero when set"));
        }

        let mut seen = HashSet::new();
        for station in &self.stations {
            station.validate()?;
            if !seen.insert(station.name.as_str()) {
                return Err(Cd11Error::config(format!("station {} configured twice", station.name)));
            }
        }
        Ok(())
    }

    pub fn station(&self, name: &str) -> Option<&StationConfig> {
        self.stations.iter().find(|s| s.name == name)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn ack_interval(&self) -> Duration {
        Duration::from_millis(self.ack_interval_ms)
    }

    pub fn forward_block(&self) -> Duration {
        Duration::from_millis(self.forward_block_ms)
    }

    pub fn gap_expiration(&self) -> Option<Duration> {
        self.gap_expiration_secs.map(Duration::from_secs)
    }

    pub fn consumer_endpoint(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.consumer_address, self.consumer_port)
    }
}

fn check_width(field: &str, value: &str, width: usize) -> Result<()> {
    if value.len() > width {
        return Err(Cd11Error::config(format!("{field} {value:?} is longer than {width} bytes")));
    }
    Ok(())
}
