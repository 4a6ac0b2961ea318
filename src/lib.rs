//! CD-1.1 station data acquisition.
//!
//! Receives continuous seismic and infrasound telemetry from remote stations over
//! the CD-1.1 protocol: a UDP connection exchange negotiates a TCP stream, the
//! stream carries checksummed, sequence-numbered frames, and the receiver reports
//! what it has and what is missing in periodic acknowledgments.
//!
//! # Features
//!
//! - **Bit-exact codec**: every frame kind, CRC-64 verification, stream resynchronisation
//! - **Gap tracking**: out-of-order and duplicate delivery with exactly-once forwarding
//! - **Per-station isolation**: each station runs in its own tasks and fails alone
//! - **Bounded forwarding**: a slow downstream consumer costs payloads, never the stream
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use cd11_ingest::{Cd11Receiver, ChannelSink, ReceiverConfig};
//!
//! #[tokio::main]
//! async fn main() -> cd11_ingest::Result<()> {
//!     let config = ReceiverConfig::load("receiver.yaml")?;
//!     let (sink, mut frames) = ChannelSink::new(1024);
//!     let receiver = Cd11Receiver::new(config, sink)?;
//!
//!     for (station, result) in receiver.connect_all().await {
//!         if let Err(e) = result {
//!             eprintln!("{station}: {e}");
//!         }
//!     }
//!
//!     while let Some(frame) = frames.recv().await {
//!         println!("{} #{}: {:?}", frame.station, frame.sequence_number, frame.channel_ids);
//!     }
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod codec;
pub mod config;
mod error;
pub mod exchange;
pub mod gap_list;
pub mod manager;
pub mod registry;
pub mod session;
pub mod sink;
pub mod stream;
#[cfg_attr(any(test, feature = "benchmark"), path = "test_utils.rs")]
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use futures::future::join_all;
use tracing::{debug, info};

// Core exports
pub use error::*;
pub use types::*;

pub use auth::{AcceptAll, FrameAuthenticator, KeyAllowList};
pub use config::{ManagerConfig, ReceiverConfig, RosterEntry, StationConfig};
pub use exchange::{ConnectionExchange, ExchangeState};
pub use gap_list::{GapList, SequenceRange};
pub use manager::ConnectionManager;
pub use registry::SessionRegistry;
pub use session::{
    CloseReason, SessionConfig, SessionHandle, SessionServices, SessionState, SessionStats, SessionStatus, StationSession,
};
pub use sink::{ChannelSink, RawFrameSink, RawStationDataFrame};

use stream::ThrottleExt;

/// Data consumer for every configured station.
///
/// Owns the session registry. Dropping the receiver requests every session to close;
/// call [`Cd11Receiver::shutdown`] to also wait for them.
pub struct Cd11Receiver {
    config: Arc<ReceiverConfig>,
    services: SessionServices,
}

impl Cd11Receiver {
    /// Build a receiver forwarding data to `sink`.
    ///
    /// Authentication is enforced when the configuration carries a policy.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the configuration fails validation.
    pub fn new(config: ReceiverConfig, sink: impl RawFrameSink) -> Result<Self> {
        config.validate()?;
        let registry = SessionRegistry::new(config.resume_gap_state);
        let mut services = SessionServices::new(Arc::new(sink), registry);
        if let Some(policy) = &config.authentication {
            services = services.with_authenticator(Arc::new(policy.clone()));
        }
        info!(stations = config.stations.len(), manager = %config.connection_manager, "receiver ready");
        Ok(Self { config: Arc::new(config), services })
    }

    /// Replace the authentication policy.
    pub fn with_authenticator(mut self, authenticator: impl FrameAuthenticator) -> Self {
        self.services.authenticator = Arc::new(authenticator);
        self
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.services.registry
    }

    /// Run the connection exchange for one configured station.
    ///
    /// # Errors
    ///
    /// `UnknownStation` if the station is not configured, otherwise whatever the
    /// exchange reports. Nothing is retried.
    pub async fn connect_station(&self, station: &str) -> Result<SessionHandle> {
        let station_config =
            self.config.station(station).ok_or_else(|| Cd11Error::UnknownStation { station: station.to_string() })?;
        let mut exchange = ConnectionExchange::new(station_config, &self.config);
        exchange.establish(&self.services).await
    }

    /// Connect every configured station concurrently.
    ///
    /// Results come back in configuration order. One station failing has no effect
    /// on the others.
    pub async fn connect_all(&self) -> Vec<(String, Result<SessionHandle>)> {
        let attempts = self
            .config
            .stations
            .iter()
            .map(|station| async move { (station.name.clone(), self.connect_station(&station.name).await) });
        join_all(attempts).await
    }

    /// Close a station's session and wait for it to finish.
    pub async fn disconnect(&self, station: &str) -> Result<CloseReason> {
        let handle = self
            .services
            .registry
            .lookup(station)
            .ok_or_else(|| Cd11Error::UnknownStation { station: station.to_string() })?;
        handle.close();
        Ok(handle.closed().await)
    }

    /// Current status of a station's live session.
    pub fn status(&self, station: &str) -> Option<SessionStatus> {
        self.services.registry.lookup(station).map(|handle| handle.status())
    }

    pub fn statuses(&self) -> Vec<SessionStatus> {
        self.services.registry.statuses()
    }

    /// Status updates of a station's live session, at most one per `every`.
    ///
    /// The stream ends after the session's final status.
    pub fn status_updates(&self, station: &str, every: Duration) -> Result<impl Stream<Item = SessionStatus> + use<>> {
        let handle = self
            .services
            .registry
            .lookup(station)
            .ok_or_else(|| Cd11Error::UnknownStation { station: station.to_string() })?;
        Ok(handle.status_updates().throttle(every))
    }

    /// Close every session and wait for them.
    pub async fn shutdown(&self) {
        self.services.registry.shutdown().await;
    }
}

impl Drop for Cd11Receiver {
    fn drop(&mut self) {
        debug!("Dropping receiver");
        self.services.registry.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SequenceTracker;
    use crate::test_utils::RecordingSink;

    #[tokio::test]
    async fn unknown_station_is_reported() {
        let receiver = Cd11Receiver::new(ReceiverConfig::default(), RecordingSink::new()).unwrap();
        assert!(matches!(receiver.connect_station("ARCES").await, Err(Cd11Error::UnknownStation { .. })));
        assert!(matches!(receiver.disconnect("ARCES").await, Err(Cd11Error::UnknownStation { .. })));
        assert!(receiver.status_updates("ARCES", Duration::from_secs(1)).is_err());
        assert!(receiver.statuses().is_empty());
    }

    #[tokio::test]
    async fn status_stream_outlives_the_borrow() {
        use futures::StreamExt;
        use tokio::io::AsyncWriteExt;

        let receiver = Cd11Receiver::new(ReceiverConfig::default(), RecordingSink::new())
            .unwrap()
            .with_authenticator(KeyAllowList::new([0], false));
        let config = SessionConfig { station: "ARCES".into(), ..SessionConfig::default() };
        let (consumer, mut provider) = tokio::io::duplex(64 * 1024);
        let handle = StationSession::spawn(consumer, config, SequenceTracker::new(), &receiver.services);
        receiver.registry().register(handle.clone());

        let updates = {
            let station = String::from("ARCES");
            receiver.status_updates(&station, Duration::from_millis(10)).unwrap()
        };
        provider.write_all(&crate::test_utils::encoded_data_frame("ARCES", 3)).await.unwrap();
        let mut updates = Box::pin(updates);
        loop {
            let status = updates.next().await.unwrap();
            if status.last_contiguous == Some(3) {
                break;
            }
        }
        handle.close();
        handle.closed().await;
    }

    #[test]
    fn invalid_config_is_refused() {
        let config = ReceiverConfig { forward_queue_capacity: 0, ..Default::default() };
        assert!(matches!(Cd11Receiver::new(config, RecordingSink::new()), Err(Cd11Error::Config { .. })));
    }
}
