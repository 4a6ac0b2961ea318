//! UDP connection handshake that negotiates a station's data stream.
//!
//! ```text
//! Init ──request──▶ AwaitingConnectionResponse ──(options)──▶ AwaitingOptionResponse
//!                          │                                          │
//!                          └────────────── response ─────────────────┴──▶ Established
//!  any timeout, rejection or socket failure ──▶ Closed
//! ```
//!
//! The exchange never retries. A failure is returned to the caller and nothing is
//! registered.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::codec;
use crate::config::{ReceiverConfig, StationConfig};
use crate::session::{SessionConfig, SessionHandle, SessionServices, StationSession};
use crate::types::{ConnectionRequest, ConnectionResponse, Frame, FrameBody, FrameHeader, FrameOption, ServiceType};
use crate::{Cd11Error, Result};

const MAX_DATAGRAM: usize = 64 * 1024;

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Init,
    AwaitingConnectionResponse,
    AwaitingOptionResponse,
    Established,
    Closed,
}

/// Handshake for one station.
#[derive(Debug)]
pub struct ConnectionExchange {
    station: StationConfig,
    manager: SocketAddr,
    consumer: SocketAddrV4,
    timeout: Duration,
    session: SessionConfig,
    state: ExchangeState,
}

impl ConnectionExchange {
    pub fn new(station: &StationConfig, receiver: &ReceiverConfig) -> Self {
        Self {
            station: station.clone(),
            manager: station.connection_manager.unwrap_or(receiver.connection_manager),
            consumer: receiver.consumer_endpoint(),
            timeout: receiver.handshake_timeout(),
            session: SessionConfig::new(station, receiver),
            state: ExchangeState::Init,
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub fn station(&self) -> &str {
        &self.station.name
    }

    /// Run the handshake, open the data stream and register the new session.
    pub async fn establish(&mut self, services: &SessionServices) -> Result<SessionHandle> {
        if self.state != ExchangeState::Init {
            return Err(Cd11Error::handshake_rejected(&self.station.name, "exchange already used"));
        }

        match self.negotiate(services).await {
            Ok(handle) => {
                self.transition(ExchangeState::Established);
                Ok(handle)
            }
            Err(err) => {
                warn!(station = %self.station.name, error = %err, "connection exchange failed");
                self.transition(ExchangeState::Closed);
                Err(err)
            }
        }
    }

    async fn negotiate(&mut self, services: &SessionServices) -> Result<SessionHandle> {
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
            .await
            .map_err(|e| Cd11Error::socket("binding handshake socket", e))?;

        let request = ConnectionRequest {
            version: self.station.protocol,
            station_name: self.station.name.clone(),
            station_type: self.station.station_type.clone(),
            service_type: self.station.service_type,
            endpoint: self.consumer,
            secondary: None,
        };
        self.send(&socket, request).await?;
        self.transition(ExchangeState::AwaitingConnectionResponse);

        let response = self
            .await_reply(&socket, services, |body| match body {
                FrameBody::ConnectionResponse(response) => Some(response),
                _ => None,
            })
            .await?;
        self.check_response(&response)?;

        if self.station.request_options {
            self.send(&socket, FrameBody::OptionRequest(vec![FrameOption::station_name(&self.station.name)])).await?;
            self.transition(ExchangeState::AwaitingOptionResponse);
            let options = self
                .await_reply(&socket, services, |body| match body {
                    FrameBody::OptionResponse(options) => Some(options),
                    _ => None,
                })
                .await?;
            debug!(station = %self.station.name, count = options.len(), "option exchange complete");
        }

        let endpoint = SocketAddr::V4(response.endpoint);
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| Cd11Error::handshake_timeout(&self.station.name, self.timeout))?
            .map_err(|e| Cd11Error::socket(format!("connecting to data provider at {endpoint}"), e))?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(station = %self.station.name, error = %err, "could not disable Nagle");
        }
        info!(station = %self.station.name, %endpoint, responder = %response.responder_name, "data stream connected");

        let tracker = services.registry.initial_tracker(&self.station.name);
        let handle = StationSession::spawn(stream, self.session.clone(), tracker, services);
        services.registry.register(handle.clone());
        Ok(handle)
    }

    fn check_response(&self, response: &ConnectionResponse) -> Result<()> {
        if response.is_rejection() {
            return Err(Cd11Error::handshake_rejected(
                &self.station.name,
                format!("{} refused the connection", response.responder_name),
            ));
        }
        if response.service_type != ServiceType::Tcp {
            return Err(Cd11Error::handshake_rejected(
                &self.station.name,
                format!("negotiated {} data stream, only TCP is supported", response.service_type),
            ));
        }
        if response.version.major != self.station.protocol.major {
            return Err(Cd11Error::handshake_rejected(
                &self.station.name,
                format!("provider speaks protocol {}, expected {}", response.version, self.station.protocol),
            ));
        }
        Ok(())
    }

    async fn send(&self, socket: &UdpSocket, body: impl Into<FrameBody>) -> Result<()> {
        let header = FrameHeader::new(&self.station.frame_creator, &self.station.frame_destination, 0);
        let frame = Frame::new(header, body).with_auth(self.station.auth_key_id, Bytes::new());
        let bytes = codec::encode(&frame)?;
        socket
            .send_to(&bytes, self.manager)
            .await
            .map_err(|e| Cd11Error::socket(format!("sending {:?} to {}", frame.frame_type(), self.manager), e))?;
        trace!(station = %self.station.name, manager = %self.manager, frame_type = ?frame.frame_type(), "sent handshake frame");
        Ok(())
    }

    /// Wait for the first datagram from the manager that `accept` takes.
    ///
    /// Undecodable or unexpected datagrams are ignored while the deadline runs. A reply
    /// that fails authentication ends the exchange.
    async fn await_reply<T>(
        &self,
        socket: &UdpSocket,
        services: &SessionServices,
        accept: impl Fn(FrameBody) -> Option<T>,
    ) -> Result<T> {
        let deadline = Instant::now() + self.timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let (len, from) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf))
                .await
                .map_err(|_| Cd11Error::handshake_timeout(&self.station.name, self.timeout))?
                .map_err(|e| Cd11Error::socket("receiving handshake reply", e))?;

            if from != self.manager {
                debug!(station = %self.station.name, %from, "ignoring datagram from unexpected peer");
                continue;
            }
            match codec::decode(&buf[..len]) {
                Ok(frame) => {
                    if let Err(err) = services.authenticator.verify(&frame, &buf[..len]) {
                        warn!(station = %self.station.name, key_id = frame.trailer.auth_key_id, error = %err, "handshake reply failed authentication");
                        return Err(err);
                    }
                    let frame_type = frame.frame_type();
                    match accept(frame.body) {
                        Some(reply) => return Ok(reply),
                        None => debug!(station = %self.station.name, ?frame_type, "ignoring unexpected handshake frame"),
                    }
                }
                Err(err) => warn!(station = %self.station.name, error = %err, "ignoring undecodable handshake reply"),
            }
        }
    }

    fn transition(&mut self, next: ExchangeState) {
        debug!(station = %self.station.name, from = ?self.state, to = ?next, "exchange state");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::KeyAllowList;
    use crate::config::{ManagerConfig, RosterEntry};
    use crate::manager::ConnectionManager;
    use crate::registry::SessionRegistry;
    use crate::session::CloseReason;
    use crate::test_utils::RecordingSink;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn services() -> SessionServices {
        SessionServices::new(Arc::new(RecordingSink::new()), SessionRegistry::new(false))
    }

    fn receiver_config(manager: SocketAddr, timeout_ms: u64) -> ReceiverConfig {
        ReceiverConfig { connection_manager: manager, handshake_timeout_ms: timeout_ms, ..Default::default() }
    }

    async fn manager_for(station: &str, provider: SocketAddr) -> ConnectionManager {
        let SocketAddr::V4(provider) = provider else { panic!("expected IPv4") };
        let config = ManagerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            roster: vec![RosterEntry { name: station.to_string(), address: *provider.ip(), port: provider.port() }],
            ..Default::default()
        };
        ConnectionManager::bind(config).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn silent_manager_times_out_without_registering() {
        // bound but never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let services = services();
        let receiver = receiver_config(silent.local_addr().unwrap(), 10_000);
        let mut exchange = ConnectionExchange::new(&StationConfig::new("ARCES"), &receiver);

        let err = exchange.establish(&services).await.unwrap_err();
        assert!(matches!(err, Cd11Error::HandshakeTimeout { ref station, .. } if station == "ARCES"));
        assert_eq!(exchange.state(), ExchangeState::Closed);
        assert!(services.registry.lookup("ARCES").is_none());
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn unknown_station_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let manager = manager_for("ARCES", listener.local_addr().unwrap()).await;
        let services = services();
        let receiver = receiver_config(manager.local_addr(), 2_000);
        let mut exchange = ConnectionExchange::new(&StationConfig::new("NOPE"), &receiver);

        let err = exchange.establish(&services).await.unwrap_err();
        assert!(matches!(err, Cd11Error::HandshakeRejected { .. }));
        assert_eq!(exchange.state(), ExchangeState::Closed);
        assert!(services.registry.is_empty());
    }

    #[tokio::test]
    async fn successful_exchange_registers_a_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let manager = manager_for("ARCES", listener.local_addr().unwrap()).await;
        let services = services();
        let receiver = receiver_config(manager.local_addr(), 2_000);
        let station = StationConfig { request_options: true, ..StationConfig::new("ARCES") };
        let mut exchange = ConnectionExchange::new(&station, &receiver);

        let (handle, accepted) = tokio::join!(exchange.establish(&services), listener.accept());
        let handle = handle.unwrap();
        let (_provider, _) = accepted.unwrap();

        assert_eq!(exchange.state(), ExchangeState::Established);
        assert_eq!(services.registry.lookup("ARCES").unwrap().id(), handle.id());

        handle.close();
        assert_eq!(handle.closed().await, CloseReason::Requested);
        assert!(services.registry.is_empty());
    }

    #[tokio::test]
    async fn reply_signed_with_unknown_key_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let manager = manager_for("ARCES", listener.local_addr().unwrap()).await;
        let receiver = receiver_config(manager.local_addr(), 2_000);

        // the manager signs its replies with key 0
        let strict = services().with_authenticator(Arc::new(KeyAllowList::new([7], false)));
        let mut exchange = ConnectionExchange::new(&StationConfig::new("ARCES"), &receiver);
        let err = exchange.establish(&strict).await.unwrap_err();
        assert!(matches!(err, Cd11Error::Authentication { key_id: 0, .. }));
        assert_eq!(exchange.state(), ExchangeState::Closed);
        assert!(strict.registry.is_empty());

        let trusting = services().with_authenticator(Arc::new(KeyAllowList::new([0], false)));
        let mut exchange = ConnectionExchange::new(&StationConfig::new("ARCES"), &receiver);
        let (handle, accepted) = tokio::join!(exchange.establish(&trusting), listener.accept());
        let handle = handle.unwrap();
        let _provider = accepted.unwrap();
        assert_eq!(exchange.state(), ExchangeState::Established);
        handle.close();
        handle.closed().await;
    }

    #[tokio::test]
    async fn unreachable_provider_is_a_socket_error() {
        // grab a free port, then release it so nothing listens there
        let port = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let manager = manager_for("ARCES", port).await;
        let services = services();
        let receiver = receiver_config(manager.local_addr(), 2_000);
        let mut exchange = ConnectionExchange::new(&StationConfig::new("ARCES"), &receiver);

        let err = exchange.establish(&services).await.unwrap_err();
        assert!(matches!(err, Cd11Error::Socket { .. }));
        assert!(services.registry.is_empty());
    }
}
