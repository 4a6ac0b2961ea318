//! Connection manager: the UDP side of the handshake.
//!
//! Answers connection requests from a static roster of station name to data
//! provider address. Stations missing from the roster get a rejection. Used by
//! simulated deployments and by the loopback tests.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::ManagerConfig;
use crate::types::{ConnectionRequest, ConnectionResponse, Frame, FrameBody, FrameHeader, FrameOption};
use crate::{Cd11Error, Result};

const MAX_DATAGRAM: usize = 64 * 1024;

/// A running connection manager. Stops when dropped.
#[derive(Debug)]
pub struct ConnectionManager {
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl ConnectionManager {
    /// Bind the configured address and start answering requests.
    pub async fn bind(config: ManagerConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind)
            .await
            .map_err(|e| Cd11Error::socket(format!("binding connection manager on {}", config.bind), e))?;
        let local_addr = socket.local_addr().map_err(|e| Cd11Error::socket("reading bound address", e))?;

        let roster: HashMap<String, SocketAddrV4> =
            config.roster.iter().map(|entry| (entry.name.clone(), entry.endpoint())).collect();
        info!(%local_addr, stations = roster.len(), "connection manager listening");

        let cancel = CancellationToken::new();
        let responder = Responder { socket, config, roster };
        tokio::spawn(responder.serve(cancel.clone()));

        Ok(Self { local_addr, cancel })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        debug!(local_addr = %self.local_addr, "dropping connection manager");
        self.cancel.cancel();
    }
}

struct Responder {
    socket: UdpSocket,
    config: ManagerConfig,
    roster: HashMap<String, SocketAddrV4>,
}

impl Responder {
    async fn serve(self, cancel: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut error_count = 0u32;
        const MAX_ERRORS: u32 = 10;

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };

            let (len, peer) = match received {
                Ok(received) => {
                    error_count = 0;
                    received
                }
                Err(err) => {
                    error_count += 1;
                    warn!(error = %err, "connection manager receive failed ({}/{})", error_count, MAX_ERRORS);
                    if error_count >= MAX_ERRORS {
                        warn!("too many receive errors, connection manager stopping");
                        break;
                    }
                    continue;
                }
            };

            let frame = match codec::decode(&buf[..len]) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(%peer, error = %err, "ignoring undecodable datagram");
                    continue;
                }
            };

            let reply = match &frame.body {
                FrameBody::ConnectionRequest(request) => self.answer_connection(request, peer),
                FrameBody::OptionRequest(_) => {
                    FrameBody::OptionResponse(vec![FrameOption::station_name(&self.config.responder_name)])
                }
                other => {
                    debug!(%peer, frame_type = ?other.frame_type(), "ignoring frame");
                    continue;
                }
            };

            let header = FrameHeader::new(&self.config.frame_creator, &frame.header.creator, 0);
            let reply = Frame::new(header, reply).with_auth(0, Bytes::new());
            match codec::encode(&reply) {
                Ok(bytes) => {
                    if let Err(err) = self.socket.send_to(&bytes, peer).await {
                        warn!(%peer, error = %err, "failed to send reply");
                    }
                }
                Err(err) => warn!(%peer, error = %err, "failed to encode reply"),
            }
        }

        info!("connection manager stopped");
    }

    fn answer_connection(&self, request: &ConnectionRequest, peer: SocketAddr) -> FrameBody {
        let station = &request.station_name;
        let response = match self.roster.get(station) {
            Some(endpoint) => {
                info!(station = %station, %peer, provider = %endpoint, "assigning data provider");
                ConnectionResponse {
                    version: self.config.protocol,
                    responder_name: self.config.responder_name.clone(),
                    responder_type: self.config.responder_type.clone(),
                    service_type: request.service_type,
                    endpoint: *endpoint,
                    secondary: None,
                }
            }
            None => {
                warn!(station = %station, %peer, "rejecting connection request for unknown station");
                ConnectionResponse::rejection(
                    self.config.protocol,
                    self.config.responder_name.clone(),
                    self.config.responder_type.clone(),
                )
            }
        };
        FrameBody::ConnectionResponse(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RosterEntry;
    use crate::types::{ProtocolVersion, ServiceType};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    async fn request(manager: SocketAddr, body: impl Into<FrameBody>) -> Frame {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let frame = Frame::new(FrameHeader::new("TEST", "0", 0), body);
        socket.send_to(&codec::encode(&frame).unwrap(), manager).await.unwrap();

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf)).await.unwrap().unwrap();
        codec::decode(&buf[..len]).unwrap()
    }

    fn connection_request(station: &str) -> ConnectionRequest {
        ConnectionRequest {
            version: ProtocolVersion::CD_1_1,
            station_name: station.to_string(),
            station_type: "IDC".to_string(),
            service_type: ServiceType::Tcp,
            endpoint: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            secondary: None,
        }
    }

    async fn manager() -> ConnectionManager {
        let config = ManagerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            roster: vec![RosterEntry { name: "ARCES".into(), address: Ipv4Addr::LOCALHOST, port: 8100 }],
            ..Default::default()
        };
        ConnectionManager::bind(config).await.unwrap()
    }

    #[tokio::test]
    async fn roster_station_gets_its_endpoint() {
        let manager = manager().await;
        let reply = request(manager.local_addr(), connection_request("ARCES")).await;

        let FrameBody::ConnectionResponse(response) = reply.body else { panic!("expected a connection response") };
        assert!(!response.is_rejection());
        assert_eq!(response.endpoint, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8100));
        assert_eq!(response.responder_name, "DC");
        assert_eq!(reply.header.destination, "TEST");
    }

    #[tokio::test]
    async fn unknown_station_gets_a_rejection() {
        let manager = manager().await;
        let reply = request(manager.local_addr(), connection_request("ELSE")).await;
        let FrameBody::ConnectionResponse(response) = reply.body else { panic!("expected a connection response") };
        assert!(response.is_rejection());
    }

    #[tokio::test]
    async fn option_request_is_answered_and_garbage_ignored() {
        let manager = manager().await;

        let junk = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        junk.send_to(b"not a frame", manager.local_addr()).await.unwrap();

        let reply = request(manager.local_addr(), FrameBody::OptionRequest(vec![FrameOption::station_name("ARCES")])).await;
        assert_eq!(reply.body, FrameBody::OptionResponse(vec![FrameOption::station_name("DC")]));
    }
}
