//! Live station streams.
//!
//! [`StationSession::spawn`] takes an established byte stream and runs it as four
//! tasks, mirroring how one station is served end to end:
//!
//! - a receive loop that reassembles frames, authenticates them, updates the
//!   [`SequenceTracker`] and queues unique data payloads,
//! - a writer that sends periodic acknowledgments plus any replies the receive
//!   loop asks for,
//! - a forwarder that drains the bounded queue into the downstream sink,
//! - a supervisor that turns task completion or failure into a single close,
//!   deregisters the session and publishes the final status.
//!
//! The receive loop and the acknowledgment timer share the tracker behind a
//! mutex; no lock is ever held across an await point.

mod tracker;

pub use tracker::{Delivery, ProviderAck, SequenceTracker};

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::auth::{AcceptAll, FrameAuthenticator};
use crate::codec::{self, FrameReader, ReceivedFrame};
use crate::config::{ReceiverConfig, StationConfig};
use crate::gap_list::SequenceRange;
use crate::registry::SessionRegistry;
use crate::sink::{ForwardQueue, PushOutcome, RawFrameSink, RawStationDataFrame, report_backpressure};
use crate::types::{Acknowledgment, Alert, DataFrame, Frame, FrameBody, FrameHeader, FrameOption, JulianTimestamp};
use crate::{Cd11Error, Result};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

const READ_CHUNK: usize = 16 * 1024;
const OUTBOUND_CAPACITY: usize = 16;
const SHUTDOWN_ALERT_TIMEOUT: Duration = Duration::from_secs(1);
const FORWARD_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed through its handle, the registry or receiver shutdown.
    Requested,
    /// A newer session for the same station was registered.
    Replaced,
    /// The provider sent an alert frame.
    Alert(String),
    PeerClosed,
    ReadTimeout(Duration),
    Socket(String),
    /// A session task panicked.
    TaskFailed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Requested => f.write_str("close requested"),
            CloseReason::Replaced => f.write_str("replaced by a newer session"),
            CloseReason::Alert(message) => write!(f, "provider alert: {message}"),
            CloseReason::PeerClosed => f.write_str("provider closed the connection"),
            CloseReason::ReadTimeout(after) => write!(f, "no data for {after:?}"),
            CloseReason::Socket(details) => write!(f, "socket error: {details}"),
            CloseReason::TaskFailed => f.write_str("session task failed"),
        }
    }
}

/// Lifecycle of a station session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Established,
    Closed(CloseReason),
}

impl SessionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed(_))
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        match self {
            SessionState::Closed(reason) => Some(reason),
            SessionState::Established => None,
        }
    }
}

/// Per-session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_received: u64,
    pub data_frames: u64,
    pub duplicates: u64,
    pub decode_errors: u64,
    pub auth_failures: u64,
    /// Payloads evicted because the sink fell behind.
    pub payloads_dropped: u64,
    pub sink_errors: u64,
    pub acks_sent: u64,
}

/// Monitoring snapshot of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub id: u64,
    pub station: String,
    pub state: SessionState,
    pub last_contiguous: Option<u64>,
    pub gaps: Vec<SequenceRange>,
    pub stats: SessionStats,
    pub created_at: JulianTimestamp,
}

/// Settings for one station's stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub station: String,
    /// Creator written on outbound frames.
    pub frame_creator: String,
    pub frame_destination: String,
    pub auth_key_id: u32,
    pub read_timeout: Duration,
    pub ack_interval: Duration,
    pub forward_queue_capacity: usize,
    pub forward_block: Duration,
    pub gap_expiration: Option<Duration>,
}

impl SessionConfig {
    pub fn new(station: &StationConfig, receiver: &ReceiverConfig) -> Self {
        Self {
            station: station.name.clone(),
            frame_creator: station.frame_creator.clone(),
            frame_destination: station.frame_destination.clone(),
            auth_key_id: station.auth_key_id,
            read_timeout: receiver.read_timeout(),
            ack_interval: receiver.ack_interval(),
            forward_queue_capacity: receiver.forward_queue_capacity,
            forward_block: receiver.forward_block(),
            gap_expiration: receiver.gap_expiration(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(&StationConfig::default(), &ReceiverConfig::default())
    }
}

/// Collaborators shared by every session of a receiver.
#[derive(Clone)]
pub struct SessionServices {
    pub sink: Arc<dyn RawFrameSink>,
    pub authenticator: Arc<dyn FrameAuthenticator>,
    pub registry: SessionRegistry,
}

impl SessionServices {
    /// Services with authentication disabled.
    pub fn new(sink: Arc<dyn RawFrameSink>, registry: SessionRegistry) -> Self {
        Self { sink, authenticator: Arc::new(AcceptAll), registry }
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn FrameAuthenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }
}

impl fmt::Debug for SessionServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionServices").field("registry", &self.registry).finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct SessionCore {
    tracker: SequenceTracker,
    stats: SessionStats,
    /// `creator:destination` of the provider's data frames.
    frameset: Option<String>,
}

#[derive(Debug)]
struct SessionShared {
    id: u64,
    config: SessionConfig,
    created_at: JulianTimestamp,
    core: Mutex<SessionCore>,
    queue: ForwardQueue<RawStationDataFrame>,
    status_tx: watch::Sender<SessionStatus>,
    close_reason: Mutex<Option<CloseReason>>,
    cancel: CancellationToken,
}

impl SessionShared {
    /// First reason wins; later calls only re-cancel.
    fn close(&self, reason: CloseReason) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                debug!(station = %self.config.station, session = self.id, %reason, "closing session");
                *slot = Some(reason);
            }
        }
        self.cancel.cancel();
    }

    fn status(&self) -> SessionStatus {
        let state = self.status_tx.borrow().state.clone();
        let core = self.core.lock();
        SessionStatus {
            id: self.id,
            station: self.config.station.clone(),
            state,
            last_contiguous: core.tracker.last_contiguous(),
            gaps: core.tracker.gaps().snapshot(),
            stats: core.stats,
            created_at: self.created_at,
        }
    }

    fn publish(&self) {
        let (last_contiguous, gaps, stats) = {
            let core = self.core.lock();
            (core.tracker.last_contiguous(), core.tracker.gaps().snapshot(), core.stats)
        };
        self.status_tx.send_modify(|status| {
            status.last_contiguous = last_contiguous;
            status.gaps = gaps;
            status.stats = stats;
        });
    }

    fn acknowledgment(&self) -> Acknowledgment {
        let mut core = self.core.lock();
        if let Some(max_age) = self.config.gap_expiration {
            let expired = core.tracker.expire_gaps(max_age);
            if expired > 0 {
                warn!(station = %self.config.station, expired, "abandoned gap ranges past their expiration");
            }
        }
        let frameset = core
            .frameset
            .clone()
            .unwrap_or_else(|| Acknowledgment::frameset_name(&self.config.station, &self.config.frame_destination));
        core.tracker.acknowledgment(frameset)
    }

    async fn on_frame(
        &self,
        received: ReceivedFrame,
        authenticator: &dyn FrameAuthenticator,
        outbound: &mpsc::Sender<FrameBody>,
    ) -> Option<CloseReason> {
        let ReceivedFrame { frame, raw } = received;
        let station = self.config.station.as_str();
        let seq = frame.sequence_number();
        self.core.lock().stats.frames_received += 1;

        if let Err(err) = authenticator.verify(&frame, &raw) {
            self.core.lock().stats.auth_failures += 1;
            warn!(station, seq, error = %err, "rejecting frame that failed authentication");
            return None;
        }

        match frame.body {
            FrameBody::Data(data) => {
                self.on_data(&frame.header, &data, raw).await;
                None
            }
            FrameBody::Acknowledgment(ack) => {
                let outcome = self.core.lock().tracker.on_provider_ack(&ack);
                debug!(station, ?outcome, highest = ?ack.highest_seq, "provider acknowledgment");
                if outcome != ProviderAck::Unchanged {
                    self.publish();
                }
                None
            }
            FrameBody::Alert(alert) => {
                info!(station, message = %alert.message, "provider alert, closing session");
                Some(CloseReason::Alert(alert.message))
            }
            FrameBody::OptionRequest(options) => {
                debug!(station, count = options.len(), "answering option request");
                let response = FrameBody::OptionResponse(vec![FrameOption::station_name(&self.config.frame_creator)]);
                if outbound.try_send(response).is_err() {
                    warn!(station, "writer backlog full, option request left unanswered");
                }
                None
            }
            other => {
                debug!(station, seq, frame_type = ?other.frame_type(), "ignoring unexpected frame on stream");
                None
            }
        }
    }

    async fn on_data(&self, header: &FrameHeader, data: &DataFrame, raw: Bytes) {
        let station = self.config.station.as_str();
        let seq = header.sequence_number;

        // reserved as "nothing received" in acknowledgments
        if seq == u64::MAX {
            self.core.lock().stats.decode_errors += 1;
            warn!(station, seq, "dropping data frame with reserved sequence number");
            return;
        }

        let delivery = {
            let mut core = self.core.lock();
            core.stats.data_frames += 1;
            if core.frameset.is_none() {
                core.frameset = Some(Acknowledgment::frameset_name(&header.creator, &header.destination));
            }
            let delivery = core.tracker.on_sequence(seq);
            if delivery == Delivery::Duplicate {
                core.stats.duplicates += 1;
            }
            delivery
        };

        if delivery == Delivery::Duplicate {
            trace!(station, seq, "dropping duplicate data frame");
            return;
        }

        let (payload_start, payload_end) = data.time_bounds();
        let payload = RawStationDataFrame {
            station: self.config.station.clone(),
            sequence_number: seq,
            channel_ids: data.channel_ids(),
            payload_start,
            payload_end,
            reception_time: JulianTimestamp::now(),
            raw,
        };

        match self.queue.push(payload).await {
            PushOutcome::Queued => trace!(station, seq, "queued data frame"),
            PushOutcome::DroppedOldest => {
                self.core.lock().stats.payloads_dropped += 1;
                report_backpressure(station, seq, self.queue.dropped());
            }
            PushOutcome::Closed => debug!(station, seq, "forward queue closed, payload discarded"),
        }
    }

    async fn write_frame<W>(&self, writer: &mut W, next_seq: &mut u64, body: FrameBody) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let header = FrameHeader::new(&self.config.frame_creator, &self.config.frame_destination, *next_seq);
        *next_seq = next_seq.wrapping_add(1);
        let frame = Frame::new(header, body).with_auth(self.config.auth_key_id, Bytes::new());
        let bytes = codec::encode(&frame)?;
        writer.write_all(&bytes).await.map_err(|e| Cd11Error::socket("writing frame", e))?;
        writer.flush().await.map_err(|e| Cd11Error::socket("flushing frame", e))?;
        trace!(station = %self.config.station, frame_type = ?frame.frame_type(), len = bytes.len(), "sent frame");
        Ok(())
    }
}

/// Spawns the tasks serving one station stream.
pub struct StationSession;

impl StationSession {
    /// Start serving `stream`.
    ///
    /// `tracker` seeds the sequence state, normally fresh. The returned handle stays
    /// valid after the session closes and then reports the final status.
    pub fn spawn<S>(stream: S, config: SessionConfig, tracker: SequenceTracker, services: &SessionServices) -> SessionHandle
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let created_at = JulianTimestamp::now();
        let initial = SessionStatus {
            id,
            station: config.station.clone(),
            state: SessionState::Established,
            last_contiguous: tracker.last_contiguous(),
            gaps: tracker.gaps().snapshot(),
            stats: SessionStats::default(),
            created_at,
        };
        let (status_tx, status_rx) = watch::channel(initial);

        info!(station = %config.station, session = id, resumed = tracker.last_contiguous().is_some(), "station session established");

        let shared = Arc::new(SessionShared {
            id,
            queue: ForwardQueue::new(config.forward_queue_capacity, config.forward_block),
            config,
            created_at,
            core: Mutex::new(SessionCore { tracker, stats: SessionStats::default(), frameset: None }),
            status_tx,
            close_reason: Mutex::new(None),
            cancel: CancellationToken::new(),
        });

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (reader, writer) = tokio::io::split(stream);

        let receiver =
            tokio::spawn(receive_loop(reader, Arc::clone(&shared), Arc::clone(&services.authenticator), outbound_tx));
        let writer = tokio::spawn(write_loop(writer, Arc::clone(&shared), outbound_rx));
        let forwarder = tokio::spawn(forward_loop(Arc::clone(&shared), Arc::clone(&services.sink)));
        tokio::spawn(supervise(Arc::clone(&shared), receiver, writer, forwarder, services.registry.clone()));

        SessionHandle { shared, status: status_rx }
    }
}

/// Control and monitoring handle for a running session. Cheap to clone.
///
/// Dropping handles does not close the session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    /// Process-unique session identifier.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn station(&self) -> &str {
        &self.shared.config.station
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.status.borrow().state.is_closed()
    }

    /// Current snapshot, read directly from the live tracker.
    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    /// Snapshots published after each read batch, acknowledgment and the final close.
    pub fn status_updates(&self) -> impl Stream<Item = SessionStatus> + use<> {
        WatchStream::new(self.status.clone())
    }

    /// Request teardown. Returns immediately; await [`SessionHandle::closed`] to wait.
    pub fn close(&self) {
        self.shared.close(CloseReason::Requested);
    }

    /// True once teardown has begun, before the final state is published.
    pub fn is_closing(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub(crate) fn close_with(&self, reason: CloseReason) {
        self.shared.close(reason);
    }

    /// Wait until the session has fully closed and been deregistered.
    pub async fn closed(&self) -> CloseReason {
        let mut status = self.status.clone();
        match status.wait_for(|s| s.state.is_closed()).await {
            Ok(status) => status.state.close_reason().cloned().unwrap_or(CloseReason::Requested),
            Err(_) => CloseReason::Requested,
        }
    }

    pub(crate) fn tracker_snapshot(&self) -> SequenceTracker {
        self.shared.core.lock().tracker.clone()
    }
}

async fn receive_loop<R>(
    mut reader: R,
    shared: Arc<SessionShared>,
    authenticator: Arc<dyn FrameAuthenticator>,
    outbound: mpsc::Sender<FrameBody>,
) -> CloseReason
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let station = shared.config.station.clone();
    let read_timeout = shared.config.read_timeout;
    let mut frames = FrameReader::new();

    loop {
        frames.buffer_mut().reserve(READ_CHUNK);
        let read = tokio::select! {
            _ = shared.cancel.cancelled() => return CloseReason::Requested,
            read = tokio::time::timeout(read_timeout, reader.read_buf(frames.buffer_mut())) => read,
        };

        match read {
            Err(_) => {
                warn!(station = %station, timeout = ?read_timeout, "connection expired, no data within read timeout");
                return CloseReason::ReadTimeout(read_timeout);
            }
            Ok(Ok(0)) => {
                info!(station = %station, "provider closed the stream");
                return CloseReason::PeerClosed;
            }
            Ok(Ok(n)) => trace!(station = %station, bytes = n, buffered = frames.buffered(), "read"),
            Ok(Err(err)) => {
                warn!(station = %station, error = %err, "socket read failed");
                return CloseReason::Socket(err.to_string());
            }
        }

        while let Some(result) = frames.next_frame() {
            match result {
                Ok(received) => {
                    if let Some(reason) = shared.on_frame(received, authenticator.as_ref(), &outbound).await {
                        return reason;
                    }
                }
                Err(err) => {
                    shared.core.lock().stats.decode_errors += 1;
                    warn!(station = %station, error = %err, discarded = frames.discarded(), "discarding undecodable input");
                }
            }
        }
        shared.publish();
    }
}

async fn write_loop<W>(mut writer: W, shared: Arc<SessionShared>, mut outbound: mpsc::Receiver<FrameBody>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let station = shared.config.station.clone();
    let period = shared.config.ack_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut next_seq = 0u64;

    loop {
        let body = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => FrameBody::Acknowledgment(shared.acknowledgment()),
            body = outbound.recv() => match body {
                Some(body) => body,
                None => break,
            },
        };

        let is_ack = matches!(body, FrameBody::Acknowledgment(_));
        if let Err(err) = shared.write_frame(&mut writer, &mut next_seq, body).await {
            warn!(station = %station, error = %err, "failed to send frame");
            shared.close(CloseReason::Socket(err.to_string()));
            return;
        }
        if is_ack {
            shared.core.lock().stats.acks_sent += 1;
            shared.publish();
        }
    }

    // the provider may already be gone
    let alert = shared.write_frame(&mut writer, &mut next_seq, FrameBody::Alert(Alert::shutdown()));
    match tokio::time::timeout(SHUTDOWN_ALERT_TIMEOUT, alert).await {
        Ok(Ok(())) => debug!(station = %station, "sent shutdown alert"),
        Ok(Err(err)) => debug!(station = %station, error = %err, "could not send shutdown alert"),
        Err(_) => debug!(station = %station, "timed out sending shutdown alert"),
    }
    let _ = tokio::time::timeout(SHUTDOWN_ALERT_TIMEOUT, writer.shutdown()).await;
}

async fn forward_loop(shared: Arc<SessionShared>, sink: Arc<dyn RawFrameSink>) {
    while let Some(payload) = shared.queue.pop().await {
        let seq = payload.sequence_number;
        if let Err(err) = sink.store(payload).await {
            shared.core.lock().stats.sink_errors += 1;
            warn!(station = %shared.config.station, seq, error = %err, "downstream sink rejected frame");
        }
    }
}

async fn supervise(
    shared: Arc<SessionShared>,
    mut receiver: JoinHandle<CloseReason>,
    mut writer: JoinHandle<()>,
    forwarder: JoinHandle<()>,
    registry: SessionRegistry,
) {
    let station = shared.config.station.clone();

    let writer_done = tokio::select! {
        result = &mut receiver => {
            shared.close(task_outcome(&station, result));
            false
        }
        result = &mut writer => {
            if let Err(err) = result {
                error!(station = %station, error = %err, "writer task failed");
                shared.close(CloseReason::TaskFailed);
            }
            true
        }
    };

    if writer_done {
        shared.cancel.cancel();
        shared.close(task_outcome(&station, receiver.await));
    } else if let Err(err) = writer.await {
        error!(station = %station, error = %err, "writer task failed");
    }

    shared.queue.close();
    let abort = forwarder.abort_handle();
    match tokio::time::timeout(FORWARD_DRAIN_TIMEOUT, forwarder).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(station = %station, error = %err, "forwarder task failed"),
        Err(_) => {
            warn!(station = %station, queued = shared.queue.len(), "sink did not drain in time, abandoning queued payloads");
            abort.abort();
        }
    }

    let reason = shared.close_reason.lock().clone().unwrap_or(CloseReason::Requested);
    let tracker = shared.core.lock().tracker.clone();
    registry.release(&station, shared.id, tracker);

    shared.publish();
    shared.status_tx.send_modify(|status| status.state = SessionState::Closed(reason.clone()));
    let stats = shared.core.lock().stats;
    info!(station = %station, session = shared.id, %reason, ?stats, "station session closed");
}

fn task_outcome(station: &str, result: std::result::Result<CloseReason, tokio::task::JoinError>) -> CloseReason {
    match result {
        Ok(reason) => reason,
        Err(err) => {
            error!(station, error = %err, "receive task failed");
            CloseReason::TaskFailed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::KeyAllowList;
    use crate::test_utils::{RecordingSink, encoded_data_frame};
    use tokio::io::DuplexStream;

    const STATION: &str = "ARCES";

    fn config() -> SessionConfig {
        SessionConfig {
            station: STATION.to_string(),
            ack_interval: Duration::from_secs(3600),
            ..SessionConfig::default()
        }
    }

    fn start(config: SessionConfig, services: &SessionServices) -> (SessionHandle, DuplexStream) {
        let (consumer, provider) = tokio::io::duplex(256 * 1024);
        (StationSession::spawn(consumer, config, SequenceTracker::new(), services), provider)
    }

    fn services(sink: &RecordingSink) -> SessionServices {
        SessionServices::new(Arc::new(sink.clone()), SessionRegistry::new(false))
    }

    async fn send_data(provider: &mut DuplexStream, seqs: &[u64]) {
        for &seq in seqs {
            provider.write_all(&encoded_data_frame(STATION, seq)).await.unwrap();
        }
    }

    async fn send(provider: &mut DuplexStream, body: impl Into<FrameBody>) {
        let frame = Frame::new(FrameHeader::new(STATION, "0", 0), body);
        provider.write_all(&codec::encode(&frame).unwrap()).await.unwrap();
    }

    async fn read_frame(reader: &mut FrameReader, provider: &mut DuplexStream) -> Frame {
        loop {
            if let Some(result) = reader.next_frame() {
                return result.unwrap().frame;
            }
            let n = provider.read_buf(reader.buffer_mut()).await.unwrap();
            assert!(n > 0, "consumer closed the stream");
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn range(start: u64, end: u64) -> SequenceRange {
        SequenceRange::new(start, end).unwrap()
    }

    #[tokio::test]
    async fn forwards_each_unique_sequence_once() {
        let sink = RecordingSink::new();
        let (handle, mut provider) = start(config(), &services(&sink));

        send_data(&mut provider, &[1, 2, 3, 6, 7, 4, 5, 5, 3]).await;
        eventually(|| handle.status().stats.data_frames == 9).await;
        eventually(|| sink.len() == 7).await;

        assert_eq!(sink.sequence_numbers(), vec![1, 2, 3, 6, 7, 4, 5]);
        let status = handle.status();
        assert_eq!(status.last_contiguous, Some(7));
        assert!(status.gaps.is_empty());
        assert_eq!(status.stats.duplicates, 2);

        let first = &sink.frames()[0];
        assert_eq!(first.station, STATION);
        assert_eq!(first.channel_ids, vec!["ARCES.BHZ", "ARCES.BHN", "ARCES.BHE"]);
        assert!(first.payload_start < first.payload_end);
        assert_eq!(first.raw, encoded_data_frame(STATION, 1));
    }

    #[tokio::test]
    async fn acknowledgments_report_gaps() {
        let sink = RecordingSink::new();
        let config = SessionConfig { ack_interval: Duration::from_millis(20), ..config() };
        let (handle, mut provider) = start(config, &services(&sink));

        send_data(&mut provider, &[1, 2, 3, 6, 7]).await;
        eventually(|| handle.status().last_contiguous == Some(7)).await;

        let mut reader = FrameReader::new();
        let ack = loop {
            if let FrameBody::Acknowledgment(ack) = read_frame(&mut reader, &mut provider).await.body {
                if ack.highest_seq == Some(7) {
                    break ack;
                }
            }
        };
        assert_eq!(ack.lowest_seq, Some(1));
        assert_eq!(ack.gaps, vec![range(4, 5)]);
        assert_eq!(ack.frameset_acked, "ARCES:0");
        assert!(handle.status().stats.acks_sent >= 1);
    }

    #[tokio::test]
    async fn corrupt_frame_is_skipped_and_reported_missing() {
        let sink = RecordingSink::new();
        let (handle, mut provider) = start(config(), &services(&sink));

        let mut corrupt = encoded_data_frame(STATION, 2).to_vec();
        corrupt[100] ^= 0x01;
        send_data(&mut provider, &[1]).await;
        provider.write_all(&corrupt).await.unwrap();
        send_data(&mut provider, &[3]).await;

        eventually(|| sink.len() == 2).await;
        let status = handle.status();
        assert_eq!(sink.sequence_numbers(), vec![1, 3]);
        assert_eq!(status.stats.decode_errors, 1);
        assert_eq!(status.gaps, vec![range(2, 2)]);
        assert!(!handle.is_closed());
    }

    #[tokio::test]
    async fn provider_alert_closes_and_deregisters() {
        let sink = RecordingSink::new();
        let services = services(&sink);
        let (handle, mut provider) = start(config(), &services);
        services.registry.register(handle.clone());

        send(&mut provider, Alert::new("station maintenance")).await;
        assert_eq!(handle.closed().await, CloseReason::Alert("station maintenance".into()));
        assert!(services.registry.lookup(STATION).is_none());
    }

    #[tokio::test]
    async fn close_sends_shutdown_alert() {
        let sink = RecordingSink::new();
        let (handle, mut provider) = start(config(), &services(&sink));

        handle.close();
        assert_eq!(handle.closed().await, CloseReason::Requested);

        let mut reader = FrameReader::new();
        let frame = read_frame(&mut reader, &mut provider).await;
        assert_eq!(frame.body, FrameBody::Alert(Alert::shutdown()));
        assert_eq!(frame.header.creator, "TEST");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_provider_expires() {
        let sink = RecordingSink::new();
        let config = SessionConfig { read_timeout: Duration::from_secs(120), ..config() };
        let (handle, _provider) = start(config, &services(&sink));
        assert_eq!(handle.closed().await, CloseReason::ReadTimeout(Duration::from_secs(120)));
    }

    #[tokio::test]
    async fn provider_hangup_closes() {
        let sink = RecordingSink::new();
        let (handle, provider) = start(config(), &services(&sink));
        drop(provider);
        assert_eq!(handle.closed().await, CloseReason::PeerClosed);
        assert!(handle.state().is_closed());
    }

    #[tokio::test]
    async fn option_request_is_answered() {
        let sink = RecordingSink::new();
        let (_handle, mut provider) = start(config(), &services(&sink));

        send(&mut provider, FrameBody::OptionRequest(vec![FrameOption::station_name(STATION)])).await;
        let mut reader = FrameReader::new();
        let frame = read_frame(&mut reader, &mut provider).await;
        assert_eq!(frame.body, FrameBody::OptionResponse(vec![FrameOption::station_name("TEST")]));
    }

    #[tokio::test]
    async fn unauthenticated_frames_are_dropped() {
        let sink = RecordingSink::new();
        let services = services(&sink).with_authenticator(Arc::new(KeyAllowList::new([9], false)));
        let (handle, mut provider) = start(config(), &services);

        send_data(&mut provider, &[1, 2]).await;
        eventually(|| handle.status().stats.auth_failures == 2).await;
        assert!(sink.is_empty());
        assert_eq!(handle.status().last_contiguous, None);
    }

    #[tokio::test]
    async fn provider_restart_resets_sequence_state() {
        let sink = RecordingSink::new();
        let (handle, mut provider) = start(config(), &services(&sink));

        send_data(&mut provider, &[100, 102]).await;
        eventually(|| handle.status().last_contiguous == Some(102)).await;

        let restart = Acknowledgment { highest_seq: Some(1), lowest_seq: Some(0), ..Default::default() };
        send(&mut provider, restart).await;
        send_data(&mut provider, &[2]).await;

        eventually(|| handle.status().last_contiguous == Some(2)).await;
        assert!(handle.status().gaps.is_empty());
        assert_eq!(sink.sequence_numbers(), vec![100, 102, 2]);
    }

    #[tokio::test]
    async fn reserved_sequence_number_is_not_tracked() {
        let sink = RecordingSink::new();
        let config = SessionConfig { ack_interval: Duration::from_millis(20), ..config() };
        let (handle, mut provider) = start(config, &services(&sink));

        send_data(&mut provider, &[u64::MAX, 1]).await;
        eventually(|| handle.status().stats.data_frames == 1).await;
        eventually(|| sink.len() == 1).await;

        let mut reader = FrameReader::new();
        let ack = loop {
            if let FrameBody::Acknowledgment(ack) = read_frame(&mut reader, &mut provider).await.body {
                if ack.highest_seq.is_some() {
                    break ack;
                }
            }
        };
        assert_eq!(ack.highest_seq, Some(1));
        assert_eq!(handle.status().stats.decode_errors, 1);
        assert!(!handle.is_closed());
    }

    struct StalledSink;

    #[async_trait::async_trait]
    impl RawFrameSink for StalledSink {
        async fn store(&self, _frame: RawStationDataFrame) -> Result<()> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn slow_sink_costs_payloads_not_the_stream() {
        let services = SessionServices::new(Arc::new(StalledSink), SessionRegistry::new(false));
        let config = SessionConfig { forward_queue_capacity: 1, forward_block: Duration::from_millis(5), ..config() };
        let (handle, mut provider) = start(config, &services);

        send_data(&mut provider, &[1, 2, 3, 4, 5]).await;
        eventually(|| handle.status().last_contiguous == Some(5)).await;
        eventually(|| handle.status().stats.payloads_dropped == 3).await;
        assert!(!handle.is_closed());
    }

    #[tokio::test]
    async fn status_stream_sees_the_close() {
        use futures::StreamExt;

        let sink = RecordingSink::new();
        let (handle, _provider) = start(config(), &services(&sink));
        let mut updates = handle.status_updates();

        assert_eq!(updates.next().await.unwrap().state, SessionState::Established);
        handle.close();
        let closed = updates.filter(|s| futures::future::ready(s.state.is_closed())).next().await.unwrap();
        assert_eq!(closed.state, SessionState::Closed(CloseReason::Requested));
    }
}
