//! One multiplexed connection over a byte stream.
//!
//! Each connection runs a small set of tokio tasks:
//! - demux: owns the read half, routes data to channels, answers pings and
//!   reacts to GOAWAY;
//! - writer: owns the write half and drains the bounded outbound queue;
//! - heartbeat: sends pings and runs the failure detector;
//! - supervisor (only when attached to a [`Context`](crate::Context)):
//!   starts a graceful shutdown when the context shuts down.
//!
//! Teardown is driven by one `CancellationToken`. Whatever triggers it first
//! (local shutdown, GOAWAY, peer EOF, a transport error or a confirmed failure)
//! becomes the connection's [`CloseReason`], and every parked read, write or
//! accept is woken with the matching error.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chanmux_frame::{Frame, FrameCodec, FrameType, NO_CHANNEL};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::channel::{Channel, ChannelSlot, ChannelState, Delivery};
use crate::config::ConnectionConfig;
use crate::detector::{FailureDetector, Health, Liveness, Pulse};
use crate::error::{ConnError, Result};
use crate::registry::ChannelRegistry;

/// Upper bound on flushing queued frames once a connection is torn down.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Why a connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Local shutdown, directly or through the owning context.
    Shutdown,
    /// The peer sent GOAWAY.
    GoAway,
    /// The peer closed the transport at a frame boundary.
    PeerClosed,
    /// Heartbeat timeout, transport error or malformed frames.
    Failed(String),
}

impl CloseReason {
    pub fn is_failure(&self) -> bool {
        matches!(self, CloseReason::Failed(_))
    }

    /// The error reported to operations interrupted by this teardown.
    pub fn to_error(&self) -> ConnError {
        match self {
            CloseReason::Failed(detail) => ConnError::ConnectionFailed(detail.clone()),
            other => ConnError::ConnectionClosed(other.to_string()),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Shutdown => f.write_str("local shutdown"),
            CloseReason::GoAway => f.write_str("peer sent GOAWAY"),
            CloseReason::PeerClosed => f.write_str("peer closed the transport"),
            CloseReason::Failed(detail) => write!(f, "failed: {detail}"),
        }
    }
}

/// Point-in-time view of a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStats {
    pub open_channels: usize,
    pub frames_in: u64,
    pub frames_out: u64,
    /// Round trip of the most recently answered heartbeat.
    pub last_rtt: Option<Duration>,
    pub suspicion_level: f64,
    pub suspected: bool,
}

/// State shared by the connection's tasks and its channels.
pub(crate) struct ConnectionShared {
    pub(crate) id: u64,
    pub(crate) peer: String,
    pub(crate) config: ConnectionConfig,
    pub(crate) registry: ChannelRegistry<ChannelSlot>,
    pub(crate) cancel: CancellationToken,
    outbound: mpsc::Sender<Frame>,
    accepting: AtomicBool,
    reason: OnceLock<CloseReason>,
    /// Signalled whenever a channel leaves the registry.
    released: Notify,
    pulse: watch::Sender<Pulse>,
    health: watch::Sender<Health>,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
}

impl ConnectionShared {
    pub(crate) fn close_error(&self) -> ConnError {
        match self.reason.get() {
            Some(reason) => reason.to_error(),
            None => ConnError::ConnectionClosed("connection closed".into()),
        }
    }

    /// Fails once the connection has been torn down.
    pub(crate) fn ensure_usable(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(self.close_error())
        } else {
            Ok(())
        }
    }

    fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Queue a frame for the writer task, waiting for room.
    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.ensure_usable()?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(self.close_error()),
            res = self.outbound.send(frame) => res.map_err(|_| self.close_error()),
        }
    }

    /// Queue a control frame without waiting. Returns false if it was dropped.
    fn try_send_control(&self, frame: Frame) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                debug!(
                    conn_id = self.id,
                    kind = frame.frame_type.name(),
                    "outbound queue full, dropping control frame"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a frame from a context that cannot wait, such as `Drop`. Falls
    /// back to a spawned send when the queue is full.
    pub(crate) fn queue_detached(self: &Arc<Self>, frame: Frame) {
        let frame = match self.outbound.try_send(frame) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => return,
            Err(mpsc::error::TrySendError::Full(frame)) => frame,
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let shared = Arc::clone(self);
                runtime.spawn(async move {
                    if let Err(err) = shared.send_frame(frame).await {
                        debug!(conn_id = shared.id, %err, "could not send END_STREAM for dropped channel");
                    }
                });
            }
            Err(_) => debug!(conn_id = self.id, "no runtime, END_STREAM for dropped channel not sent"),
        }
    }

    /// Drive a demux step that waits on local consumers (a full channel
    /// buffer or accept queue). The transport is not read meanwhile, so the
    /// pulse is kept fresh: a slow consumer must not look like a dead peer.
    async fn while_stalled<F: Future>(&self, step: F) -> F::Output {
        tokio::pin!(step);
        let period = self.config.detector_check_interval();
        let mut keepalive = time::interval_at(time::Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stalled = false;
        loop {
            tokio::select! {
                biased;
                output = &mut step => return output,
                _ = keepalive.tick() => {
                    if !stalled {
                        debug!(conn_id = self.id, "demux waiting on a slow consumer");
                        stalled = true;
                    }
                    let now = Instant::now();
                    self.pulse.send_modify(|pulse| pulse.last_heard = now);
                }
            }
        }
    }

    /// Drop a fully closed channel from the registry.
    pub(crate) fn release(&self, id: u32) {
        if self.registry.remove(id).is_some() {
            debug!(conn_id = self.id, channel = id, "channel closed");
        }
        self.released.notify_waiters();
    }

    /// Record the close reason and stop accepting channels.
    /// Returns false if the connection was already closing.
    fn begin_close(&self, reason: CloseReason) -> bool {
        self.accepting.store(false, Ordering::Release);
        self.reason.set(reason).is_ok()
    }

    /// Tear the connection down now. Idempotent; the first reason recorded wins.
    pub(crate) fn terminate(&self, reason: CloseReason) {
        self.begin_close(reason);
        if self.cancel.is_cancelled() {
            return;
        }
        let reason = self.reason.get().cloned().unwrap_or(CloseReason::Shutdown);
        if reason.is_failure() {
            warn!(conn_id = self.id, peer = %self.peer, %reason, "connection failed");
        } else {
            info!(conn_id = self.id, peer = %self.peer, %reason, "connection closed");
        }

        self.cancel.cancel();
        for slot in self.registry.drain() {
            slot.core.force_close();
        }
        self.released.notify_waiters();
    }

    /// Stop taking new channels, optionally tell the peer with GOAWAY, give
    /// open channels up to `shutdown_grace` to finish, then tear down.
    async fn graceful_close(self: Arc<Self>, reason: CloseReason, send_go_away: bool) {
        if !self.begin_close(reason.clone()) {
            return;
        }
        info!(
            conn_id = self.id,
            peer = %self.peer,
            %reason,
            open_channels = self.registry.len(),
            "draining connection"
        );

        let drain = async {
            if send_go_away {
                if let Err(err) = self.send_frame(Frame::go_away()).await {
                    debug!(conn_id = self.id, %err, "could not send GOAWAY");
                }
            }
            self.wait_idle().await;
        };
        if time::timeout(self.config.shutdown_grace, drain).await.is_err() {
            warn!(
                conn_id = self.id,
                remaining = self.registry.len(),
                "shutdown grace elapsed, cancelling open channels"
            );
        }
        self.terminate(reason);
    }

    async fn wait_idle(&self) {
        loop {
            let released = self.released.notified();
            if self.registry.is_empty() || self.cancel.is_cancelled() {
                return;
            }
            released.await;
        }
    }

    async fn dispatch(self: &Arc<Self>, frame: Frame, now: Instant, accept: &mpsc::Sender<Channel>) {
        match frame.frame_type {
            FrameType::Data => self.route_data(frame, accept).await,
            FrameType::Ping if frame.is_ack() => match <[u8; 8]>::try_from(frame.payload.as_ref()) {
                Ok(seq) => {
                    let seq = u64::from_be_bytes(seq);
                    self.pulse.send_modify(|pulse| pulse.last_ack = Some((seq, now)));
                }
                Err(_) => debug!(
                    conn_id = self.id,
                    len = frame.payload.len(),
                    "ignoring ping ACK with unexpected payload"
                ),
            },
            FrameType::Ping => {
                self.try_send_control(Frame::ping(frame.payload, true));
            }
            FrameType::GoAway => {
                info!(conn_id = self.id, peer = %self.peer, "received GOAWAY");
                let shared = Arc::clone(self);
                tokio::spawn(shared.graceful_close(CloseReason::GoAway, false));
            }
        }
    }

    async fn route_data(self: &Arc<Self>, frame: Frame, accept: &mpsc::Sender<Channel>) {
        let src = frame.src_channel_id;
        let dest = frame.dest_channel_id;

        let slot = if dest != NO_CHANNEL {
            match self.registry.lookup(dest) {
                Some(slot) => slot,
                None => {
                    warn!(conn_id = self.id, channel = dest, src, "dropping data for unknown channel");
                    return;
                }
            }
        } else if src == NO_CHANNEL {
            warn!(conn_id = self.id, "dropping data frame without channel ids");
            return;
        } else if let Some(slot) = self.registry.lookup_remote(src) {
            slot
        } else {
            match self.open_inbound(src, accept).await {
                Some(slot) => slot,
                None => return,
            }
        };

        slot.core.learn_remote(src);
        let id = slot.core.id();
        let end_stream = frame.is_end_stream();
        match self.while_stalled(slot.deliver(frame.payload, end_stream)).await {
            Delivery::Delivered | Delivery::Cancelled => {}
            Delivery::Rejected => {
                warn!(conn_id = self.id, channel = id, "dropping data after END_STREAM");
            }
            Delivery::Closed => self.release(id),
        }
    }

    /// Register a channel the peer opened and queue it for `accept()`.
    async fn open_inbound(self: &Arc<Self>, remote: u32, accept: &mpsc::Sender<Channel>) -> Option<ChannelSlot> {
        if !self.is_accepting() {
            warn!(conn_id = self.id, remote, "refusing inbound channel while draining");
            return None;
        }
        let registered = self.registry.next_channel_id().and_then(|id| {
            let (slot, channel) =
                ChannelSlot::pair(id, remote, ChannelState::Open, Arc::clone(self));
            self.registry.register_remote(remote, slot.clone())?;
            Ok((slot, channel))
        });
        let (slot, channel) = match registered {
            Ok(pair) => pair,
            Err(err) => {
                error!(conn_id = self.id, remote, %err, "cannot open inbound channel");
                return None;
            }
        };
        debug!(conn_id = self.id, channel = slot.core.id(), remote, "peer opened channel");

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            res = self.while_stalled(accept.send(channel)) => {
                if res.is_err() {
                    debug!(conn_id = self.id, "accept queue closed");
                }
            }
        }
        Some(slot)
    }
}

/// A live connection to one peer.
///
/// Cloning yields another handle to the same connection. Must be created
/// inside a tokio runtime.
#[derive(Clone)]
pub struct ConnectionContext {
    shared: Arc<ConnectionShared>,
    accept_rx: Arc<AsyncMutex<mpsc::Receiver<Channel>>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ConnectionContext {
    /// Start multiplexing over `stream`.
    pub fn new<S>(peer: impl Into<String>, stream: S, config: ConnectionConfig) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_parts(peer, reader, writer, config)
    }

    /// Start multiplexing over separately owned read and write halves.
    pub fn from_parts<R, W>(
        peer: impl Into<String>,
        reader: R,
        writer: W,
        config: ConnectionConfig,
    ) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::start(peer.into(), reader, writer, config, None)
    }

    pub(crate) fn start<R, W>(
        peer: String,
        reader: R,
        writer: W,
        config: ConnectionConfig,
        shutdown: Option<CancellationToken>,
    ) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        config.validate()?;

        let (outbound, outbound_rx) = mpsc::channel(config.outbound_queue_frames);
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog);
        let shared = Arc::new(ConnectionShared {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            config,
            registry: ChannelRegistry::new(),
            cancel: CancellationToken::new(),
            outbound,
            accepting: AtomicBool::new(true),
            reason: OnceLock::new(),
            released: Notify::new(),
            pulse: watch::channel(Pulse::new(Instant::now())).0,
            health: watch::channel(Health::default()).0,
            frames_in: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
        });

        // Inbound frames may use the full 24-bit length; `max_frame_payload`
        // only bounds what this side sends.
        let frames_in = FramedRead::new(reader, FrameCodec::new());
        let frames_out = FramedWrite::new(writer, FrameCodec::new());

        let mut tasks = vec![
            tokio::spawn(run_demux(Arc::clone(&shared), frames_in, accept_tx)),
            tokio::spawn(run_writer(Arc::clone(&shared), frames_out, outbound_rx)),
            tokio::spawn(run_heartbeat(Arc::clone(&shared))),
        ];
        if let Some(shutdown) = shutdown {
            tasks.push(tokio::spawn(supervise(Arc::clone(&shared), shutdown)));
        }
        info!(conn_id = shared.id, peer = %shared.peer, "connection started");

        Ok(Self {
            shared,
            accept_rx: Arc::new(AsyncMutex::new(accept_rx)),
            tasks: Arc::new(Mutex::new(tasks)),
        })
    }

    /// Process-unique connection ID.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Open a new outbound channel. The peer learns about it with the first
    /// frame sent on it.
    pub fn open_channel(&self) -> Result<Channel> {
        let shared = &self.shared;
        shared.ensure_usable()?;
        if !shared.is_accepting() {
            return Err(ConnError::NotAccepting);
        }
        let id = shared.registry.next_channel_id()?;
        let (slot, channel) = ChannelSlot::pair(id, NO_CHANNEL, ChannelState::Idle, Arc::clone(shared));
        shared.registry.register(slot)?;
        debug!(conn_id = shared.id, channel = id, "opened channel");
        Ok(channel)
    }

    /// Wait for the peer to open a channel.
    pub async fn accept(&self) -> Result<Channel> {
        let mut accept_rx = self.accept_rx.lock().await;
        tokio::select! {
            biased;
            channel = accept_rx.recv() => channel.ok_or_else(|| self.shared.close_error()),
            _ = self.shared.cancel.cancelled() => Err(self.shared.close_error()),
        }
    }

    /// Look up a live channel by its local ID.
    pub fn channel(&self, id: u32) -> Option<Channel> {
        self.shared
            .registry
            .lookup(id)
            .and_then(|slot| Channel::from_core(slot.core))
    }

    /// Local IDs of the live channels, ascending.
    pub fn channel_ids(&self) -> Vec<u32> {
        self.shared.registry.ids()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Set as soon as the connection starts closing.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.reason.get().cloned()
    }

    /// Resolve once the connection has been torn down.
    pub async fn closed(&self) -> CloseReason {
        self.shared.cancel.cancelled().await;
        self.close_reason().unwrap_or(CloseReason::Shutdown)
    }

    /// Graceful shutdown: send GOAWAY, refuse new channels, wait up to
    /// `shutdown_grace` for open channels, then close the transport.
    pub async fn shutdown(&self) {
        Arc::clone(&self.shared)
            .graceful_close(CloseReason::Shutdown, true)
            .await;
        self.finish().await;
    }

    /// Wait for teardown and for the connection's tasks to exit.
    pub(crate) async fn finish(&self) {
        self.shared.cancel.cancelled().await;
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(err) = task.await {
                if err.is_panic() {
                    error!(conn_id = self.shared.id, %err, "connection task panicked");
                }
            }
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        let health = *self.shared.health.borrow();
        ConnectionStats {
            open_channels: self.shared.registry.len(),
            frames_in: self.shared.frames_in.load(Ordering::Relaxed),
            frames_out: self.shared.frames_out.load(Ordering::Relaxed),
            last_rtt: health.last_rtt,
            suspicion_level: health.suspicion_level,
            suspected: health.suspected,
        }
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.shared.id)
            .field("peer", &self.shared.peer)
            .field("closed", &self.is_closed())
            .field("channels", &self.shared.registry.len())
            .finish()
    }
}

async fn run_demux<R>(
    shared: Arc<ConnectionShared>,
    mut frames: FramedRead<R, FrameCodec>,
    accept: mpsc::Sender<Channel>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(frame)) => {
                shared.frames_in.fetch_add(1, Ordering::Relaxed);
                let now = Instant::now();
                shared.pulse.send_modify(|pulse| pulse.last_heard = now);
                shared.dispatch(frame, now, &accept).await;
            }
            Some(Err(err)) => {
                error!(conn_id = shared.id, peer = %shared.peer, %err, "cannot read frames");
                shared.terminate(CloseReason::Failed(err.to_string()));
                break;
            }
            None => {
                shared.terminate(CloseReason::PeerClosed);
                break;
            }
        }
    }
    trace!(conn_id = shared.id, "demux task exiting");
}

async fn run_writer<W>(
    shared: Arc<ConnectionShared>,
    mut sink: FramedWrite<W, FrameCodec>,
    mut outbound: mpsc::Receiver<Frame>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let sent = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            sent = sink.send(frame) => sent,
        };
        if let Err(err) = sent {
            error!(conn_id = shared.id, peer = %shared.peer, %err, "cannot write frames");
            shared.terminate(CloseReason::Failed(err.to_string()));
            break;
        }
        shared.frames_out.fetch_add(1, Ordering::Relaxed);
    }

    // Best effort: flush whatever is still queued, then close the write half.
    let flush = async {
        while let Ok(frame) = outbound.try_recv() {
            if sink.feed(frame).await.is_err() {
                return;
            }
        }
        let _ = sink.close().await;
    };
    if time::timeout(CLOSE_FLUSH_TIMEOUT, flush).await.is_err() {
        debug!(conn_id = shared.id, "transport did not flush before close");
    }
    trace!(conn_id = shared.id, "writer task exiting");
}

async fn run_heartbeat(shared: Arc<ConnectionShared>) {
    let config = &shared.config;
    let mut detector = FailureDetector::new(
        config.heartbeat_interval,
        config.failure_threshold,
        Instant::now(),
    );
    let mut pulses = shared.pulse.subscribe();

    let mut ping_timer = time::interval(config.heartbeat_interval);
    ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut check_timer = time::interval(config.detector_check_interval());
    check_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut seq: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            _ = check_timer.tick() => {
                let pulse = *pulses.borrow_and_update();
                if let Some(rtt) = detector.observe(&pulse) {
                    trace!(conn_id = shared.id, rtt_us = rtt.as_micros() as u64, "heartbeat acknowledged");
                }
                let now = Instant::now();
                let liveness = detector.check(now);
                shared.health.send_replace(detector.health(now));
                match liveness {
                    Liveness::Alive => {}
                    Liveness::Suspect { level } => {
                        warn!(conn_id = shared.id, peer = %shared.peer, level, "peer suspected");
                    }
                    Liveness::Failed { level } => {
                        error!(conn_id = shared.id, peer = %shared.peer, level, "peer failure confirmed");
                        shared.terminate(CloseReason::Failed(format!(
                            "peer unresponsive (suspicion level {level:.2})"
                        )));
                        break;
                    }
                }
            }
            _ = ping_timer.tick() => {
                seq = seq.wrapping_add(1);
                let ping = Frame::ping(Bytes::copy_from_slice(&seq.to_be_bytes()), false);
                if shared.try_send_control(ping) {
                    detector.ping_sent(seq, Instant::now());
                }
            }
        }
    }
    trace!(conn_id = shared.id, "heartbeat task exiting");
}

async fn supervise(shared: Arc<ConnectionShared>, shutdown: CancellationToken) {
    tokio::select! {
        _ = shared.cancel.cancelled() => {}
        _ = shutdown.cancelled() => {
            Arc::clone(&shared)
                .graceful_close(CloseReason::Shutdown, true)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_reason_maps_to_errors() {
        assert!(matches!(
            CloseReason::Failed("boom".into()).to_error(),
            ConnError::ConnectionFailed(msg) if msg == "boom"
        ));
        assert!(matches!(
            CloseReason::GoAway.to_error(),
            ConnError::ConnectionClosed(_)
        ));
        assert!(CloseReason::Failed(String::new()).is_failure());
        assert!(!CloseReason::PeerClosed.is_failure());
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let (stream, _peer) = tokio::io::duplex(64);
        let config = ConnectionConfig::default().with_max_frame_payload(0);
        let err = ConnectionContext::new("test", stream, config).unwrap_err();
        assert!(matches!(err, ConnError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn channel_ids_increase() {
        let (stream, _peer) = tokio::io::duplex(1024);
        let conn = ConnectionContext::new("test", stream, ConnectionConfig::default()).unwrap();
        let a = conn.open_channel().unwrap();
        let b = conn.open_channel().unwrap();
        assert_eq!((a.id(), b.id()), (1, 2));
        assert_eq!(a.state(), ChannelState::Idle);
        assert_eq!(conn.channel_ids(), vec![1, 2]);
        assert_eq!(conn.channel(2).map(|c| c.id()), Some(2));
    }
}
