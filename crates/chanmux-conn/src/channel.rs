//! Logical channels carried by a connection.
//!
//! A [`Channel`] is a cheap handle. The connection keeps the matching
//! [`ChannelSlot`] in its registry; the slot owns the sending side of the
//! channel's inbound buffer, so removing it (full close or teardown) is what
//! eventually wakes a parked reader.
//!
//! Dropping the last handle to a channel ends its local half, discards
//! anything still buffered, and lets the channel leave the registry once the
//! peer has ended its half too.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use chanmux_frame::{Frame, NO_CHANNEL};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, trace};

use crate::connection::ConnectionShared;
use crate::error::{ConnError, Result};
use crate::registry::Identified;

/// Lifecycle of a channel.
///
/// ```text
/// Idle -> Open -> HalfClosedLocal  -> Closed
///              -> HalfClosedRemote -> Closed
/// ```
///
/// Any state moves straight to `Closed` when the connection is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Allocated locally, nothing sent or received yet.
    Idle,
    Open,
    /// END_STREAM sent; the peer may still send.
    HalfClosedLocal,
    /// END_STREAM received; we may still send.
    HalfClosedRemote,
    Closed,
}

impl ChannelState {
    pub fn can_send(self) -> bool {
        matches!(
            self,
            ChannelState::Idle | ChannelState::Open | ChannelState::HalfClosedRemote
        )
    }

    pub fn can_receive(self) -> bool {
        matches!(
            self,
            ChannelState::Idle | ChannelState::Open | ChannelState::HalfClosedLocal
        )
    }
}

#[derive(Debug)]
pub(crate) enum Inbound {
    Data(Bytes),
    End,
}

struct Reader {
    rx: mpsc::Receiver<Inbound>,
    /// Unread remainder of the last chunk.
    pending: Bytes,
    eof: bool,
}

pub(crate) struct ChannelCore {
    id: u32,
    /// Peer's ID for this channel, `NO_CHANNEL` until learned.
    remote_id: AtomicU32,
    state: Mutex<ChannelState>,
    reader: AsyncMutex<Reader>,
    /// Serializes writers so chunks of one write are never interleaved.
    write_lock: AsyncMutex<()>,
    /// Live user handles. The channel detaches when this reaches zero.
    handles: AtomicUsize,
    detached: AtomicBool,
    conn: Arc<ConnectionShared>,
}

impl ChannelCore {
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn remote_id(&self) -> u32 {
        self.remote_id.load(Ordering::Acquire)
    }

    pub(crate) fn learn_remote(&self, remote: u32) {
        if remote != NO_CHANNEL {
            let _ = self.remote_id.compare_exchange(
                NO_CHANNEL,
                remote,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.lock_state()
    }

    pub(crate) fn force_close(&self) {
        *self.lock_state() = ChannelState::Closed;
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Take another user handle, unless the last one is already gone.
    fn retain(&self) -> bool {
        self.handles
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 0).then_some(n + 1)
            })
            .is_ok()
    }

    /// The last user handle went away: nobody will read or write again.
    fn detach(&self) {
        self.detached.store(true, Ordering::Release);
        if let Ok(mut reader) = self.reader.try_lock() {
            // Closing the receiver also unblocks a demux waiting for room.
            reader.rx.close();
            while reader.rx.try_recv().is_ok() {}
            reader.pending = Bytes::new();
        }
        if self.conn.cancel.is_cancelled() {
            return;
        }
        match self.state() {
            ChannelState::Idle => {
                self.force_close();
                self.conn.release(self.id);
            }
            ChannelState::Open | ChannelState::HalfClosedRemote => {
                debug!(channel = self.id, "channel dropped, ending local half");
                let end = Frame::data(self.id, self.remote_id(), Bytes::new(), true);
                self.conn.queue_detached(end);
                self.end_local();
            }
            ChannelState::HalfClosedLocal | ChannelState::Closed => {}
        }
    }

    fn begin_send(&self) -> Result<()> {
        self.conn.ensure_usable()?;
        let mut state = self.lock_state();
        match *state {
            ChannelState::Idle => {
                *state = ChannelState::Open;
                Ok(())
            }
            ChannelState::Open | ChannelState::HalfClosedRemote => Ok(()),
            ChannelState::HalfClosedLocal | ChannelState::Closed => {
                Err(ConnError::ChannelClosed(self.id))
            }
        }
    }

    /// Local END_STREAM went out. Releases the channel once both halves are done.
    fn end_local(&self) {
        let closed = {
            let mut state = self.lock_state();
            match *state {
                ChannelState::Idle | ChannelState::Open => {
                    *state = ChannelState::HalfClosedLocal;
                    false
                }
                ChannelState::HalfClosedRemote => {
                    *state = ChannelState::Closed;
                    true
                }
                ChannelState::HalfClosedLocal | ChannelState::Closed => false,
            }
        };
        trace!(channel = self.id, state = ?self.state(), "local end of stream");
        if closed {
            self.conn.release(self.id);
        }
    }

    /// Returns false when the channel no longer takes data from the peer.
    fn accept_remote_data(&self) -> bool {
        let mut state = self.lock_state();
        match *state {
            ChannelState::Idle => {
                *state = ChannelState::Open;
                true
            }
            ChannelState::Open | ChannelState::HalfClosedLocal => true,
            ChannelState::HalfClosedRemote | ChannelState::Closed => false,
        }
    }

    /// Peer END_STREAM arrived. Returns true when the channel is now fully closed.
    fn end_remote(&self) -> bool {
        let mut state = self.lock_state();
        match *state {
            ChannelState::Idle | ChannelState::Open => {
                *state = ChannelState::HalfClosedRemote;
                false
            }
            ChannelState::HalfClosedLocal => {
                *state = ChannelState::Closed;
                true
            }
            ChannelState::HalfClosedRemote | ChannelState::Closed => false,
        }
    }

    async fn send_data(&self, payload: Bytes, end_stream: bool) -> Result<()> {
        let frame = Frame::data(self.id, self.remote_id(), payload, end_stream);
        self.conn.send_frame(frame).await
    }

    /// Next item from the peer, honouring teardown.
    async fn next_inbound(&self, reader: &mut Reader) -> Result<Option<Bytes>> {
        loop {
            if reader.eof {
                return Ok(None);
            }
            let item = tokio::select! {
                biased;
                item = reader.rx.recv() => item,
                _ = self.conn.cancel.cancelled() => return Err(self.conn.close_error()),
            };
            match item {
                Some(Inbound::Data(bytes)) if bytes.is_empty() => continue,
                Some(Inbound::Data(bytes)) => return Ok(Some(bytes)),
                Some(Inbound::End) => {
                    reader.eof = true;
                    return Ok(None);
                }
                // Every sender is gone: either the connection was torn down
                // or the channel was closed locally before the peer knew it.
                None => {
                    self.conn.ensure_usable()?;
                    reader.eof = true;
                    return Ok(None);
                }
            }
        }
    }
}

/// Registry entry for a live channel.
#[derive(Clone)]
pub(crate) struct ChannelSlot {
    pub(crate) core: Arc<ChannelCore>,
    inbound: mpsc::Sender<Inbound>,
}

pub(crate) enum Delivery {
    Delivered,
    /// The channel already saw END_STREAM from the peer.
    Rejected,
    /// The channel reached `Closed` and should leave the registry.
    Closed,
    /// The connection was torn down while waiting for buffer space.
    Cancelled,
}

impl ChannelSlot {
    pub(crate) fn pair(
        id: u32,
        remote: u32,
        state: ChannelState,
        conn: Arc<ConnectionShared>,
    ) -> (ChannelSlot, Channel) {
        let (tx, rx) = mpsc::channel(conn.config.channel_buffer_frames);
        let core = Arc::new(ChannelCore {
            id,
            remote_id: AtomicU32::new(remote),
            state: Mutex::new(state),
            reader: AsyncMutex::new(Reader {
                rx,
                pending: Bytes::new(),
                eof: false,
            }),
            write_lock: AsyncMutex::new(()),
            handles: AtomicUsize::new(1),
            detached: AtomicBool::new(false),
            conn,
        });
        (
            ChannelSlot {
                core: Arc::clone(&core),
                inbound: tx,
            },
            Channel { core },
        )
    }

    /// Hand a data frame's payload to the channel. Waits while the channel's
    /// buffer is full. Payloads for a dropped channel are discarded.
    pub(crate) async fn deliver(&self, payload: Bytes, end_stream: bool) -> Delivery {
        if !self.core.accept_remote_data() {
            return Delivery::Rejected;
        }
        let detached = self.core.is_detached();
        if !payload.is_empty() && !detached && !self.push(Inbound::Data(payload)).await {
            return Delivery::Cancelled;
        }
        if end_stream {
            if !detached && !self.push(Inbound::End).await {
                return Delivery::Cancelled;
            }
            if self.core.end_remote() {
                return Delivery::Closed;
            }
        }
        Delivery::Delivered
    }

    /// Returns false only when the connection was torn down while waiting.
    async fn push(&self, item: Inbound) -> bool {
        tokio::select! {
            biased;
            _ = self.core.conn.cancel.cancelled() => false,
            res = self.inbound.send(item) => {
                if res.is_err() {
                    trace!(channel = self.core.id, "discarding data for dropped channel");
                }
                true
            }
        }
    }
}

impl Identified for ChannelSlot {
    fn channel_id(&self) -> u32 {
        self.core.id
    }
}

/// A bidirectional byte stream multiplexed over a connection.
///
/// Clones share the same channel. Reads and writes may run concurrently; two
/// concurrent readers split the incoming data between them.
///
/// When the last clone is dropped the local half is ended with END_STREAM
/// (a channel that never carried data is simply forgotten) and any data the
/// peer still sends is discarded.
pub struct Channel {
    core: Arc<ChannelCore>,
}

impl Channel {
    /// A new handle for a registered channel, unless it was already dropped.
    pub(crate) fn from_core(core: Arc<ChannelCore>) -> Option<Self> {
        if core.retain() {
            Some(Self { core })
        } else {
            None
        }
    }

    /// Local channel ID.
    pub fn id(&self) -> u32 {
        self.core.id
    }

    /// The peer's ID for this channel, once known.
    pub fn remote_id(&self) -> Option<u32> {
        match self.core.remote_id() {
            NO_CHANNEL => None,
            id => Some(id),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.core.state()
    }

    /// Next chunk of data as received, or `None` at end of stream.
    pub async fn read_chunk(&self) -> Result<Option<Bytes>> {
        let mut reader = self.core.reader.lock().await;
        if !reader.pending.is_empty() {
            return Ok(Some(std::mem::take(&mut reader.pending)));
        }
        self.core.next_inbound(&mut reader).await
    }

    /// Read into `buf`. Returns 0 at end of stream.
    ///
    /// Suspends until data is buffered, the peer ends the stream, or the
    /// connection goes away (`ConnectionClosed` / `ConnectionFailed`).
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut reader = self.core.reader.lock().await;
        if reader.pending.is_empty() {
            match self.core.next_inbound(&mut reader).await? {
                Some(chunk) => reader.pending = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(reader.pending.len());
        buf[..n].copy_from_slice(&reader.pending[..n]);
        reader.pending.advance(n);
        Ok(n)
    }

    /// Read until the peer ends the stream.
    pub async fn read_to_end(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Send at most one frame's worth of `data`. Returns the bytes sent.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        let _guard = self.core.write_lock.lock().await;
        self.core.begin_send()?;
        if data.is_empty() {
            return Ok(0);
        }
        let n = data.len().min(self.core.conn.config.max_frame_payload);
        self.core
            .send_data(Bytes::copy_from_slice(&data[..n]), false)
            .await?;
        Ok(n)
    }

    /// Send all of `data`, split into frames of at most `max_frame_payload`.
    pub async fn write_all(&self, data: &[u8]) -> Result<()> {
        self.send_chunked(data, false).await
    }

    /// Send all of `data` and end the local half of the stream.
    pub async fn write_final(&self, data: &[u8]) -> Result<()> {
        self.send_chunked(data, true).await
    }

    /// End the local half of the stream.
    ///
    /// Idempotent. A channel that never carried any data is closed locally
    /// without telling the peer.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.core.write_lock.lock().await;
        match self.core.state() {
            ChannelState::HalfClosedLocal | ChannelState::Closed => return Ok(()),
            ChannelState::Idle => {
                self.core.force_close();
                self.core.conn.release(self.core.id);
                return Ok(());
            }
            ChannelState::Open | ChannelState::HalfClosedRemote => {}
        }
        self.core.conn.ensure_usable()?;
        self.core.send_data(Bytes::new(), true).await?;
        self.core.end_local();
        Ok(())
    }

    async fn send_chunked(&self, data: &[u8], end_stream: bool) -> Result<()> {
        let _guard = self.core.write_lock.lock().await;
        self.core.begin_send()?;

        if data.is_empty() {
            if end_stream {
                self.core.send_data(Bytes::new(), true).await?;
            }
        } else {
            let mut chunks = data
                .chunks(self.core.conn.config.max_frame_payload)
                .peekable();
            while let Some(chunk) = chunks.next() {
                let last = chunks.peek().is_none();
                self.core
                    .send_data(Bytes::copy_from_slice(chunk), end_stream && last)
                    .await?;
            }
        }

        if end_stream {
            self.core.end_local();
        }
        Ok(())
    }

    /// Wrap this handle in an [`AsyncRead`] + [`AsyncWrite`] adapter.
    pub fn into_stream(self) -> ChannelStream {
        ChannelStream::new(self)
    }
}

impl Clone for Channel {
    fn clone(&self) -> Self {
        self.core.handles.fetch_add(1, Ordering::AcqRel);
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.core.handles.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.core.detach();
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.core.id)
            .field("remote_id", &self.remote_id())
            .field("state", &self.state())
            .finish()
    }
}

type Pending<T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'static>>;

/// A [`Channel`] as a tokio byte stream.
///
/// - Reads drain incoming chunks; end of stream reads as 0 bytes.
/// - Each write sends at most one frame.
/// - `poll_shutdown` sends END_STREAM.
///
/// Lets codecs such as `tokio_util::codec::FramedRead` run on top of a channel.
pub struct ChannelStream {
    channel: Channel,
    read_buf: Bytes,
    read_eof: bool,
    pending_read: Option<Pending<Option<Bytes>>>,
    pending_write: Option<Pending<usize>>,
    pending_close: Option<Pending<()>>,
}

impl ChannelStream {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            read_buf: Bytes::new(),
            read_eof: false,
            pending_read: None,
            pending_write: None,
            pending_close: None,
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Recover the handle. Bytes already pulled into the adapter are returned
    /// alongside it.
    pub fn into_inner(self) -> (Channel, Bytes) {
        (self.channel, self.read_buf)
    }
}

impl From<Channel> for ChannelStream {
    fn from(channel: Channel) -> Self {
        Self::new(channel)
    }
}

impl fmt::Debug for ChannelStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelStream")
            .field("channel", &self.channel)
            .field("buffered", &self.read_buf.len())
            .field("read_eof", &self.read_eof)
            .finish()
    }
}

impl AsyncRead for ChannelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.read_eof || buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }

            let channel = &this.channel;
            let fut = this.pending_read.get_or_insert_with(|| {
                let channel = channel.clone();
                let read: Pending<Option<Bytes>> = Box::pin(async move { channel.read_chunk().await });
                read
            });
            let next = ready!(fut.as_mut().poll(cx));
            this.pending_read = None;
            match next? {
                Some(chunk) => this.read_buf = chunk,
                None => this.read_eof = true,
            }
        }
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        // A write left pending by an earlier call carries the same data.
        if this.pending_write.is_none() {
            if data.is_empty() {
                return Poll::Ready(Ok(0));
            }
            let channel = this.channel.clone();
            let n = data.len().min(channel.core.conn.config.max_frame_payload);
            let chunk = data[..n].to_vec();
            let write: Pending<usize> = Box::pin(async move { channel.write(&chunk).await });
            this.pending_write = Some(write);
        }
        let fut = match this.pending_write.as_mut() {
            Some(fut) => fut,
            None => return Poll::Ready(Ok(0)),
        };
        let written = ready!(fut.as_mut().poll(cx));
        this.pending_write = None;
        Poll::Ready(written.map_err(io::Error::from))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if let Some(fut) = this.pending_write.as_mut() {
            let written = ready!(fut.as_mut().poll(cx));
            this.pending_write = None;
            written?;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        let this = &mut *self;
        let channel = &this.channel;
        let fut = this.pending_close.get_or_insert_with(|| {
            let channel = channel.clone();
            let close: Pending<()> = Box::pin(async move { channel.close().await });
            close
        });
        let closed = ready!(fut.as_mut().poll(cx));
        this.pending_close = None;
        Poll::Ready(closed.map_err(io::Error::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_and_receive_permissions() {
        use ChannelState::*;
        assert!(Idle.can_send() && Open.can_send() && HalfClosedRemote.can_send());
        assert!(!HalfClosedLocal.can_send() && !Closed.can_send());
        assert!(Open.can_receive() && HalfClosedLocal.can_receive());
        assert!(!HalfClosedRemote.can_receive() && !Closed.can_receive());
    }
}
