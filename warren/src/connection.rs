use std::{
    fmt, io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf, ReadHalf, SimplexStream, WriteHalf},
    sync::{watch, Mutex},
};
use tracing::debug;
use warren_proto::{
    packet::{PacketRef, PacketType},
    setup::NewConnectionPayload,
};

use crate::{context::ContextInner, error::ForwardError};

/// Size of the in-process buffer between the demux loop and a connection's reader.
///
/// The buffer is deliberately bounded: the protocol has no windowed flow control, so a consumer
/// that stops reading must eventually stall the demux loop, which stalls the transport, which
/// backpressures the peer.
const INBOUND_BUFFER_SIZE: usize = 64 * 1024;

/// Invoked exactly once when a connection reaches its final teardown, for cleanup of whatever OS
/// resource the owner attached to the handle.
pub type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// The lifecycle of a multiplexed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, but not yet accepted by the responding side.
    WaitInit,

    /// Accepted; data flows in both directions.
    Started,

    /// Closed locally; waiting for the peer to confirm.
    WaitClose,

    /// Fully torn down. Terminal.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WaitInit => write!(f, "wait-init"),
            Self::Started => write!(f, "started"),
            Self::WaitClose => write!(f, "wait-close"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// What the demux loop should do after a success record resolved against a connection's state.
pub(crate) enum SuccessAction {
    Started,
    FinishClose,
    Ignored(ConnectionState),
}

/// The shared half of a connection: everything except the inbound buffer's read side, which is
/// owned by the [`ForwardConnection`] handle.
pub(crate) struct ConnectionInner {
    pub(crate) id: u64,
    initiator: bool,
    details: NewConnectionPayload,
    state: watch::Sender<ConnectionState>,
    pipe_writer: Mutex<Option<WriteHalf<SimplexStream>>>,
    close_callback: Mutex<Option<CloseCallback>>,
    ctx: Arc<ContextInner>,
}

impl ConnectionInner {
    pub(crate) fn new(
        id: u64,
        initiator: bool,
        details: NewConnectionPayload,
        close_callback: Option<CloseCallback>,
        ctx: Arc<ContextInner>,
    ) -> (Arc<Self>, ReadHalf<SimplexStream>) {
        let (read_half, write_half) = tokio::io::simplex(INBOUND_BUFFER_SIZE);
        let (state, _) = watch::channel(ConnectionState::WaitInit);

        let inner = Arc::new(Self {
            id,
            initiator,
            details,
            state,
            pipe_writer: Mutex::new(Some(write_half)),
            close_callback: Mutex::new(close_callback),
            ctx,
        });

        (inner, read_half)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn details(&self) -> &NewConnectionPayload {
        &self.details
    }

    /// Emits one data record carrying `data`, blocking while the connection is still waiting to
    /// be accepted.
    pub(crate) async fn write(&self, data: &[u8]) -> Result<usize, ForwardError> {
        let mut receiver = self.state.subscribe();
        loop {
            let state = *receiver.borrow_and_update();
            match state {
                ConnectionState::WaitInit => {
                    if receiver.changed().await.is_err() {
                        return Err(ForwardError::ConnectionClosed);
                    }
                }
                ConnectionState::Started => break,
                ConnectionState::WaitClose | ConnectionState::Closed => return Err(ForwardError::ConnectionClosed),
            }
        }

        self.ctx
            .write_packet(PacketRef::new(PacketType::Data, self.id, data))
            .await?;
        Ok(data.len())
    }

    /// Marks the connection as started and confirms it to the peer. Only valid on a connection
    /// the peer opened, and only while it is still waiting.
    pub(crate) async fn accept(&self) -> Result<(), ForwardError> {
        if self.initiator {
            return Err(ForwardError::LocallyInitiated);
        }

        let mut previous = ConnectionState::WaitInit;
        let mut accepted = false;
        self.state.send_modify(|state| {
            previous = *state;
            if *state == ConnectionState::WaitInit {
                *state = ConnectionState::Started;
                accepted = true;
            }
        });

        if !accepted {
            return Err(ForwardError::InvalidState(previous));
        }

        self.ctx
            .write_packet(PacketRef::control(PacketType::Success, self.id))
            .await
    }

    /// Refuses a connection the peer opened, tearing it down and signaling the refusal with an
    /// error record.
    pub(crate) async fn reject(&self) -> Result<(), ForwardError> {
        if self.initiator {
            return Err(ForwardError::LocallyInitiated);
        }

        let mut previous = ConnectionState::WaitInit;
        let mut rejected = false;
        self.state.send_modify(|state| {
            previous = *state;
            if *state == ConnectionState::WaitInit {
                *state = ConnectionState::Closed;
                rejected = true;
            }
        });

        if !rejected {
            return Err(ForwardError::InvalidState(previous));
        }

        self.teardown().await;
        self.ctx
            .write_packet(PacketRef::control(PacketType::Error, self.id))
            .await
    }

    /// Starts a graceful close: transitions to wait-close and asks the peer to tear down its
    /// side. Idempotent; closing an already-closing connection does nothing.
    pub(crate) async fn close(&self) -> Result<(), ForwardError> {
        let mut emit = false;
        self.state.send_modify(|state| {
            if matches!(*state, ConnectionState::WaitInit | ConnectionState::Started) {
                *state = ConnectionState::WaitClose;
                emit = true;
            }
        });

        if emit {
            self.ctx
                .write_packet(PacketRef::control(PacketType::CloseConnection, self.id))
                .await?;
        }
        Ok(())
    }

    /// Forces the connection into its terminal state, running the final teardown exactly once.
    /// Returns an error if it was already fully closed.
    pub(crate) async fn close_immediately(&self) -> Result<(), ForwardError> {
        let mut previous = ConnectionState::Closed;
        self.state.send_modify(|state| {
            previous = *state;
            *state = ConnectionState::Closed;
        });

        if previous == ConnectionState::Closed {
            return Err(ForwardError::InvalidState(previous));
        }

        self.teardown().await;
        Ok(())
    }

    /// Resolves an incoming success record against the current state. The actual close work for
    /// the wait-close case is left to the caller so it runs outside the state modification.
    pub(crate) fn on_peer_success(&self) -> SuccessAction {
        let mut action = SuccessAction::Ignored(ConnectionState::Closed);
        self.state.send_modify(|state| match *state {
            ConnectionState::WaitInit => {
                *state = ConnectionState::Started;
                action = SuccessAction::Started;
            }
            ConnectionState::WaitClose => action = SuccessAction::FinishClose,
            other => action = SuccessAction::Ignored(other),
        });
        action
    }

    /// Writes one inbound data payload into the connection's buffer. Dropped with a log line if
    /// the connection isn't started, and aborted if the connection closes while the buffer is
    /// full; data records are fire-and-forget and never answered with an error.
    pub(crate) async fn deliver_data(&self, payload: &[u8]) {
        if self.state() != ConnectionState::Started {
            debug!(connection_id = self.id, "dropping data for a connection that is not started");
            return;
        }

        let mut guard = self.pipe_writer.lock().await;
        let writer = match guard.as_mut() {
            Some(writer) => writer,
            None => {
                debug!(connection_id = self.id, "dropping data for a connection whose buffer is gone");
                return;
            }
        };

        let mut state = self.state.subscribe();
        tokio::select! {
            result = writer.write_all(payload) => {
                if let Err(error) = result {
                    debug!(connection_id = self.id, %error, "could not deliver data to the inbound buffer");
                }
            }
            _ = state.wait_for(|state| *state == ConnectionState::Closed) => {
                debug!(connection_id = self.id, "connection closed while delivering data");
            }
        }
    }

    /// The single final teardown path: runs the close callback, ends the inbound buffer so the
    /// reader sees end-of-stream once it drains, and removes the connection from the endpoint.
    async fn teardown(&self) {
        if let Some(callback) = self.close_callback.lock().await.take() {
            callback();
        }
        self.pipe_writer.lock().await.take();
        self.ctx.remove_connection(self.id).await;
    }
}

/// One multiplexed byte stream.
///
/// Data written here is framed and sent to the peer; data the peer sends arrives through
/// [`read`](Self::read) (the type also implements [`AsyncRead`]). Writes on a freshly opened
/// outbound connection block until the peer accepts it, and fail once it is closed or was
/// rejected. Reads return end-of-stream after the connection closed and the buffered data has
/// been drained.
///
/// Dropping the handle does not close the connection; call [`close`](Self::close) (or tear the
/// whole endpoint down) so the peer learns about it.
pub struct ForwardConnection {
    inner: Arc<ConnectionInner>,
    reader: ReadHalf<SimplexStream>,
}

impl ForwardConnection {
    pub(crate) fn new(inner: Arc<ConnectionInner>, reader: ReadHalf<SimplexStream>) -> Self {
        Self { inner, reader }
    }

    /// The id identifying this stream on the wire.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The dial target and originator this connection was opened with.
    pub fn details(&self) -> &NewConnectionPayload {
        self.inner.details()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Reads inbound bytes, blocking until some arrive. Returns `Ok(0)` once the connection is
    /// closed and the buffer has been drained.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf).await
    }

    /// Sends `data` to the peer as one data record. Blocks while the connection waits to be
    /// accepted; fails with [`ForwardError::ConnectionClosed`] if it is closing, closed, or was
    /// rejected.
    pub async fn write(&self, data: &[u8]) -> Result<usize, ForwardError> {
        self.inner.write(data).await
    }

    /// Accepts a connection the peer opened, allowing data to flow.
    ///
    /// Fails with [`ForwardError::LocallyInitiated`] on a connection this endpoint opened, and
    /// with [`ForwardError::InvalidState`] if the connection is past waiting.
    pub async fn accept(&self) -> Result<(), ForwardError> {
        self.inner.accept().await
    }

    /// Rejects a connection the peer opened. Same restrictions as [`accept`](Self::accept).
    pub async fn reject(&self) -> Result<(), ForwardError> {
        self.inner.reject().await
    }

    /// Starts a graceful close. Idempotent.
    pub async fn close(&self) -> Result<(), ForwardError> {
        self.inner.close().await
    }

    /// Splits the handle into a read half and a write half so both directions can be pumped
    /// concurrently, in the same way as [`TcpStream::into_split`](tokio::net::TcpStream).
    pub fn into_split(self) -> (ForwardReadHalf, ForwardWriteHalf) {
        let read = ForwardReadHalf {
            inner: Arc::clone(&self.inner),
            reader: self.reader,
        };
        let write = ForwardWriteHalf { inner: self.inner };
        (read, write)
    }
}

impl AsyncRead for ForwardConnection {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

/// The read side of a split [`ForwardConnection`].
pub struct ForwardReadHalf {
    inner: Arc<ConnectionInner>,
    reader: ReadHalf<SimplexStream>,
}

impl ForwardReadHalf {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn details(&self) -> &NewConnectionPayload {
        self.inner.details()
    }

    /// Reads inbound bytes; `Ok(0)` means the connection closed and drained.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf).await
    }
}

impl AsyncRead for ForwardReadHalf {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

/// The write side of a split [`ForwardConnection`]. Also carries the control operations, since
/// those emit records just like writes do.
pub struct ForwardWriteHalf {
    inner: Arc<ConnectionInner>,
}

impl ForwardWriteHalf {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub async fn write(&self, data: &[u8]) -> Result<usize, ForwardError> {
        self.inner.write(data).await
    }

    pub async fn accept(&self) -> Result<(), ForwardError> {
        self.inner.accept().await
    }

    pub async fn reject(&self) -> Result<(), ForwardError> {
        self.inner.reject().await
    }

    pub async fn close(&self) -> Result<(), ForwardError> {
        self.inner.close().await
    }
}
