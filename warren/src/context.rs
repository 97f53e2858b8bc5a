use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, Mutex},
};
use tracing::debug;
use warren_proto::{
    packet::{PacketRef, PacketType},
    serialize::{ByteRead, ByteWrite},
    setup::{NewConnectionPayload, SetupPacket},
};

use crate::{
    connection::{CloseCallback, ConnectionInner, ForwardConnection},
    demux,
    error::ForwardError,
    framing::{FrameReader, FrameWriter},
    table::ConnectionTable,
};

/// How long [`ForwardContext::kill`] waits for graceful closes to complete before force-closing
/// whatever is still live.
const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// The state shared between the endpoint's handles, its connections and its demux task.
pub(crate) struct ContextInner {
    writer: Mutex<FrameWriter>,
    pub(crate) table: ConnectionTable,
    stopped: AtomicBool,
    accept_tx: Mutex<Option<mpsc::UnboundedSender<ForwardConnection>>>,
}

impl ContextInner {
    /// Emits one record. The writer mutex is what keeps frames from interleaving; it is never
    /// held while any other lock is taken.
    pub(crate) async fn write_packet(&self, packet: PacketRef<'_>) -> Result<(), ForwardError> {
        self.writer.lock().await.write_packet(packet).await?;
        Ok(())
    }

    pub(crate) async fn remove_connection(&self, id: u64) {
        self.table.remove(id).await;
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Marks the endpoint as accepting no further connections and closes the accept queue so
    /// consumers observe end-of-stream. Returns whether this call was the one that stopped it.
    pub(crate) async fn mark_stopped(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.accept_tx.lock().await.take();
        true
    }

    /// Publishes an inbound connection on the accept queue, handing it back if the queue is
    /// already closed.
    pub(crate) async fn push_incoming(&self, connection: ForwardConnection) -> Result<(), ForwardConnection> {
        let guard = self.accept_tx.lock().await;
        match guard.as_ref() {
            Some(sender) => sender.send(connection).map_err(|error| error.0),
            None => Err(connection),
        }
    }
}

/// The stream of connections the peer opens through this endpoint.
///
/// Yields `None` once the endpoint stops accepting (a no-more-connections record was sent or
/// received, or the endpoint died) and everything already queued has been taken.
#[derive(Debug)]
pub struct AcceptQueue {
    receiver: mpsc::UnboundedReceiver<ForwardConnection>,
}

impl AcceptQueue {
    /// Waits for the next inbound connection.
    pub async fn next(&mut self) -> Option<ForwardConnection> {
        self.receiver.recv().await
    }
}

/// One side of the forwarding protocol: owns the transport, the connection table and the demux
/// task.
///
/// An endpoint is created over any reliable ordered byte pair with [`new`](Self::new), then
/// started exactly once with one of the setup entry points: [`start_responder`](Self::start_responder)
/// on the side that fulfils requests, or one of the `start_*` initiator flavors on the side that
/// makes them. After setup both sides are nearly symmetric: either may open connections with the
/// `new_connection_*` family and accept or reject what the peer opens, subject to the pattern
/// chosen at setup.
pub struct ForwardContext {
    inner: Arc<ContextInner>,
    transport: Option<(FrameReader, mpsc::UnboundedReceiver<ForwardConnection>)>,
}

impl ForwardContext {
    pub fn new(
        reader: impl AsyncRead + Send + Sync + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ContextInner {
            writer: Mutex::new(FrameWriter::new(writer)),
            table: ConnectionTable::new(),
            stopped: AtomicBool::new(false),
            accept_tx: Mutex::new(Some(accept_tx)),
        });

        Self {
            inner,
            transport: Some((FrameReader::new(reader), accept_rx)),
        }
    }

    fn take_transport(&mut self) -> Result<(FrameReader, AcceptQueue), ForwardError> {
        match self.transport.take() {
            Some((reader, receiver)) => Ok((reader, AcceptQueue { receiver })),
            None => Err(ForwardError::AlreadyStarted),
        }
    }

    fn spawn_demux(&self, reader: FrameReader) {
        tokio::spawn(demux::run(Arc::clone(&self.inner), reader));
    }

    /// Starts the endpoint as the responder: reads the peer's setup record, acknowledges it, and
    /// returns the decoded setup along with the queue the peer's connections will arrive on.
    ///
    /// Any first record other than a setup is a protocol violation and the endpoint terminates.
    pub async fn start_responder(&mut self) -> Result<(SetupPacket, AcceptQueue), ForwardError> {
        let (mut reader, queue) = self.take_transport()?;

        let packet = reader.read_packet().await?;
        if packet.packet_type() != Some(PacketType::Setup) {
            return Err(ForwardError::UnexpectedPacket {
                expected: "setup",
                received: packet.type_tag,
            });
        }

        let setup = SetupPacket::read(&mut &packet.payload[..])
            .await
            .map_err(|error| ForwardError::MalformedPayload("setup", error))?;

        self.inner
            .write_packet(PacketRef::control(PacketType::Success, 0))
            .await?;
        self.spawn_demux(reader);

        Ok((setup, queue))
    }

    /// Starts the endpoint as the initiator of a direct forward: this endpoint will open
    /// connections and the peer dials the targets. The peer is expected to reject anything that
    /// arrives on the returned queue in this mode.
    pub async fn start_direct_forward(&mut self) -> Result<AcceptQueue, ForwardError> {
        self.start_initiator(SetupPacket::direct_forward()).await
    }

    /// Starts the endpoint as the initiator of a reverse TCP forward: the peer listens on
    /// `bind_host:bind_port` and every connection it receives arrives on the returned queue.
    pub async fn start_reverse_forward_tcp(
        &mut self,
        bind_host: String,
        bind_port: u32,
        single_connection: bool,
    ) -> Result<AcceptQueue, ForwardError> {
        self.start_initiator(SetupPacket::reverse_forward_tcp(bind_host, bind_port, single_connection))
            .await
    }

    /// Starts the endpoint as the initiator of a reverse UNIX socket forward: the peer listens on
    /// the socket path and forwards every connection back here.
    pub async fn start_reverse_forward_unix(
        &mut self,
        path: String,
        single_connection: bool,
    ) -> Result<AcceptQueue, ForwardError> {
        self.start_initiator(SetupPacket::reverse_forward_unix(path, single_connection))
            .await
    }

    /// Starts the endpoint as the initiator of an X11 forward, carrying the session's X11 auth
    /// data to the peer. Forwarded X11 connections arrive on the returned queue.
    pub async fn start_x11_forward(
        &mut self,
        single_connection: bool,
        screen: String,
        auth_protocol: String,
        auth_cookie: String,
    ) -> Result<AcceptQueue, ForwardError> {
        self.start_initiator(SetupPacket::x11(single_connection, screen, auth_protocol, auth_cookie))
            .await
    }

    async fn start_initiator(&mut self, setup: SetupPacket) -> Result<AcceptQueue, ForwardError> {
        let (mut reader, queue) = self.take_transport()?;

        let mut payload = Vec::new();
        setup.write(&mut payload).await.map_err(ForwardError::Transport)?;
        self.inner
            .write_packet(PacketRef::new(PacketType::Setup, 0, &payload))
            .await?;

        let response = reader.read_packet().await?;
        match response.packet_type() {
            Some(PacketType::Success) => {}
            Some(PacketType::Error) => return Err(ForwardError::SetupRefused),
            _ => {
                return Err(ForwardError::UnexpectedPacket {
                    expected: "success",
                    received: response.type_tag,
                })
            }
        }

        self.spawn_demux(reader);
        Ok(queue)
    }

    /// Opens a connection through the peer towards a TCP target.
    ///
    /// The returned handle is immediately writable, but writes block until the peer accepts the
    /// connection and fail if it rejects it. The originator address and port are informational,
    /// carried for the peer's access-control checks.
    pub async fn new_connection_tcp(
        &self,
        connected_address: String,
        connected_port: u32,
        originator_address: String,
        originator_port: u32,
        close_callback: Option<CloseCallback>,
    ) -> Result<ForwardConnection, ForwardError> {
        let details = NewConnectionPayload::tcp(connected_address, connected_port, originator_address, originator_port);
        self.new_connection(details, close_callback).await
    }

    /// Opens a connection through the peer towards a UNIX socket path.
    pub async fn new_connection_unix(
        &self,
        path: String,
        close_callback: Option<CloseCallback>,
    ) -> Result<ForwardConnection, ForwardError> {
        self.new_connection(NewConnectionPayload::unix(path), close_callback).await
    }

    async fn new_connection(
        &self,
        details: NewConnectionPayload,
        close_callback: Option<CloseCallback>,
    ) -> Result<ForwardConnection, ForwardError> {
        let mut payload = Vec::new();
        details.write(&mut payload).await.map_err(ForwardError::Transport)?;

        let id = self.inner.table.allocate_id().await;
        let (inner, read_half) = ConnectionInner::new(id, true, details, close_callback, Arc::clone(&self.inner));
        self.inner.table.insert(Arc::clone(&inner)).await?;

        if let Err(error) = self
            .inner
            .write_packet(PacketRef::new(PacketType::NewConnection, id, &payload))
            .await
        {
            debug!(connection_id = id, "tearing down connection whose open record could not be sent");
            let _ = inner.close_immediately().await;
            return Err(error);
        }

        Ok(ForwardConnection::new(inner, read_half))
    }

    /// Tells the peer this endpoint will neither open nor accept any further connections, and
    /// closes the accept queue so consumers observe end-of-stream. Idempotent; only the first
    /// call emits the record.
    pub async fn no_more_connections(&self) -> Result<(), ForwardError> {
        if self.inner.mark_stopped().await {
            self.inner
                .write_packet(PacketRef::control(PacketType::NoMoreConnections, 0))
                .await?;
        }
        Ok(())
    }

    /// Blocks until every connection this endpoint has seen reached its final teardown.
    pub async fn wait_finish(&self) {
        self.inner.table.wait_empty().await;
    }

    /// Terminates the endpoint: stops accepting, gracefully closes every live connection, and
    /// after a bounded grace period force-closes whatever the peer has not acknowledged. Returns
    /// once every connection is torn down, which is guaranteed to happen within the grace period
    /// regardless of peer behavior.
    pub async fn kill(&self) {
        let _ = self.no_more_connections().await;

        for connection in self.inner.table.snapshot().await {
            let _ = connection.close().await;
        }

        if tokio::time::timeout(KILL_GRACE_PERIOD, self.wait_finish()).await.is_err() {
            for connection in self.inner.table.snapshot().await {
                let _ = connection.close_immediately().await;
            }
        }

        self.wait_finish().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use warren_proto::{packet::Packet, setup::ConnectionType};

    use super::*;

    fn endpoint_pair() -> (ForwardContext, ForwardContext) {
        let (near, far) = tokio::io::duplex(256 * 1024);
        let (near_read, near_write) = tokio::io::split(near);
        let (far_read, far_write) = tokio::io::split(far);
        (
            ForwardContext::new(near_read, near_write),
            ForwardContext::new(far_read, far_write),
        )
    }

    /// An endpoint on one side and raw transport halves on the other, for tests that speak the
    /// wire format by hand.
    fn endpoint_and_raw() -> (ForwardContext, ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) {
        let (near, far) = tokio::io::duplex(256 * 1024);
        let (near_read, near_write) = tokio::io::split(near);
        let (far_read, far_write) = tokio::io::split(far);
        (ForwardContext::new(near_read, near_write), far_read, far_write)
    }

    async fn write_raw(writer: &mut WriteHalf<DuplexStream>, packet: PacketRef<'_>) {
        packet.write(writer).await.unwrap();
        writer.flush().await.unwrap();
    }

    /// Plays the responder's half of the handshake by hand: read the setup record, acknowledge.
    async fn raw_accept_setup(raw_read: &mut ReadHalf<DuplexStream>, raw_write: &mut WriteHalf<DuplexStream>) {
        let setup = Packet::read(raw_read).await.unwrap();
        assert_eq!(setup.packet_type(), Some(PacketType::Setup));
        write_raw(raw_write, PacketRef::control(PacketType::Success, 0)).await;
    }

    #[tokio::test]
    async fn direct_tcp_forward_carries_data_both_ways() {
        let (mut initiator, mut responder) = endpoint_pair();

        let responder_task = tokio::spawn(async move {
            let (setup, mut queue) = responder.start_responder().await.unwrap();
            assert_eq!(setup.connection_type, ConnectionType::PortDial);

            let mut conn = queue.next().await.unwrap();
            assert_eq!(conn.details().connected_address, "10.0.0.1");
            assert_eq!(conn.details().connected_port, 22);
            assert_eq!(conn.details().originator_address, "192.168.1.5");
            assert_eq!(conn.details().originator_port, 55555);
            conn.accept().await.unwrap();

            let mut buf = [0u8; 32];
            let n = conn.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"hello\n");
            conn.write(b"world\n").await.unwrap();

            // the peer closes; the handle drains to end-of-stream
            assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
            responder.wait_finish().await;
        });

        let _queue = initiator.start_direct_forward().await.unwrap();
        let mut conn = initiator
            .new_connection_tcp("10.0.0.1".to_string(), 22, "192.168.1.5".to_string(), 55555, None)
            .await
            .unwrap();

        assert_eq!(conn.write(b"hello\n").await.unwrap(), 6);
        let mut buf = [0u8; 32];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world\n");

        conn.close().await.unwrap();
        initiator.wait_finish().await;
        responder_task.await.unwrap();
    }

    #[tokio::test]
    async fn reverse_forward_echoes_and_drains_the_accept_queue() {
        let (mut initiator, mut responder) = endpoint_pair();

        let agent = tokio::spawn(async move {
            let (setup, _queue) = responder.start_responder().await.unwrap();
            assert_eq!(setup.connection_type, ConnectionType::PortForward);
            assert_eq!(setup.bind_host, "127.0.0.1");
            assert_eq!(setup.bind_port, 8080);
            assert!(setup.single_connection);

            let mut conn = responder
                .new_connection_tcp("127.0.0.1".to_string(), 8080, "10.9.8.7".to_string(), 41000, None)
                .await
                .unwrap();

            let payload = vec![0x5au8; 1024 * 1024];
            conn.write(&payload).await.unwrap();

            let mut echoed = vec![0u8; payload.len()];
            conn.read_exact(&mut echoed).await.unwrap();
            assert_eq!(echoed, payload);

            conn.close().await.unwrap();
            responder.no_more_connections().await.unwrap();
            responder.wait_finish().await;
        });

        let mut queue = initiator
            .start_reverse_forward_tcp("127.0.0.1".to_string(), 8080, true)
            .await
            .unwrap();

        let conn = queue.next().await.unwrap();
        assert_eq!(conn.id(), 1);
        conn.accept().await.unwrap();

        let (mut read_half, write_half) = conn.into_split();
        let mut buf = vec![0u8; 8192];
        loop {
            let n = read_half.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            write_half.write(&buf[..n]).await.unwrap();
        }

        assert!(queue.next().await.is_none());
        initiator.wait_finish().await;
        agent.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_connection_fails_writes_and_drains_reads() {
        let (mut initiator, mut responder) = endpoint_pair();

        let responder_task = tokio::spawn(async move {
            let (_, mut queue) = responder.start_responder().await.unwrap();
            let conn = queue.next().await.unwrap();
            conn.reject().await.unwrap();
            responder.wait_finish().await;
        });

        let _queue = initiator.start_direct_forward().await.unwrap();
        let mut conn = initiator
            .new_connection_tcp("10.0.0.1".to_string(), 80, String::new(), 0, None)
            .await
            .unwrap();

        let error = conn.write(b"anyone there?").await.unwrap_err();
        assert!(matches!(error, ForwardError::ConnectionClosed));
        assert_eq!(error.code(), 1005);

        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);

        initiator.wait_finish().await;
        responder_task.await.unwrap();
    }

    #[tokio::test]
    async fn inbound_ids_must_increase() {
        let (mut initiator, mut raw_read, mut raw_write) = endpoint_and_raw();

        let (started, ()) = tokio::join!(
            initiator.start_reverse_forward_tcp("0.0.0.0".to_string(), 9000, false),
            raw_accept_setup(&mut raw_read, &mut raw_write),
        );
        let mut queue = started.unwrap();

        let mut payload = Vec::new();
        NewConnectionPayload::tcp("127.0.0.1".to_string(), 9000, "10.0.0.9".to_string(), 1234)
            .write(&mut payload)
            .await
            .unwrap();

        // id 1: accepted
        write_raw(&mut raw_write, PacketRef::new(PacketType::NewConnection, 1, &payload)).await;
        // id 1 again: replay, dropped without allocation
        write_raw(&mut raw_write, PacketRef::new(PacketType::NewConnection, 1, &payload)).await;
        // id 3: a gap is suspicious but legal
        write_raw(&mut raw_write, PacketRef::new(PacketType::NewConnection, 3, &payload)).await;
        // id 2: went backwards, dropped
        write_raw(&mut raw_write, PacketRef::new(PacketType::NewConnection, 2, &payload)).await;
        write_raw(&mut raw_write, PacketRef::control(PacketType::NoMoreConnections, 0)).await;

        let mut accepted = Vec::new();
        while let Some(conn) = queue.next().await {
            accepted.push(conn.id());
        }
        assert_eq!(accepted, vec![1, 3]);
    }

    #[tokio::test]
    async fn accept_on_locally_initiated_connection_is_refused() {
        let (mut initiator, mut raw_read, mut raw_write) = endpoint_and_raw();

        let (started, ()) = tokio::join!(
            initiator.start_direct_forward(),
            raw_accept_setup(&mut raw_read, &mut raw_write),
        );
        let _queue = started.unwrap();

        let conn = initiator
            .new_connection_tcp("10.0.0.1".to_string(), 443, String::new(), 0, None)
            .await
            .unwrap();

        let error = conn.accept().await.unwrap_err();
        assert!(matches!(error, ForwardError::LocallyInitiated));
        assert_eq!(error.code(), 1006);
        assert!(matches!(conn.reject().await, Err(ForwardError::LocallyInitiated)));

        // the misuse emitted nothing: the peer sees the open record followed by the close, with
        // no success or error records in between
        conn.close().await.unwrap();
        let open = Packet::read(&mut raw_read).await.unwrap();
        assert_eq!(open.packet_type(), Some(PacketType::NewConnection));
        let close = Packet::read(&mut raw_read).await.unwrap();
        assert_eq!(close.packet_type(), Some(PacketType::CloseConnection));
        assert_eq!(close.connection_id, conn.id());
    }

    #[tokio::test]
    async fn close_runs_the_callback_exactly_once() {
        let (mut initiator, mut responder) = endpoint_pair();

        let responder_task = tokio::spawn(async move {
            let (_, mut queue) = responder.start_responder().await.unwrap();
            let mut conn = queue.next().await.unwrap();
            conn.accept().await.unwrap();
            let mut buf = [0u8; 1];
            conn.read(&mut buf).await.unwrap();
            // close from this side as well, racing the peer's close
            conn.close().await.unwrap();
            responder.wait_finish().await;
        });

        let _queue = initiator.start_direct_forward().await.unwrap();

        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        let conn = initiator
            .new_connection_tcp(
                "10.0.0.1".to_string(),
                22,
                String::new(),
                0,
                Some(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .await
            .unwrap();

        // blocks until the peer accepts, so the closes below race only each other
        conn.write(b"x").await.unwrap();
        conn.close().await.unwrap();
        conn.close().await.unwrap();

        initiator.wait_finish().await;
        responder_task.await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn kill_closes_every_connection_within_the_grace_period() {
        let (mut initiator, mut raw_read, mut raw_write) = endpoint_and_raw();

        let (started, ()) = tokio::join!(
            initiator.start_direct_forward(),
            raw_accept_setup(&mut raw_read, &mut raw_write),
        );
        let _queue = started.unwrap();

        // a peer that accepts everything but never acknowledges a close
        let deaf_peer = tokio::spawn(async move {
            loop {
                let packet = match Packet::read(&mut raw_read).await {
                    Ok(packet) => packet,
                    Err(_) => break,
                };
                if packet.packet_type() == Some(PacketType::NewConnection) {
                    write_raw(&mut raw_write, PacketRef::control(PacketType::Success, packet.connection_id)).await;
                }
            }
        });

        let mut connections = Vec::new();
        for i in 0..100u32 {
            let conn = initiator
                .new_connection_tcp("10.0.0.1".to_string(), 7000 + i, String::new(), 0, None)
                .await
                .unwrap();
            conn.write(b"ping").await.unwrap();
            connections.push(conn);
        }

        initiator.kill().await;

        for conn in &mut connections {
            assert_eq!(conn.state(), crate::connection::ConnectionState::Closed);
            let mut buf = [0u8; 8];
            assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
            assert!(matches!(conn.write(b"late").await, Err(ForwardError::ConnectionClosed)));
        }

        deaf_peer.abort();
    }

    #[tokio::test]
    async fn starting_twice_is_refused() {
        let (mut initiator, mut responder) = endpoint_pair();

        let responder_task = tokio::spawn(async move {
            let _ = responder.start_responder().await.unwrap();
        });
        let _queue = initiator.start_direct_forward().await.unwrap();
        responder_task.await.unwrap();

        let error = initiator.start_direct_forward().await.unwrap_err();
        assert!(matches!(error, ForwardError::AlreadyStarted));
        assert_eq!(error.code(), 1004);
    }
}
