use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use warren_proto::{
    packet::{Packet, PacketRef},
    serialize::{ByteRead, ByteWrite},
};

/// The read half of the framer. Owned by exactly one task (the demux loop after setup), so no
/// locking happens on this side.
pub(crate) struct FrameReader {
    reader: Box<dyn AsyncRead + Send + Sync + Unpin>,
}

impl FrameReader {
    pub fn new(reader: impl AsyncRead + Send + Sync + Unpin + 'static) -> Self {
        Self {
            reader: Box::new(reader),
        }
    }

    /// Blocks until the next record is available and returns it in stream order. Any error is
    /// terminal for the endpoint.
    pub async fn read_packet(&mut self) -> io::Result<Packet> {
        Packet::read(&mut self.reader).await
    }
}

/// The write half of the framer. Shared behind a mutex; one `write_packet` call emits one whole
/// record, so frames from concurrent writers never interleave.
pub(crate) struct FrameWriter {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl FrameWriter {
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            writer: Box::new(writer),
        }
    }

    pub async fn write_packet(&mut self, packet: PacketRef<'_>) -> io::Result<()> {
        packet.write(&mut self.writer).await?;
        self.writer.flush().await
    }
}
