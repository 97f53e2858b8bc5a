use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::serialize::{ByteRead, ByteWrite, U8ReprEnum};

/// The closed set of record types carried on the wire.
///
/// Every record is a [`Packet`] whose type tag is one of these values. Tags outside this set are
/// skipped by receivers for forward compatibility, never written by this crate.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// The one-time handshake record, carrying a [`SetupPacket`](crate::setup::SetupPacket).
    Setup = 0,

    /// Acknowledges a setup, a new connection, or a close.
    Success = 1,

    /// Rejects a new connection, refuses a setup, or reports a failed close.
    Error = 2,

    /// Raw bytes to deliver on the stream identified by the packet's connection id.
    Data = 3,

    /// Opens a new multiplexed stream, carrying a
    /// [`NewConnectionPayload`](crate::setup::NewConnectionPayload).
    NewConnection = 4,

    /// Requests teardown of one multiplexed stream.
    CloseConnection = 5,

    /// Announces that the sender will not open nor accept any further streams.
    NoMoreConnections = 6,
}

impl U8ReprEnum for PacketType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Setup),
            1 => Some(Self::Success),
            2 => Some(Self::Error),
            3 => Some(Self::Data),
            4 => Some(Self::NewConnection),
            5 => Some(Self::CloseConnection),
            6 => Some(Self::NoMoreConnections),
            _ => None,
        }
    }

    fn into_u8(self) -> u8 {
        self as u8
    }
}

impl ByteWrite for PacketType {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        self.into_u8().write(writer).await
    }
}

/// An inbound record, decoded from the wire.
///
/// The type tag is kept raw rather than parsed into [`PacketType`], because a record with an
/// unknown tag still has a well-formed frame around it and receivers are expected to skip it
/// rather than kill the stream. Use [`packet_type`](Self::packet_type) to interpret the tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// The raw type tag as read off the wire.
    pub type_tag: u8,

    /// The id of the multiplexed stream this record belongs to. Zero (and otherwise ignored) for
    /// record types that address the whole channel.
    pub connection_id: u64,

    /// The opaque record payload. Empty for most control records.
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(packet_type: PacketType, connection_id: u64, payload: Vec<u8>) -> Self {
        Self {
            type_tag: packet_type.into_u8(),
            connection_id,
            payload,
        }
    }

    /// Interprets this record's type tag, returning `None` if the tag is not a known
    /// [`PacketType`].
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_u8(self.type_tag)
    }
}

impl ByteRead for Packet {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let (type_tag, connection_id) = <(u8, u64) as ByteRead>::read(reader).await?;
        let payload = Vec::<u8>::read(reader).await?;

        Ok(Self {
            type_tag,
            connection_id,
            payload,
        })
    }
}

/// An outbound record: a [`Packet`] whose payload is borrowed rather than owned, so writing a
/// data frame doesn't copy the caller's bytes.
#[derive(Debug, Clone, Copy)]
pub struct PacketRef<'a> {
    pub packet_type: PacketType,
    pub connection_id: u64,
    pub payload: &'a [u8],
}

impl<'a> PacketRef<'a> {
    pub const fn new(packet_type: PacketType, connection_id: u64, payload: &'a [u8]) -> Self {
        Self {
            packet_type,
            connection_id,
            payload,
        }
    }

    /// A record with an empty payload, which is most of the control records.
    pub const fn control(packet_type: PacketType, connection_id: u64) -> PacketRef<'static> {
        PacketRef {
            packet_type,
            connection_id,
            payload: &[],
        }
    }
}

impl<'a> ByteWrite for PacketRef<'a> {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        (self.packet_type, self.connection_id).write(writer).await?;
        self.payload.write(writer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn packets_roundtrip() {
        let cases = [
            PacketRef::control(PacketType::Success, 0),
            PacketRef::control(PacketType::CloseConnection, 81),
            PacketRef::control(PacketType::NoMoreConnections, 0),
            PacketRef::new(PacketType::Data, 3, b"hello\n"),
            PacketRef::new(PacketType::NewConnection, u64::MAX, &[0u8; 300]),
        ];

        for case in cases {
            let mut buf = Vec::new();
            case.write(&mut buf).await.unwrap();

            let packet = Packet::read(&mut &buf[..]).await.unwrap();
            assert_eq!(packet.packet_type(), Some(case.packet_type));
            assert_eq!(packet.connection_id, case.connection_id);
            assert_eq!(packet.payload, case.payload);
        }
    }

    #[tokio::test]
    async fn type_tags_are_stable() {
        let expected = [
            (PacketType::Setup, 0),
            (PacketType::Success, 1),
            (PacketType::Error, 2),
            (PacketType::Data, 3),
            (PacketType::NewConnection, 4),
            (PacketType::CloseConnection, 5),
            (PacketType::NoMoreConnections, 6),
        ];

        for (packet_type, tag) in expected {
            assert_eq!(packet_type.into_u8(), tag);
            assert_eq!(PacketType::from_u8(tag), Some(packet_type));
        }
        assert_eq!(PacketType::from_u8(7), None);
    }

    #[tokio::test]
    async fn unknown_type_tag_still_decodes_as_a_frame() {
        let mut buf = Vec::new();
        (200u8, 17u64).write(&mut buf).await.unwrap();
        vec![1u8, 2, 3].write(&mut buf).await.unwrap();

        let packet = Packet::read(&mut &buf[..]).await.unwrap();
        assert_eq!(packet.packet_type(), None);
        assert_eq!(packet.type_tag, 200);
        assert_eq!(packet.connection_id, 17);
        assert_eq!(packet.payload, vec![1, 2, 3]);
    }
}
