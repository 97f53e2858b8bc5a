use std::{
    fmt,
    io::{self, Error, ErrorKind},
};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::serialize::{ByteRead, ByteWrite, SmallReadString, SmallWriteString, U8ReprEnum};

/// The forwarding pattern an endpoint requests with its [`SetupPacket`].
///
/// Carried on the wire as an `u32` field. `SocketForward` and `SocketDial` are defined for peers
/// that distinguish UNIX sockets at setup time; this crate's setup constructors follow the
/// convention of reusing `PortForward` / `PortDial` with a `"unix"` protocol tag instead.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    X11 = 0,
    PortForward = 1,
    PortDial = 2,
    SocketForward = 3,
    SocketDial = 4,
}

impl U8ReprEnum for ConnectionType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::X11),
            1 => Some(Self::PortForward),
            2 => Some(Self::PortDial),
            3 => Some(Self::SocketForward),
            4 => Some(Self::SocketDial),
            _ => None,
        }
    }

    fn into_u8(self) -> u8 {
        self as u8
    }
}

impl ByteWrite for ConnectionType {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        (self.into_u8() as u32).write(writer).await
    }
}

impl ByteRead for ConnectionType {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let value = u32::read(reader).await?;
        let tag = match u8::try_from(value) {
            Ok(tag) => tag,
            Err(_) => return Err(Error::new(ErrorKind::InvalidData, "Invalid ConnectionType value")),
        };

        match Self::from_u8(tag) {
            Some(connection_type) => Ok(connection_type),
            None => Err(Error::new(ErrorKind::InvalidData, "Invalid ConnectionType value")),
        }
    }
}

/// The transport family of a forwarded target, carried on the wire as its string tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardProtocol {
    Tcp,
    Unix,
}

impl ForwardProtocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Unix => "unix",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "tcp" => Some(Self::Tcp),
            "unix" => Some(Self::Unix),
            _ => None,
        }
    }
}

impl fmt::Display for ForwardProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ByteWrite for ForwardProtocol {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        SmallWriteString(self.as_str()).write(writer).await
    }
}

impl ByteRead for ForwardProtocol {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let tag = SmallReadString::read(reader).await?;
        match Self::from_tag(&tag.0) {
            Some(protocol) => Ok(protocol),
            None => Err(Error::new(ErrorKind::InvalidData, "Unknown protocol tag")),
        }
    }
}

/// The payload of the one [`Setup`](crate::packet::PacketType::Setup) record an initiator sends,
/// telling the responder which forwarding pattern to fulfil.
///
/// Only the fields relevant to the chosen [`ConnectionType`] are meaningful; the rest are carried
/// as empty strings and zeroes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupPacket {
    pub connection_type: ConnectionType,

    /// The host (or UNIX socket path) the responder should listen on, for reverse forwards.
    pub bind_host: String,
    pub bind_port: u32,
    pub protocol: ForwardProtocol,

    /// The X11 screen number.
    pub screen: String,

    /// Whether to stop listening after the first forwarded connection.
    pub single_connection: bool,
    pub auth_protocol: String,
    pub auth_cookie: String,
}

impl SetupPacket {
    /// A setup requesting that the initiator be allowed to dial targets through the responder.
    pub fn direct_forward() -> Self {
        Self {
            connection_type: ConnectionType::PortDial,
            bind_host: String::new(),
            bind_port: 0,
            protocol: ForwardProtocol::Tcp,
            screen: String::new(),
            single_connection: false,
            auth_protocol: String::new(),
            auth_cookie: String::new(),
        }
    }

    /// A setup requesting that the responder listen on a TCP address and forward every inbound
    /// connection back to the initiator.
    pub fn reverse_forward_tcp(bind_host: String, bind_port: u32, single_connection: bool) -> Self {
        Self {
            connection_type: ConnectionType::PortForward,
            bind_host,
            bind_port,
            protocol: ForwardProtocol::Tcp,
            screen: String::new(),
            single_connection,
            auth_protocol: String::new(),
            auth_cookie: String::new(),
        }
    }

    /// A setup requesting that the responder listen on a UNIX socket path and forward every
    /// inbound connection back to the initiator.
    pub fn reverse_forward_unix(path: String, single_connection: bool) -> Self {
        Self {
            connection_type: ConnectionType::PortForward,
            bind_host: path,
            bind_port: 0,
            protocol: ForwardProtocol::Unix,
            screen: String::new(),
            single_connection,
            auth_protocol: String::new(),
            auth_cookie: String::new(),
        }
    }

    /// A setup requesting that the responder stand up a local X11 server and forward its
    /// connections back to the initiator, carrying the session's auth data.
    pub fn x11(single_connection: bool, screen: String, auth_protocol: String, auth_cookie: String) -> Self {
        Self {
            connection_type: ConnectionType::X11,
            bind_host: String::new(),
            bind_port: 0,
            protocol: ForwardProtocol::Tcp,
            screen,
            single_connection,
            auth_protocol,
            auth_cookie,
        }
    }
}

impl ByteWrite for SetupPacket {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        (self.connection_type, &self.bind_host, self.bind_port, self.protocol)
            .write(writer)
            .await?;
        (&self.screen, self.single_connection, &self.auth_protocol, &self.auth_cookie)
            .write(writer)
            .await
    }
}

impl ByteRead for SetupPacket {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let (connection_type, bind_host, bind_port, protocol) =
            <(ConnectionType, String, u32, ForwardProtocol) as ByteRead>::read(reader).await?;
        let (screen, single_connection, auth_protocol, auth_cookie) =
            <(String, bool, String, String) as ByteRead>::read(reader).await?;

        Ok(Self {
            connection_type,
            bind_host,
            bind_port,
            protocol,
            screen,
            single_connection,
            auth_protocol,
            auth_cookie,
        })
    }
}

/// The payload of a [`NewConnection`](crate::packet::PacketType::NewConnection) record: enough
/// for the receiving peer to dial the target, and for access-control checks on inbound forwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConnectionPayload {
    pub protocol: ForwardProtocol,

    /// The address the stream connects to: a host for TCP, a socket path for UNIX.
    pub connected_address: String,
    pub connected_port: u32,

    /// Where the stream originates from, for the receiver's access-control decisions.
    pub originator_address: String,
    pub originator_port: u32,
}

impl NewConnectionPayload {
    pub fn tcp(connected_address: String, connected_port: u32, originator_address: String, originator_port: u32) -> Self {
        Self {
            protocol: ForwardProtocol::Tcp,
            connected_address,
            connected_port,
            originator_address,
            originator_port,
        }
    }

    pub fn unix(path: String) -> Self {
        Self {
            protocol: ForwardProtocol::Unix,
            connected_address: path,
            connected_port: 0,
            originator_address: String::new(),
            originator_port: 0,
        }
    }
}

impl ByteWrite for NewConnectionPayload {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        (
            self.protocol,
            &self.connected_address,
            self.connected_port,
            &self.originator_address,
            self.originator_port,
        )
            .write(writer)
            .await
    }
}

impl ByteRead for NewConnectionPayload {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let (protocol, connected_address, connected_port, originator_address, originator_port) =
            <(ForwardProtocol, String, u32, String, u32) as ByteRead>::read(reader).await?;

        Ok(Self {
            protocol,
            connected_address,
            connected_port,
            originator_address,
            originator_port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip_setup(setup: SetupPacket) {
        let mut buf = Vec::new();
        setup.write(&mut buf).await.unwrap();
        let read = SetupPacket::read(&mut &buf[..]).await.unwrap();
        assert_eq!(read, setup);
    }

    #[tokio::test]
    async fn setup_packets_roundtrip() {
        roundtrip_setup(SetupPacket::direct_forward()).await;
        roundtrip_setup(SetupPacket::reverse_forward_tcp("127.0.0.1".to_string(), 8080, true)).await;
        roundtrip_setup(SetupPacket::reverse_forward_unix("/tmp/fwd.sock".to_string(), false)).await;
        roundtrip_setup(SetupPacket::x11(
            true,
            "0".to_string(),
            "MIT-MAGIC-COOKIE-1".to_string(),
            "c0ffee".to_string(),
        )).await;
    }

    #[tokio::test]
    async fn setup_connection_types_match_wire_values() {
        assert_eq!(SetupPacket::direct_forward().connection_type.into_u8(), 2);
        assert_eq!(
            SetupPacket::reverse_forward_tcp(String::new(), 0, false).connection_type.into_u8(),
            1
        );
        assert_eq!(
            SetupPacket::reverse_forward_unix(String::new(), false).connection_type.into_u8(),
            1
        );
        assert_eq!(
            SetupPacket::x11(false, String::new(), String::new(), String::new()).connection_type.into_u8(),
            0
        );
    }

    #[tokio::test]
    async fn new_connection_payloads_roundtrip() {
        let cases = [
            NewConnectionPayload::tcp("10.0.0.1".to_string(), 22, "192.168.1.5".to_string(), 55555),
            NewConnectionPayload::unix("/var/run/agent.sock".to_string()),
        ];

        for payload in cases {
            let mut buf = Vec::new();
            payload.write(&mut buf).await.unwrap();
            let read = NewConnectionPayload::read(&mut &buf[..]).await.unwrap();
            assert_eq!(read, payload);
        }
    }

    #[tokio::test]
    async fn unknown_protocol_tag_is_rejected() {
        let mut buf = Vec::new();
        SmallWriteString("udp").write(&mut buf).await.unwrap();
        let error = ForwardProtocol::read(&mut &buf[..]).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn out_of_range_connection_type_is_rejected() {
        let mut buf = Vec::new();
        5u32.write(&mut buf).await.unwrap();
        assert!(ConnectionType::read(&mut &buf[..]).await.is_err());

        let mut buf = Vec::new();
        1_000_000u32.write(&mut buf).await.unwrap();
        assert!(ConnectionType::read(&mut &buf[..]).await.is_err());
    }
}
