//! Wire format for the warren agent forwarding protocol.
//!
//! The protocol multiplexes any number of independent byte streams over a
//! single reliable, ordered, bidirectional byte channel. Everything on the
//! wire is a [`Packet`](packet::Packet): a type tag, a connection id, and an
//! opaque payload. Two payload shapes are defined on top of that,
//! [`SetupPacket`](setup::SetupPacket) for the one-time handshake and
//! [`NewConnectionPayload`](setup::NewConnectionPayload) for opening a
//! multiplexed stream.
//!
//! Serialization is done through the [`ByteRead`](serialize::ByteRead) and
//! [`ByteWrite`](serialize::ByteWrite) traits, which read from and write to
//! any tokio [`AsyncRead`](tokio::io::AsyncRead) /
//! [`AsyncWrite`](tokio::io::AsyncWrite) asynchronously.

pub mod packet;
pub mod serialize;
pub mod setup;

pub use packet::*;
pub use setup::*;
