//! An agent forwarding multiplexer: carries many independent byte streams over a single
//! reliable, ordered, bidirectional byte channel.
//!
//! The crate implements the forwarding semantics an SSH server needs — direct and reverse TCP
//! port forwarding, UNIX domain socket forwarding, and X11 forwarding — but it is
//! transport-agnostic: an endpoint runs over any [`AsyncRead`](tokio::io::AsyncRead) /
//! [`AsyncWrite`](tokio::io::AsyncWrite) pair, be that an SSH channel, a socket, or a pipe pair.
//! Authentication and the dialing or listening done on behalf of forwarded targets belong to the
//! embedding program; this crate moves the bytes and manages the connection lifecycles.
//!
//! The two sides of the channel are conventionally the *client* (next to the SSH server) and the
//! *agent* (inside a container or on a remote host), but the protocol itself only distinguishes
//! the *initiator*, which sends the one setup record, from the *responder*, which fulfils it.
//!
//! # Example
//!
//! A direct forward: the initiator asks the responder to dial targets on its behalf.
//!
//! ```ignore
//! let mut ctx = ForwardContext::new(reader, writer);
//! ctx.start_direct_forward().await?;
//!
//! let mut conn = ctx
//!     .new_connection_tcp("10.0.0.1".into(), 22, "192.168.1.5".into(), 55555, None)
//!     .await?;
//! conn.write(b"hello").await?; // blocks until the agent accepts the connection
//! ```
//!
//! On the agent, [`ForwardContext::start_responder`] returns the decoded setup and the accept
//! queue; each queued [`ForwardConnection`] is accepted or rejected after inspecting its
//! [`details`](ForwardConnection::details), then pumped to and from whatever socket the agent
//! dialed.

mod connection;
mod context;
mod demux;
mod error;
mod framing;
mod table;

pub use connection::{CloseCallback, ConnectionState, ForwardConnection, ForwardReadHalf, ForwardWriteHalf};
pub use context::{AcceptQueue, ForwardContext};
pub use error::ForwardError;

pub use warren_proto::{
    packet::{Packet, PacketRef, PacketType},
    setup::{ConnectionType, ForwardProtocol, NewConnectionPayload, SetupPacket},
};
