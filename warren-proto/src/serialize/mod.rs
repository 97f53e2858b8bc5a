//! Defines the [`ByteRead`] and [`ByteWrite`] traits and implements them for the types the
//! protocol is built out of.
//!
//! This includes [`bool`], [`u8`], [`u32`] and [`u64`], as well as [`str`] (write-only),
//! [`String`], `[u8]` (write-only), [`Vec<u8>`] and tuples of serializable values.
//!
//! # Serialization of strings
//! [`String`] and [`str`] are serialized as chunked strings, starting with an [`u16`] indicating
//! the length of the string in bytes, followed by said amount of bytes. Some strings are known to
//! be short tags, such as the `"tcp"` / `"unix"` protocol tag, so these are serialized with [`u8`]
//! length instead through the [`SmallWriteString`] and [`SmallReadString`] types, which wrap a
//! `&str` and a [`String`] respectively.
//!
//! # Serialization of byte buffers
//! Packet payloads are opaque byte buffers that can be larger than 64KB, so `[u8]` and
//! [`Vec<u8>`] are serialized with an [`u32`] length prefix instead of the [`u16`] used for
//! strings.
//!
//! # Serialization of tuples
//! [`ByteRead`] and [`ByteWrite`] are also implemented for tuples of serializable elements in the
//! arities the packet shapes use. This allows easily turning multiple writes such as this:
//! ```ignore
//! thing1.write(writer).await?;
//! thing2.write(writer).await?;
//! thing3.write(writer).await?;
//! ```
//!
//! into this:
//! ```ignore
//! (thing1, thing2, thing3).write(writer).await?;
//! ```

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

pub mod bytes;
pub mod primitives;
pub mod string;
pub mod tuples;
pub mod u8_repr_enum;

pub use string::*;
pub use u8_repr_enum::*;

/// Serializes a type into bytes, writing it to an [`AsyncWrite`] asynchronously.
#[allow(async_fn_in_trait)]
pub trait ByteWrite {
    /// Serializes this instance into bytes, writing those bytes into a writer.
    ///
    /// When an error occurs, there's no guarantee on how many bytes were written.
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()>;
}

/// Deserializes a type from raw bytes, reading it from an [`AsyncRead`] asynchronously.
#[allow(async_fn_in_trait)]
pub trait ByteRead: Sized {
    /// Deserializes bytes into an instance of this type by reading bytes from a reader.
    ///
    /// When an error occurs, there's no guarantee on how many bytes were read.
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self>;
}
