use std::io::{self, Error, ErrorKind};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ByteRead, ByteWrite};

impl ByteWrite for str {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        let bytes = self.as_bytes();
        let len = bytes.len();
        if len > u16::MAX as usize {
            return Err(Error::new(ErrorKind::InvalidData, "String is too long (>= 64KB)"));
        }

        let len = len as u16;
        writer.write_u16(len).await?;
        writer.write_all(bytes).await
    }
}

impl ByteWrite for String {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        self.as_str().write(writer).await
    }
}

impl ByteRead for String {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let len = reader.read_u16().await? as usize;

        let mut v = vec![0u8; len];
        reader.read_exact(&mut v).await?;
        match String::from_utf8(v) {
            Ok(s) => Ok(s),
            Err(_) => Err(Error::new(ErrorKind::InvalidData, "String is not valid UTF-8")),
        }
    }
}

/// A type that wraps a `&str` and implements [`ByteWrite`] for easily writing strings whose max
/// length is 255 bytes.
pub struct SmallWriteString<'a>(pub &'a str);

impl<'a> ByteWrite for SmallWriteString<'a> {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        let bytes = self.0.as_bytes();
        let len = bytes.len();
        if len > u8::MAX as usize {
            return Err(Error::new(ErrorKind::InvalidData, "Small string is too long (>= 256B)"));
        }

        let len = len as u8;
        writer.write_u8(len).await?;
        writer.write_all(bytes).await
    }
}

/// A type that wraps a [`String`] and implements [`ByteRead`] for easily reading strings whose max
/// length is 255 bytes.
pub struct SmallReadString(pub String);

impl ByteRead for SmallReadString {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let len = reader.read_u8().await? as usize;

        let mut v = vec![0u8; len];
        reader.read_exact(&mut v).await?;
        match String::from_utf8(v) {
            Ok(s) => Ok(SmallReadString(s)),
            Err(_) => Err(Error::new(ErrorKind::InvalidData, "Small string is not valid UTF-8")),
        }
    }
}
