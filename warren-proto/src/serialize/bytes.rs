use std::io::{self, Error, ErrorKind};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ByteRead, ByteWrite};

impl ByteWrite for [u8] {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        let len = self.len();
        if len > u32::MAX as usize {
            return Err(Error::new(ErrorKind::InvalidData, "Byte buffer is too long (>= 4GB)"));
        }

        let len = len as u32;
        writer.write_u32(len).await?;
        writer.write_all(self).await
    }
}

impl ByteWrite for Vec<u8> {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        self.as_slice().write(writer).await
    }
}

impl ByteRead for Vec<u8> {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let len = reader.read_u32().await? as usize;

        let mut v = vec![0u8; len];
        reader.read_exact(&mut v).await?;
        Ok(v)
    }
}
