use super::MuxError;
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_SIZE: usize = 8;

/// Frame command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cmd {
    /// Open a stream
    Syn = 0,
    /// Half-close a stream
    Fin = 1,
    /// Stream data
    Psh = 2,
    /// Keepalive; also the handshake frame
    Nop = 3,
    /// Window update: consumed u32 LE, window u32 LE. A zero window
    /// means the peer dropped the stream.
    Upd = 4,
}

impl TryFrom<u8> for Cmd {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Syn),
            1 => Ok(Self::Fin),
            2 => Ok(Self::Psh),
            3 => Ok(Self::Nop),
            4 => Ok(Self::Upd),
            other => Err(MuxError::Protocol(format!("unknown command {other}"))),
        }
    }
}

/// One mux frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub cmd: Cmd,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(version: u8, cmd: Cmd, stream_id: u32, payload: Bytes) -> Self {
        debug_assert!(payload.len() <= u16::MAX as usize);
        Self {
            version,
            cmd,
            stream_id,
            payload,
        }
    }

    /// Frame without payload
    pub fn control(version: u8, cmd: Cmd, stream_id: u32) -> Self {
        Self::new(version, cmd, stream_id, Bytes::new())
    }

    /// Window update acknowledging `consumed` bytes
    pub fn update(version: u8, stream_id: u32, consumed: u32, window: u32) -> Self {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u32_le(consumed);
        payload.put_u32_le(window);
        Self::new(version, Cmd::Upd, stream_id, payload.freeze())
    }

    pub fn header(&self) -> [u8; HEADER_SIZE] {
        let mut header = [0u8; HEADER_SIZE];
        header[0] = self.version;
        header[1] = self.cmd as u8;
        header[2..4].copy_from_slice(&(self.payload.len() as u16).to_le_bytes());
        header[4..8].copy_from_slice(&self.stream_id.to_le_bytes());
        header
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, MuxError> {
        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header).await?;

        let cmd = Cmd::try_from(header[1])?;
        let len = u16::from_le_bytes([header[2], header[3]]) as usize;
        let stream_id = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let mut payload = BytesMut::zeroed(len);
        if len > 0 {
            reader.read_exact(&mut payload).await?;
        }

        Ok(Self {
            version: header[0],
            cmd,
            stream_id,
            payload: payload.freeze(),
        })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.header()).await?;
        if !self.payload.is_empty() {
            writer.write_all(&self.payload).await?;
        }
        Ok(())
    }
}
