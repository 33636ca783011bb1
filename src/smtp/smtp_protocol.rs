//! Line transport for an SMTP connection.
//!
//! Reads CRLF (or bare LF) terminated lines and writes [`Reply`] values over
//! any buffered async reader / async writer pair, so the same code drives a
//! `TcpStream` in production and in-memory buffers in tests.

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing::trace;

use super::reply::Reply;

pub struct SmtpProtocol<R, W>
where
    R: AsyncBufReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    reader: R,
    writer: W,
}

impl<R, W> SmtpProtocol<R, W>
where
    R: AsyncBufReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        SmtpProtocol { reader, writer }
    }

    /// Reads one line without its trailing CR/LF.
    ///
    /// Returns `None` once the peer closed the stream. Bytes are passed
    /// through untouched, so 8-bit message content survives.
    pub async fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buffer = Vec::new();
        let bytes_read = self.reader.read_until(b'\n', &mut buffer).await?;
        if bytes_read == 0 {
            return Ok(None);
        }

        while matches!(buffer.last(), Some(b'\n' | b'\r')) {
            buffer.pop();
        }
        trace!("SMTP Read: {}", String::from_utf8_lossy(&buffer));
        Ok(Some(buffer))
    }

    /// Writes a reply and flushes it to the peer.
    pub async fn write_reply(&mut self, reply: &Reply) -> Result<()> {
        let wire = reply.to_string();
        trace!("SMTP Write: {}", wire.trim_end());
        self.writer.write_all(wire.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    #[cfg(test)]
    fn writer(&self) -> &W {
        &self.writer
    }
}
