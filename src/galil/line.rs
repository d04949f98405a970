//! Framed line I/O over the controller's TCP connection.
//!
//! Outbound lines are CR-terminated. Inbound bytes are split on CR or LF;
//! empty segments between the two are dropped by the caller via
//! `reply::clean`.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

pub struct LineConn {
    read: OwnedReadHalf,
    write: OwnedWriteHalf,
    buf: Vec<u8>,
    /// Parse position within `buf`.
    pos: usize,
}

impl LineConn {
    pub fn new(stream: TcpStream) -> Self {
        let (read, write) = stream.into_split();
        LineConn {
            read,
            write,
            buf: Vec::with_capacity(1024),
            pos: 0,
        }
    }

    /// Read one line, without its terminator. Returns `None` at EOF once
    /// the buffer is drained. Cancel-safe: partial data stays buffered.
    pub async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            if let Some(line) = self.take_buffered_line() {
                return Ok(Some(line));
            }
            let mut chunk = [0_u8; 1024];
            let n = self.read.read(&mut chunk).await?;
            if n == 0 {
                // EOF: hand out whatever trailing bytes remain.
                if self.pos < self.buf.len() {
                    let line = String::from_utf8_lossy(&self.buf[self.pos..]).into_owned();
                    self.buf.clear();
                    self.pos = 0;
                    return Ok(Some(line));
                }
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn take_buffered_line(&mut self) -> Option<String> {
        let search = &self.buf[self.pos..];
        let end = search.iter().position(|b| *b == b'\r' || *b == b'\n')?;
        let line = String::from_utf8_lossy(&search[..end]).into_owned();
        self.pos += end + 1;
        if self.pos > 4096 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        Some(line)
    }

    /// Write one line, CR-terminated.
    pub async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.write.write_all(line.as_bytes()).await?;
        self.write.write_all(b"\r").await?;
        self.write.flush().await
    }
}
