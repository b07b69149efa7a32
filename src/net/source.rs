use std::io::{self, Read, Write};
use std::net::Shutdown;

use mio::net::TcpStream;

/// Outcome of a single non-blocking transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// `n > 0` bytes moved.
    Bytes(usize),
    /// Nothing available right now; wait for readiness.
    WouldBlock,
    /// The peer closed its side (EOF on read).
    Closed,
}

impl Transfer {
    pub fn bytes(&self) -> usize {
        match self {
            Transfer::Bytes(n) => *n,
            _ => 0,
        }
    }
}

/// Non-blocking read/write surface of one client socket.
///
/// None of these calls may block.
pub trait ByteSource {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Transfer>;

    fn try_write(&mut self, buf: &[u8]) -> io::Result<Transfer>;

    /// Half-close: no more bytes will be written, reads stay open.
    fn shutdown_output(&mut self) -> io::Result<()>;

    /// Tear the stream down. Idempotent.
    fn close(&mut self);
}

impl ByteSource for TcpStream {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Transfer> {
        loop {
            match self.read(buf) {
                Ok(0) if !buf.is_empty() => return Ok(Transfer::Closed),
                Ok(n) => return Ok(Transfer::Bytes(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Transfer::WouldBlock),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<Transfer> {
        loop {
            match self.write(buf) {
                Ok(0) if !buf.is_empty() => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "connection closed while writing",
                    ));
                }
                Ok(n) => return Ok(Transfer::Bytes(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Transfer::WouldBlock),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn shutdown_output(&mut self) -> io::Result<()> {
        match self.shutdown(Shutdown::Write) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn close(&mut self) {
        let _ = self.shutdown(Shutdown::Both);
    }
}
