use std::io;

use crate::http::request::ConnectionIntent;
use crate::http::response::Response;
use crate::net::{ByteSource, Transfer};

const HTTP_VERSION: &str = "HTTP/1.1";

fn serialize_response(resp: &Response, intent: ConnectionIntent) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128 + resp.body.len());

    let status_line = format!(
        "{} {} {}\r\n",
        HTTP_VERSION,
        resp.status.as_u16(),
        resp.status.reason_phrase()
    );
    buf.extend_from_slice(status_line.as_bytes());

    for (k, v) in resp.headers.iter() {
        if k.eq_ignore_ascii_case("Connection") {
            continue;
        }
        buf.extend_from_slice(k.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(v.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    // The connection decides persistence, not the handler.
    match intent {
        ConnectionIntent::KeepAlive => buf.extend_from_slice(b"Connection: keep-alive\r\n"),
        ConnectionIntent::Close => buf.extend_from_slice(b"Connection: close\r\n"),
    }

    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(&resp.body);

    buf
}

/// Progress of a resumable write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteProgress {
    Done,
    /// The socket is full; resume on write readiness.
    Blocked,
}

/// A serialized response plus how much of it already reached the socket.
#[derive(Debug)]
pub struct ResponseWriter {
    buffer: Vec<u8>,
    written: usize,
}

impl ResponseWriter {
    pub fn new(response: &Response, intent: ConnectionIntent) -> Self {
        Self {
            buffer: serialize_response(response, intent),
            written: 0,
        }
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.written
    }

    /// Writes until done or the source would block.
    ///
    /// `on_progress` sees every non-zero write so the caller can record
    /// activity.
    pub fn write_to<S, F>(&mut self, source: &mut S, mut on_progress: F) -> io::Result<WriteProgress>
    where
        S: ByteSource + ?Sized,
        F: FnMut(usize),
    {
        while self.written < self.buffer.len() {
            match source.try_write(&self.buffer[self.written..])? {
                Transfer::Bytes(n) => {
                    self.written += n;
                    on_progress(n);
                }
                Transfer::WouldBlock => return Ok(WriteProgress::Blocked),
                Transfer::Closed => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "connection closed while writing",
                    ));
                }
            }
        }

        Ok(WriteProgress::Done)
    }
}
