use std::io;

use bytes::{Buf, BytesMut};
use tracing::{debug, trace, warn};

use crate::error::{ConnectionError, HandlerError, ProtocolError};
use crate::http::parser::{ParseEvent, ParserState, RequestParser};
use crate::http::request::{ConnectionIntent, Request, RequestBuilder};
use crate::http::response::Response;
use crate::http::writer::{ResponseWriter, WriteProgress};
use crate::net::{ByteSource, Transfer};
use crate::server::monitor::{ConnectionId, IdleHandle};

/// Per-connection buffer and work bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    /// Size of each read from the socket.
    pub read_chunk_bytes: usize,
    /// Reads per readiness turn before yielding to other connections.
    pub max_reads_per_turn: usize,
    pub max_body_bytes: u64,
    /// Input discarded after a close-intent response before giving up on
    /// the peer's EOF.
    pub max_drain_bytes: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            read_chunk_bytes: 8192,
            max_reads_per_turn: 16,
            max_body_bytes: 8 * 1024 * 1024,
            max_drain_bytes: 64 * 1024,
        }
    }
}

/// What the event loop should do with a connection after a callback.
#[derive(Debug)]
pub enum Disposition {
    Continue,
    /// Graceful: any response has been flushed.
    Close,
    /// Abort immediately.
    Error(ConnectionError),
}

#[derive(Debug)]
enum Phase {
    Reading,
    /// Request handed to the worker pool; input waits.
    Dispatched,
    Writing {
        writer: ResponseWriter,
        intent: ConnectionIntent,
    },
    /// Write side shut after a close-intent response; input is discarded.
    Draining,
    Closed,
}

/// Server side of one accepted client stream.
///
/// Owned and driven by the event loop thread only. The parser, the body
/// being assembled and the phase are plain fields; the one piece of state
/// the sweeper can see is the [`IdleHandle`].
#[derive(Debug)]
pub struct Connection<S> {
    id: ConnectionId,
    source: S,
    parser: RequestParser,
    /// Bytes read but not yet taken by the parser.
    input: BytesMut,
    request: Option<RequestBuilder>,
    body: BytesMut,
    ready: Option<Request>,
    intent: ConnectionIntent,
    phase: Phase,
    idle: IdleHandle,
    limits: ConnectionLimits,
    starved: bool,
    drained: usize,
    requests_served: u64,
}

impl<S: ByteSource> Connection<S> {
    pub fn new(source: S, parser: RequestParser, idle: IdleHandle, limits: ConnectionLimits) -> Self {
        Self {
            id: idle.id(),
            source,
            parser,
            input: BytesMut::with_capacity(limits.read_chunk_bytes),
            request: None,
            body: BytesMut::new(),
            ready: None,
            intent: ConnectionIntent::KeepAlive,
            phase: Phase::Reading,
            idle,
            limits,
            starved: false,
            drained: 0,
            requests_served: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn idle(&self) -> &IdleHandle {
        &self.idle
    }

    pub fn intent(&self) -> ConnectionIntent {
        self.intent
    }

    pub fn parser_state(&self) -> ParserState {
        self.parser.state()
    }

    pub fn remaining_body_bytes(&self) -> u64 {
        self.parser.remaining_body()
    }

    pub fn requests_served(&self) -> u64 {
        self.requests_served
    }

    /// A response is waiting for write readiness.
    pub fn wants_write(&self) -> bool {
        matches!(self.phase, Phase::Writing { .. })
    }

    /// The last turn stopped on its work budget, not on would-block.
    pub fn needs_another_turn(&self) -> bool {
        self.starved
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.phase, Phase::Closed)
    }

    /// The request completed by the last turn, if any.
    pub fn take_request(&mut self) -> Option<Request> {
        self.ready.take()
    }

    /// Re-checks expiry on the loop thread. Activity since the sweep wins.
    pub fn is_idle_expired(&self) -> bool {
        self.idle.is_expired()
    }

    pub fn on_readable(&mut self) -> Disposition {
        self.starved = false;
        let result = match self.phase {
            Phase::Reading => self.read_requests(),
            Phase::Draining => self.drain(),
            Phase::Closed => return Disposition::Close,
            // input stays in the kernel until the response is out
            Phase::Dispatched | Phase::Writing { .. } => Ok(Disposition::Continue),
        };
        self.settle(result)
    }

    pub fn on_writable(&mut self) -> Disposition {
        let result = match self.phase {
            Phase::Writing { .. } => self.flush(),
            Phase::Closed => return Disposition::Close,
            _ => Ok(Disposition::Continue),
        };
        self.settle(result)
    }

    /// Starts writing the handler's answer. A failed handler gets a 500 and
    /// the connection closes once it is flushed.
    pub fn on_handler_complete(&mut self, outcome: Result<Response, HandlerError>) -> Disposition {
        if !matches!(self.phase, Phase::Dispatched) {
            return Disposition::Continue;
        }

        let (response, intent) = match outcome {
            Ok(response) => (response, self.intent),
            Err(err) => {
                let err = ConnectionError::from(err);
                warn!(conn = %self.id, error = %err, "Responding with 500 and closing");
                (Response::internal_error(), ConnectionIntent::Close)
            }
        };

        // A peer that stops reading the response is subject to the idle
        // policy again; every byte written counts as activity.
        self.idle.set_busy(false);
        self.phase = Phase::Writing {
            writer: ResponseWriter::new(&response, intent),
            intent,
        };
        let result = self.flush();
        self.settle(result)
    }

    /// Policy closure. Closes the socket and leaves the registry.
    pub fn on_idle_timeout(&mut self) -> ConnectionError {
        let idle = self.idle.idle_for();
        self.close();
        ConnectionError::IdleTimeout(idle)
    }

    pub fn close(&mut self) {
        if !self.is_closed() {
            self.source.close();
            self.phase = Phase::Closed;
        }
        self.idle.unregister();
    }

    fn settle(&mut self, result: Result<Disposition, ConnectionError>) -> Disposition {
        match result {
            Ok(Disposition::Close) => {
                self.close();
                Disposition::Close
            }
            Ok(disposition) => disposition,
            Err(err) => {
                self.close();
                Disposition::Error(err)
            }
        }
    }

    fn read_requests(&mut self) -> Result<Disposition, ConnectionError> {
        let mut reads = 0;

        loop {
            if !self.input.is_empty() {
                self.parse_input()?;
                if !matches!(self.phase, Phase::Reading) {
                    return Ok(Disposition::Continue);
                }
            }

            if reads == self.limits.max_reads_per_turn {
                self.starved = true;
                return Ok(Disposition::Continue);
            }

            match self.fill()? {
                Transfer::Bytes(_) => reads += 1,
                Transfer::WouldBlock => return Ok(Disposition::Continue),
                Transfer::Closed => {
                    if self.parser.state() != ParserState::Start || self.parser.buffered_len() > 0 {
                        debug!(conn = %self.id, state = ?self.parser.state(), "Peer closed mid-request");
                    }
                    return Ok(Disposition::Close);
                }
            }
        }
    }

    /// One read into the working buffer. Only transferred bytes count as
    /// activity.
    fn fill(&mut self) -> io::Result<Transfer> {
        let start = self.input.len();
        self.input.resize(start + self.limits.read_chunk_bytes, 0);

        let outcome = self.source.try_read(&mut self.input[start..]);
        let n = outcome.as_ref().map(Transfer::bytes).unwrap_or(0);
        self.input.truncate(start + n);

        if n > 0 {
            self.idle.touch();
            trace!(conn = %self.id, bytes = n, "Read");
        }
        outcome
    }

    fn parse_input(&mut self) -> Result<(), ConnectionError> {
        let feed = self.parser.feed(&self.input);
        self.input.advance(feed.consumed);

        for event in feed.events {
            self.apply(event)?;
        }
        Ok(())
    }

    fn apply(&mut self, event: ParseEvent) -> Result<(), ConnectionError> {
        match event {
            ParseEvent::StartLine {
                method,
                path,
                version,
            } => {
                self.request = Some(RequestBuilder::new().method(method).path(path).version(version));
            }

            ParseEvent::Header { name, value } => {
                if let Some(builder) = self.request.as_mut() {
                    builder.push_header(name, value);
                }
            }

            ParseEvent::HeadersComplete {
                content_length,
                intent,
            } => {
                if content_length > self.limits.max_body_bytes {
                    return Err(ProtocolError::BodyTooLarge(self.limits.max_body_bytes).into());
                }
                self.intent = intent;
                self.body = BytesMut::with_capacity(content_length.min(64 * 1024) as usize);
            }

            ParseEvent::BodyChunk(chunk) => self.body.extend_from_slice(&chunk),

            ParseEvent::MessageComplete => {
                let request = self
                    .request
                    .take()
                    .ok_or(ProtocolError::InvalidRequestLine)?
                    .body(std::mem::take(&mut self.body).freeze())
                    .build()
                    .map_err(|_| ProtocolError::InvalidRequestLine)?;

                debug!(
                    conn = %self.id,
                    method = request.method.as_str(),
                    path = %request.path,
                    body_bytes = request.body.len(),
                    intent = ?self.intent,
                    "Request complete"
                );

                self.ready = Some(request);
                self.phase = Phase::Dispatched;
                self.idle.set_busy(true);
            }

            ParseEvent::Error(err) => return Err(err.into()),
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<Disposition, ConnectionError> {
        let Phase::Writing { writer, intent } = &mut self.phase else {
            return Ok(Disposition::Continue);
        };
        let intent = *intent;
        let idle = &self.idle;

        if writer.write_to(&mut self.source, |_| idle.touch())? == WriteProgress::Blocked {
            return Ok(Disposition::Continue);
        }

        self.requests_served += 1;

        match intent {
            ConnectionIntent::KeepAlive => {
                self.parser.reset();
                self.phase = Phase::Reading;
                self.read_requests()
            }
            ConnectionIntent::Close => {
                // Leftover input is never parsed once the intent is close.
                self.input.clear();
                self.source.shutdown_output()?;
                self.phase = Phase::Draining;
                self.drain()
            }
        }
    }

    fn drain(&mut self) -> Result<Disposition, ConnectionError> {
        let mut scratch = [0u8; 4096];

        for _ in 0..self.limits.max_reads_per_turn {
            match self.source.try_read(&mut scratch)? {
                Transfer::Bytes(n) => {
                    self.idle.touch();
                    self.drained += n;
                    if self.drained > self.limits.max_drain_bytes {
                        debug!(conn = %self.id, drained = self.drained, "Peer kept sending after close");
                        return Ok(Disposition::Close);
                    }
                }
                Transfer::WouldBlock => return Ok(Disposition::Continue),
                Transfer::Closed => return Ok(Disposition::Close),
            }
        }

        self.starved = true;
        Ok(Disposition::Continue)
    }
}
