//! Incremental HTTP/1.x request parser.
//!
//! [`RequestParser::feed`] accepts whatever bytes the socket produced and
//! emits one [`ParseEvent`] per complete syntactic unit: the request line,
//! each header line, each slice of body data. A line that is only partially
//! present is copied into the parser and finished by a later `feed`; bytes
//! already searched for a line terminator are never searched again.
//!
//! ```text
//!   Start ──request line──▶ Headers ──blank line──┬─▶ Body ──remaining = 0──▶ Complete
//!                                                 └─(no body)────────────────▶ Complete
//!   any malformed unit ──▶ Error
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::http::request::{ConnectionIntent, Method, Version};

/// Longest accepted request line or header line, terminator excluded.
pub const MAX_LINE_BYTES: usize = 8192;

/// Maximum number of headers parsed from a single request.
pub const MAX_HEADERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseLimits {
    pub max_line_bytes: usize,
    pub max_headers: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_line_bytes: MAX_LINE_BYTES,
            max_headers: MAX_HEADERS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    Start,
    Headers,
    Body,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    StartLine {
        method: Method,
        path: String,
        version: Version,
    },
    Header {
        name: String,
        value: String,
    },
    HeadersComplete {
        content_length: u64,
        intent: ConnectionIntent,
    },
    BodyChunk(Bytes),
    MessageComplete,
    /// Terminal; the parser consumes nothing after this.
    Error(ProtocolError),
}

/// Result of one [`RequestParser::feed`] call.
#[derive(Debug, Default)]
pub struct Feed {
    pub events: Vec<ParseEvent>,
    /// Bytes of the input taken by the parser. Anything past this belongs to
    /// the next request (or is garbage after an error).
    pub consumed: usize,
}

/// Invoked once per `feed` call.
pub type ParseObserver = Arc<dyn Fn() + Send + Sync>;

/// Shared count of parse invocations.
///
/// Used to spot connections that spin the parser without new input.
#[derive(Debug, Clone, Default)]
pub struct ParseCounter(Arc<AtomicU64>);

impl ParseCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn observer(&self) -> ParseObserver {
        let count = Arc::clone(&self.0);
        Arc::new(move || {
            count.fetch_add(1, Ordering::Relaxed);
        })
    }
}

pub struct RequestParser {
    state: ParserState,
    limits: ParseLimits,
    /// Start of a line whose terminator has not arrived yet.
    line: BytesMut,
    observer: Option<ParseObserver>,

    version: Version,
    content_length: Option<u64>,
    remaining: u64,
    headers_seen: usize,
    close_token: bool,
    keep_alive_token: bool,
}

impl fmt::Debug for RequestParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestParser")
            .field("state", &self.state)
            .field("buffered", &self.line.len())
            .field("remaining", &self.remaining)
            .finish()
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self::with_limits(ParseLimits::default())
    }

    pub fn with_limits(limits: ParseLimits) -> Self {
        Self {
            state: ParserState::Start,
            limits,
            line: BytesMut::new(),
            observer: None,
            version: Version::Http11,
            content_length: None,
            remaining: 0,
            headers_seen: 0,
            close_token: false,
            keep_alive_token: false,
        }
    }

    pub fn with_observer(mut self, observer: ParseObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Body bytes still expected for the current request.
    pub fn remaining_body(&self) -> u64 {
        self.remaining
    }

    /// Bytes held from an unfinished line.
    pub fn buffered_len(&self) -> usize {
        self.line.len()
    }

    /// Prepares for the next request on a keep-alive connection.
    ///
    /// Only legal once the current request is `Complete`; returns `false`
    /// and leaves the parser untouched otherwise.
    pub fn reset(&mut self) -> bool {
        if self.state != ParserState::Complete {
            return false;
        }

        self.state = ParserState::Start;
        self.line.clear();
        self.version = Version::Http11;
        self.content_length = None;
        self.remaining = 0;
        self.headers_seen = 0;
        self.close_token = false;
        self.keep_alive_token = false;
        true
    }

    pub fn feed(&mut self, input: &[u8]) -> Feed {
        if let Some(observer) = &self.observer {
            observer();
        }

        let mut events = Vec::new();
        let mut pos = 0;

        while pos < input.len() {
            match self.state {
                ParserState::Start | ParserState::Headers => {
                    let rest = &input[pos..];
                    let Some(newline) = rest.iter().position(|&b| b == b'\n') else {
                        if self.line.len() + rest.len() > self.limits.max_line_bytes + 1 {
                            self.fail(ProtocolError::LineTooLong(self.limits.max_line_bytes), &mut events);
                            break;
                        }
                        self.line.extend_from_slice(rest);
                        pos = input.len();
                        break;
                    };

                    // +1 leaves room for the optional CR
                    if self.line.len() + newline > self.limits.max_line_bytes + 1 {
                        self.fail(ProtocolError::LineTooLong(self.limits.max_line_bytes), &mut events);
                        break;
                    }

                    let end = pos + newline;
                    let outcome = if self.line.is_empty() {
                        self.on_line(&input[pos..end], &mut events)
                    } else {
                        let mut line = std::mem::take(&mut self.line);
                        line.extend_from_slice(&input[pos..end]);
                        let outcome = self.on_line(&line, &mut events);
                        line.clear();
                        self.line = line;
                        outcome
                    };
                    pos = end + 1;

                    if let Err(err) = outcome {
                        self.fail(err, &mut events);
                        break;
                    }
                }

                ParserState::Body => {
                    let available = (input.len() - pos) as u64;
                    let take = available.min(self.remaining) as usize;
                    events.push(ParseEvent::BodyChunk(Bytes::copy_from_slice(
                        &input[pos..pos + take],
                    )));
                    pos += take;
                    self.remaining -= take as u64;

                    if self.remaining == 0 {
                        self.state = ParserState::Complete;
                        events.push(ParseEvent::MessageComplete);
                    }
                }

                ParserState::Complete | ParserState::Error => break,
            }
        }

        Feed {
            events,
            consumed: pos,
        }
    }

    fn fail(&mut self, err: ProtocolError, events: &mut Vec<ParseEvent>) {
        self.state = ParserState::Error;
        events.push(ParseEvent::Error(err));
    }

    fn on_line(&mut self, raw: &[u8], events: &mut Vec<ParseEvent>) -> Result<(), ProtocolError> {
        let line = raw.strip_suffix(b"\r").unwrap_or(raw);

        match self.state {
            ParserState::Start => {
                // RFC 7230 3.5: ignore empty lines ahead of a request line
                if line.is_empty() {
                    return Ok(());
                }

                let (method, path, version) = parse_request_line(line)?;
                self.version = version;
                self.state = ParserState::Headers;
                events.push(ParseEvent::StartLine {
                    method,
                    path,
                    version,
                });
                Ok(())
            }

            ParserState::Headers if line.is_empty() => {
                self.finish_headers(events);
                Ok(())
            }

            ParserState::Headers => self.on_header(line, events),

            _ => Ok(()),
        }
    }

    fn on_header(&mut self, line: &[u8], events: &mut Vec<ParseEvent>) -> Result<(), ProtocolError> {
        // obsolete line folding
        if matches!(line.first(), Some(b' ' | b'\t')) {
            return Err(ProtocolError::InvalidHeader);
        }

        if self.headers_seen == self.limits.max_headers {
            return Err(ProtocolError::TooManyHeaders(self.limits.max_headers));
        }

        let text = std::str::from_utf8(line).map_err(|_| ProtocolError::InvalidHeader)?;
        let (name, value) = text.split_once(':').ok_or(ProtocolError::InvalidHeader)?;

        if name.is_empty() || !name.bytes().all(is_token_byte) {
            return Err(ProtocolError::InvalidHeader);
        }

        let value = value.trim_matches([' ', '\t']);
        self.headers_seen += 1;

        if name.eq_ignore_ascii_case("content-length") {
            let length = parse_content_length(value)?;
            match self.content_length {
                Some(previous) if previous != length => {
                    return Err(ProtocolError::InvalidContentLength);
                }
                _ => self.content_length = Some(length),
            }
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            return Err(ProtocolError::UnsupportedTransferEncoding);
        } else if name.eq_ignore_ascii_case("connection") {
            for token in value.split(',') {
                let token = token.trim();
                self.close_token |= token.eq_ignore_ascii_case("close");
                self.keep_alive_token |= token.eq_ignore_ascii_case("keep-alive");
            }
        }

        events.push(ParseEvent::Header {
            name: name.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    fn finish_headers(&mut self, events: &mut Vec<ParseEvent>) {
        let content_length = self.content_length.unwrap_or(0);
        let intent = ConnectionIntent::resolve(self.version, self.close_token, self.keep_alive_token);

        events.push(ParseEvent::HeadersComplete {
            content_length,
            intent,
        });

        if content_length > 0 {
            self.remaining = content_length;
            self.state = ParserState::Body;
        } else {
            self.state = ParserState::Complete;
            events.push(ParseEvent::MessageComplete);
        }
    }
}

fn parse_request_line(line: &[u8]) -> Result<(Method, String, Version), ProtocolError> {
    let text = std::str::from_utf8(line).map_err(|_| ProtocolError::InvalidRequestLine)?;
    let mut parts = text.split(' ');

    let (Some(method), Some(path), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ProtocolError::InvalidRequestLine);
    };

    if path.is_empty() || path.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Err(ProtocolError::InvalidRequestLine);
    }

    let method = Method::from_str(method).ok_or(ProtocolError::InvalidMethod)?;
    let version = Version::from_str(version).ok_or(if version.starts_with("HTTP/") {
        ProtocolError::UnsupportedVersion
    } else {
        ProtocolError::InvalidRequestLine
    })?;

    Ok((method, path.to_string(), version))
}

/// Digits only: `u64::from_str` alone would accept a leading `+`.
fn parse_content_length(value: &str) -> Result<u64, ProtocolError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::InvalidContentLength);
    }
    value.parse().map_err(|_| ProtocolError::InvalidContentLength)
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
