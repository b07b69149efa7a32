use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use idlegate::error::{ConnectionError, HandlerError, ProtocolError};
use idlegate::http::connection::{Connection, ConnectionLimits, Disposition};
use idlegate::http::parser::{ParseCounter, ParserState, RequestParser};
use idlegate::http::request::{ConnectionIntent, Method};
use idlegate::http::response::Response;
use idlegate::net::{ByteSource, Transfer};
use idlegate::server::clock::ManualClock;
use idlegate::server::monitor::{ConnectionId, IdleTimeoutMonitor};

#[derive(Debug)]
enum Step {
    Data(Vec<u8>),
    Block,
    Eof,
}

#[derive(Debug, Default)]
struct ScriptedSource {
    reads: VecDeque<Step>,
    written: Vec<u8>,
    write_budget: Option<usize>,
    shutdown: bool,
    closed: bool,
}

impl ScriptedSource {
    fn push(&mut self, data: &[u8]) {
        self.reads.push_back(Step::Data(data.to_vec()));
    }

    fn written_str(&self) -> String {
        String::from_utf8_lossy(&self.written).into_owned()
    }
}

impl ByteSource for ScriptedSource {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Transfer> {
        match self.reads.pop_front() {
            Some(Step::Data(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    self.reads.push_front(Step::Data(data[n..].to_vec()));
                }
                Ok(Transfer::Bytes(n))
            }
            Some(Step::Eof) => Ok(Transfer::Closed),
            Some(Step::Block) | None => Ok(Transfer::WouldBlock),
        }
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<Transfer> {
        let n = match self.write_budget.as_mut() {
            Some(0) => return Ok(Transfer::WouldBlock),
            Some(budget) => {
                let n = (*budget).min(buf.len());
                *budget -= n;
                n
            }
            None => buf.len(),
        };
        self.written.extend_from_slice(&buf[..n]);
        Ok(Transfer::Bytes(n))
    }

    fn shutdown_output(&mut self) -> io::Result<()> {
        self.shutdown = true;
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

struct Harness {
    conn: Connection<ScriptedSource>,
    monitor: IdleTimeoutMonitor,
    clock: Arc<ManualClock>,
    parses: ParseCounter,
}

fn harness(limits: ConnectionLimits) -> Harness {
    let clock = Arc::new(ManualClock::new());
    let monitor = IdleTimeoutMonitor::with_clock(clock.clone());
    let parses = ParseCounter::new();
    let idle = monitor.register(ConnectionId(1), Duration::from_millis(200));
    let parser = RequestParser::new().with_observer(parses.observer());
    let conn = Connection::new(ScriptedSource::default(), parser, idle, limits);
    Harness {
        conn,
        monitor,
        clock,
        parses,
    }
}

#[test]
fn test_empty_reads_are_not_activity() {
    let mut h = harness(ConnectionLimits::default());

    h.clock.advance(Duration::from_millis(50));
    h.conn.source_mut().reads.push_back(Step::Block);
    assert!(matches!(h.conn.on_readable(), Disposition::Continue));
    assert_eq!(h.conn.idle().idle_for(), Duration::from_millis(50));
    assert_eq!(h.parses.get(), 0);

    h.clock.advance(Duration::from_millis(10));
    h.conn.source_mut().push(b"GET / HT");
    h.conn.on_readable();
    assert_eq!(h.conn.idle().idle_for(), Duration::ZERO);
    assert_eq!(h.parses.get(), 1);
}

#[test]
fn test_request_waits_for_handler_then_keeps_alive() {
    let mut h = harness(ConnectionLimits::default());
    h.conn.source_mut().push(b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n");

    assert!(matches!(h.conn.on_readable(), Disposition::Continue));
    let request = h.conn.take_request().unwrap();
    assert_eq!(request.method, Method::GET);
    assert_eq!(request.path, "/x");
    assert!(h.conn.idle().is_busy());

    // readiness while the handler runs reads nothing
    h.conn.source_mut().push(b"GET /y HTTP/1.1\r\n\r\n");
    h.conn.on_readable();
    assert!(h.conn.take_request().is_none());

    let disposition = h.conn.on_handler_complete(Ok(Response::ok("hi")));
    assert!(matches!(disposition, Disposition::Continue));
    let written = h.conn.source().written_str();
    assert!(written.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(written.contains("Connection: keep-alive\r\n"));
    assert!(written.ends_with("\r\n\r\nhi"));

    // the queued request is picked up on resume
    assert_eq!(h.conn.take_request().unwrap().path, "/y");
    assert_eq!(h.conn.requests_served(), 1);
}

#[test]
fn test_back_to_back_requests_do_not_share_body_state() {
    let mut h = harness(ConnectionLimits::default());
    h.conn
        .source_mut()
        .push(b"POST /a HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcGET /b HTTP/1.1\r\n\r\n");

    h.conn.on_readable();
    let first = h.conn.take_request().unwrap();
    assert_eq!(first.path, "/a");
    assert_eq!(&first.body[..], b"abc");
    assert_eq!(h.conn.remaining_body_bytes(), 0);
    assert_eq!(h.conn.parser_state(), ParserState::Complete);

    h.conn.on_handler_complete(Ok(Response::ok("one")));
    let second = h.conn.take_request().unwrap();
    assert_eq!(second.path, "/b");
    assert!(second.body.is_empty());
    assert_eq!(h.conn.remaining_body_bytes(), 0);
}

#[test]
fn test_invalid_content_length_aborts_without_a_request() {
    let mut h = harness(ConnectionLimits::default());
    h.conn
        .source_mut()
        .push(b"POST / HTTP/1.1\r\nContent-Length: -1\r\n\r\n");

    match h.conn.on_readable() {
        Disposition::Error(ConnectionError::Protocol(ProtocolError::InvalidContentLength)) => {}
        other => panic!("unexpected disposition {other:?}"),
    }
    assert!(h.conn.take_request().is_none());
    assert!(h.conn.source().closed);
    assert!(h.conn.source().written.is_empty());
    assert!(h.monitor.is_empty());
}

#[test]
fn test_close_intent_half_closes_and_never_parses_again() {
    let mut h = harness(ConnectionLimits::default());
    h.conn
        .source_mut()
        .push(b"POST / HTTP/1.1\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok");

    h.conn.on_readable();
    assert!(h.conn.take_request().is_some());
    assert_eq!(h.conn.intent(), ConnectionIntent::Close);

    let disposition = h.conn.on_handler_complete(Ok(Response::ok("done")));
    assert!(matches!(disposition, Disposition::Continue));
    assert!(h.conn.source().shutdown);
    assert!(h.conn.source().written_str().contains("Connection: close\r\n"));

    h.conn.source_mut().push(b"POST / HTTP/1.1\r\n\r\n");
    h.conn.source_mut().reads.push_back(Step::Eof);
    assert!(matches!(h.conn.on_readable(), Disposition::Close));
    assert!(h.conn.take_request().is_none());
    assert_eq!(h.parses.get(), 1);
}

#[test]
fn test_stalled_peer_does_not_spin_the_parser() {
    let mut h = harness(ConnectionLimits::default());
    let body = vec![b'Y'; 3072];
    {
        let source = h.conn.source_mut();
        source.push(b"POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 3072\r\n\r\n");
        for chunk in body.chunks(1000) {
            source.push(chunk);
            source.reads.push_back(Step::Block);
        }
    }

    for _ in 0..100 {
        h.conn.on_readable();
    }

    let request = h.conn.take_request().unwrap();
    assert_eq!(request.body.len(), 3072);
    assert!(h.parses.get() < 10, "parsed {} times", h.parses.get());
}

#[test]
fn test_handler_failure_sends_500_and_closes() {
    let mut h = harness(ConnectionLimits::default());
    h.conn.source_mut().push(b"GET / HTTP/1.1\r\n\r\n");
    h.conn.on_readable();
    h.conn.take_request();

    h.conn.source_mut().reads.push_back(Step::Eof);
    let disposition = h.conn.on_handler_complete(Err(HandlerError::new("boom")));

    assert!(matches!(disposition, Disposition::Close));
    let written = h.conn.source().written_str();
    assert!(written.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert!(written.contains("Connection: close\r\n"));
}

#[test]
fn test_stalled_write_expires() {
    let mut h = harness(ConnectionLimits::default());
    h.conn.source_mut().write_budget = Some(0);
    h.conn.source_mut().push(b"GET / HTTP/1.1\r\n\r\n");
    h.conn.on_readable();
    h.conn.take_request();
    assert!(h.conn.idle().is_busy());

    h.conn.on_handler_complete(Ok(Response::ok("payload")));
    assert!(h.conn.wants_write());
    assert!(!h.conn.idle().is_busy());

    h.clock.advance(Duration::from_secs(3600));
    let report = h.monitor.sweep(&|_: ConnectionId| true);
    assert_eq!(report.expired, vec![ConnectionId(1)]);
    assert!(h.conn.is_idle_expired());
    assert!(h.conn.source().written.is_empty());
}

#[test]
fn test_slow_reader_stays_alive_while_bytes_move() {
    let mut h = harness(ConnectionLimits::default());
    h.conn.source_mut().write_budget = Some(10);
    h.conn.source_mut().push(b"GET / HTTP/1.1\r\n\r\n");
    h.conn.on_readable();
    h.conn.take_request();

    h.conn.on_handler_complete(Ok(Response::ok("payload")));
    assert!(h.conn.wants_write());

    for _ in 0..3 {
        h.clock.advance(Duration::from_millis(150));
        assert!(!h.conn.is_idle_expired());
        h.conn.source_mut().write_budget = Some(10);
        h.conn.on_writable();
    }
    assert!(!h.conn.is_idle_expired());

    h.conn.source_mut().write_budget = None;
    h.conn.on_writable();
    assert!(!h.conn.wants_write());
    assert!(h.conn.source().written_str().ends_with("payload"));
}

#[test]
fn test_read_budget_yields_to_other_connections() {
    let limits = ConnectionLimits {
        max_reads_per_turn: 2,
        ..ConnectionLimits::default()
    };
    let mut h = harness(limits);
    let parts: [&[u8]; 4] = [b"GET / ", b"HTTP/1.1\r\n", b"Host: a\r\n", b"\r\n"];
    for part in parts {
        h.conn.source_mut().push(part);
    }

    h.conn.on_readable();
    assert!(h.conn.needs_another_turn());
    assert!(h.conn.take_request().is_none());

    h.conn.on_readable();
    assert!(h.conn.take_request().is_some());
}

#[test]
fn test_idle_timeout_closes_and_unregisters() {
    let mut h = harness(ConnectionLimits::default());
    h.clock.advance(Duration::from_millis(250));
    assert!(h.conn.is_idle_expired());

    let err = h.conn.on_idle_timeout();
    assert!(matches!(err, ConnectionError::IdleTimeout(d) if d == Duration::from_millis(250)));
    assert!(!err.is_failure());
    assert!(h.conn.source().closed);
    assert!(h.monitor.is_empty());
}
