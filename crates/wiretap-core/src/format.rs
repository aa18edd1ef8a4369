//! Record formatting.
//!
//! Every record starts with the session id in brackets so request, response
//! and body records of one exchange can be matched up by eye or by grep.
//! Body text is colored per side when color output is enabled.

use std::fmt::{Display, Write as _};
use std::time::Duration;

use hyper::header::HeaderValue;
use hyper::{HeaderMap, StatusCode};

use crate::session::{Session, SessionId};
use crate::tee::{StreamKind, TeeClose, TeeEvent};

const RESET: &str = "\x1b[0m";
const CYAN: &str = "\x1b[36m";
const GREEN: &str = "\x1b[32m";

/// Formats records for an output sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineFormat {
    color: bool,
    max_preview: usize,
}

impl LineFormat {
    /// Plain formatting, full bodies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables ANSI colors on body text.
    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    /// Limits how many bytes of each body chunk are printed (0 = no limit).
    pub fn with_max_preview(mut self, max_preview: usize) -> Self {
        self.max_preview = max_preview;
        self
    }

    /// `[001] 127.0.0.1:50000 GET http://example.com/`
    pub fn request_line(&self, session: &Session) -> String {
        format!(
            "[{}] {} {} {}",
            session.id(),
            session.client_addr(),
            session.method(),
            session.url()
        )
    }

    /// `[001] 200 OK GET http://example.com/ (12 ms)`
    pub fn response_line(&self, session: &Session, status: StatusCode, elapsed: Duration) -> String {
        format!(
            "[{}] {} {} {} ({} ms)",
            session.id(),
            status,
            session.method(),
            session.url(),
            elapsed.as_millis()
        )
    }

    /// Redirect target of a 3xx response. A missing header is reported, not
    /// treated as an error.
    pub fn redirect_line(&self, session: &Session, location: Option<&HeaderValue>) -> String {
        match location {
            Some(value) => format!(
                "[{}] redirect {} -> {}",
                session.id(),
                session.url(),
                String::from_utf8_lossy(value.as_bytes())
            ),
            None => format!(
                "[{}] redirect {} -> (no Location header)",
                session.id(),
                session.url()
            ),
        }
    }

    /// Multi-line header dump, emitted as a single record.
    pub fn header_dump(&self, id: SessionId, kind: StreamKind, headers: &HeaderMap) -> String {
        if headers.is_empty() {
            return format!("[{id}] {kind} headers: (none)");
        }

        let mut out = format!("[{id}] {kind} headers:");
        for (name, value) in headers {
            let _ = write!(
                out,
                "\n    {}: {}",
                name,
                String::from_utf8_lossy(value.as_bytes())
            );
        }
        out
    }

    /// `[001] request body (4 bytes): ping`
    pub fn body_chunk(&self, event: &TeeEvent<'_>) -> String {
        let shown = match self.max_preview {
            0 => event.payload,
            max => &event.payload[..event.payload.len().min(max)],
        };
        let text = String::from_utf8_lossy(shown);

        let mut out = format!(
            "[{}] {} body ({} bytes): ",
            event.session,
            event.kind,
            event.byte_count()
        );
        if self.color {
            let _ = write!(out, "{}{}{}", body_color(event.kind), text, RESET);
        } else {
            out.push_str(&text);
        }
        if shown.len() < event.payload.len() {
            let _ = write!(out, " ... (+{} bytes)", event.payload.len() - shown.len());
        }
        out
    }

    /// `[001] response body complete (4 bytes)`
    pub fn body_close(&self, close: &TeeClose) -> String {
        format!(
            "[{}] {} body {} ({} bytes)",
            close.session,
            close.kind,
            close.reason.as_str(),
            close.total_bytes
        )
    }

    /// Upstream failure for an exchange.
    pub fn upstream_error(&self, session: &Session, error: &dyn Display) -> String {
        format!(
            "[{}] upstream error {} {}: {}",
            session.id(),
            session.method(),
            session.url(),
            error
        )
    }

    /// Exchange that ended without a response (websocket upgrade, client
    /// gone).
    pub fn unanswered_line(&self, session: &Session, elapsed: Duration) -> String {
        format!(
            "[{}] no response {} {} ({} ms)",
            session.id(),
            session.method(),
            session.url(),
            elapsed.as_millis()
        )
    }
}

fn body_color(kind: StreamKind) -> &'static str {
    match kind {
        StreamKind::Request => CYAN,
        StreamKind::Response => GREEN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRegistry;
    use crate::tee::CloseReason;
    use hyper::Method;
    use std::net::SocketAddr;

    fn session() -> Session {
        SessionRegistry::new().begin(
            Method::GET,
            "http://example.com/ping",
            SocketAddr::from(([10, 0, 0, 2], 40000)),
        )
    }

    fn event(kind: StreamKind, payload: &[u8]) -> TeeEvent<'_> {
        TeeEvent {
            session: SessionId::new(1),
            kind,
            payload,
        }
    }

    #[test]
    fn request_and_response_lines() {
        let format = LineFormat::new();
        let session = session();

        assert_eq!(
            format.request_line(&session),
            "[001] 10.0.0.2:40000 GET http://example.com/ping"
        );
        assert_eq!(
            format.response_line(&session, StatusCode::OK, Duration::from_millis(12)),
            "[001] 200 OK GET http://example.com/ping (12 ms)"
        );
    }

    #[test]
    fn redirect_with_and_without_location() {
        let format = LineFormat::new();
        let session = session();
        let location = HeaderValue::from_static("https://example.com/pong");

        assert_eq!(
            format.redirect_line(&session, Some(&location)),
            "[001] redirect http://example.com/ping -> https://example.com/pong"
        );
        assert!(format
            .redirect_line(&session, None)
            .ends_with("(no Location header)"));
    }

    #[test]
    fn header_dump_lists_every_value() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));

        let dump = LineFormat::new().header_dump(SessionId::new(3), StreamKind::Response, &headers);
        let lines: Vec<&str> = dump.lines().collect();

        assert_eq!(lines[0], "[003] response headers:");
        assert!(lines.contains(&"    content-type: text/plain"));
        assert!(lines.contains(&"    set-cookie: a=1"));
        assert!(lines.contains(&"    set-cookie: b=2"));
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn header_dump_shows_non_utf8_lossily() {
        let mut headers = HeaderMap::new();
        headers.insert("x-raw", HeaderValue::from_bytes(&[b'o', b'k', 0xff]).unwrap());

        let dump = LineFormat::new().header_dump(SessionId::new(1), StreamKind::Request, &headers);
        assert!(dump.contains("x-raw: ok\u{fffd}"));
    }

    #[test]
    fn empty_headers() {
        let dump =
            LineFormat::new().header_dump(SessionId::new(1), StreamKind::Request, &HeaderMap::new());
        assert_eq!(dump, "[001] request headers: (none)");
    }

    #[test]
    fn body_chunk_plain() {
        let line = LineFormat::new().body_chunk(&event(StreamKind::Request, b"ping"));
        assert_eq!(line, "[001] request body (4 bytes): ping");
    }

    #[test]
    fn body_chunk_colors_differ_per_side() {
        let format = LineFormat::new().with_color(true);
        let request = format.body_chunk(&event(StreamKind::Request, b"ping"));
        let response = format.body_chunk(&event(StreamKind::Response, b"pong"));

        assert!(request.contains("\x1b[36mping\x1b[0m"));
        assert!(response.contains("\x1b[32mpong\x1b[0m"));
    }

    #[test]
    fn body_chunk_preview_is_truncated() {
        let format = LineFormat::new().with_max_preview(4);
        let line = format.body_chunk(&event(StreamKind::Response, b"0123456789"));
        assert_eq!(line, "[001] response body (10 bytes): 0123 ... (+6 bytes)");
    }

    #[test]
    fn body_close_line() {
        let close = TeeClose {
            session: SessionId::new(9),
            kind: StreamKind::Response,
            total_bytes: 4,
            reason: CloseReason::EndOfStream,
        };
        assert_eq!(
            LineFormat::new().body_close(&close),
            "[009] response body complete (4 bytes)"
        );
    }

    #[test]
    fn upstream_error_line() {
        let line = LineFormat::new().upstream_error(&session(), &"connection refused");
        assert_eq!(
            line,
            "[001] upstream error GET http://example.com/ping: connection refused"
        );
    }

    #[test]
    fn unanswered_line() {
        let line = LineFormat::new().unanswered_line(&session(), Duration::from_millis(7));
        assert_eq!(line, "[001] no response GET http://example.com/ping (7 ms)");
    }
}
