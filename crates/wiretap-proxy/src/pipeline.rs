//! Interception pipeline.
//!
//! Turns intercepted requests and responses into output records and,
//! when body capture is on, swaps their bodies for [`TeeStream`]s bound to
//! the exchange's session. Nothing the endpoints receive is changed: the
//! method, URI, status, headers and body bytes are forwarded as they came.

use std::fmt::{self, Display};
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::BodyExt;
use hudsucker::Body;
use hyper::header::LOCATION;
use hyper::{Request, Response};

use wiretap_core::{
    HostFilter, LineFormat, OutputSink, Session, SessionId, SessionRegistry, StreamKind, TeeClose,
    TeeEvent, TeeObserver, TeeStream,
};

/// What the pipeline records. Fixed for the lifetime of the process.
#[derive(Debug, Clone, Default)]
pub struct InspectorConfig {
    /// Which CONNECT targets are decrypted.
    pub host_filter: HostFilter,
    /// Attach tees to request and response bodies.
    pub show_body: bool,
    /// Emit a header dump for every request and response.
    pub show_headers: bool,
    /// Record formatting.
    pub format: LineFormat,
}

impl InspectorConfig {
    /// Traces every host, logs request and response lines only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the host filter.
    pub fn with_host_filter(mut self, host_filter: HostFilter) -> Self {
        self.host_filter = host_filter;
        self
    }

    /// Enables or disables body capture.
    pub fn with_show_body(mut self, show_body: bool) -> Self {
        self.show_body = show_body;
        self
    }

    /// Enables or disables header dumps.
    pub fn with_show_headers(mut self, show_headers: bool) -> Self {
        self.show_headers = show_headers;
        self
    }

    /// Sets the record format.
    pub fn with_format(mut self, format: LineFormat) -> Self {
        self.format = format;
        self
    }
}

/// Forwards tee observations to the sink as formatted records.
struct BodyPrinter {
    format: LineFormat,
    sink: Arc<dyn OutputSink>,
}

impl TeeObserver for BodyPrinter {
    fn on_read(&self, event: &TeeEvent<'_>) {
        self.sink.emit(&self.format.body_chunk(event));
    }

    fn on_close(&self, close: &TeeClose) {
        self.sink.emit(&self.format.body_close(close));
    }
}

/// Request and response hooks shared by every connection.
pub struct InterceptionPipeline {
    config: InspectorConfig,
    sessions: SessionRegistry,
    sink: Arc<dyn OutputSink>,
    printer: Arc<dyn TeeObserver>,
}

impl fmt::Debug for InterceptionPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptionPipeline")
            .field("config", &self.config)
            .field("sessions", &self.sessions)
            .finish()
    }
}

impl InterceptionPipeline {
    /// Creates a pipeline writing to `sink`.
    pub fn new(config: InspectorConfig, sink: Arc<dyn OutputSink>) -> Self {
        let printer = Arc::new(BodyPrinter {
            format: config.format,
            sink: sink.clone(),
        });

        Self {
            config,
            sessions: SessionRegistry::new(),
            sink,
            printer,
        }
    }

    /// Pipeline configuration.
    pub fn config(&self) -> &InspectorConfig {
        &self.config
    }

    /// Session registry, for in-flight statistics.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Whether a CONNECT target should be decrypted.
    pub fn should_intercept(&self, target: &str) -> bool {
        self.config.host_filter.should_intercept(target)
    }

    /// Request hook: starts a session and records the request.
    ///
    /// The request is always forwarded; with body capture on, its body is
    /// replaced by a tee of kind [`StreamKind::Request`].
    pub fn on_request(&self, req: Request<Body>, client_addr: SocketAddr) -> (Session, Request<Body>) {
        let session = self
            .sessions
            .begin(req.method().clone(), req.uri().to_string(), client_addr);
        let format = &self.config.format;

        self.sink.emit(&format.request_line(&session));
        if self.config.show_headers {
            self.sink
                .emit(&format.header_dump(session.id(), StreamKind::Request, req.headers()));
        }

        let req = if self.config.show_body {
            let id = session.id();
            req.map(|body| self.tap(body, id, StreamKind::Request))
        } else {
            req
        };

        (session, req)
    }

    /// Response hook: records the response under the request's session and
    /// finishes the session.
    pub fn on_response(&self, session: &Session, res: Response<Body>) -> Response<Body> {
        let elapsed = self.sessions.finish(session);
        let format = &self.config.format;

        self.sink
            .emit(&format.response_line(session, res.status(), elapsed));
        if res.status().is_redirection() {
            self.sink
                .emit(&format.redirect_line(session, res.headers().get(LOCATION)));
        }
        if self.config.show_headers {
            self.sink
                .emit(&format.header_dump(session.id(), StreamKind::Response, res.headers()));
        }

        if self.config.show_body {
            let id = session.id();
            res.map(|body| self.tap(body, id, StreamKind::Response))
        } else {
            res
        }
    }

    /// Error hook: the upstream could not be reached or failed mid-request.
    pub fn on_error(&self, session: &Session, error: &dyn Display) {
        self.sessions.finish(session);
        self.sink
            .emit(&self.config.format.upstream_error(session, error));
    }

    /// The exchange ended without a response or an error reaching the
    /// handler.
    pub fn on_unanswered(&self, session: &Session) {
        let elapsed = self.sessions.finish(session);
        self.sink
            .emit(&self.config.format.unanswered_line(session, elapsed));
    }

    fn tap(&self, body: Body, session: SessionId, kind: StreamKind) -> Body {
        Body::from(TeeStream::new(body, session, kind, self.printer.clone()).boxed())
    }
}
