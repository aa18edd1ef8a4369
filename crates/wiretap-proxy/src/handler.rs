//! Engine hooks.
//!
//! The engine clones the handler for every request and calls
//! `handle_request` and then `handle_response` (or `handle_error`) on the
//! same clone, so the session started for a request is simply kept in the
//! clone until its response arrives. A clone dropped while still holding
//! its session (websocket upgrades, cancelled requests) closes it.

use std::future::Future;
use std::sync::Arc;

use hudsucker::{
    hyper::{Method, Request, Response, StatusCode},
    Body, HttpContext, HttpHandler, RequestOrResponse,
};
use hyper_util::client::legacy::Error as ClientError;

use wiretap_core::Session;

use crate::pipeline::InterceptionPipeline;

/// Per-exchange HTTP handler for the MITM engine.
#[derive(Debug)]
pub struct ExchangeHandler {
    pipeline: Arc<InterceptionPipeline>,
    session: Option<Session>,
}

impl ExchangeHandler {
    /// Creates a handler template; the engine clones it per request.
    pub fn new(pipeline: Arc<InterceptionPipeline>) -> Self {
        Self {
            pipeline,
            session: None,
        }
    }

    /// Session of the exchange this clone is handling, if traced.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    fn bad_gateway() -> Response<Body> {
        Response::builder()
            .status(StatusCode::BAD_GATEWAY)
            .body(Body::empty())
            .expect("static response is valid")
    }
}

// A clone starts a new exchange, it never shares the session.
impl Clone for ExchangeHandler {
    fn clone(&self) -> Self {
        Self::new(self.pipeline.clone())
    }
}

impl Drop for ExchangeHandler {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pipeline.on_unanswered(&session);
        }
    }
}

impl HttpHandler for ExchangeHandler {
    async fn handle_request(&mut self, ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        // Tunnel setup; the engine asks `should_intercept` next.
        if req.method() == Method::CONNECT {
            return RequestOrResponse::Request(req);
        }

        let (session, req) = self.pipeline.on_request(req, ctx.client_addr);
        self.session = Some(session);
        RequestOrResponse::Request(req)
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        match self.session.take() {
            Some(session) => self.pipeline.on_response(&session, res),
            None => res,
        }
    }

    async fn handle_error(&mut self, _ctx: &HttpContext, err: ClientError) -> Response<Body> {
        match self.session.take() {
            Some(session) => self.pipeline.on_error(&session, &err),
            None => tracing::warn!("Failed to forward request: {}", err),
        }
        Self::bad_gateway()
    }

    fn should_intercept(
        &mut self,
        _ctx: &HttpContext,
        req: &Request<Body>,
    ) -> impl Future<Output = bool> + Send {
        let target = req
            .uri()
            .authority()
            .map(|authority| authority.as_str())
            .unwrap_or_default();
        let intercept = self.pipeline.should_intercept(target);
        if intercept {
            tracing::debug!("Intercepting CONNECT {}", target);
        } else {
            tracing::debug!("Tunneling CONNECT {} without interception", target);
        }
        async move { intercept }
    }
}
