//! Session identity for request/response correlation.
//!
//! Every intercepted request gets a [`Session`] from the shared
//! [`SessionRegistry`]. The session travels with the exchange so the
//! response hook (and both body tees) report under the same id.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use hyper::Method;

/// Identifier of one request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Wraps a raw id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

/// Metadata of one in-flight exchange, read-only after creation.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    client_addr: SocketAddr,
    method: Method,
    url: String,
    started: Instant,
}

impl Session {
    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Address of the client that sent the request.
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request URL as seen by the proxy.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Time since the request hook fired.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Issues session ids.
///
/// The counter is the only mutable state and is a single atomic, so
/// unrelated connections never wait on each other.
#[derive(Debug)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    in_flight: AtomicUsize,
}

impl SessionRegistry {
    /// Creates a registry whose first id is 1.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Starts a new exchange.
    pub fn begin(&self, method: Method, url: impl Into<String>, client_addr: SocketAddr) -> Session {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.in_flight.fetch_add(1, Ordering::Relaxed);

        Session {
            id,
            client_addr,
            method,
            url: url.into(),
            started: Instant::now(),
        }
    }

    /// Ends an exchange and returns how long it took.
    pub fn finish(&self, session: &Session) -> Duration {
        // Saturating: a repeated finish leaves the gauge at zero.
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        session.elapsed()
    }

    /// Number of exchanges started but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Number of ids handed out so far.
    pub fn issued(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed) - 1
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
