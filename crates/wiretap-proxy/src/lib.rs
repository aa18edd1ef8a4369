//! Wiretap Proxy - debugging MITM proxy.
//!
//! Plugs the interception pipeline from `wiretap-core` into the `hudsucker`
//! engine. The engine owns sockets, TLS and certificate issuance; this crate
//! decides which CONNECT targets get decrypted and hooks every decrypted
//! request and response.
//!
//! ## Architecture
//!
//! ```text
//! Client CONNECT → Host Filter match?
//!                        │
//!          ┌─────────────┴──────────────┐
//!          │ No                         │ Yes
//!          ▼                            ▼
//!   Opaque tunnel               Decrypt (leaf cert from CA)
//!                                       │
//!                                       ▼
//!                         on_request: session id, request line,
//!                         headers, tee request body
//!                                       │
//!                                       ▼
//!                                   Upstream
//!                                       │
//!                                       ▼
//!                         on_response: status line, redirect,
//!                         headers, tee response body
//! ```

mod ca;
mod error;
mod handler;
mod pipeline;
mod proxy;

pub use ca::{CaManager, CaManagerError};
pub use error::{ProxyError, Result};
pub use handler::ExchangeHandler;
pub use pipeline::{InspectorConfig, InterceptionPipeline};
pub use proxy::{ProxyConfig, ProxyHandle, ProxyServer};

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8080;
