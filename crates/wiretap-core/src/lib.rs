//! Wiretap Core - building blocks of the interception pipeline.
//!
//! Everything here is independent of the proxy engine:
//!
//! - [`HostFilter`] decides which CONNECT targets are decrypted
//! - [`SessionRegistry`] hands out ids that tie a response to its request
//! - [`TeeStream`] observes body reads without changing them
//! - [`OutputSink`] and [`LineFormat`] turn observations into records

mod error;
pub mod filter;
pub mod format;
pub mod session;
pub mod sink;
pub mod tee;

pub use error::{ConfigError, Result};
pub use filter::{HostFilter, MATCH_ALL};
pub use format::LineFormat;
pub use session::{Session, SessionId, SessionRegistry};
pub use sink::{MemorySink, OutputSink, WriterSink};
pub use tee::{CloseReason, StreamKind, TeeClose, TeeEvent, TeeObserver, TeeStream};
