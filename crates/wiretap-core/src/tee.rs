//! Transparent body tee.
//!
//! [`TeeStream`] wraps a request or response body and reports every chunk
//! that passes through it to a [`TeeObserver`], without buffering,
//! reframing or altering anything the consumer sees:
//!
//! - one non-empty read in, one [`TeeEvent`] out, emitted inside the same
//!   poll call that produced the bytes;
//! - results (data, errors, `Pending`, end of stream) are returned exactly
//!   as the wrapped stream produced them;
//! - `size_hint` and `is_end_stream` are forwarded so the engine frames the
//!   message the same way it would without the tee.
//!
//! It works both as an HTTP body ([`hyper::body::Body`]) and as a raw byte
//! stream ([`AsyncRead`] / [`AsyncWrite`]).

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use hyper::body::{Body, Bytes, Frame, SizeHint};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::session::SessionId;

/// Which side of the exchange a stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Body sent by the client.
    Request,
    /// Body sent back by the upstream.
    Response,
}

impl StreamKind {
    /// Lowercase name used in output lines.
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Request => "request",
            StreamKind::Response => "response",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed read.
#[derive(Debug, Clone, Copy)]
pub struct TeeEvent<'a> {
    /// Exchange the stream belongs to.
    pub session: SessionId,
    /// Request or response body.
    pub kind: StreamKind,
    /// Exactly the bytes returned by this read.
    pub payload: &'a [u8],
}

impl TeeEvent<'_> {
    /// Number of bytes in this read.
    pub fn byte_count(&self) -> usize {
        self.payload.len()
    }
}

/// How a tee came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The stream reported its end.
    EndOfStream,
    /// The wrapped body yielded an error.
    Error,
    /// `shutdown` was called on the stream.
    Shutdown,
    /// The tee was dropped before the stream ended.
    Dropped,
}

impl CloseReason {
    /// Short description used in output lines.
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::EndOfStream => "complete",
            CloseReason::Error => "failed",
            CloseReason::Shutdown => "shut down",
            CloseReason::Dropped => "closed early",
        }
    }
}

/// Finalization record, emitted at most once per tee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeeClose {
    /// Exchange the stream belonged to.
    pub session: SessionId,
    /// Request or response body.
    pub kind: StreamKind,
    /// Bytes observed over the lifetime of the tee.
    pub total_bytes: u64,
    /// Why the tee finished.
    pub reason: CloseReason,
}

/// Receives what a [`TeeStream`] sees.
///
/// Called synchronously from the poll that produced the data, so
/// implementations must not block beyond a short lock.
pub trait TeeObserver: Send + Sync {
    /// Called once per non-empty read.
    fn on_read(&self, event: &TeeEvent<'_>);

    /// Called once when the tee finishes.
    fn on_close(&self, _close: &TeeClose) {}
}

/// Pass-through stream wrapper that reports every read.
pub struct TeeStream<R> {
    inner: R,
    session: SessionId,
    kind: StreamKind,
    observer: Arc<dyn TeeObserver>,
    total_bytes: u64,
    closed: bool,
}

impl<R> TeeStream<R> {
    /// Wraps `inner`, reporting reads to `observer` under `session`.
    pub fn new(
        inner: R,
        session: SessionId,
        kind: StreamKind,
        observer: Arc<dyn TeeObserver>,
    ) -> Self {
        Self {
            inner,
            session,
            kind,
            observer,
            total_bytes: 0,
            closed: false,
        }
    }

    /// The wrapped stream.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Session the reads are reported under.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Request or response side.
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Bytes observed so far.
    pub fn bytes_observed(&self) -> u64 {
        self.total_bytes
    }

    fn observe(&mut self, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        self.total_bytes += payload.len() as u64;
        self.observer.on_read(&TeeEvent {
            session: self.session,
            kind: self.kind,
            payload,
        });
    }

    fn finish(&mut self, reason: CloseReason) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.observer.on_close(&TeeClose {
            session: self.session,
            kind: self.kind,
            total_bytes: self.total_bytes,
            reason,
        });
    }
}

impl<R> fmt::Debug for TeeStream<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeeStream")
            .field("session", &self.session)
            .field("kind", &self.kind)
            .field("total_bytes", &self.total_bytes)
            .field("closed", &self.closed)
            .finish()
    }
}

impl<R> Drop for TeeStream<R> {
    fn drop(&mut self) {
        self.finish(CloseReason::Dropped);
    }
}

impl<B> Body for TeeStream<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        let polled = Pin::new(&mut this.inner).poll_frame(cx);

        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.observe(data);
                }
                // Engines stop polling once the body says it is done.
                if this.inner.is_end_stream() {
                    this.finish(CloseReason::EndOfStream);
                }
            }
            Poll::Ready(Some(Err(_))) => this.finish(CloseReason::Error),
            Poll::Ready(None) => this.finish(CloseReason::EndOfStream),
            Poll::Pending => {}
        }

        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<R> AsyncRead for TeeStream<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        let had_room = buf.remaining() > 0;

        let polled = Pin::new(&mut this.inner).poll_read(cx, buf);

        if let Poll::Ready(Ok(())) = polled {
            let read = &buf.filled()[before..];
            if read.is_empty() {
                if had_room {
                    this.finish(CloseReason::EndOfStream);
                }
            } else {
                this.observe(read);
            }
        }

        polled
    }
}

impl<R> AsyncWrite for TeeStream<R>
where
    R: AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let polled = Pin::new(&mut this.inner).poll_shutdown(cx);
        if polled.is_ready() {
            this.finish(CloseReason::Shutdown);
        }
        polled
    }
}
