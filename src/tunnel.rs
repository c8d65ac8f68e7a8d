//! Upgrade tunnel.
//!
//! An upgrade request is never answered by the proxy. The handshake is
//! replayed onto a raw socket to the primary backend, and from then on the
//! two sockets are spliced: whatever the backend says (its `101`, its
//! frames, its close) reaches the caller untouched.
//!
//! ```text
//! caller ──► [ METHOD PATH HTTP/1.1 | headers | CRLF | buffered ] ──► backend
//! caller ◄──────────────────── raw bytes, both ways ─────────────────► backend
//! ```
//!
//! Both directions run concurrently. A clean EOF on one side is passed on as
//! a write shutdown to the other, and the opposite direction keeps relaying
//! until it sees its own EOF, so a caller that half-closes after its last
//! frame still gets the backend's reply. An I/O error on either direction
//! cancels the shared [`CancellationToken`] and both sockets are dropped.

use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Error;
use crate::head::RequestHead;

const CRLF: &[u8] = b"\r\n";

// ── Handshake preamble ────────────────────────────────────────────────────────

/// Byte-level builder for the replayed handshake.
///
/// Every line ends in CRLF, the head ends in an empty line, and the
/// pre-buffered payload follows immediately.
pub struct Preamble {
    buf: BytesMut,
}

impl Preamble {
    /// Starts with the request line `METHOD PATH HTTP/1.1`.
    pub fn new(method: &str, path: &str) -> Self {
        let mut buf = BytesMut::with_capacity(512);
        buf.put_slice(method.as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(path.as_bytes());
        buf.put_slice(b" HTTP/1.1");
        buf.put_slice(CRLF);
        Self { buf }
    }

    pub fn header(mut self, name: &str, value: &[u8]) -> Self {
        self.buf.put_slice(name.as_bytes());
        self.buf.put_slice(b": ");
        self.buf.put_slice(value);
        self.buf.put_slice(CRLF);
        self
    }

    /// Closes the head and appends the bytes that arrived with it.
    pub fn finish(mut self, buffered: &[u8]) -> Bytes {
        self.buf.put_slice(CRLF);
        self.buf.put_slice(buffered);
        self.buf.freeze()
    }
}

impl RequestHead {
    /// The exact bytes the backend sees before any live traffic.
    pub fn preamble(&self, buffered: &[u8]) -> Bytes {
        self.headers.iter()
            .fold(Preamble::new(&self.method, &self.path), |p, (name, value)| p.header(name, value))
            .finish(buffered)
    }
}

// ── Tunnel ────────────────────────────────────────────────────────────────────

/// Byte counts of a finished tunnel.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Spliced {
    /// Caller to backend, after the preamble.
    pub upstream: u64,
    /// Backend to caller.
    pub downstream: u64,
}

/// Connects to `backend`, replays the handshake, and splices until either
/// side closes.
///
/// If the backend cannot be reached or the preamble cannot be written,
/// `caller` is dropped (closing it) and the error is returned.
pub async fn open<C>(
    caller: C,
    head: &RequestHead,
    buffered: &[u8],
    backend: SocketAddr,
) -> Result<Spliced, Error>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let mut upstream = TcpStream::connect(backend)
        .await
        .map_err(|source| Error::Connect { addr: backend, source })?;
    if let Err(e) = upstream.set_nodelay(true) {
        debug!(%backend, "set_nodelay failed: {e}");
    }

    upstream.write_all(&head.preamble(buffered)).await?;
    upstream.flush().await?;

    Ok(splice(caller, upstream).await)
}

/// Relays bytes both ways between `caller` and `backend` until both
/// directions reach EOF or either one fails, then drops both.
pub async fn splice<A, B>(caller: A, backend: B) -> Spliced
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut caller_rd, mut caller_wr) = tokio::io::split(caller);
    let (mut backend_rd, mut backend_wr) = tokio::io::split(backend);
    let closed = CancellationToken::new();

    let (upstream, downstream) = tokio::join!(
        relay("upstream", &mut caller_rd, &mut backend_wr, &closed),
        relay("downstream", &mut backend_rd, &mut caller_wr, &closed),
    );

    Spliced { upstream, downstream }
}

/// Copies `from` into `to` until EOF, an error, or cancellation by the
/// other direction. EOF shuts down `to`; an error cancels the other
/// direction.
async fn relay<R, W>(
    direction: &'static str,
    from: &mut R,
    to: &mut W,
    closed: &CancellationToken,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = CountingWriter { inner: to, count: 0 };

    tokio::select! {
        biased;

        () = closed.cancelled() => {}

        res = tokio::io::copy(from, &mut copied) => {
            match res {
                Ok(_) => {
                    debug!(direction, bytes = copied.count, "tunnel leg reached eof");
                    if let Err(e) = copied.inner.shutdown().await {
                        debug!(direction, "shutdown after eof failed: {e}");
                        closed.cancel();
                    }
                }
                Err(e) => {
                    debug!(direction, bytes = copied.count, "tunnel leg failed: {e}");
                    closed.cancel();
                }
            }
        }
    }

    copied.count
}

/// Counts bytes as they are written so a cancelled leg still reports what
/// it relayed.
struct CountingWriter<'a, W> {
    inner: &'a mut W,
    count: u64,
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<'_, W> {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let poll = std::pin::Pin::new(&mut *self.inner).poll_write(cx, buf);
        if let std::task::Poll::Ready(Ok(n)) = poll {
            self.count += n as u64;
        }
        poll
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}
