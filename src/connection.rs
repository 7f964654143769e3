//! The per-accepted-socket connection: a buffered reader over a replaceable
//! byte stream, plus the bookkeeping every protocol processor needs
//! (spec.md §3 "Connection", §4.4.2 "TLS forging").

use std::io::Cursor;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::error::ProxyError;

/// Blanket marker for anything usable as a connection's transport: reads,
/// writes, and can be boxed for dynamic dispatch once its concrete type
/// changes mid-connection (plain TCP -> forged TLS).
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

pin_project! {
    /// Feeds already-buffered bytes to the reader before falling through to
    /// `inner`. Used exactly once per connection, at the moment a forged TLS
    /// handshake takes over a socket that already had bytes sitting in its
    /// buffered reader (the CONNECT request's trailing bytes, or the first
    /// peeked byte of a ClientHello) — without this, those bytes would be
    /// lost, since `rustls`'s handshake reads from whatever stream it is
    /// handed and has no way to be told "some input already arrived".
    struct Prefixed<IO> {
        prefix: Cursor<Vec<u8>>,
        #[pin]
        inner: IO,
    }
}

impl<IO: AsyncRead + Unpin> AsyncRead for Prefixed<IO> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.project();
        if (this.prefix.position() as usize) < this.prefix.get_ref().len() {
            let remaining = &this.prefix.get_ref()[this.prefix.position() as usize..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.prefix.set_position(this.prefix.position() + n as u64);
            return Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<IO: AsyncWrite + Unpin> AsyncWrite for Prefixed<IO> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// A placeholder transport swapped in for the instant between taking the old
/// transport out of `Connection::reader` and moving it into the TLS
/// acceptor — never actually read from or written to.
struct Closed;

impl AsyncRead for Closed {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for Closed {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }
    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// What the last byte sniff found sitting at the front of the stream
/// (spec.md §4.3 and §4.4.2 step 2's "peek one byte").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeekedKind {
    TlsHandshake,
    PlainHttp,
    Unknown,
}

/// A live, accepted connection: peer/local addresses, a start timestamp, I/O
/// deadlines, and a buffered reader over a transport that can be swapped out
/// mid-flight when a CONNECT tunnel is forged into TLS (spec.md §3).
pub struct Connection {
    reader: BufReader<Box<dyn Io>>,
    /// Bytes read out of `reader` by a caller (typically the HTTP request
    /// parser skimming past a header block in one syscall-sized chunk) that
    /// turned out to belong to whatever comes next rather than the thing
    /// being parsed, and so were handed back via `unread`. Checked ahead of
    /// `reader` by every read operation.
    pending: Vec<u8>,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub started_at: Instant,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub is_tls: bool,
    pub connection_id: String,
    /// Overall deadline applied on top of the per-op read/write timeouts,
    /// set once a forged TLS handshake completes (spec.md §4.4.2 step 6
    /// "set a 5-minute overall deadline on the TLS stream"). `None` before
    /// that point, so plain HTTP connections are governed by the per-op
    /// timeouts alone.
    deadline: Option<Instant>,
}

impl Connection {
    pub fn from_tcp_stream(stream: TcpStream, read_timeout: Duration, write_timeout: Duration) -> std::io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        stream.set_nodelay(true).ok();
        Ok(Self {
            reader: BufReader::new(Box::new(stream)),
            pending: Vec::new(),
            connection_id: uuid::Uuid::new_v4().to_string(),
            deadline: None,
            peer_addr,
            local_addr,
            started_at: Instant::now(),
            read_timeout,
            write_timeout,
            is_tls: false,
        })
    }

    /// Reads (without consuming) enough bytes to classify the stream's first
    /// byte. Returns `Unknown` if the peer closed before sending anything.
    pub async fn peek_kind(&mut self) -> Result<PeekedKind, ProxyError> {
        let buf = self.fill_buf().await?;
        Ok(match buf.first() {
            Some(0x16) => PeekedKind::TlsHandshake,
            Some(b) if b.is_ascii_uppercase() => PeekedKind::PlainHttp,
            _ => PeekedKind::Unknown,
        })
    }

    /// Sets the overall deadline applied on top of the per-op read/write
    /// timeouts (spec.md §4.4.2 step 6). Every `fill_buf`/`write_all`/`flush`
    /// call after this races its own per-op timeout against whichever comes
    /// first.
    pub fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    /// The earlier of "now + `per_op`" and the overall deadline, if one is
    /// set.
    fn op_deadline(&self, per_op: Duration) -> Instant {
        let per_op_deadline = Instant::now() + per_op;
        match self.deadline {
            Some(overall) => per_op_deadline.min(overall),
            None => per_op_deadline,
        }
    }

    /// Fills (and returns) the buffered reader's internal buffer without
    /// consuming it, applying the connection's read deadline. Bytes pushed
    /// back via `unread` are served first.
    pub async fn fill_buf(&mut self) -> Result<&[u8], ProxyError> {
        use tokio::io::AsyncBufReadExt;
        if !self.pending.is_empty() {
            return Ok(&self.pending);
        }
        let deadline = self.op_deadline(self.read_timeout);
        tokio::time::timeout_at(deadline, self.reader.fill_buf())
            .await
            .map_err(|_| ProxyError::Timeout("reading from peer".to_string()))?
            .map_err(ProxyError::IoFault)
    }

    pub fn consume(&mut self, amount: usize) {
        use tokio::io::AsyncBufReadExt;
        if !self.pending.is_empty() {
            self.pending.drain(..amount.min(self.pending.len()));
            return;
        }
        self.reader.consume(amount);
    }

    /// Hands bytes back to the connection so a later read sees them again
    /// — used when a parser reads past the boundary of the message it was
    /// parsing and the extra bytes belong to whatever follows (spec.md
    /// §4.4.4 "the handler must not leak ... state" applies equally to
    /// leftover bytes from a pipelined next request).
    pub fn unread(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut combined = bytes.to_vec();
        combined.append(&mut self.pending);
        self.pending = combined;
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ProxyError> {
        let mut filled = 0;
        while filled < buf.len() {
            let chunk = self.fill_buf().await?;
            if chunk.is_empty() {
                return Err(ProxyError::IoFault(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed before expected bytes arrived",
                )));
            }
            let n = chunk.len().min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&chunk[..n]);
            self.consume(n);
            filled += n;
        }
        Ok(())
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), ProxyError> {
        use tokio::io::AsyncWriteExt;
        let deadline = self.op_deadline(self.write_timeout);
        tokio::time::timeout_at(deadline, self.reader.get_mut().write_all(buf))
            .await
            .map_err(|_| ProxyError::Timeout("writing to peer".to_string()))?
            .map_err(ProxyError::IoFault)?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), ProxyError> {
        use tokio::io::AsyncWriteExt;
        let deadline = self.op_deadline(self.write_timeout);
        tokio::time::timeout_at(deadline, self.reader.get_mut().flush())
            .await
            .map_err(|_| ProxyError::Timeout("flushing to peer".to_string()))?
            .map_err(ProxyError::IoFault)?;
        Ok(())
    }

    /// Replaces the connection's transport with `acceptor`'s TLS handshake
    /// result, carrying over whatever bytes were still sitting unconsumed in
    /// the buffered reader (spec.md §4.4.2 step 4 "recursively re-enters the
    /// request loop" — the new reader is freshly buffered over the new
    /// transport). `acceptor` is generic so callers don't have to know
    /// tokio-rustls's concrete acceptor type.
    pub async fn upgrade_server_tls(&mut self, acceptor: &tokio_rustls::TlsAcceptor) -> Result<(), ProxyError> {
        let mut buffered: Vec<u8> = self.pending.drain(..).collect();
        buffered.extend_from_slice(self.reader.buffer());
        let reader_buffered_len = self.reader.buffer().len();
        self.reader.consume(reader_buffered_len);

        let placeholder: Box<dyn Io> = Box::new(Closed);
        let inner = std::mem::replace(self.reader.get_mut(), placeholder);

        let prefixed = Prefixed {
            prefix: Cursor::new(buffered),
            inner,
        };

        let tls_stream = acceptor
            .accept(prefixed)
            .await
            .map_err(|e| ProxyError::TlsHandshakeFailed(e.to_string()))?;

        self.reader = BufReader::new(Box::new(tls_stream));
        self.is_tls = true;
        Ok(())
    }

    /// Splits the connection into raw halves for bidirectional relaying
    /// (plain TCP passthrough, WebSocket framing) where no further buffered
    /// parsing is needed on this side. Any bytes still buffered are drained
    /// into the returned reader first.
    pub fn into_io(mut self) -> (Vec<u8>, Box<dyn Io>) {
        let mut buffered: Vec<u8> = self.pending.drain(..).collect();
        buffered.extend_from_slice(self.reader.buffer());
        (buffered, self.reader.into_inner())
    }

    /// Like `into_io`, but folds the leftover buffered bytes back onto the
    /// transport itself, for callers (the websocket relay) that want one
    /// `AsyncRead + AsyncWrite` rather than a separate leftover buffer.
    pub fn into_prefixed_io(self) -> Box<dyn Io> {
        let (buffered, inner) = self.into_io();
        Box::new(Prefixed {
            prefix: Cursor::new(buffered),
            inner,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let accept = listener.accept();
        let (client, (server, _)) = tokio::join!(connect, accept);
        (client.unwrap(), server)
    }

    #[tokio::test]
    async fn peek_does_not_consume() {
        let (mut client, server) = loopback_pair().await;
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let mut conn = Connection::from_tcp_stream(server, Duration::from_secs(5), Duration::from_secs(5)).unwrap();
        let kind = conn.peek_kind().await.unwrap();
        assert_eq!(kind, PeekedKind::PlainHttp);

        let mut buf = [0u8; 3];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET");
    }

    #[tokio::test]
    async fn prefixed_reader_serves_buffer_before_inner() {
        let (mut client, server) = loopback_pair().await;
        client.write_all(b"hello-world").await.unwrap();
        drop(client);

        let prefixed = Prefixed {
            prefix: Cursor::new(b"prefix-".to_vec()),
            inner: server,
        };
        tokio::pin!(prefixed);
        let mut out = Vec::new();
        prefixed.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"prefix-hello-world");
    }

    #[tokio::test]
    async fn unread_bytes_are_replayed_before_the_socket() {
        let (mut client, server) = loopback_pair().await;
        client.write_all(b"world").await.unwrap();

        let mut conn = Connection::from_tcp_stream(server, Duration::from_secs(5), Duration::from_secs(5)).unwrap();
        conn.unread(b"hello-");

        let mut buf = [0u8; 11];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello-world");
    }

    #[tokio::test]
    async fn tls_detection_from_handshake_byte() {
        let (mut client, server) = loopback_pair().await;
        client.write_all(&[0x16, 0x03, 0x01]).await.unwrap();

        let mut conn = Connection::from_tcp_stream(server, Duration::from_secs(5), Duration::from_secs(5)).unwrap();
        assert_eq!(conn.peek_kind().await.unwrap(), PeekedKind::TlsHandshake);
    }
}
