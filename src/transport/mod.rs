use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::config::TransportSettings;

pub mod kcp;

/// A duplex byte stream usable by the relay engine.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type IoStream = Box<dyn AsyncStream>;

/// A dialed connection plus whatever endpoint metadata the transport knows.
pub struct TransportConn {
    pub stream: IoStream,
    pub local_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for TransportConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConn")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

/// Stream transport under a proxy protocol: plain TCP by default, or KCP
/// over UDP.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connects to `addr`, racing against `ctx`. Cancellation before the
    /// connect completes yields an `Interrupted` error.
    async fn dial(&self, ctx: &CancellationToken, addr: &str) -> io::Result<TransportConn>;

    async fn listen(&self, addr: &str) -> io::Result<Box<dyn TransportListener>>;
}

#[async_trait]
pub trait TransportListener: Send {
    async fn accept(&mut self) -> io::Result<(TransportConn, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Builds the transport configured for one downstream or upstream.
pub fn from_settings(settings: Option<&TransportSettings>) -> anyhow::Result<Arc<dyn Transport>> {
    match settings.and_then(|t| t.kcp.as_ref()) {
        Some(kcp_settings) => Ok(Arc::new(
            kcp::KcpTransport::new(kcp_settings).context("failed to create KCP transport")?,
        )),
        None => Ok(Arc::new(TcpTransport)),
    }
}

pub(crate) fn dial_cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "dial cancelled")
}

pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(&self, ctx: &CancellationToken, addr: &str) -> io::Result<TransportConn> {
        if ctx.is_cancelled() {
            return Err(dial_cancelled());
        }
        let stream = tokio::select! {
            r = TcpStream::connect(addr) => r?,
            _ = ctx.cancelled() => return Err(dial_cancelled()),
        };
        let local_addr = stream.local_addr().ok();
        Ok(TransportConn {
            stream: Box::new(stream),
            local_addr,
        })
    }

    async fn listen(&self, addr: &str) -> io::Result<Box<dyn TransportListener>> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Box::new(TcpListenerWrapper(listener)))
    }
}

struct TcpListenerWrapper(TcpListener);

#[async_trait]
impl TransportListener for TcpListenerWrapper {
    async fn accept(&mut self) -> io::Result<(TransportConn, SocketAddr)> {
        let (stream, peer) = self.0.accept().await?;
        let local_addr = stream.local_addr().ok();
        Ok((
            TransportConn {
                stream: Box::new(stream),
                local_addr,
            },
            peer,
        ))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.0.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn listener_or_skip() -> Option<Box<dyn TransportListener>> {
        match TcpTransport.listen("127.0.0.1:0").await {
            Ok(l) => Some(l),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => None,
            Err(e) => panic!("failed to bind test listener: {e}"),
        }
    }

    #[tokio::test]
    async fn tcp_dial_and_accept_round_trip() {
        let Some(mut listener) = listener_or_skip().await else {
            return;
        };
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            conn.stream.read_exact(&mut buf).await.unwrap();
            conn.stream.write_all(&buf).await.unwrap();
        });

        let ctx = CancellationToken::new();
        let mut conn = TcpTransport.dial(&ctx, &addr.to_string()).await.unwrap();
        assert!(conn.local_addr.is_some());
        conn.stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_dial_honours_cancellation() {
        let ctx = CancellationToken::new();
        ctx.cancel();
        let err = TcpTransport
            .dial(&ctx, "127.0.0.1:1")
            .await
            .expect_err("cancelled dial must fail");
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }
}
