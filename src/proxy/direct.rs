use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::addr::TargetAddress;
use crate::error::ProxyError;
use crate::proxy::{ProxyClient, UpstreamConn};
use crate::transport::Transport;

/// Upstream that connects straight to the target over its transport.
pub struct DirectClient {
    transport: Arc<dyn Transport>,
}

impl DirectClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl ProxyClient for DirectClient {
    async fn request(
        &self,
        ctx: &CancellationToken,
        target: &TargetAddress,
    ) -> Result<UpstreamConn, ProxyError> {
        debug!(target = %target, "connecting directly");
        let conn = self
            .transport
            .dial(ctx, &target.to_string())
            .await
            .map_err(ProxyError::from)?;
        let bound: TargetAddress = conn
            .local_addr
            .unwrap_or_else(|| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))
            .into();
        Ok(UpstreamConn {
            stream: conn.stream,
            bound,
            peer_identifiers: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProxyErrorKind;
    use crate::transport::TcpTransport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn connects_to_ip_targets() {
        let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
            Ok(l) => l,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => return,
            Err(e) => panic!("failed to bind test listener: {e}"),
        };
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(b"ok").await.unwrap();
        });

        let client = DirectClient::new(Arc::new(TcpTransport));
        let ctx = CancellationToken::new();
        let mut conn = client.request(&ctx, &addr.into()).await.unwrap();
        assert!(conn.bound.socket_addr().is_some());
        conn.stream.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        conn.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connections_are_categorised() {
        // Bind a port and drop it so nothing is listening there.
        let addr = {
            let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
                Ok(l) => l,
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => return,
                Err(e) => panic!("failed to bind test listener: {e}"),
            };
            listener.local_addr().unwrap()
        };

        let client = DirectClient::new(Arc::new(TcpTransport));
        let ctx = CancellationToken::new();
        let err = client
            .request(&ctx, &addr.into())
            .await
            .expect_err("connect must fail");
        assert_eq!(err.kind(), ProxyErrorKind::ConnectionRefused);
    }
}
