use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::addr::TargetAddress;
use crate::error::ProxyError;
use crate::transport::IoStream;

pub mod direct;
pub mod socks5;

/// An authenticated identity attached to a connection, e.g. a SOCKS5 user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentifier {
    /// Where the identity comes from ("socks5", "tls", ...).
    pub scope: String,
    pub user_id: String,
}

/// An inbound request accepted by a downstream server, waiting for a
/// verdict. Exactly one of [`ProxyRequest::success`] or
/// [`ProxyRequest::fail`] must be invoked, which is why both consume the
/// request.
#[async_trait]
pub trait ProxyRequest: Send {
    fn target(&self) -> &TargetAddress;

    /// Address of the originating client.
    fn peer_addr(&self) -> SocketAddr;

    /// Identities the downstream authenticated, if it supports any.
    fn peer_identifiers(&self) -> Option<Vec<PeerIdentifier>> {
        None
    }

    /// Completes the downstream handshake and hands back the duplex stream
    /// the relay will drive.
    async fn success(self: Box<Self>, bound: &TargetAddress) -> io::Result<IoStream>;

    /// Declines the request with a categorised error.
    async fn fail(self: Box<Self>, err: ProxyError);
}

/// A downstream server: accepts client connections and emits one
/// [`ProxyRequest`] per usable handshake.
#[async_trait]
pub trait ProxyServer: Send {
    async fn start(&mut self) -> anyhow::Result<mpsc::Receiver<Box<dyn ProxyRequest>>>;

    async fn stop(&mut self);
}

/// A connection an upstream established on our behalf.
pub struct UpstreamConn {
    pub stream: IoStream,
    /// Address the upstream bound or reached for this request.
    pub bound: TargetAddress,
    /// Identities presented by the upstream server, when its protocol
    /// carries any.
    pub peer_identifiers: Vec<PeerIdentifier>,
}

impl std::fmt::Debug for UpstreamConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConn")
            .field("bound", &self.bound)
            .field("peer_identifiers", &self.peer_identifiers)
            .finish_non_exhaustive()
    }
}

/// An upstream client: opens a connection to the target on behalf of a
/// downstream request.
#[async_trait]
pub trait ProxyClient: Send + Sync {
    async fn request(
        &self,
        ctx: &CancellationToken,
        target: &TargetAddress,
    ) -> Result<UpstreamConn, ProxyError>;
}
