use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use fast_socks5::client::{self, Socks5Stream};
use fast_socks5::server::states::CommandRead;
use fast_socks5::server::Socks5ServerProtocol;
use fast_socks5::util::target_addr::TargetAddr;
use fast_socks5::{ReplyError, Socks5Command, SocksError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::addr::TargetAddress;
use crate::error::{ProxyError, ProxyErrorKind};
use crate::proxy::{ProxyClient, ProxyRequest, ProxyServer, UpstreamConn};
use crate::transport::{IoStream, Transport, TransportListener};

/// SOCKS5 downstream server. Accepts connections over its transport, runs
/// the no-auth handshake and emits one request per TCP CONNECT command.
pub struct Socks5Server {
    name: String,
    listen: String,
    transport: Arc<dyn Transport>,
    shutdown: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
    bound_addr: Option<SocketAddr>,
}

impl Socks5Server {
    pub fn new(name: &str, listen: &str, transport: Arc<dyn Transport>) -> Self {
        Self {
            name: name.to_owned(),
            listen: listen.to_owned(),
            transport,
            shutdown: CancellationToken::new(),
            accept_task: None,
            bound_addr: None,
        }
    }

    /// The address the listener actually bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound_addr
    }
}

#[async_trait]
impl ProxyServer for Socks5Server {
    async fn start(&mut self) -> anyhow::Result<mpsc::Receiver<Box<dyn ProxyRequest>>> {
        let listener = self.transport.listen(&self.listen).await?;
        self.bound_addr = listener.local_addr().ok();
        let (tx, rx) = mpsc::channel(16);
        let token = self.shutdown.clone();
        let name = self.name.clone();
        self.accept_task = Some(tokio::spawn(accept_loop(listener, tx, token, name)));
        Ok(rx)
    }

    async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
    }
}

async fn accept_loop(
    mut listener: Box<dyn TransportListener>,
    tx: mpsc::Sender<Box<dyn ProxyRequest>>,
    token: CancellationToken,
    name: String,
) {
    loop {
        let (conn, peer) = tokio::select! {
            r = listener.accept() => match r {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(server = %name, error = %e, "accept error");
                    continue;
                }
            },
            _ = token.cancelled() => return,
        };
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Err(e) = handshake(conn.stream, peer, tx).await {
                debug!(client = %peer, error = %e, "SOCKS5 handshake failed");
            }
        });
    }
}

async fn handshake(
    stream: IoStream,
    peer: SocketAddr,
    tx: mpsc::Sender<Box<dyn ProxyRequest>>,
) -> Result<(), SocksError> {
    let (proto, cmd, target) = Socks5ServerProtocol::accept_no_auth(stream)
        .await?
        .read_command()
        .await?;
    if cmd != Socks5Command::TCPConnect {
        proto.reply_error(&ReplyError::CommandNotSupported).await?;
        return Ok(());
    }
    let request = Socks5Request {
        proto,
        target: from_socks_target(target),
        peer,
    };
    // A send failure means the dispatcher is gone; the client sees a drop.
    let _ = tx.send(Box::new(request)).await;
    Ok(())
}

struct Socks5Request {
    proto: Socks5ServerProtocol<IoStream, CommandRead>,
    target: TargetAddress,
    peer: SocketAddr,
}

#[async_trait]
impl ProxyRequest for Socks5Request {
    fn target(&self) -> &TargetAddress {
        &self.target
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    async fn success(self: Box<Self>, bound: &TargetAddress) -> io::Result<IoStream> {
        // The reply frame wants a socket address; domain-bound upstreams get
        // the unspecified placeholder.
        let bound = bound
            .socket_addr()
            .unwrap_or_else(|| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)));
        self.proto
            .reply_success(bound)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    async fn fail(self: Box<Self>, err: ProxyError) {
        if let Err(e) = self.proto.reply_error(&to_socks_reply(err.kind())).await {
            debug!(error = %e, "failed to send SOCKS5 error reply");
        }
    }
}

/// SOCKS5 upstream client: relays requests through another SOCKS5 server
/// reached over this client's transport.
pub struct Socks5Client {
    server_addr: String,
    transport: Arc<dyn Transport>,
}

impl Socks5Client {
    pub fn new(server_addr: &str, transport: Arc<dyn Transport>) -> Self {
        Self {
            server_addr: server_addr.to_owned(),
            transport,
        }
    }
}

#[async_trait]
impl ProxyClient for Socks5Client {
    async fn request(
        &self,
        ctx: &CancellationToken,
        target: &TargetAddress,
    ) -> Result<UpstreamConn, ProxyError> {
        let conn = self
            .transport
            .dial(ctx, &self.server_addr)
            .await
            .map_err(ProxyError::from)?;
        let mut stream = Socks5Stream::use_stream(conn.stream, None, client::Config::default())
            .await
            .map_err(socks_to_proxy_error)?;
        let bound = stream
            .request(Socks5Command::TCPConnect, to_socks_target(target))
            .await
            .map_err(socks_to_proxy_error)?;
        Ok(UpstreamConn {
            stream: Box::new(stream),
            bound: from_socks_target(bound),
            peer_identifiers: Vec::new(),
        })
    }
}

fn to_socks_target(addr: &TargetAddress) -> TargetAddr {
    match addr {
        TargetAddress::Ip4(sa) => TargetAddr::Ip(SocketAddr::V4(*sa)),
        TargetAddress::Ip6(sa) => TargetAddr::Ip(SocketAddr::V6(*sa)),
        TargetAddress::Domain(domain, port) => TargetAddr::Domain(domain.clone(), *port),
    }
}

fn from_socks_target(addr: TargetAddr) -> TargetAddress {
    match addr {
        TargetAddr::Ip(sa) => sa.into(),
        TargetAddr::Domain(domain, port) => TargetAddress::Domain(domain, port),
    }
}

fn to_socks_reply(kind: ProxyErrorKind) -> ReplyError {
    match kind {
        ProxyErrorKind::GeneralFailure => ReplyError::GeneralFailure,
        ProxyErrorKind::NotAllowed => ReplyError::ConnectionNotAllowed,
        ProxyErrorKind::NetworkUnreachable => ReplyError::NetworkUnreachable,
        ProxyErrorKind::HostUnreachable => ReplyError::HostUnreachable,
        ProxyErrorKind::ConnectionRefused => ReplyError::ConnectionRefused,
        ProxyErrorKind::TtlExpired | ProxyErrorKind::Timeout => ReplyError::TtlExpired,
        ProxyErrorKind::CommandUnsupported => ReplyError::CommandNotSupported,
        ProxyErrorKind::AddressUnsupported => ReplyError::AddressTypeNotSupported,
        ProxyErrorKind::AuthRequired => ReplyError::ConnectionNotAllowed,
    }
}

fn from_socks_reply(reply: &ReplyError) -> ProxyErrorKind {
    match reply {
        ReplyError::GeneralFailure => ProxyErrorKind::GeneralFailure,
        ReplyError::ConnectionNotAllowed => ProxyErrorKind::NotAllowed,
        ReplyError::NetworkUnreachable => ProxyErrorKind::NetworkUnreachable,
        ReplyError::HostUnreachable => ProxyErrorKind::HostUnreachable,
        ReplyError::ConnectionRefused => ProxyErrorKind::ConnectionRefused,
        ReplyError::TtlExpired => ProxyErrorKind::TtlExpired,
        ReplyError::CommandNotSupported => ProxyErrorKind::CommandUnsupported,
        ReplyError::AddressTypeNotSupported => ProxyErrorKind::AddressUnsupported,
        _ => ProxyErrorKind::GeneralFailure,
    }
}

fn socks_to_proxy_error(err: SocksError) -> ProxyError {
    match err {
        SocksError::Io(e) => ProxyError::from(e),
        SocksError::ReplyError(reply) => ProxyError::new(from_socks_reply(&reply), reply),
        other => ProxyError::general(other),
    }
}
