use std::io;

use thiserror::Error;

/// Categories of request failure surfaced to the downstream peer.
///
/// Downstream servers translate these into wire-level reply codes, so the set
/// is closed: adding a variant means teaching every downstream protocol how
/// to encode it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ProxyErrorKind {
    #[error("general failure")]
    GeneralFailure,
    #[error("not allowed")]
    NotAllowed,
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("host unreachable")]
    HostUnreachable,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("TTL expired")]
    TtlExpired,
    #[error("command unsupported")]
    CommandUnsupported,
    #[error("address unsupported")]
    AddressUnsupported,
    #[error("authentication required")]
    AuthRequired,
    #[error("timed out")]
    Timeout,
}

type Cause = Box<dyn std::error::Error + Send + Sync>;

/// A categorised proxy failure: the kind drives the reply code sent to the
/// peer, the optional cause is kept for logging only.
#[derive(Debug, Error)]
#[error("{}", render(.kind, .cause))]
pub struct ProxyError {
    kind: ProxyErrorKind,
    #[source]
    cause: Option<Cause>,
}

fn render(kind: &ProxyErrorKind, cause: &Option<Cause>) -> String {
    match cause {
        Some(cause) => format!("{kind}: {cause}"),
        None => kind.to_string(),
    }
}

impl ProxyError {
    pub fn new(kind: ProxyErrorKind, cause: impl Into<Cause>) -> Self {
        Self {
            kind,
            cause: Some(cause.into()),
        }
    }

    pub fn from_kind(kind: ProxyErrorKind) -> Self {
        Self { kind, cause: None }
    }

    pub fn timeout(msg: &str) -> Self {
        Self::new(ProxyErrorKind::Timeout, msg.to_owned())
    }

    pub fn general(cause: impl Into<Cause>) -> Self {
        Self::new(ProxyErrorKind::GeneralFailure, cause)
    }

    pub fn kind(&self) -> ProxyErrorKind {
        self.kind
    }
}

impl From<io::Error> for ProxyError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::ConnectionRefused => ProxyErrorKind::ConnectionRefused,
            io::ErrorKind::TimedOut => ProxyErrorKind::Timeout,
            io::ErrorKind::HostUnreachable => ProxyErrorKind::HostUnreachable,
            io::ErrorKind::NetworkUnreachable => ProxyErrorKind::NetworkUnreachable,
            io::ErrorKind::AddrNotAvailable => ProxyErrorKind::HostUnreachable,
            _ => ProxyErrorKind::GeneralFailure,
        };
        Self::new(kind, err)
    }
}
