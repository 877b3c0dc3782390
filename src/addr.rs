use std::fmt;
use std::net::{IpAddr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// Target of a proxy request: where the originating client wants to go.
///
/// Domain names are carried verbatim; resolution is the job of whichever
/// upstream ends up handling the request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddress {
    Ip4(SocketAddrV4),
    Ip6(SocketAddrV6),
    Domain(String, u16),
}

impl TargetAddress {
    pub fn port(&self) -> u16 {
        match self {
            TargetAddress::Ip4(sa) => sa.port(),
            TargetAddress::Ip6(sa) => sa.port(),
            TargetAddress::Domain(_, port) => *port,
        }
    }

    /// The socket address, when the target is already an IP endpoint.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            TargetAddress::Ip4(sa) => Some(SocketAddr::V4(*sa)),
            TargetAddress::Ip6(sa) => Some(SocketAddr::V6(*sa)),
            TargetAddress::Domain(..) => None,
        }
    }
}

impl From<SocketAddr> for TargetAddress {
    fn from(sa: SocketAddr) -> Self {
        match sa {
            SocketAddr::V4(v4) => TargetAddress::Ip4(v4),
            SocketAddr::V6(v6) => TargetAddress::Ip6(v6),
        }
    }
}

impl From<(IpAddr, u16)> for TargetAddress {
    fn from((ip, port): (IpAddr, u16)) -> Self {
        SocketAddr::new(ip, port).into()
    }
}

impl fmt::Display for TargetAddress {
    // Formats as `host:port`, bracketing IPv6 addresses, so the result is
    // directly usable as a dial address.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddress::Ip4(sa) => sa.fmt(f),
            TargetAddress::Ip6(sa) => sa.fmt(f),
            TargetAddress::Domain(name, port) => write!(f, "{name}:{port}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_dialable() {
        let v4: TargetAddress = "1.2.3.4:80".parse::<SocketAddr>().unwrap().into();
        assert_eq!(v4.to_string(), "1.2.3.4:80");

        let v6: TargetAddress = "[::1]:443".parse::<SocketAddr>().unwrap().into();
        assert_eq!(v6.to_string(), "[::1]:443");

        let dom = TargetAddress::Domain("example.com".to_owned(), 8080);
        assert_eq!(dom.to_string(), "example.com:8080");
    }

    #[test]
    fn port_and_socket_addr() {
        let dom = TargetAddress::Domain("example.com".to_owned(), 80);
        assert_eq!(dom.port(), 80);
        assert!(dom.socket_addr().is_none());

        let v4: TargetAddress = "127.0.0.1:1080".parse::<SocketAddr>().unwrap().into();
        assert_eq!(v4.port(), 1080);
        assert_eq!(v4.socket_addr().unwrap().port(), 1080);
    }
}
