use crate::Result;
use rsip::{host_with_port, HostWithPort};
use std::{fmt, hash::Hash, net::SocketAddr};

/// SIP Address
///
/// `SipAddr` combines a host/port with an optional transport protocol and
/// is the key the transport layer uses for bound sockets and established
/// stream connections.
///
/// # Examples
///
/// ```rust
/// use rsipua::transport::SipAddr;
/// use std::net::SocketAddr;
///
/// let socket_addr: SocketAddr = "192.168.1.100:5060".parse().unwrap();
/// let sip_addr = SipAddr::from(socket_addr);
/// assert_eq!(sip_addr.get_socketaddr().unwrap(), socket_addr);
/// ```
#[derive(Debug, Eq, PartialEq, Clone, Default)]
pub struct SipAddr {
    pub r#type: Option<rsip::transport::Transport>,
    pub addr: HostWithPort,
}

impl fmt::Display for SipAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipAddr {
                r#type: Some(r#type),
                addr,
            } => write!(f, "{} {}", r#type, addr),
            SipAddr { r#type: None, addr } => write!(f, "{}", addr),
        }
    }
}

impl Hash for SipAddr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.r#type.hash(state);
        match self.addr.host {
            host_with_port::Host::Domain(ref domain) => domain.to_string().hash(state),
            host_with_port::Host::IpAddr(ref ip_addr) => ip_addr.hash(state),
        }
        if let Some(port) = self.addr.port {
            port.value().hash(state);
        }
    }
}

impl SipAddr {
    pub fn new(transport: rsip::transport::Transport, addr: HostWithPort) -> Self {
        SipAddr {
            r#type: Some(transport),
            addr,
        }
    }

    pub fn with_type(mut self, transport: rsip::transport::Transport) -> Self {
        self.r#type = Some(transport);
        self
    }

    pub fn is_reliable(&self) -> bool {
        !matches!(self.r#type, None | Some(rsip::transport::Transport::Udp))
    }

    pub fn is_secure(&self) -> bool {
        matches!(
            self.r#type,
            Some(rsip::transport::Transport::Tls) | Some(rsip::transport::Transport::Wss)
        )
    }

    pub fn default_port(&self) -> u16 {
        if self.is_secure() {
            5061
        } else {
            5060
        }
    }

    pub fn get_socketaddr(&self) -> Result<SocketAddr> {
        match &self.addr.host {
            host_with_port::Host::Domain(domain) => Err(crate::Error::Error(format!(
                "Cannot convert domain {} to SocketAddr",
                domain
            ))),
            host_with_port::Host::IpAddr(ip_addr) => {
                let port = self
                    .addr
                    .port
                    .map_or(self.default_port(), |p| p.value().to_owned());
                Ok(SocketAddr::new(ip_addr.to_owned(), port))
            }
        }
    }
}

impl From<&SipAddr> for rsip::Uri {
    fn from(addr: &SipAddr) -> Self {
        let scheme = if addr.is_secure() {
            rsip::Scheme::Sips
        } else {
            rsip::Scheme::Sip
        };
        let mut params = vec![];
        match addr.r#type {
            Some(rsip::transport::Transport::Tcp) => {
                params.push(rsip::Param::Transport(rsip::transport::Transport::Tcp))
            }
            Some(rsip::transport::Transport::Tls) => {
                params.push(rsip::Param::Transport(rsip::transport::Transport::Tls))
            }
            _ => {}
        }
        rsip::Uri {
            scheme: Some(scheme),
            host_with_port: addr.addr.clone(),
            params,
            ..Default::default()
        }
    }
}

impl From<SipAddr> for HostWithPort {
    fn from(addr: SipAddr) -> Self {
        addr.addr
    }
}

impl From<SocketAddr> for SipAddr {
    fn from(addr: SocketAddr) -> Self {
        let host_with_port = HostWithPort {
            host: addr.ip().into(),
            port: Some(addr.port().into()),
        };
        SipAddr {
            r#type: None,
            addr: host_with_port,
        }
    }
}

impl From<HostWithPort> for SipAddr {
    fn from(host_with_port: HostWithPort) -> Self {
        SipAddr {
            r#type: None,
            addr: host_with_port,
        }
    }
}

impl TryFrom<&rsip::Uri> for SipAddr {
    type Error = crate::Error;

    fn try_from(uri: &rsip::Uri) -> Result<Self> {
        let mut r#type = match uri.scheme {
            Some(rsip::Scheme::Sips) => Some(rsip::transport::Transport::Tls),
            _ => None,
        };
        if let Some(transport) = uri.transport() {
            r#type = Some(transport.clone());
        }
        Ok(SipAddr {
            r#type: r#type.or(Some(rsip::transport::Transport::Udp)),
            addr: uri.host_with_port.clone(),
        })
    }
}
