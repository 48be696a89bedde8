use serde::{Deserialize, Serialize};
use std::fmt;

pub mod channel;
pub mod connection;
pub mod sip_addr;
pub mod stream;
pub mod tcp;
pub mod tcp_listener;
pub mod tls;
pub mod transport_layer;
pub mod udp;
pub use connection::SipConnection;
pub use connection::TransportEvent;
pub use sip_addr::SipAddr;
pub use tls::TlsConfig;
pub use transport_layer::TransportLayer;

#[cfg(test)]
pub mod tests;

/// Protocol of a configured transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
}

impl TransportKind {
    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportKind::Udp)
    }
}

impl From<TransportKind> for rsip::transport::Transport {
    fn from(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Udp => rsip::transport::Transport::Udp,
            TransportKind::Tcp => rsip::transport::Transport::Tcp,
            TransportKind::Tls => rsip::transport::Transport::Tls,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Udp => write!(f, "UDP"),
            TransportKind::Tcp => write!(f, "TCP"),
            TransportKind::Tls => write!(f, "TLS"),
        }
    }
}
