use super::{
    channel::ChannelConnection, stream::StreamConnection, tcp::TcpConnection, tls::TlsConnection,
    udp::UdpConnection, SipAddr,
};
use crate::Result;
use rsip::{
    param::{OtherParam, OtherParamValue, Received},
    prelude::{HeadersExt, ToTypedHeader},
    HostWithPort, Param, SipMessage,
};
use std::{fmt, net::SocketAddr};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

#[derive(Clone, Debug)]
pub enum TransportEvent {
    Incoming(SipMessage, SipConnection, SipAddr),
    New(SipConnection),
    Closed(SipConnection),
}

pub type TransportReceiver = UnboundedReceiver<TransportEvent>;
pub type TransportSender = UnboundedSender<TransportEvent>;

pub const KEEPALIVE_REQUEST: &[u8] = b"\r\n\r\n";
pub const KEEPALIVE_RESPONSE: &[u8] = b"\r\n";

#[derive(Clone)]
pub enum SipConnection {
    Udp(UdpConnection),
    Tcp(TcpConnection),
    Tls(TlsConnection),
    Channel(ChannelConnection),
}

impl SipConnection {
    pub fn is_reliable(&self) -> bool {
        !matches!(self, SipConnection::Udp(_))
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, SipConnection::Tls(_))
    }

    pub fn get_addr(&self) -> &SipAddr {
        match self {
            SipConnection::Udp(t) => t.get_addr(),
            SipConnection::Tcp(t) => t.get_addr(),
            SipConnection::Tls(t) => t.get_addr(),
            SipConnection::Channel(t) => t.get_addr(),
        }
    }

    /// Key under which the transport layer tracks this connection:
    /// the local binding for datagram sockets, the peer for streams.
    pub fn table_key(&self) -> SipAddr {
        match self {
            SipConnection::Udp(t) => t.get_addr().clone(),
            SipConnection::Tcp(t) => t.remote_addr().clone(),
            SipConnection::Tls(t) => t.remote_addr().clone(),
            SipConnection::Channel(t) => t.get_addr().clone(),
        }
    }

    pub async fn send(&self, msg: SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        match self {
            SipConnection::Udp(t) => t.send(msg, destination).await,
            SipConnection::Tcp(t) => t.send_message(msg).await,
            SipConnection::Tls(t) => t.send_message(msg).await,
            SipConnection::Channel(t) => t.send(msg).await,
        }
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        match self {
            SipConnection::Udp(t) => t.serve_loop(sender).await,
            SipConnection::Tcp(t) => t.serve_loop(sender).await,
            SipConnection::Tls(t) => t.serve_loop(sender).await,
            SipConnection::Channel(t) => t.serve_loop(sender).await,
        }
    }

    pub async fn close(&self) -> Result<()> {
        match self {
            SipConnection::Udp(_) => Ok(()),
            SipConnection::Tcp(t) => t.close().await,
            SipConnection::Tls(t) => t.close().await,
            SipConnection::Channel(_) => Ok(()),
        }
    }
}

impl SipConnection {
    /// Stamp `received`/`rport` on the top Via of an inbound request so the
    /// response goes back to where the request actually came from.
    pub fn update_msg_received(msg: SipMessage, addr: SocketAddr) -> Result<SipMessage> {
        match msg {
            SipMessage::Request(mut req) => {
                let via = req.via_header_mut()?;
                Self::build_via_received(via, addr)?;
                Ok(req.into())
            }
            SipMessage::Response(_) => Ok(msg),
        }
    }

    pub fn build_via_received(via: &mut rsip::headers::Via, addr: SocketAddr) -> Result<()> {
        let received: HostWithPort = addr.into();
        let mut typed_via = via.typed()?;
        if typed_via.uri.host_with_port == received {
            return Ok(());
        }
        typed_via.params.retain(|param| match param {
            Param::Other(key, _) => !key.value().eq_ignore_ascii_case("rport"),
            Param::Received(_) => false,
            _ => true,
        });
        *via = typed_via
            .with_param(Param::Received(Received::new(addr.ip().to_string())))
            .with_param(Param::Other(
                OtherParam::new("rport"),
                Some(OtherParamValue::new(addr.port().to_string())),
            ))
            .into();
        Ok(())
    }

    pub fn parse_target_from_via(via: &rsip::headers::Via) -> Result<HostWithPort> {
        let typed_via = via.typed()?;
        let mut host_with_port = typed_via.uri.host_with_port.clone();
        for param in typed_via.params.iter() {
            match param {
                Param::Received(v) => {
                    if let Ok(addr) = v.parse() {
                        host_with_port.host = addr.into();
                    }
                }
                Param::Other(key, Some(value)) if key.value().eq_ignore_ascii_case("rport") => {
                    if let Ok(port) = value.value().parse::<u16>() {
                        host_with_port.port = Some(port.into());
                    }
                }
                _ => {}
            }
        }
        Ok(host_with_port)
    }

    pub fn get_destination(msg: &SipMessage) -> Result<SocketAddr> {
        let target: SipAddr = match msg {
            SipMessage::Request(req) => SipAddr::try_from(&req.uri)?,
            SipMessage::Response(res) => Self::parse_target_from_via(res.via_header()?)?.into(),
        };
        target.get_socketaddr()
    }
}

impl fmt::Display for SipConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipConnection::Udp(t) => write!(f, "UDP {}", t),
            SipConnection::Tcp(t) => write!(f, "{}", t),
            SipConnection::Tls(t) => write!(f, "{}", t),
            SipConnection::Channel(t) => write!(f, "CHANNEL {}", t),
        }
    }
}

impl fmt::Debug for SipConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<UdpConnection> for SipConnection {
    fn from(connection: UdpConnection) -> Self {
        SipConnection::Udp(connection)
    }
}

impl From<TcpConnection> for SipConnection {
    fn from(connection: TcpConnection) -> Self {
        SipConnection::Tcp(connection)
    }
}

impl From<TlsConnection> for SipConnection {
    fn from(connection: TlsConnection) -> Self {
        SipConnection::Tls(connection)
    }
}

impl From<ChannelConnection> for SipConnection {
    fn from(connection: ChannelConnection) -> Self {
        SipConnection::Channel(connection)
    }
}
