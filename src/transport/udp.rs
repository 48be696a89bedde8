use super::{
    connection::{TransportSender, KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE},
    SipAddr, SipConnection, TransportEvent,
};
use crate::{Error, Result};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::UdpSocket;
use tracing::{debug, info, instrument, trace, warn};

const MAX_UDP_DATAGRAM: usize = 65535;

struct UdpConnectionInner {
    conn: UdpSocket,
    addr: SipAddr,
}

#[derive(Clone)]
pub struct UdpConnection {
    inner: Arc<UdpConnectionInner>,
}

impl UdpConnection {
    /// Bind a UDP socket. `external` replaces the advertised address, e.g.
    /// behind a NAT with a known public mapping.
    pub async fn create_connection(local: SocketAddr, external: Option<SocketAddr>) -> Result<Self> {
        let conn = UdpSocket::bind(local).await.map_err(|e| {
            Error::BindError(
                e.to_string(),
                SipAddr::from(local).with_type(rsip::transport::Transport::Udp),
            )
        })?;
        let local = conn.local_addr()?;
        let addr = SipAddr::from(external.unwrap_or(local)).with_type(rsip::transport::Transport::Udp);

        let t = UdpConnection {
            inner: Arc::new(UdpConnectionInner { addr, conn }),
        };
        info!("created UDP transport: {} external: {:?}", t, external);
        Ok(t)
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut buf = vec![0u8; MAX_UDP_DATAGRAM];
        loop {
            let (len, addr) = match self.inner.conn.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    // ICMP port unreachable surfaces here on some platforms
                    warn!("error receiving UDP packet: {}", e);
                    continue;
                }
            };

            match &buf[..len] {
                KEEPALIVE_REQUEST => {
                    self.inner.conn.send_to(KEEPALIVE_RESPONSE, addr).await.ok();
                    continue;
                }
                KEEPALIVE_RESPONSE => continue,
                data if data.iter().all(|b| b.is_ascii_whitespace()) => continue,
                _ => {}
            }

            let undecoded = match std::str::from_utf8(&buf[..len]) {
                Ok(s) => s,
                Err(e) => {
                    info!("decoding text from: {} error: {}", addr, e);
                    continue;
                }
            };

            let msg = match rsip::SipMessage::try_from(undecoded) {
                Ok(msg) => msg,
                Err(e) => {
                    info!("error parsing SIP message from: {} error: {}", addr, e);
                    continue;
                }
            };

            let msg = match SipConnection::update_msg_received(msg, addr) {
                Ok(msg) => msg,
                Err(e) => {
                    info!("error updating via received from: {} error: {}", addr, e);
                    continue;
                }
            };

            debug!("received {} {} -> {}", len, addr, self.get_addr());
            trace!("{}", undecoded);

            let source = SipAddr::from(addr).with_type(rsip::transport::Transport::Udp);
            sender.send(TransportEvent::Incoming(
                msg,
                SipConnection::Udp(self.clone()),
                source,
            ))?;
        }
    }

    #[instrument(skip(self, msg), fields(addr = %self.get_addr()))]
    pub async fn send(&self, msg: rsip::SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        let target = match destination {
            Some(addr) => addr.get_socketaddr()?,
            None => SipConnection::get_destination(&msg)?,
        };
        let buf = msg.to_string();
        trace!("sending {} -> {} {}", buf.len(), target, buf);

        self.inner
            .conn
            .send_to(buf.as_bytes(), target)
            .await
            .map_err(|e| Error::SendError(e.to_string(), target.into()))
            .map(|_| ())
    }

    pub async fn send_raw(&self, buf: &[u8], destination: &SipAddr) -> Result<()> {
        let target = destination.get_socketaddr()?;
        self.inner
            .conn
            .send_to(buf, target)
            .await
            .map_err(|e| Error::SendError(e.to_string(), destination.clone()))
            .map(|_| ())
    }

    pub async fn recv_raw(&self, buf: &mut [u8]) -> Result<(usize, SipAddr)> {
        let (len, addr) = self.inner.conn.recv_from(buf).await?;
        Ok((
            len,
            SipAddr::from(addr).with_type(rsip::transport::Transport::Udp),
        ))
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }
}

impl std::fmt::Display for UdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.conn.local_addr() {
            Ok(addr) => write!(f, "{}", addr),
            Err(_) => write!(f, "*:*"),
        }
    }
}

impl std::fmt::Debug for UdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.addr)
    }
}

impl Drop for UdpConnectionInner {
    fn drop(&mut self) {
        info!("dropping UDP transport: {}", self.addr);
    }
}
