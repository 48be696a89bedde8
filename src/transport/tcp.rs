use crate::{
    transport::{
        connection::TransportSender,
        sip_addr::SipAddr,
        stream::{StreamConnection, StreamConnectionInner},
        SipConnection,
    },
    Error, Result,
};
use rsip::{transport::Transport, SipMessage};
use std::{fmt, sync::Arc};
use tokio::net::TcpStream;
use tracing::info;

type TcpInner =
    StreamConnectionInner<tokio::io::ReadHalf<TcpStream>, tokio::io::WriteHalf<TcpStream>>;

#[derive(Clone)]
pub struct TcpConnection {
    pub inner: Arc<TcpInner>,
}

impl TcpConnection {
    fn wrap(stream: TcpStream, local: SipAddr, remote: SipAddr, origin: &str) -> Self {
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = tokio::io::split(stream);
        let connection = TcpConnection {
            inner: Arc::new(StreamConnectionInner::new(local, remote, read_half, write_half)),
        };
        info!(%connection, "{} TCP connection", origin);
        connection
    }

    /// Dial `remote`; a refused connect is a send failure towards it.
    pub async fn connect(remote: &SipAddr) -> Result<Self> {
        let stream = TcpStream::connect(remote.get_socketaddr()?)
            .await
            .map_err(|e| Error::SendError(e.to_string(), remote.clone()))?;
        let local = SipAddr::from(stream.local_addr()?).with_type(Transport::Tcp);
        let remote = remote.clone().with_type(Transport::Tcp);
        Ok(Self::wrap(stream, local, remote, "outbound"))
    }

    pub fn from_stream(stream: TcpStream, local: SipAddr) -> Result<Self> {
        let remote = SipAddr::from(stream.peer_addr()?).with_type(Transport::Tcp);
        Ok(Self::wrap(stream, local, remote, "accepted"))
    }

    pub fn remote_addr(&self) -> &SipAddr {
        &self.inner.remote_addr
    }
}

#[async_trait::async_trait]
impl StreamConnection for TcpConnection {
    fn get_addr(&self) -> &SipAddr {
        &self.inner.local_addr
    }

    async fn send_message(&self, msg: SipMessage) -> Result<()> {
        self.inner.send_message(msg).await
    }

    async fn send_raw(&self, data: &[u8]) -> Result<()> {
        self.inner.send_raw(data).await
    }

    async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let sip_connection = SipConnection::Tcp(self.clone());
        self.inner.serve_loop(sender, sip_connection).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

impl fmt::Display for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp {}<->{}", self.inner.local_addr, self.inner.remote_addr)
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
