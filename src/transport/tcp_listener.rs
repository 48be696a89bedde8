use crate::transport::{tcp::TcpConnection, transport_layer::TransportLayerInnerRef, SipAddr};
use crate::{Error, Result};
use std::fmt;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, select, sync::Mutex};
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct TcpListenerConnection {
    local_addr: SipAddr,
    external: Option<SipAddr>,
    listener: Arc<Mutex<Option<TcpListener>>>,
}

impl TcpListenerConnection {
    /// Bind the listening socket right away so a port conflict is reported
    /// at configuration time rather than when serving starts.
    pub async fn bind(local: SocketAddr, external: Option<SocketAddr>) -> Result<Self> {
        let listener = TcpListener::bind(local).await.map_err(|e| {
            Error::BindError(
                e.to_string(),
                SipAddr::from(local).with_type(rsip::transport::Transport::Tcp),
            )
        })?;
        let local_addr =
            SipAddr::from(listener.local_addr()?).with_type(rsip::transport::Transport::Tcp);
        info!("created TCP listener: {}", local_addr);
        Ok(TcpListenerConnection {
            local_addr,
            external: external
                .map(|addr| SipAddr::from(addr).with_type(rsip::transport::Transport::Tcp)),
            listener: Arc::new(Mutex::new(Some(listener))),
        })
    }

    pub async fn serve_listener(&self, transport_layer: TransportLayerInnerRef) -> Result<()> {
        let Some(listener) = self.listener.lock().await.take() else {
            return Err(Error::TransportLayerError(
                "listener already serving".to_string(),
                self.local_addr.clone(),
            ));
        };
        loop {
            let (stream, remote_addr) = select! {
                _ = transport_layer.cancel_token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("failed to accept TCP connection: {:?}", e);
                        continue;
                    }
                }
            };
            match TcpConnection::from_stream(stream, self.local_addr.clone()) {
                Ok(connection) => transport_layer.serve_connection(connection.into()),
                Err(e) => error!(%remote_addr, "failed to create TCP connection: {:?}", e),
            }
        }
        Ok(())
    }

    pub fn get_addr(&self) -> &SipAddr {
        self.external.as_ref().unwrap_or(&self.local_addr)
    }
}

impl fmt::Display for TcpListenerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TCP Listener {}", self.get_addr())
    }
}

impl fmt::Debug for TcpListenerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
