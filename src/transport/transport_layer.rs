use super::{
    connection::TransportSender,
    tcp::TcpConnection,
    tcp_listener::TcpListenerConnection,
    tls::{TlsConfig, TlsConnection, TlsListenerConnection},
    udp::UdpConnection,
    SipAddr, SipConnection, TransportEvent, TransportKind,
};
use crate::{Error, Result};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct ConnectionEntry {
    connection: SipConnection,
    cancel_token: CancellationToken,
    serving: bool,
}

#[derive(Clone)]
enum ListenerConnection {
    Tcp(TcpListenerConnection),
    Tls(TlsListenerConnection),
}

impl ListenerConnection {
    fn get_addr(&self) -> &SipAddr {
        match self {
            ListenerConnection::Tcp(l) => l.get_addr(),
            ListenerConnection::Tls(l) => l.get_addr(),
        }
    }
}

pub struct TransportLayerInner {
    pub(crate) cancel_token: CancellationToken,
    connections: Mutex<HashMap<SipAddr, ConnectionEntry>>,
    listeners: Mutex<Vec<ListenerConnection>>,
    transport_tx: Mutex<Option<TransportSender>>,
    tls_config: Mutex<TlsConfig>,
}
pub type TransportLayerInnerRef = Arc<TransportLayerInner>;

/// Owns every socket of the user agent: bound UDP sockets, TCP/TLS
/// listeners, and the stream connections accepted or dialed through them.
/// All of them are released when the layer's cancel token fires.
#[derive(Clone)]
pub struct TransportLayer {
    pub outbound: Option<SipAddr>,
    pub inner: TransportLayerInnerRef,
}

impl TransportLayer {
    pub fn new(cancel_token: CancellationToken) -> Self {
        let inner = TransportLayerInner {
            cancel_token,
            connections: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            transport_tx: Mutex::new(None),
            tls_config: Mutex::new(TlsConfig::default()),
        };
        Self {
            outbound: None,
            inner: Arc::new(inner),
        }
    }

    pub fn set_tls_config(&self, config: TlsConfig) -> Result<()> {
        *self.inner.tls_config.lock()? = config;
        Ok(())
    }

    /// Bind one transport of `kind` on `local`. Port 0 picks a free port;
    /// the returned address carries the port actually bound.
    pub async fn bind(
        &self,
        kind: TransportKind,
        local: SocketAddr,
        external: Option<SocketAddr>,
    ) -> Result<SipAddr> {
        match kind {
            TransportKind::Udp => {
                let connection = UdpConnection::create_connection(local, external).await?;
                let addr = connection.get_addr().clone();
                self.add_transport(connection.into());
                Ok(addr)
            }
            TransportKind::Tcp => {
                let listener = TcpListenerConnection::bind(local, external).await?;
                let addr = listener.get_addr().clone();
                self.inner.add_listener(ListenerConnection::Tcp(listener))?;
                Ok(addr)
            }
            TransportKind::Tls => {
                let config = self.inner.tls_config.lock()?.clone();
                if !config.can_listen() {
                    return Err(Error::BindError(
                        "TLS listener needs a certificate and key".to_string(),
                        SipAddr::from(local).with_type(rsip::transport::Transport::Tls),
                    ));
                }
                let listener = TlsListenerConnection::bind(local, &config).await?;
                let addr = listener.get_addr().clone();
                self.inner.add_listener(ListenerConnection::Tls(listener))?;
                Ok(addr)
            }
        }
    }

    /// Serve an already open connection. Bound transports come from `bind`.
    pub(crate) fn add_transport(&self, connection: SipConnection) {
        self.inner.serve_connection(connection)
    }

    /// Close a transport: its serve loop stops, a `Closed` event is emitted
    /// and transactions bound to it fail.
    pub fn close_transport(&self, addr: &SipAddr) -> bool {
        self.inner.close_connection(addr)
    }

    pub async fn lookup(&self, uri: &rsip::uri::Uri) -> Result<SipConnection> {
        self.inner.lookup(uri, self.outbound.as_ref()).await
    }

    pub async fn serve_listens(&self, sender: TransportSender) -> Result<()> {
        self.inner.serve_listens(sender).await
    }

    pub fn get_addrs(&self) -> Vec<SipAddr> {
        let mut addrs = self
            .inner
            .connections
            .lock()
            .map(|conns| {
                conns
                    .values()
                    .filter(|e| matches!(e.connection, SipConnection::Udp(_)))
                    .map(|e| e.connection.get_addr().clone())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        if let Ok(listeners) = self.inner.listeners.lock() {
            addrs.extend(listeners.iter().map(|l| l.get_addr().clone()));
        }
        addrs
    }

    pub fn len(&self) -> usize {
        self.inner
            .connections
            .lock()
            .map(|conns| conns.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TransportLayerInner {
    fn add_listener(self: &Arc<Self>, listener: ListenerConnection) -> Result<()> {
        let sender = self.transport_tx.lock()?.clone();
        self.listeners.lock()?.push(listener.clone());
        if sender.is_some() {
            self.spawn_listener(listener);
        }
        Ok(())
    }

    fn spawn_listener(self: &Arc<Self>, listener: ListenerConnection) {
        let inner = self.clone();
        tokio::spawn(async move {
            let r = match &listener {
                ListenerConnection::Tcp(l) => l.serve_listener(inner.clone()).await,
                ListenerConnection::Tls(l) => l.serve_listener(inner.clone()).await,
            };
            if let Err(e) = r {
                warn!(addr = %listener.get_addr(), "listener exited: {}", e);
            }
        });
    }

    /// Track `connection` and, once the layer is serving, run its receive loop.
    pub(crate) fn serve_connection(self: &Arc<Self>, connection: SipConnection) {
        let key = connection.table_key();
        let cancel_token = self.cancel_token.child_token();
        let sender = match self.transport_tx.lock() {
            Ok(sender) => sender.clone(),
            Err(_) => None,
        };
        if let Ok(mut conns) = self.connections.lock() {
            conns.insert(
                key.clone(),
                ConnectionEntry {
                    connection: connection.clone(),
                    cancel_token: cancel_token.clone(),
                    serving: sender.is_some(),
                },
            );
        }
        if let Some(sender) = sender {
            self.spawn_connection(key, connection, cancel_token, sender);
        }
    }

    fn spawn_connection(
        self: &Arc<Self>,
        key: SipAddr,
        connection: SipConnection,
        cancel_token: CancellationToken,
        sender: TransportSender,
    ) {
        let inner = self.clone();
        tokio::spawn(async move {
            sender.send(TransportEvent::New(connection.clone())).ok();
            select! {
                _ = cancel_token.cancelled() => {}
                r = connection.serve_loop(sender.clone()) => {
                    if let Err(e) = r {
                        warn!(%connection, "serve_loop error: {}", e);
                    }
                }
            }
            inner.del_connection(&key);
            connection.close().await.ok();
            info!(%connection, "transport closed");
            sender.send(TransportEvent::Closed(connection)).ok();
        });
    }

    fn del_connection(&self, addr: &SipAddr) {
        if let Ok(mut conns) = self.connections.lock() {
            conns.remove(addr);
        }
    }

    fn close_connection(&self, addr: &SipAddr) -> bool {
        let entry = match self.connections.lock() {
            Ok(mut conns) => conns.remove(addr),
            Err(_) => None,
        };
        match entry {
            Some(entry) => {
                entry.cancel_token.cancel();
                true
            }
            None => false,
        }
    }

    async fn lookup(
        self: &Arc<Self>,
        uri: &rsip::uri::Uri,
        outbound: Option<&SipAddr>,
    ) -> Result<SipConnection> {
        let target = match outbound {
            Some(addr) => addr.clone(),
            None => SipAddr::try_from(uri)?,
        };
        debug!("lookup target: {} -> {}", uri, target);

        let existing = self
            .connections
            .lock()?
            .get(&target)
            .map(|e| e.connection.clone());
        if let Some(connection) = existing {
            return Ok(connection);
        }

        match target.r#type {
            Some(rsip::transport::Transport::Tcp) => {
                let connection: SipConnection = TcpConnection::connect(&target).await?.into();
                self.serve_connection(connection.clone());
                Ok(connection)
            }
            Some(rsip::transport::Transport::Tls) => {
                let config = self.tls_config.lock()?.clone();
                let connection: SipConnection =
                    TlsConnection::connect(&target, &config).await?.into();
                self.serve_connection(connection.clone());
                Ok(connection)
            }
            Some(rsip::transport::Transport::Udp) | None => {
                let conns = self.connections.lock()?;
                let datagram = |udp: bool| {
                    conns
                        .values()
                        .map(|e| &e.connection)
                        .find(|c| match c {
                            SipConnection::Udp(_) => udp,
                            SipConnection::Channel(_) => !udp,
                            _ => false,
                        })
                        .cloned()
                };
                datagram(true)
                    .or_else(|| datagram(false))
                    .ok_or(Error::TransportLayerError(
                        "no UDP transport available".to_string(),
                        target.clone(),
                    ))
            }
            _ => Err(Error::TransportLayerError(
                format!("unsupported transport type: {:?}", target.r#type),
                target,
            )),
        }
    }

    async fn serve_listens(self: &Arc<Self>, sender: TransportSender) -> Result<()> {
        *self.transport_tx.lock()? = Some(sender.clone());
        let pending = {
            let mut conns = self.connections.lock()?;
            conns
                .iter_mut()
                .filter(|(_, e)| !e.serving)
                .map(|(key, e)| {
                    e.serving = true;
                    (key.clone(), e.connection.clone(), e.cancel_token.clone())
                })
                .collect::<Vec<_>>()
        };
        for (key, connection, cancel_token) in pending {
            self.spawn_connection(key, connection, cancel_token, sender.clone());
        }
        let listeners = self.listeners.lock()?.clone();
        for listener in listeners {
            self.spawn_listener(listener);
        }
        Ok(())
    }
}
