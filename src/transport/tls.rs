use super::{
    connection::TransportSender,
    sip_addr::SipAddr,
    stream::{StreamConnection, StreamConnectionInner},
    transport_layer::TransportLayerInnerRef,
    SipConnection,
};
use crate::{Error, Result};
use rsip::SipMessage;
use rustls::client::danger::ServerCertVerifier;
use std::{fmt, net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::Mutex,
};
use tokio_rustls::{
    rustls::{pki_types, ClientConfig, RootCertStore, ServerConfig},
    TlsAcceptor, TlsConnector, TlsStream,
};
use tracing::{info, warn};

/// TLS material. Certificates and keys are PEM encoded.
#[derive(Clone, Default)]
pub struct TlsConfig {
    /// Server certificate chain, required to listen.
    pub cert: Option<Vec<u8>>,
    /// Server private key (PKCS#8 or PKCS#1), required to listen.
    pub key: Option<Vec<u8>>,
    /// Trust store used to verify peers when connecting.
    pub ca_certs: Option<Vec<u8>>,
    /// Replaces trust-store verification entirely.
    pub verifier: Option<Arc<dyn ServerCertVerifier>>,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("cert", &self.cert.as_ref().map(|c| c.len()))
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("ca_certs", &self.ca_certs.as_ref().map(|c| c.len()))
            .field("verifier", &self.verifier.is_some())
            .finish()
    }
}

impl TlsConfig {
    pub fn can_listen(&self) -> bool {
        self.cert.is_some() && self.key.is_some()
    }

    fn load_certs(pem: &[u8]) -> Result<Vec<pki_types::CertificateDer<'static>>> {
        let mut reader = std::io::BufReader::new(pem);
        rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, std::io::Error>>()
            .map_err(|e| Error::TlsError(format!("failed to parse certificate: {}", e)))
    }

    fn load_key(pem: &[u8]) -> Result<pki_types::PrivateKeyDer<'static>> {
        let mut reader = std::io::BufReader::new(pem);
        rustls_pemfile::private_key(&mut reader)
            .map_err(|e| Error::TlsError(format!("failed to parse private key: {}", e)))?
            .ok_or_else(|| Error::TlsError("no private key found".to_string()))
    }

    pub fn create_acceptor(&self) -> Result<TlsAcceptor> {
        let (Some(cert), Some(key)) = (&self.cert, &self.key) else {
            return Err(Error::TlsError(
                "certificate and key are required to listen".to_string(),
            ));
        };
        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(Self::load_certs(cert)?, Self::load_key(key)?)?;
        Ok(TlsAcceptor::from(Arc::new(server_config)))
    }

    pub fn create_connector(&self) -> Result<TlsConnector> {
        let mut root_store = RootCertStore::empty();
        if let Some(ca_certs) = &self.ca_certs {
            for cert in Self::load_certs(ca_certs)? {
                root_store.add(cert)?;
            }
        }
        let mut config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        if let Some(verifier) = &self.verifier {
            config.dangerous().set_certificate_verifier(verifier.clone());
        }
        Ok(TlsConnector::from(Arc::new(config)))
    }
}

type TlsInner = StreamConnectionInner<
    tokio::io::ReadHalf<TlsStream<TcpStream>>,
    tokio::io::WriteHalf<TlsStream<TcpStream>>,
>;

#[derive(Clone)]
pub struct TlsConnection {
    inner: Arc<TlsInner>,
}

impl TlsConnection {
    /// Connect and complete the handshake. The connection is unusable
    /// until the handshake succeeds; failures map to `TlsError`.
    pub async fn connect(remote_addr: &SipAddr, config: &TlsConfig) -> Result<Self> {
        let connector = config.create_connector()?;
        let socket_addr = remote_addr.get_socketaddr()?;
        let domain_string = match &remote_addr.addr.host {
            rsip::host_with_port::Host::Domain(domain) => domain.to_string(),
            rsip::host_with_port::Host::IpAddr(ip) => ip.to_string(),
        };
        let server_name = pki_types::ServerName::try_from(domain_string.as_str())
            .map_err(|_| Error::TlsError(format!("invalid server name: {}", domain_string)))?
            .to_owned();

        let stream = TcpStream::connect(socket_addr)
            .await
            .map_err(|e| Error::SendError(e.to_string(), remote_addr.clone()))?;
        let local_addr =
            SipAddr::from(stream.local_addr()?).with_type(rsip::transport::Transport::Tls);
        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| Error::TlsError(format!("handshake with {}: {}", remote_addr, e)))?;

        let connection = Self::from_stream(
            TlsStream::Client(tls_stream),
            local_addr,
            remote_addr.clone().with_type(rsip::transport::Transport::Tls),
        );
        info!("created TLS client connection: {}", connection);
        Ok(connection)
    }

    pub fn from_stream(stream: TlsStream<TcpStream>, local_addr: SipAddr, remote_addr: SipAddr) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            inner: Arc::new(StreamConnectionInner::new(
                local_addr,
                remote_addr,
                read_half,
                write_half,
            )),
        }
    }

    pub fn remote_addr(&self) -> &SipAddr {
        &self.inner.remote_addr
    }
}

#[async_trait::async_trait]
impl StreamConnection for TlsConnection {
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
        let sip_connection = SipConnection::Tls(self.clone());
        self.inner.serve_loop(sender, sip_connection).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

impl fmt::Display for TlsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TLS {} -> {}",
            self.inner.local_addr, self.inner.remote_addr
        )
    }
}

/// A bound TLS listening socket. Accepted connections are handed to the
/// transport layer once their handshake completes.
#[derive(Clone)]
pub struct TlsListenerConnection {
    local_addr: SipAddr,
    acceptor: TlsAcceptor,
    listener: Arc<Mutex<Option<TcpListener>>>,
}

impl TlsListenerConnection {
    pub async fn bind(local: SocketAddr, config: &TlsConfig) -> Result<Self> {
        let acceptor = config.create_acceptor()?;
        let listener = TcpListener::bind(local).await.map_err(|e| {
            Error::BindError(
                e.to_string(),
                SipAddr::from(local).with_type(rsip::transport::Transport::Tls),
            )
        })?;
        let local_addr =
            SipAddr::from(listener.local_addr()?).with_type(rsip::transport::Transport::Tls);
        info!("created TLS listener: {}", local_addr);
        Ok(Self {
            local_addr,
            acceptor,
            listener: Arc::new(Mutex::new(Some(listener))),
        })
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.local_addr
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
                        warn!("failed to accept TLS connection: {}", e);
                        continue;
                    }
                }
            };
            let acceptor = self.acceptor.clone();
            let local_addr = self.local_addr.clone();
            let transport_layer = transport_layer.clone();
            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(%remote_addr, "TLS handshake failed: {}", e);
                        return;
                    }
                };
                let connection = TlsConnection::from_stream(
                    TlsStream::Server(tls_stream),
                    local_addr,
                    SipAddr::from(remote_addr).with_type(rsip::transport::Transport::Tls),
                );
                transport_layer.serve_connection(connection.into());
            });
        }
        Ok(())
    }
}

impl fmt::Display for TlsListenerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TLS Listener {}", self.local_addr)
    }
}
