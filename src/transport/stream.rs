use crate::{
    transport::{
        connection::{TransportSender, KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE},
        SipAddr, SipConnection, TransportEvent,
    },
    Error, Result,
};
use bytes::{Buf, BytesMut};
use futures::StreamExt;
use rsip::SipMessage;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};
use tokio_util::codec::{Decoder, Encoder, FramedRead};
use tracing::{debug, info, warn};

pub(super) const MAX_SIP_MESSAGE_SIZE: usize = 65535;

/// Frames SIP messages on a byte stream using Content-Length, and
/// recognises the RFC 5626 CRLF keepalive ping/pong.
#[derive(Default)]
pub struct SipCodec {}

impl SipCodec {
    pub fn new() -> Self {
        Self {}
    }
}

#[derive(Debug, Clone)]
pub enum SipCodecType {
    Message(SipMessage),
    KeepaliveRequest,
    KeepaliveResponse,
}

impl std::fmt::Display for SipCodecType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SipCodecType::Message(msg) => write!(f, "{}", msg),
            SipCodecType::KeepaliveRequest => write!(f, "Keepalive Request"),
            SipCodecType::KeepaliveResponse => write!(f, "Keepalive Response"),
        }
    }
}

fn content_length(headers: &str) -> Result<usize> {
    for line in headers.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l") {
            return value
                .trim()
                .parse::<usize>()
                .map_err(|e| Error::SipMessageError(format!("invalid Content-Length: {}", e)));
        }
    }
    Ok(0)
}

impl Decoder for SipCodec {
    type Item = SipCodecType;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.starts_with(KEEPALIVE_REQUEST) {
            src.advance(KEEPALIVE_REQUEST.len());
            return Ok(Some(SipCodecType::KeepaliveRequest));
        }
        if src.len() == KEEPALIVE_RESPONSE.len() && &src[..] == KEEPALIVE_RESPONSE {
            src.advance(KEEPALIVE_RESPONSE.len());
            return Ok(Some(SipCodecType::KeepaliveResponse));
        }
        // stray CRLFs between messages
        while src.starts_with(KEEPALIVE_RESPONSE) && src.len() > KEEPALIVE_RESPONSE.len() {
            if src.starts_with(KEEPALIVE_REQUEST) {
                break;
            }
            src.advance(KEEPALIVE_RESPONSE.len());
        }

        if let Some(headers_end) = src.windows(4).position(|w| w == b"\r\n\r\n") {
            let headers = std::str::from_utf8(&src[..headers_end + 4])
                .map_err(|e| Error::SipMessageError(format!("invalid UTF-8 in headers: {}", e)))?;
            let total_len = content_length(headers)?
                .checked_add(headers_end + 4)
                .filter(|len| *len <= MAX_SIP_MESSAGE_SIZE)
                .ok_or_else(|| Error::SipMessageError("SIP message too large".to_string()))?;
            if src.len() >= total_len {
                let msg_data = src.split_to(total_len);
                let msg = SipMessage::try_from(&msg_data[..])?;
                return Ok(Some(SipCodecType::Message(msg)));
            }
        }

        if src.len() > MAX_SIP_MESSAGE_SIZE {
            return Err(Error::SipMessageError("SIP message too large".to_string()));
        }
        Ok(None)
    }
}

impl Encoder<SipMessage> for SipCodec {
    type Error = Error;

    fn encode(&mut self, item: SipMessage, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(item.to_string().as_bytes());
        Ok(())
    }
}

#[async_trait::async_trait]
pub trait StreamConnection: Send + Sync {
    fn get_addr(&self) -> &SipAddr;
    async fn send_message(&self, msg: SipMessage) -> Result<()>;
    async fn send_raw(&self, data: &[u8]) -> Result<()>;
    async fn serve_loop(&self, sender: TransportSender) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

pub struct StreamConnectionInner<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub local_addr: SipAddr,
    pub remote_addr: SipAddr,
    pub read_half: Mutex<Option<R>>,
    pub write_half: Mutex<Option<W>>,
}

impl<R, W> StreamConnectionInner<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(local_addr: SipAddr, remote_addr: SipAddr, read_half: R, write_half: W) -> Self {
        Self {
            local_addr,
            remote_addr,
            read_half: Mutex::new(Some(read_half)),
            write_half: Mutex::new(Some(write_half)),
        }
    }

    pub async fn send_message(&self, msg: SipMessage) -> Result<()> {
        self.send_raw(msg.to_string().as_bytes()).await
    }

    pub async fn send_raw(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.write_half.lock().await;
        let Some(write_half) = guard.as_mut() else {
            return Err(Error::SendError(
                "connection closed".to_string(),
                self.remote_addr.clone(),
            ));
        };
        write_half
            .write_all(data)
            .await
            .map_err(|e| Error::SendError(e.to_string(), self.remote_addr.clone()))?;
        write_half
            .flush()
            .await
            .map_err(|e| Error::SendError(e.to_string(), self.remote_addr.clone()))
    }

    pub async fn serve_loop(
        &self,
        sender: TransportSender,
        connection: SipConnection,
    ) -> Result<()> {
        let read_half = match self.read_half.lock().await.take() {
            Some(read_half) => read_half,
            None => {
                warn!("serve_loop called on a consumed connection");
                return Ok(());
            }
        };
        let mut frames = FramedRead::new(read_half, SipCodec::new());
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(SipCodecType::Message(msg)) => {
                    debug!("received {} <- {}", self.local_addr, self.remote_addr);
                    let msg = match self.remote_addr.get_socketaddr() {
                        Ok(addr) => SipConnection::update_msg_received(msg, addr)?,
                        Err(_) => msg,
                    };
                    sender.send(TransportEvent::Incoming(
                        msg,
                        connection.clone(),
                        self.remote_addr.clone(),
                    ))?;
                }
                Ok(SipCodecType::KeepaliveRequest) => {
                    self.send_raw(KEEPALIVE_RESPONSE).await.ok();
                }
                Ok(SipCodecType::KeepaliveResponse) => {}
                Err(e) => {
                    warn!("stream decode error from {}: {}", self.remote_addr, e);
                    break;
                }
            }
        }
        info!("stream connection closed: {}", self.remote_addr);
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        if let Some(mut write_half) = self.write_half.lock().await.take() {
            write_half.shutdown().await.ok();
        }
        Ok(())
    }
}
