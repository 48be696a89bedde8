use super::{
    connection::{TransportReceiver, TransportSender},
    SipAddr, SipConnection, TransportEvent,
};
use crate::{Error, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::unbounded_channel;

struct ChannelConnectionInner {
    incoming: Mutex<Option<TransportReceiver>>,
    outgoing: TransportSender,
    addr: SipAddr,
}

/// In-process reliable connection, used to wire two endpoints together
/// without sockets.
#[derive(Clone)]
pub struct ChannelConnection {
    inner: Arc<ChannelConnectionInner>,
}

impl ChannelConnection {
    pub fn create_connection(
        incoming: TransportReceiver,
        outgoing: TransportSender,
        addr: SipAddr,
    ) -> Self {
        ChannelConnection {
            inner: Arc::new(ChannelConnectionInner {
                incoming: Mutex::new(Some(incoming)),
                outgoing,
                addr,
            }),
        }
    }

    /// Two connected ends: what one sends, the other receives.
    pub fn pair(left: SipAddr, right: SipAddr) -> (Self, Self) {
        let (left_tx, left_rx) = unbounded_channel();
        let (right_tx, right_rx) = unbounded_channel();
        (
            Self::create_connection(left_rx, right_tx, left),
            Self::create_connection(right_rx, left_tx, right),
        )
    }

    pub async fn send(&self, msg: rsip::SipMessage) -> Result<()> {
        let source = self.get_addr().clone();
        self.inner
            .outgoing
            .send(TransportEvent::Incoming(
                msg,
                SipConnection::Channel(self.clone()),
                source.clone(),
            ))
            .map_err(|e| Error::SendError(e.to_string(), source))
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let incoming = self.inner.incoming.lock()?.take();
        let Some(mut incoming) = incoming else {
            return Err(Error::TransportLayerError(
                "serve_loop called twice".to_string(),
                self.get_addr().clone(),
            ));
        };
        while let Some(event) = incoming.recv().await {
            if let TransportEvent::Incoming(msg, _, from) = event {
                sender.send(TransportEvent::Incoming(
                    msg,
                    SipConnection::Channel(self.clone()),
                    from,
                ))?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.addr)
    }
}
