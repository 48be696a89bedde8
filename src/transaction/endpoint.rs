use super::{
    key::{TransactionKey, TransactionRole},
    state::TimerPolicy,
    timer::Timer,
    transaction::Transaction,
    TransactionEvent, TransactionEventSender, TransactionReceiver, TransactionSender,
    TransactionTimer,
};
use crate::{
    dialog::DialogId,
    transport::{SipAddr, SipConnection, TransportEvent, TransportLayer},
    Result, VERSION,
};
use rsip::{Method, SipMessage, StatusCode, StatusCodeKind};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};
use tokio::{
    select,
    sync::mpsc::{unbounded_channel, UnboundedReceiver},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// RFC 3261 timer values and retransmission bound.
#[derive(Debug, Clone)]
pub struct EndpointOption {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
    pub max_retransmits: u32,
    pub timer_interval: Duration,
    pub callid_suffix: Option<String>,
}

impl Default for EndpointOption {
    fn default() -> Self {
        let policy = TimerPolicy::default();
        EndpointOption {
            t1: policy.t1,
            t2: policy.t2,
            t4: policy.t4,
            max_retransmits: policy.max_retransmits,
            timer_interval: Duration::from_millis(20),
            callid_suffix: None,
        }
    }
}

impl EndpointOption {
    pub fn timer_policy(&self) -> TimerPolicy {
        TimerPolicy {
            t1: self.t1,
            t2: self.t2,
            t4: self.t4,
            max_retransmits: self.max_retransmits,
            reliable: false,
        }
    }
}

pub struct EndpointInner {
    pub user_agent: String,
    pub timers: Timer<TransactionTimer>,
    pub transport_layer: TransportLayer,
    pub option: EndpointOption,
    pub cancel_token: CancellationToken,
    transactions: RwLock<HashMap<TransactionKey, TransactionEventSender>>,
    finished_transactions: RwLock<HashMap<TransactionKey, Option<SipMessage>>>,
    waiting_ack: RwLock<HashMap<DialogId, TransactionKey>>,
    incoming_sender: TransactionSender,
    incoming_receiver: Mutex<Option<TransactionReceiver>>,
}
pub type EndpointInnerRef = Arc<EndpointInner>;

pub struct EndpointBuilder {
    user_agent: String,
    transport_layer: Option<TransportLayer>,
    cancel_token: Option<CancellationToken>,
    option: Option<EndpointOption>,
}

/// Owns the transaction layer: the transaction table, the timer wheel and
/// the loop that matches inbound messages to transactions. New server
/// transactions come out of `incoming_transactions`.
pub struct Endpoint {
    pub inner: EndpointInnerRef,
}

impl EndpointInner {
    fn new(
        user_agent: String,
        transport_layer: TransportLayer,
        cancel_token: CancellationToken,
        option: EndpointOption,
    ) -> Arc<Self> {
        let (incoming_sender, incoming_receiver) = unbounded_channel();
        Arc::new(EndpointInner {
            user_agent,
            timers: Timer::new(),
            transport_layer,
            option,
            cancel_token,
            transactions: RwLock::new(HashMap::new()),
            finished_transactions: RwLock::new(HashMap::new()),
            waiting_ack: RwLock::new(HashMap::new()),
            incoming_sender,
            incoming_receiver: Mutex::new(Some(incoming_receiver)),
        })
    }

    pub async fn serve(self: &Arc<Self>) -> Result<()> {
        select! {
            _ = self.cancel_token.cancelled() => {
                info!("endpoint cancelled");
            }
            r = self.process_timer() => {
                r?;
            }
            r = self.process_transport_layer() => {
                r?;
            }
        }
        Ok(())
    }

    async fn process_timer(&self) -> Result<()> {
        loop {
            for t in self.timers.poll(Instant::now()) {
                match t {
                    TransactionTimer::Fire(key, kind) => {
                        if !self.forward(&key, TransactionEvent::Timer(kind)) {
                            trace!(%key, %kind, "timer for gone transaction");
                        }
                    }
                    TransactionTimer::Cleanup(key) => {
                        if let Ok(mut finished) = self.finished_transactions.write() {
                            finished.remove(&key);
                        }
                    }
                }
            }
            tokio::time::sleep(self.option.timer_interval).await;
        }
    }

    async fn process_transport_layer(self: &Arc<Self>) -> Result<()> {
        let (sender, mut receiver) = unbounded_channel();
        self.transport_layer.serve_listens(sender).await?;
        self.process_transport_events(&mut receiver).await;
        Ok(())
    }

    async fn process_transport_events(
        self: &Arc<Self>,
        receiver: &mut UnboundedReceiver<TransportEvent>,
    ) {
        while let Some(event) = receiver.recv().await {
            match event {
                TransportEvent::Incoming(msg, connection, from) => {
                    if let Err(e) = self.on_received_message(msg, connection).await {
                        warn!(%from, "on_received_message error: {}", e);
                    }
                }
                TransportEvent::New(connection) => {
                    debug!(%connection, "new transport");
                }
                TransportEvent::Closed(connection) => self.on_transport_closed(&connection),
            }
        }
    }

    fn on_transport_closed(&self, connection: &SipConnection) {
        let addr = connection.table_key();
        info!(%connection, "transport closed, failing bound transactions");
        if let Ok(transactions) = self.transactions.read() {
            for sender in transactions.values() {
                sender
                    .send(TransactionEvent::TransportClosed(addr.clone()))
                    .ok();
            }
        }
    }

    pub(crate) async fn on_received_message(
        self: &Arc<Self>,
        msg: SipMessage,
        connection: SipConnection,
    ) -> Result<()> {
        match msg {
            SipMessage::Request(req) => {
                let key = TransactionKey::from_request(&req, TransactionRole::Server)?;
                match req.method {
                    Method::Ack => return self.on_received_ack(key, req, connection),
                    Method::Cancel => return self.on_received_cancel(key, req, connection).await,
                    _ => {}
                }
                if self.forward(
                    &key,
                    TransactionEvent::Received(req.clone().into(), Some(connection.clone())),
                ) {
                    return Ok(());
                }
                if let Some(last_message) = self.finished_message(&key) {
                    if let Some(last_message) = last_message {
                        debug!(%key, "retransmitted request, resending last response");
                        connection.send(last_message, None).await?;
                    }
                    return Ok(());
                }
                let mut tx =
                    Transaction::new_server(key.clone(), req, self.clone(), Some(connection));
                tx.on_received_request().await?;
                debug!(%key, "new server transaction");
                self.incoming_sender.send(tx)?;
                Ok(())
            }
            SipMessage::Response(resp) => {
                let key = TransactionKey::from_response(&resp, TransactionRole::Client)?;
                let is_final = resp.status_code.kind() != StatusCodeKind::Provisional;
                if self.forward(
                    &key,
                    TransactionEvent::Received(resp.into(), Some(connection.clone())),
                ) {
                    return Ok(());
                }
                match self.finished_message(&key) {
                    Some(Some(SipMessage::Request(ack))) if is_final => {
                        debug!(%key, "retransmitted final response, resending ACK");
                        let target = match &self.transport_layer.outbound {
                            Some(outbound) => outbound.clone(),
                            None => SipAddr::try_from(&ack.uri)?,
                        };
                        connection.send(ack.into(), Some(&target)).await
                    }
                    Some(_) => Ok(()),
                    None => {
                        debug!(%key, "response without transaction");
                        Ok(())
                    }
                }
            }
        }
    }

    fn on_received_ack(
        &self,
        key: TransactionKey,
        req: rsip::Request,
        connection: SipConnection,
    ) -> Result<()> {
        let event = TransactionEvent::Received(req.clone().into(), Some(connection));
        if self.forward(&key, event) {
            return Ok(());
        }
        if self.finished_message(&key).is_some() {
            return Ok(());
        }
        // the ACK for a 2xx carries a fresh branch; route it by dialog
        let waiting = DialogId::try_from(&req).ok().and_then(|id| {
            self.waiting_ack
                .read()
                .ok()
                .and_then(|w| w.get(&id).cloned())
        });
        match waiting {
            Some(invite_key) => {
                self.forward(&invite_key, TransactionEvent::Received(req.into(), None));
            }
            None => debug!(%key, "ACK without transaction"),
        }
        Ok(())
    }

    async fn on_received_cancel(
        &self,
        key: TransactionKey,
        req: rsip::Request,
        connection: SipConnection,
    ) -> Result<()> {
        let invite_key = key.with_method(Method::Invite);
        let live = self
            .transactions
            .read()
            .map(|t| t.contains_key(&invite_key))
            .unwrap_or(false);
        let status = if live || self.finished_message(&invite_key).is_some() {
            StatusCode::OK
        } else {
            StatusCode::CallTransactionDoesNotExist
        };
        let resp = self.make_response(&req, status.clone(), None);
        connection.send(resp.into(), None).await?;
        if live {
            info!(key = %invite_key, "CANCEL matched INVITE transaction");
            self.forward(
                &invite_key,
                TransactionEvent::Received(req.into(), Some(connection)),
            );
        } else {
            debug!(%key, "CANCEL answered with {}", status);
        }
        Ok(())
    }

    fn forward(&self, key: &TransactionKey, event: TransactionEvent) -> bool {
        self.transactions
            .read()
            .ok()
            .and_then(|t| t.get(key).map(|sender| sender.send(event).is_ok()))
            .unwrap_or(false)
    }

    fn finished_message(&self, key: &TransactionKey) -> Option<Option<SipMessage>> {
        self.finished_transactions
            .read()
            .ok()
            .and_then(|f| f.get(key).cloned())
    }

    /// Start the 64*T1 wait for a final response on a cancelled INVITE.
    pub fn invite_cancelled(&self, invite_key: &TransactionKey) -> bool {
        self.forward(invite_key, TransactionEvent::Cancelled)
    }

    pub(super) fn attach_transaction(&self, key: &TransactionKey, sender: TransactionEventSender) {
        if let Ok(mut finished) = self.finished_transactions.write() {
            finished.remove(key);
        }
        if let Ok(mut transactions) = self.transactions.write() {
            transactions.insert(key.clone(), sender);
        }
    }

    pub(super) fn detach_transaction(&self, key: &TransactionKey, last_message: Option<SipMessage>) {
        if let Ok(mut transactions) = self.transactions.write() {
            transactions.remove(key);
        }
        if let Ok(mut waiting_ack) = self.waiting_ack.write() {
            waiting_ack.retain(|_, k| k != key);
        }
        if let Ok(mut finished) = self.finished_transactions.write() {
            finished.insert(key.clone(), last_message);
        }
        self.timers.timeout(
            self.option.timer_policy().timeout(),
            TransactionTimer::Cleanup(key.clone()),
        );
    }

    /// Route the ACK of `dialog_id` to the server INVITE transaction `key`.
    pub fn wait_ack(&self, dialog_id: DialogId, key: TransactionKey) {
        if let Ok(mut waiting_ack) = self.waiting_ack.write() {
            waiting_ack.insert(dialog_id, key);
        }
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.read().map(|t| t.len()).unwrap_or_default()
    }

    pub fn get_addrs(&self) -> Vec<SipAddr> {
        self.transport_layer.get_addrs()
    }
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointBuilder {
    pub fn new() -> Self {
        EndpointBuilder {
            user_agent: VERSION.to_string(),
            transport_layer: None,
            cancel_token: None,
            option: None,
        }
    }

    pub fn user_agent(&mut self, user_agent: &str) -> &mut Self {
        self.user_agent = user_agent.to_string();
        self
    }

    pub fn transport_layer(&mut self, transport_layer: TransportLayer) -> &mut Self {
        self.transport_layer.replace(transport_layer);
        self
    }

    pub fn cancel_token(&mut self, cancel_token: CancellationToken) -> &mut Self {
        self.cancel_token.replace(cancel_token);
        self
    }

    pub fn option(&mut self, option: EndpointOption) -> &mut Self {
        self.option.replace(option);
        self
    }

    pub fn build(&mut self) -> Endpoint {
        let cancel_token = self.cancel_token.take().unwrap_or_default();
        let transport_layer = self
            .transport_layer
            .take()
            .unwrap_or_else(|| TransportLayer::new(cancel_token.child_token()));
        let inner = EndpointInner::new(
            self.user_agent.clone(),
            transport_layer,
            cancel_token,
            self.option.take().unwrap_or_default(),
        );
        Endpoint { inner }
    }
}

impl Endpoint {
    pub async fn serve(&self) {
        if let Err(e) = self.inner.serve().await {
            warn!("endpoint serve error: {}", e);
        }
        info!("endpoint shutdown");
    }

    pub fn shutdown(&self) {
        self.inner.cancel_token.cancel();
    }

    /// Server transactions for requests that matched nothing. Can be taken once.
    pub fn incoming_transactions(&self) -> Result<TransactionReceiver> {
        self.inner
            .incoming_receiver
            .lock()?
            .take()
            .ok_or_else(|| crate::Error::Error("incoming transactions already taken".to_string()))
    }

    pub fn get_addrs(&self) -> Vec<SipAddr> {
        self.inner.get_addrs()
    }
}
