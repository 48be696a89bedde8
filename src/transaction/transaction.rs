use super::{
    endpoint::EndpointInnerRef,
    key::TransactionKey,
    make_tag,
    state::{
        transition, TimerKind, TimerPolicy, TransactionAction, TransactionFailure,
        TransactionInput, TransactionState, TransactionType,
    },
    TransactionEvent, TransactionEventReceiver, TransactionEventSender, TransactionTimer,
};
use crate::{
    transport::{SipAddr, SipConnection},
    Error, Result,
};
use rsip::{
    prelude::{HeadersExt, ToTypedHeader},
    Header, Method, Request, Response, SipMessage, StatusCode, StatusCodeKind,
};
use std::collections::HashMap;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, info, trace, warn};

/// One request and its responses. Client transactions are created by the
/// transaction user and driven with `send` and `receive`; server
/// transactions are created by the endpoint and handed to the user through
/// the incoming queue, then answered with `respond`.
///
/// The transaction only makes progress while its owner awaits `receive`
/// or calls one of the send methods. Dropping it hands the key and the
/// last message to the endpoint, which keeps absorbing retransmissions
/// for 64*T1.
pub struct Transaction {
    pub transaction_type: TransactionType,
    pub key: TransactionKey,
    pub original: Request,
    pub destination: Option<SipAddr>,
    pub state: TransactionState,
    pub endpoint_inner: EndpointInnerRef,
    pub connection: Option<SipConnection>,
    pub last_response: Option<Response>,
    pub last_ack: Option<Request>,
    pub tu_sender: TransactionEventSender,
    tu_receiver: TransactionEventReceiver,
    timers: HashMap<TimerKind, u64>,
    policy: TimerPolicy,
}

impl Transaction {
    fn new(
        transaction_type: TransactionType,
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let (tu_sender, tu_receiver) = unbounded_channel();
        endpoint_inner.attach_transaction(&key, tu_sender.clone());
        let mut policy = endpoint_inner.option.timer_policy();
        policy.reliable = connection
            .as_ref()
            .map(|c| c.is_reliable())
            .unwrap_or(false);
        trace!(%key, %transaction_type, "transaction created");
        Transaction {
            transaction_type,
            key,
            original,
            destination: None,
            state: TransactionState::Nothing,
            endpoint_inner,
            connection,
            last_response: None,
            last_ack: None,
            tu_sender,
            tu_receiver,
            timers: HashMap::new(),
            policy,
        }
    }

    pub fn new_client(
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let transaction_type = match original.method {
            Method::Invite => TransactionType::ClientInvite,
            _ => TransactionType::ClientNonInvite,
        };
        Self::new(transaction_type, key, original, endpoint_inner, connection)
    }

    pub fn new_server(
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let transaction_type = match original.method {
            Method::Invite => TransactionType::ServerInvite,
            _ => TransactionType::ServerNonInvite,
        };
        Self::new(transaction_type, key, original, endpoint_inner, connection)
    }

    pub fn is_terminated(&self) -> bool {
        self.state.is_terminated()
    }

    /// Resolve a transport and transmit the request.
    pub async fn send(&mut self) -> Result<()> {
        if !self.transaction_type.is_client() {
            return Err(Error::TransactionError(
                "send is only valid on client transactions".to_string(),
                self.key.clone(),
            ));
        }
        if self.connection.is_none() {
            let connection = self.lookup_connection().await?;
            self.connection = Some(connection);
        }
        self.policy.reliable = self
            .connection
            .as_ref()
            .map(|c| c.is_reliable())
            .unwrap_or(false);
        self.step(TransactionInput::SendRequest, None)
            .await
            .map(|_| ())
    }

    /// Wait for the next message to hand to the transaction user.
    /// `Ok(None)` once the transaction has terminated; a timeout or
    /// transport failure is reported exactly once as an error.
    pub async fn receive(&mut self) -> Result<Option<SipMessage>> {
        while !self.state.is_terminated() {
            let Some(event) = self.tu_receiver.recv().await else {
                break;
            };
            let (input, msg) = match event {
                TransactionEvent::Received(msg, connection) => {
                    if self.connection.is_none() {
                        self.connection = connection;
                    }
                    match self.classify(&msg) {
                        Some(input) => (input, Some(msg)),
                        None => continue,
                    }
                }
                TransactionEvent::Respond(response) => {
                    if let Err(e) = self.respond(response).await {
                        warn!(key = %self.key, "queued response not sent: {}", e);
                    }
                    continue;
                }
                TransactionEvent::Timer(kind) => {
                    // fired before it was cancelled
                    if self.timers.remove(&kind).is_none() {
                        continue;
                    }
                    (TransactionInput::Timer(kind), None)
                }
                TransactionEvent::TransportClosed(addr) => {
                    let bound = self
                        .connection
                        .as_ref()
                        .map(|c| c.table_key() == addr)
                        .unwrap_or(false);
                    if !bound {
                        continue;
                    }
                    (TransactionInput::TransportError, None)
                }
                TransactionEvent::Cancelled => (TransactionInput::Cancelled, None),
                TransactionEvent::Terminate => {
                    self.terminate();
                    break;
                }
            };
            if let Some(msg) = self.step(input, msg).await? {
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }

    /// Send a response on a server transaction.
    pub async fn respond(&mut self, response: Response) -> Result<()> {
        if self.transaction_type.is_client() {
            return Err(Error::TransactionError(
                "respond is only valid on server transactions".to_string(),
                self.key.clone(),
            ));
        }
        let input = match response.status_code.kind() {
            StatusCodeKind::Provisional => TransactionInput::Provisional,
            StatusCodeKind::Successful => TransactionInput::Success,
            _ => TransactionInput::Failure,
        };
        if transition(self.transaction_type, self.state, input, &self.policy).is_none() {
            return Err(Error::InvalidStateError(format!(
                "cannot send {} in state {}",
                response.status_code, self.state
            )));
        }
        self.step(input, Some(response.into())).await.map(|_| ())
    }

    pub async fn reply(&mut self, status_code: StatusCode) -> Result<()> {
        self.reply_with(status_code, vec![], None).await
    }

    /// Reply with extra headers and an optional body. A To tag is added to
    /// non-100 responses that lack one.
    pub async fn reply_with(
        &mut self,
        status_code: StatusCode,
        headers: Vec<Header>,
        body: Option<Vec<u8>>,
    ) -> Result<()> {
        let mut response =
            self.endpoint_inner
                .make_response(&self.original, status_code.clone(), body);
        if status_code != StatusCode::Trying {
            if response.to_header()?.tag()?.is_none() {
                let to = response.to_header()?.typed()?.with_tag(make_tag());
                response.headers.unique_push(Header::To(to.into()));
            }
        }
        for header in headers {
            response.headers.unique_push(header);
        }
        self.respond(response).await
    }

    /// Send (and remember) the ACK for a 2xx to this INVITE. Retransmitted
    /// 2xx responses are answered with the same ACK.
    pub async fn send_ack(&mut self, ack: Request) -> Result<()> {
        if self.transaction_type != TransactionType::ClientInvite {
            return Err(Error::TransactionError(
                "ACK is only sent on client INVITE transactions".to_string(),
                self.key.clone(),
            ));
        }
        self.last_ack.replace(ack.clone());
        self.send_out_of_band(ack.into()).await
    }

    fn classify(&self, msg: &SipMessage) -> Option<TransactionInput> {
        match (self.transaction_type.is_client(), msg) {
            (true, SipMessage::Response(resp)) => Some(match resp.status_code.kind() {
                StatusCodeKind::Provisional => TransactionInput::Provisional,
                StatusCodeKind::Successful => TransactionInput::Success,
                _ => TransactionInput::Failure,
            }),
            (false, SipMessage::Request(req)) => Some(match req.method {
                Method::Ack => TransactionInput::Ack,
                Method::Cancel => TransactionInput::Cancel,
                _ => TransactionInput::RetransmittedRequest,
            }),
            _ => None,
        }
    }

    /// Run the initial transition of a freshly created server transaction.
    pub(crate) async fn on_received_request(&mut self) -> Result<()> {
        self.step(TransactionInput::ReceiveRequest, None)
            .await
            .map(|_| ())
    }

    async fn step(
        &mut self,
        input: TransactionInput,
        msg: Option<SipMessage>,
    ) -> Result<Option<SipMessage>> {
        let Some(next) = transition(self.transaction_type, self.state, input, &self.policy) else {
            trace!(key = %self.key, state = %self.state, ?input, "input ignored");
            return Ok(None);
        };
        if self.state != next.state {
            debug!(key = %self.key, "transition {} -> {}", self.state, next.state);
        }
        self.state = next.state;

        let mut delivered = None;
        let mut failure = None;
        for action in next.actions {
            match action {
                TransactionAction::Transmit => {
                    if let Err(e) = self.transmit().await {
                        self.terminate();
                        return Err(e);
                    }
                }
                TransactionAction::Retransmit => {
                    let msg = if self.transaction_type.is_client() {
                        Some(SipMessage::from(self.original.clone()))
                    } else {
                        self.last_response.clone().map(SipMessage::from)
                    };
                    if let Some(msg) = msg {
                        if let Err(e) = self.send_on_connection(msg).await {
                            warn!(key = %self.key, "retransmit failed: {}", e);
                        }
                    }
                }
                TransactionAction::SendAck => {
                    if let Some(SipMessage::Response(resp)) = &msg {
                        let ack = self
                            .endpoint_inner
                            .make_ack(self.original.uri.clone(), resp)?;
                        self.last_ack.replace(ack.clone());
                        self.send_on_connection(ack.into()).await?;
                    }
                }
                TransactionAction::ResendAck => {
                    if let Some(ack) = self.last_ack.clone() {
                        self.send_on_connection(ack.into()).await?;
                    }
                }
                TransactionAction::SendTrying => {
                    let trying =
                        self.endpoint_inner
                            .make_response(&self.original, StatusCode::Trying, None);
                    self.last_response.replace(trying.clone());
                    self.send_on_connection(trying.into()).await?;
                }
                TransactionAction::SendResponse => {
                    if let Some(SipMessage::Response(resp)) = &msg {
                        self.last_response.replace(resp.clone());
                        self.send_on_connection(resp.clone().into()).await?;
                    }
                }
                TransactionAction::Deliver => delivered = msg.clone(),
                TransactionAction::Schedule(kind, duration) => self.schedule(kind, duration),
                TransactionAction::CancelTimer(kind) => {
                    if let Some(id) = self.timers.remove(&kind) {
                        self.endpoint_inner.timers.cancel(id);
                    }
                }
                TransactionAction::Fail(reason) => {
                    info!(key = %self.key, ?reason, "transaction failed");
                    failure = Some(match reason {
                        TransactionFailure::Timeout => Error::TimeoutError(self.key.clone()),
                        TransactionFailure::Transport => Error::TransactionError(
                            "transport closed".to_string(),
                            self.key.clone(),
                        ),
                    });
                }
                TransactionAction::Terminate => self.terminate(),
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(delivered),
        }
    }

    fn schedule(&mut self, kind: TimerKind, duration: std::time::Duration) {
        let id = self
            .endpoint_inner
            .timers
            .timeout(duration, TransactionTimer::Fire(self.key.clone(), kind));
        if let Some(old) = self.timers.insert(kind, id) {
            self.endpoint_inner.timers.cancel(old);
        }
    }

    fn target(&self) -> Result<SipAddr> {
        if let Some(destination) = &self.destination {
            return Ok(destination.clone());
        }
        if let Some(outbound) = &self.endpoint_inner.transport_layer.outbound {
            return Ok(outbound.clone());
        }
        SipAddr::try_from(&self.original.uri)
    }

    async fn lookup_connection(&self) -> Result<SipConnection> {
        let target = self.target()?;
        let uri = rsip::Uri::from(&target);
        self.endpoint_inner.transport_layer.lookup(&uri).await
    }

    /// Send the original request. A failing transport is closed and the
    /// request goes out once more over whatever transport lookup yields.
    async fn transmit(&mut self) -> Result<()> {
        let target = self.target()?;
        let mut failed_over = false;
        loop {
            let connection = match self.connection.clone() {
                Some(connection) => connection,
                None => {
                    let connection = self.lookup_connection().await?;
                    self.connection = Some(connection.clone());
                    connection
                }
            };
            self.stamp_via(connection.get_addr())?;
            match connection
                .send(self.original.clone().into(), Some(&target))
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if !failed_over => {
                    warn!(key = %self.key, %connection, "send failed, failing over: {}", e);
                    self.endpoint_inner
                        .transport_layer
                        .close_transport(&connection.table_key());
                    self.connection = None;
                    failed_over = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Point the top Via at the transport actually used, keeping the branch.
    fn stamp_via(&mut self, addr: &SipAddr) -> Result<()> {
        let via = self.original.via_header_mut()?;
        let mut typed_via = via.typed()?;
        typed_via.uri.host_with_port = addr.addr.clone();
        typed_via.transport = addr
            .r#type
            .clone()
            .unwrap_or(rsip::transport::Transport::Udp);
        *via = typed_via.into();
        Ok(())
    }

    async fn send_on_connection(&self, msg: SipMessage) -> Result<()> {
        let Some(connection) = &self.connection else {
            return Err(Error::TransactionError(
                "no connection".to_string(),
                self.key.clone(),
            ));
        };
        if self.transaction_type.is_client() {
            let target = self.target()?;
            connection.send(msg, Some(&target)).await
        } else {
            connection.send(msg, None).await
        }
    }

    /// ACK for a 2xx is its own transaction and goes to the remote target.
    async fn send_out_of_band(&mut self, msg: SipMessage) -> Result<()> {
        let SipMessage::Request(req) = &msg else {
            return self.send_on_connection(msg).await;
        };
        let target = match &self.endpoint_inner.transport_layer.outbound {
            Some(outbound) => outbound.clone(),
            None => SipAddr::try_from(&req.uri)?,
        };
        let connection = match &self.connection {
            Some(c) if c.is_reliable() => c.clone(),
            _ => {
                self.endpoint_inner
                    .transport_layer
                    .lookup(&rsip::Uri::from(&target))
                    .await?
            }
        };
        connection.send(msg, Some(&target)).await
    }

    fn terminate(&mut self) {
        self.state = TransactionState::Terminated;
        for (_, id) in self.timers.drain() {
            self.endpoint_inner.timers.cancel(id);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        for (_, id) in self.timers.drain() {
            self.endpoint_inner.timers.cancel(id);
        }
        let last_message = if self.transaction_type.is_client() {
            self.last_ack.clone().map(SipMessage::from)
        } else {
            self.last_response.clone().map(SipMessage::from)
        };
        self.endpoint_inner
            .detach_transaction(&self.key, last_message);
        trace!(key = %self.key, state = %self.state, "transaction dropped");
    }
}

impl std::fmt::Display for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.transaction_type, self.key, self.state)
    }
}
