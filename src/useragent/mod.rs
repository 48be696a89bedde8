//! The user agent: one configured endpoint with its transports, the
//! dialogs of its calls, registration refresh and the ordered event feed
//! the application consumes.
use crate::{
    config::{TransportConfig, UserAgentConfig},
    dialog::{
        dialog::{DialogEvent, DialogEventReceiver, DialogEventSender},
        invitation::InviteOption,
        registration::Registration,
        Dialog, DialogLayer,
    },
    media::{MediaBackend, MediaNegotiator, StaticMediaBackend},
    transaction::{
        endpoint::Endpoint, transaction::Transaction, EndpointBuilder, TransactionReceiver,
    },
    transport::{SipAddr, TlsConfig, TransportKind, TransportLayer},
    Error, Result,
};
use rsip::{
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    Header, Method, StatusCode,
};
use std::sync::{Arc, Mutex};
use tokio::{
    select,
    sync::mpsc::unbounded_channel,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod call;
pub mod events;
pub mod registry;
pub use call::{CallDirection, CallHandle};
pub use events::{EventHandler, UserAgentEvent};

use events::{EventQueue, EventReceiver};
use registry::{refresh_registration, RegistrarClient};

pub struct UserAgentInner {
    pub endpoint: Endpoint,
    pub dialog_layer: Arc<DialogLayer>,
    pub config: UserAgentConfig,
    identity: rsip::Uri,
    contact: rsip::Uri,
    /// Codecs, policy and RTP address; each call gets its own copy with
    /// fresh keys from `for_call`.
    negotiator: MediaNegotiator,
    media_backend: Arc<dyn MediaBackend>,
    events: Arc<EventQueue>,
    event_receiver: Mutex<Option<EventReceiver>>,
    dialog_sender: DialogEventSender,
    dialog_receiver: Mutex<Option<DialogEventReceiver>>,
    unusable: Vec<(TransportConfig, Error)>,
    cancel_token: CancellationToken,
    registry_token: CancellationToken,
    registry: Mutex<Option<JoinHandle<()>>>,
}

/// A configured SIP user agent. One per process; clones share it.
///
/// Nothing happens on the network until [`UserAgent::serve`] runs.
#[derive(Clone)]
pub struct UserAgent {
    pub inner: Arc<UserAgentInner>,
}

pub struct UserAgentBuilder {
    config: Option<UserAgentConfig>,
    media_backend: Option<Arc<dyn MediaBackend>>,
    tls_config: Option<TlsConfig>,
    cancel_token: Option<CancellationToken>,
}

impl Default for UserAgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl UserAgentBuilder {
    pub fn new() -> Self {
        UserAgentBuilder {
            config: None,
            media_backend: None,
            tls_config: None,
            cancel_token: None,
        }
    }

    pub fn config(&mut self, config: UserAgentConfig) -> &mut Self {
        self.config.replace(config);
        self
    }

    pub fn media_backend(&mut self, backend: Arc<dyn MediaBackend>) -> &mut Self {
        self.media_backend.replace(backend);
        self
    }

    /// TLS material, in place of the files named by the config.
    pub fn tls_config(&mut self, tls_config: TlsConfig) -> &mut Self {
        self.tls_config.replace(tls_config);
        self
    }

    pub fn cancel_token(&mut self, cancel_token: CancellationToken) -> &mut Self {
        self.cancel_token.replace(cancel_token);
        self
    }

    /// Validate the configuration, then bind the transports. Configuration
    /// errors are reported before any socket is opened. A transport that
    /// fails to bind is left out; it is an error only when none is left.
    pub async fn build(&mut self) -> Result<UserAgent> {
        let config = self
            .config
            .take()
            .ok_or_else(|| Error::ConfigError("no configuration".to_string()))?;
        config.validate()?;
        let identity = config.identity_uri()?;

        let media_backend = self
            .media_backend
            .take()
            .unwrap_or_else(|| Arc::new(StaticMediaBackend::new(config.codecs.clone())));
        let capabilities = media_backend.capabilities();
        let codecs: Vec<_> = config
            .codecs
            .iter()
            .filter(|c| capabilities.iter().any(|cap| cap.matches(c)))
            .cloned()
            .collect();
        if codecs.is_empty() {
            return Err(Error::ConfigError(
                "media backend supports none of the configured codecs".to_string(),
            ));
        }
        let negotiator = MediaNegotiator::new(codecs, config.srtp, config.media_addr());

        let tls_config = match self.tls_config.take() {
            Some(tls_config) => tls_config,
            None => match &config.tls {
                Some(files) => files.load()?,
                None => TlsConfig::default(),
            },
        };

        let cancel_token = self.cancel_token.take().unwrap_or_default();
        let mut transport_layer = TransportLayer::new(cancel_token.child_token());
        transport_layer.outbound = config.outbound_proxy()?;
        let can_listen_tls = tls_config.can_listen();
        transport_layer.set_tls_config(tls_config)?;

        let mut bound: Vec<SipAddr> = vec![];
        let mut unusable = vec![];
        for transport in &config.transports {
            if transport.kind == TransportKind::Tls && !can_listen_tls {
                info!(port = transport.port, "no TLS certificate, TLS is client only");
                continue;
            }
            match transport_layer
                .bind(transport.kind, transport.socket_addr(), transport.external)
                .await
            {
                Ok(addr) => {
                    info!(kind = %transport.kind, %addr, "transport bound");
                    bound.push(addr);
                }
                Err(e) => {
                    warn!(kind = %transport.kind, port = transport.port, "bind failed: {}", e);
                    unusable.push((transport.clone(), e));
                }
            }
        }
        let Some(first) = bound.first() else {
            return Err(match unusable.into_iter().next() {
                Some((_, e)) => e,
                None => Error::ConfigError("no transport could be bound".to_string()),
            });
        };

        let mut contact = rsip::Uri::from(first);
        contact.auth = identity.auth.clone();

        let endpoint = EndpointBuilder::new()
            .user_agent(&config.resolved_user_agent())
            .cancel_token(cancel_token.clone())
            .transport_layer(transport_layer)
            .option(config.endpoint_option())
            .build();
        let dialog_layer = Arc::new(DialogLayer::new(endpoint.inner.clone()));

        let (event_sender, event_receiver) = unbounded_channel();
        let (dialog_sender, dialog_receiver) = unbounded_channel();
        let inner = UserAgentInner {
            endpoint,
            dialog_layer,
            config,
            identity,
            contact,
            negotiator,
            media_backend,
            events: Arc::new(EventQueue::new(event_sender)),
            event_receiver: Mutex::new(Some(event_receiver)),
            dialog_sender,
            dialog_receiver: Mutex::new(Some(dialog_receiver)),
            unusable,
            registry_token: cancel_token.child_token(),
            cancel_token,
            registry: Mutex::new(None),
        };
        Ok(UserAgent {
            inner: Arc::new(inner),
        })
    }
}

impl UserAgent {
    pub fn builder() -> UserAgentBuilder {
        UserAgentBuilder::new()
    }

    /// Install the event handler. There is one slot: a later handler
    /// replaces the earlier one. Without a handler incoming calls are
    /// refused with 480.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(UserAgentEvent) + Send + Sync + 'static,
    {
        self.inner.events.set_handler(Arc::new(handler));
    }

    pub fn clear_event_handler(&self) {
        self.inner.events.clear_handler();
    }

    pub fn identity(&self) -> &rsip::Uri {
        &self.inner.identity
    }

    pub fn contact(&self) -> &rsip::Uri {
        &self.inner.contact
    }

    pub fn local_addrs(&self) -> Vec<SipAddr> {
        self.inner.endpoint.get_addrs()
    }

    /// Configured transports that could not be bound, with the reason.
    pub fn unusable_transports(&self) -> &[(TransportConfig, Error)] {
        &self.inner.unusable
    }

    pub fn calls(&self) -> Vec<CallHandle> {
        self.inner
            .dialog_layer
            .dialogs()
            .into_iter()
            .map(|dialog| self.inner.call_handle(dialog))
            .collect()
    }

    /// Start an outgoing call to `target`. Returns as soon as the INVITE is
    /// on its way; progress arrives as `CallState` events.
    pub fn place_call(&self, target: &str) -> Result<CallHandle> {
        let callee = rsip::Uri::try_from(target)
            .map_err(|e| Error::CallSetupError(format!("bad target {}: {}", target, e)))?;
        let opt = InviteOption {
            caller: self.inner.identity.clone(),
            callee: callee.clone(),
            contact: self.inner.contact.clone(),
            credential: self.inner.config.credential.clone(),
            destination: None,
            headers: None,
        };
        let (dialog, tx) = self
            .inner
            .dialog_layer
            .create_client_invite_dialog(
                opt,
                self.inner.dialog_sender.clone(),
                Arc::new(self.inner.negotiator.for_call()),
            )
            .map_err(|e| Error::CallSetupError(e.to_string()))?;

        let dialog_layer = self.inner.dialog_layer.clone();
        let driver = dialog.clone();
        tokio::spawn(async move {
            match dialog_layer.process_client_invite(&driver, tx).await {
                Ok(Some(resp)) => debug!(id = %driver.id(), "INVITE final {}", resp.status_code),
                Ok(None) => debug!(id = %driver.id(), "INVITE ended without final response"),
                Err(e) if e.is_call_setup_failure() => {
                    warn!(id = %driver.id(), "call setup failed: {}", e)
                }
                Err(e) => warn!(id = %driver.id(), "INVITE failed: {}", e),
            }
        });
        info!(id = %dialog.id(), %callee, "call placed");
        Ok(CallHandle::new(
            Dialog::ClientInvite(dialog),
            CallDirection::Outgoing,
            callee,
        ))
    }

    /// Run the user agent until shutdown: transports, transactions,
    /// incoming requests, dialog events and the delivery queue.
    pub async fn serve(&self) -> Result<()> {
        let incoming = self.inner.endpoint.incoming_transactions()?;
        let mut dialog_receiver = self
            .inner
            .dialog_receiver
            .lock()?
            .take()
            .ok_or_else(|| Error::Error("user agent already serving".to_string()))?;
        let mut event_receiver = self
            .inner
            .event_receiver
            .lock()?
            .take()
            .ok_or_else(|| Error::Error("user agent already serving".to_string()))?;

        self.inner.start_registration()?;

        select! {
            _ = self.inner.endpoint.serve() => {
                info!("endpoint finished");
            }
            r = self.inner.process_incoming(incoming) => {
                info!("incoming loop finished {:?}", r);
            }
            _ = self.inner.process_dialog_events(&mut dialog_receiver) => {
                info!("dialog event loop finished");
            }
            _ = self.inner.events.dispatch(&mut event_receiver) => {
                info!("event queue closed");
            }
            _ = self.inner.cancel_token.cancelled() => {
                info!("user agent cancelled");
            }
        }

        while let Ok(event) = dialog_receiver.try_recv() {
            self.inner.on_dialog_event(event).await;
        }
        self.inner.events.drain(&mut event_receiver);
        Ok(())
    }

    /// Hang up every call, remove the registration, then close the
    /// transports. `serve` returns once this completes.
    pub async fn shutdown(&self) {
        let wait = self.inner.endpoint.inner.option.t1 * 64;
        for dialog in self.inner.dialog_layer.dialogs() {
            if dialog.state().is_terminated() {
                continue;
            }
            let id = dialog.id();
            match timeout(wait, dialog.hangup()).await {
                Ok(Ok(())) => debug!(%id, "hung up on shutdown"),
                Ok(Err(e)) => warn!(%id, "hangup on shutdown failed: {}", e),
                Err(_) => warn!(%id, "hangup on shutdown timed out"),
            }
        }

        self.inner.registry_token.cancel();
        let registry = self.inner.registry.lock().ok().and_then(|mut r| r.take());
        if let Some(registry) = registry {
            if timeout(wait, registry).await.is_err() {
                warn!("unregister timed out");
            }
        }
        self.inner.cancel_token.cancel();
        info!("user agent shut down");
    }
}

impl UserAgentInner {
    fn call_handle(&self, dialog: Dialog) -> CallHandle {
        let (direction, remote) = match &dialog {
            Dialog::ServerInvite(d) => (
                CallDirection::Incoming,
                d.initial_request()
                    .ok()
                    .and_then(|req| req.from_header().ok().and_then(|h| h.typed().ok()))
                    .map(|from| from.uri)
                    .unwrap_or_default(),
            ),
            Dialog::ClientInvite(d) => (
                CallDirection::Outgoing,
                d.initial_request()
                    .map(|req| req.uri)
                    .unwrap_or_default(),
            ),
        };
        CallHandle::new(dialog, direction, remote)
    }

    fn start_registration(&self) -> Result<()> {
        let Some(config) = self.config.registration.clone() else {
            return Ok(());
        };
        let server = config.server_uri()?;
        let registration = Registration::new(
            self.endpoint.inner.clone(),
            self.identity.clone(),
            self.contact.clone(),
            self.config.credential.clone(),
        );
        let task = tokio::spawn(refresh_registration(
            RegistrarClient::new(registration, server),
            config,
            self.events.clone(),
            self.registry_token.clone(),
        ));
        self.registry.lock()?.replace(task);
        Ok(())
    }

    async fn process_incoming(&self, mut incoming: TransactionReceiver) -> Result<()> {
        while let Some(mut tx) = incoming.recv().await {
            debug!(key = %tx.key, "incoming transaction");
            let in_dialog = matches!(tx.original.to_header().and_then(|h| h.tag()), Ok(Some(_)));
            if in_dialog {
                match self.dialog_layer.match_dialog(&tx.original) {
                    Some(dialog) => {
                        tokio::spawn(async move {
                            if let Err(e) = dialog.handle(&mut tx).await {
                                warn!(id = %dialog.id(), "in-dialog request failed: {}", e);
                            }
                        });
                    }
                    None => {
                        info!(key = %tx.key, "no dialog for request");
                        reply(&mut tx, StatusCode::CallTransactionDoesNotExist).await;
                    }
                }
                continue;
            }

            match tx.original.method {
                Method::Invite => self.on_invite(tx).await,
                Method::Options => {
                    let allow = Header::Allow(
                        "INVITE, ACK, CANCEL, BYE, INFO, REFER, OPTIONS".into(),
                    );
                    if let Err(e) = tx.reply_with(StatusCode::OK, vec![allow], None).await {
                        warn!(key = %tx.key, "OPTIONS reply failed: {}", e);
                    }
                }
                Method::Ack => {}
                Method::Bye | Method::Cancel | Method::Info | Method::Refer => {
                    reply(&mut tx, StatusCode::CallTransactionDoesNotExist).await;
                }
                _ => reply(&mut tx, StatusCode::MethodNotAllowed).await,
            }
        }
        Ok(())
    }

    async fn on_invite(&self, mut tx: Transaction) {
        if !self.events.has_handler() {
            info!(key = %tx.key, "no handler for incoming calls");
            reply(&mut tx, StatusCode::TemporarilyUnavailable).await;
            return;
        }
        let dialog = match self.dialog_layer.create_server_invite_dialog(
            &tx,
            self.dialog_sender.clone(),
            self.config.credential.clone(),
            Some(self.contact.clone()),
            Arc::new(self.negotiator.for_call()),
        ) {
            Ok(dialog) => dialog,
            Err(e) => {
                let status = match e {
                    Error::NoCommonMediaError(_) | Error::SecurityPolicyError(_) => {
                        StatusCode::NotAcceptableHere
                    }
                    _ => StatusCode::BadRequest,
                };
                info!(key = %tx.key, %status, "incoming call refused: {}", e);
                reply(&mut tx, status).await;
                return;
            }
        };

        let call = self.call_handle(Dialog::ServerInvite(dialog.clone()));
        info!(id = %call.id(), from = %call.remote_uri(), "incoming call");
        self.events.push(UserAgentEvent::IncomingCall(call));
        if let Err(e) = dialog.ringing() {
            warn!(id = %dialog.id(), "ringing failed: {}", e);
        }
        tokio::spawn(async move {
            if let Err(e) = dialog.handle_invite(tx).await {
                warn!(id = %dialog.id(), "INVITE transaction failed: {}", e);
            }
        });
    }

    async fn process_dialog_events(&self, receiver: &mut DialogEventReceiver) {
        while let Some(event) = receiver.recv().await {
            self.on_dialog_event(event).await;
        }
    }

    /// Translate one dialog event for the application and keep media and
    /// the dialog table in step with it.
    async fn on_dialog_event(&self, event: DialogEvent) {
        match event {
            DialogEvent::State(id, state) => {
                let terminated = state.is_terminated();
                self.events
                    .push(UserAgentEvent::CallState(id.clone(), state));
                if terminated {
                    if let Some(dialog) = self.dialog_layer.remove_dialog(&id) {
                        if let Some(session) = dialog.media() {
                            if let Err(e) = self.media_backend.release(session).await {
                                warn!(%id, "media release failed: {}", e);
                            }
                        }
                    }
                }
            }
            DialogEvent::Media(id, session) => {
                if let Err(e) = self.media_backend.apply(session.clone()).await {
                    warn!(%id, "media apply failed: {}", e);
                }
                self.events.push(UserAgentEvent::MediaUpdated(id, session));
            }
            DialogEvent::Info(id, req) => {
                let content_type = req.headers.iter().find_map(|h| match h {
                    Header::ContentType(c) => Some(c.value().to_string()),
                    _ => None,
                });
                self.events.push(UserAgentEvent::Info {
                    id,
                    content_type,
                    body: req.body,
                });
            }
            DialogEvent::Refer(id, target) => {
                self.events
                    .push(UserAgentEvent::TransferRequested(id, target));
            }
        }
    }
}

async fn reply(tx: &mut Transaction, status: StatusCode) {
    if let Err(e) = tx.reply(status.clone()).await {
        warn!(key = %tx.key, %status, "reply failed: {}", e);
    }
}
