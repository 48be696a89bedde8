use super::{
    authenticate::{handle_client_authenticate, Credential},
    client_dialog::ClientInviteDialog,
    server_dialog::ServerInviteDialog,
    DialogId,
};
use crate::{
    media::{
        MediaDirection, MediaNegotiator, MediaSession, SessionDescription, SessionDescriptionExt,
    },
    rsip_ext::{parse_name_addr, route_destination, ResponseExt},
    transaction::{
        endpoint::EndpointInnerRef,
        key::{TransactionKey, TransactionRole},
        transaction::Transaction,
    },
    Error, Result,
};
use rsip::{
    headers::Route,
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    typed::{CSeq, Contact},
    Header, Method, Param, Request, Response, SipMessage, StatusCode, StatusCodeKind,
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a dialog ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TerminatedReason {
    LocalCancel,
    RemoteCancel,
    LocalBye,
    RemoteBye,
    /// We answered the INVITE with this final status.
    LocalReject(StatusCode),
    /// The callee answered our INVITE with this final status.
    RemoteReject(StatusCode),
    Timeout,
    TransportFailure,
    MediaFailure(String),
    AuthFailed,
}

/// Lifecycle of an INVITE dialog.
///
/// A caller goes `Idle -> Early -> Confirmed` (2xx received and ACKed). A
/// callee goes `Idle -> Early -> WaitAck` (2xx sent) `-> Confirmed` (ACK
/// received). `Terminated` is final.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DialogState {
    Idle,
    Early,
    WaitAck,
    Confirmed,
    Terminated(TerminatedReason),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DialogInput {
    /// A 1xx with a To tag was sent or received.
    Provisional,
    /// The callee sent its 2xx.
    AnswerSent,
    /// The caller ACKed a 2xx, or the callee received the ACK.
    Confirm,
    Terminate(TerminatedReason),
}

impl DialogState {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, DialogState::Confirmed)
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, DialogState::Terminated(_))
    }

    pub fn can_cancel(&self) -> bool {
        matches!(self, DialogState::Idle | DialogState::Early)
    }

    pub fn waiting_ack(&self) -> bool {
        matches!(self, DialogState::WaitAck)
    }

    /// The state after `input`, or `None` when `input` is not allowed here.
    pub fn transition(&self, input: &DialogInput) -> Option<DialogState> {
        use DialogState::*;
        use TerminatedReason::*;
        match (self, input) {
            (Terminated(_), _) => None,
            (Idle | Early, DialogInput::Provisional) => Some(Early),
            (Idle | Early, DialogInput::AnswerSent) => Some(WaitAck),
            (Idle | Early | WaitAck, DialogInput::Confirm) => Some(Confirmed),
            (
                Idle | Early,
                DialogInput::Terminate(
                    reason @ (LocalCancel | RemoteCancel | LocalReject(_) | RemoteReject(_)),
                ),
            ) => Some(Terminated(reason.clone())),
            (
                _,
                DialogInput::Terminate(LocalCancel | RemoteCancel | LocalReject(_) | RemoteReject(_)),
            ) => None,
            (Idle, DialogInput::Terminate(LocalBye | RemoteBye)) => None,
            (_, DialogInput::Terminate(reason)) => Some(Terminated(reason.clone())),
            _ => None,
        }
    }
}

impl std::fmt::Display for DialogState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialogState::Idle => write!(f, "Idle"),
            DialogState::Early => write!(f, "Early"),
            DialogState::WaitAck => write!(f, "WaitAck"),
            DialogState::Confirmed => write!(f, "Confirmed"),
            DialogState::Terminated(reason) => write!(f, "Terminated({:?})", reason),
        }
    }
}

/// Notifications from a dialog to its owner, in the order they happened.
#[derive(Clone, Debug)]
pub enum DialogEvent {
    State(DialogId, DialogState),
    /// A negotiated media session replaced the previous one.
    Media(DialogId, Arc<MediaSession>),
    Info(DialogId, Request),
    Refer(DialogId, rsip::Uri),
}

pub type DialogEventReceiver = UnboundedReceiver<DialogEvent>;
pub type DialogEventSender = UnboundedSender<DialogEvent>;

pub(super) fn locked<T: Clone>(m: &Mutex<T>) -> T {
    match m.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

pub struct DialogInner {
    pub role: TransactionRole,
    pub cancel_token: CancellationToken,
    pub id: Mutex<DialogId>,
    pub state: Mutex<DialogState>,
    pub local_seq: AtomicU32,
    pub remote_seq: AtomicU32,
    pub from: rsip::typed::From,
    pub to: Mutex<rsip::typed::To>,
    pub local_contact: Option<rsip::Uri>,
    pub remote_uri: Mutex<rsip::Uri>,
    pub route_set: Mutex<Vec<Route>>,
    pub credential: Option<Credential>,
    pub negotiator: Arc<MediaNegotiator>,
    pub(super) media: RwLock<Option<Arc<MediaSession>>>,
    /// Our outstanding offer, until the answer arrives.
    pub(super) local_offer: Mutex<Option<SessionDescription>>,
    pub(super) local_hold: AtomicBool,
    pub(super) cancelled: AtomicBool,
    pub(super) cancel_sent: AtomicBool,
    pub(super) renegotiation: tokio::sync::Mutex<()>,
    pub(super) endpoint_inner: EndpointInnerRef,
    pub(super) event_sender: DialogEventSender,
    pub(super) initial_request: Mutex<Request>,
}

pub type DialogInnerRef = Arc<DialogInner>;

impl DialogInner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: TransactionRole,
        id: DialogId,
        initial_request: Request,
        endpoint_inner: EndpointInnerRef,
        event_sender: DialogEventSender,
        credential: Option<Credential>,
        local_contact: Option<rsip::Uri>,
        negotiator: Arc<MediaNegotiator>,
    ) -> Result<Self> {
        let cseq = initial_request.cseq_header()?.seq()?;
        let from = initial_request.from_header()?.typed()?;
        let mut to = initial_request.to_header()?.typed()?;
        if !id.to_tag.is_empty() && !to.params.iter().any(|p| matches!(p, Param::Tag(_))) {
            to.params.push(Param::Tag(rsip::param::Tag::new(id.to_tag.clone())));
        }

        let (local_seq, remote_seq, remote_uri, route_set) = match role {
            TransactionRole::Client => (cseq, 0, initial_request.uri.clone(), vec![]),
            TransactionRole::Server => {
                let remote_uri = match initial_request.contact_header() {
                    Ok(contact) => parse_name_addr(contact.value())?,
                    Err(_) => from.uri.clone(),
                };
                let route_set = initial_request
                    .headers
                    .iter()
                    .filter_map(|h| match h {
                        Header::RecordRoute(rr) => Some(Route::from(rr.value())),
                        _ => None,
                    })
                    .collect();
                (0, cseq, remote_uri, route_set)
            }
        };

        Ok(Self {
            role,
            cancel_token: CancellationToken::new(),
            id: Mutex::new(id),
            state: Mutex::new(DialogState::Idle),
            local_seq: AtomicU32::new(local_seq),
            remote_seq: AtomicU32::new(remote_seq),
            from,
            to: Mutex::new(to),
            local_contact,
            remote_uri: Mutex::new(remote_uri),
            route_set: Mutex::new(route_set),
            credential,
            negotiator,
            media: RwLock::new(None),
            local_offer: Mutex::new(None),
            local_hold: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            cancel_sent: AtomicBool::new(false),
            renegotiation: tokio::sync::Mutex::new(()),
            endpoint_inner,
            event_sender,
            initial_request: Mutex::new(initial_request),
        })
    }

    pub fn id(&self) -> DialogId {
        locked(&self.id)
    }

    pub fn state(&self) -> DialogState {
        locked(&self.state)
    }

    pub fn is_confirmed(&self) -> bool {
        self.state().is_confirmed()
    }

    pub fn is_terminated(&self) -> bool {
        self.state().is_terminated()
    }

    pub fn media(&self) -> Option<Arc<MediaSession>> {
        self.media.read().ok().and_then(|m| m.clone())
    }

    pub fn get_local_seq(&self) -> u32 {
        self.local_seq.load(Ordering::Relaxed)
    }

    pub fn increment_local_seq(&self) -> u32 {
        self.local_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Our own tag: From tag for the caller, To tag for the callee.
    pub fn local_tag(&self) -> String {
        let id = self.id();
        match self.role {
            TransactionRole::Client => id.from_tag,
            TransactionRole::Server => id.to_tag,
        }
    }

    pub fn remote_tag(&self) -> String {
        let id = self.id();
        match self.role {
            TransactionRole::Client => id.to_tag,
            TransactionRole::Server => id.from_tag,
        }
    }

    /// Apply `input` to the dialog state and notify the owner. Events are
    /// sent under the state lock so they keep the order of the changes.
    pub(super) fn transition(&self, input: DialogInput) -> Result<DialogState> {
        let id = self.id();
        let next = {
            let mut state = self.state.lock()?;
            let Some(next) = state.transition(&input) else {
                return Err(Error::InvalidStateError(format!(
                    "{:?} not allowed in {} ({})",
                    input, state, id
                )));
            };
            if *state != next {
                self.event_sender
                    .send(DialogEvent::State(id.clone(), next.clone()))
                    .ok();
            }
            *state = next.clone();
            next
        };
        debug!(%id, "dialog state -> {}", next);
        if next.is_terminated() {
            self.cancel_token.cancel();
        }
        Ok(next)
    }

    pub(super) fn update_remote_tag(&self, tag: &str) -> Result<()> {
        if tag.is_empty() {
            return Ok(());
        }
        {
            let mut id = self.id.lock()?;
            match self.role {
                TransactionRole::Client => id.to_tag = tag.to_string(),
                TransactionRole::Server => id.from_tag = tag.to_string(),
            }
        }
        if self.role == TransactionRole::Client {
            let mut to = self.to.lock()?;
            to.params.retain(|p| !matches!(p, Param::Tag(_)));
            to.params.push(Param::Tag(rsip::param::Tag::new(tag)));
        }
        Ok(())
    }

    /// Learn the remote target and (for the caller) the route set from a
    /// dialog-establishing response.
    pub(super) fn update_remote_from_response(&self, resp: &Response) -> Result<()> {
        if let Ok(uri) = resp.contact_uri() {
            *self.remote_uri.lock()? = uri;
        }
        if self.role != TransactionRole::Client {
            return Ok(());
        }
        let mut route_set = resp
            .headers
            .iter()
            .filter_map(|h| match h {
                Header::RecordRoute(rr) => Some(Route::from(rr.value())),
                _ => None,
            })
            .collect::<Vec<_>>();
        route_set.reverse();
        *self.route_set.lock()? = route_set;
        Ok(())
    }

    pub(super) fn update_remote_target(&self, req: &Request) -> Result<()> {
        if let Ok(contact) = req.contact_header() {
            *self.remote_uri.lock()? = parse_name_addr(contact.value())?;
        }
        Ok(())
    }

    pub(super) fn make_request(
        &self,
        method: Method,
        cseq: Option<u32>,
        headers: Option<Vec<Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Request> {
        let via = self.endpoint_inner.get_via(None, None)?;
        let seq = cseq.unwrap_or_else(|| self.increment_local_seq());
        let to = locked(&self.to);
        let (from, to) = match self.role {
            TransactionRole::Client => (self.from.clone(), to),
            TransactionRole::Server => (
                rsip::typed::From {
                    display_name: to.display_name,
                    uri: to.uri,
                    params: to.params,
                },
                rsip::typed::To {
                    display_name: self.from.display_name.clone(),
                    uri: self.from.uri.clone(),
                    params: self.from.params.clone(),
                },
            ),
        };

        let mut all_headers = vec![
            Header::Via(via.into()),
            Header::CallId(self.id().call_id.into()),
            Header::From(from.into()),
            Header::To(to.into()),
            Header::CSeq(CSeq { seq, method }.into()),
        ];
        if let Some(contact) = &self.local_contact {
            all_headers.push(Contact::from(contact.clone()).into());
        }
        all_headers.extend(locked(&self.route_set).into_iter().map(Header::Route));
        all_headers.push(Header::MaxForwards(70.into()));
        all_headers.extend(headers.unwrap_or_default());
        all_headers.push(Header::ContentLength(
            body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
        ));
        all_headers.push(Header::UserAgent(
            self.endpoint_inner.user_agent.clone().into(),
        ));

        Ok(Request {
            method,
            uri: locked(&self.remote_uri),
            headers: all_headers.into(),
            body: body.unwrap_or_default(),
            version: rsip::Version::V2,
        })
    }

    /// Response to a request of this dialog, carrying our tag and Contact.
    pub(super) fn make_response(
        &self,
        request: &Request,
        status: StatusCode,
        headers: Option<Vec<Header>>,
        body: Option<Vec<u8>>,
    ) -> Response {
        let mut resp_headers = rsip::Headers::default();
        for header in request.headers.iter() {
            match header {
                Header::Via(_)
                | Header::From(_)
                | Header::CallId(_)
                | Header::CSeq(_)
                | Header::RecordRoute(_) => resp_headers.push(header.clone()),
                Header::To(to) => {
                    let mut to = match to.typed() {
                        Ok(to) => to,
                        Err(e) => {
                            info!("error parsing To header: {}", e);
                            continue;
                        }
                    };
                    if status != StatusCode::Trying
                        && !to.params.iter().any(|p| matches!(p, Param::Tag(_)))
                    {
                        to.params.push(Param::Tag(rsip::param::Tag::new(self.local_tag())));
                    }
                    resp_headers.push(Header::To(to.into()));
                }
                _ => {}
            }
        }
        if let Some(contact) = &self.local_contact {
            resp_headers.push(Contact::from(contact.clone()).into());
        }
        for header in headers.unwrap_or_default() {
            resp_headers.unique_push(header);
        }
        resp_headers.push(Header::ContentLength(
            body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
        ));
        resp_headers.push(Header::Server(self.endpoint_inner.user_agent.clone().into()));
        Response {
            status_code: status,
            headers: resp_headers,
            body: body.unwrap_or_default(),
            version: rsip::Version::V2,
        }
    }

    pub(super) async fn reply(
        &self,
        tx: &mut Transaction,
        status: StatusCode,
        headers: Option<Vec<Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<()> {
        let resp = self.make_response(&tx.original, status, headers, body);
        tx.respond(resp).await
    }

    /// Send a request in its own client transaction and wait for the final
    /// response. A 401/407 is answered once with the dialog credentials.
    pub(super) async fn do_request(&self, request: Request) -> Result<Option<Response>> {
        let method = request.method;
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request, self.endpoint_inner.clone(), None);
        tx.destination = route_destination(&tx.original);
        if let Err(e) = tx.send().await {
            warn!(id = %self.id(), %method, "failed to send request: {}", e);
            return Err(e);
        }
        let mut auth_sent = false;
        while let Some(msg) = tx.receive().await? {
            let SipMessage::Response(resp) = msg else {
                continue;
            };
            match resp.status_code {
                ref s if s.kind() == StatusCodeKind::Provisional => continue,
                StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired => {
                    let Some(cred) = self.credential.as_ref().filter(|_| !auth_sent) else {
                        return Ok(Some(resp));
                    };
                    auth_sent = true;
                    let seq = match method {
                        Method::Cancel => self.get_local_seq(),
                        _ => self.increment_local_seq(),
                    };
                    tx = handle_client_authenticate(seq, &tx, resp, cred)?;
                    tx.send().await?;
                }
                _ => {
                    debug!(id = %self.id(), %method, "request done: {}", resp.status_code);
                    return Ok(Some(resp));
                }
            }
        }
        Ok(None)
    }

    /// A request inside a confirmed dialog. 481, 408 or a transaction
    /// failure ends the dialog and surfaces as `DialogAbortedError`.
    pub(super) async fn request(
        &self,
        method: Method,
        headers: Option<Vec<Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Response> {
        if !self.is_confirmed() {
            return Err(Error::InvalidStateError(format!(
                "{} needs a confirmed dialog, {} is {}",
                method,
                self.id(),
                self.state()
            )));
        }
        let request = self.make_request(method, None, headers, body)?;
        match self.do_request(request).await {
            Ok(Some(resp)) => match resp.status_code {
                StatusCode::CallTransactionDoesNotExist | StatusCode::RequestTimeout => {
                    Err(self.abort(TerminatedReason::TransportFailure, resp.status_code.to_string()))
                }
                _ => Ok(resp),
            },
            Ok(None) => Err(Error::DialogError(
                format!("{} ended without a response", method),
                self.id(),
            )),
            Err(e @ Error::TimeoutError(_)) => Err(self.abort(TerminatedReason::Timeout, e.to_string())),
            Err(e) => Err(self.abort(TerminatedReason::TransportFailure, e.to_string())),
        }
    }

    fn abort(&self, reason: TerminatedReason, detail: String) -> Error {
        warn!(id = %self.id(), ?reason, "dialog aborted: {}", detail);
        self.transition(DialogInput::Terminate(reason)).ok();
        Error::DialogAbortedError(detail, self.id())
    }

    /// BYE without touching the state, for teardown paths that already
    /// decided the outcome.
    pub(super) async fn send_bye(&self) {
        let request = match self.make_request(Method::Bye, None, None, None) {
            Ok(request) => request,
            Err(e) => {
                warn!(id = %self.id(), "failed to build BYE: {}", e);
                return;
            }
        };
        match self.do_request(request).await {
            Ok(resp) => debug!(
                id = %self.id(),
                "BYE answered: {:?}",
                resp.map(|r| r.status_code)
            ),
            Err(e) => warn!(id = %self.id(), "BYE failed: {}", e),
        }
    }

    pub(super) async fn bye(&self) -> Result<()> {
        self.transition(DialogInput::Terminate(TerminatedReason::LocalBye))?;
        self.send_bye().await;
        Ok(())
    }

    pub(super) async fn info(&self, content_type: &str, body: Vec<u8>) -> Result<Response> {
        let headers = vec![Header::ContentType(content_type.into())];
        self.request(Method::Info, Some(headers), Some(body)).await
    }

    pub(super) async fn refer(&self, target: &rsip::Uri) -> Result<Response> {
        let headers = vec![Header::Other(
            "Refer-To".to_string(),
            format!("<{}>", target),
        )];
        let resp = self.request(Method::Refer, Some(headers), None).await?;
        match resp.status_code.kind() {
            StatusCodeKind::Successful => Ok(resp),
            _ => Err(Error::DialogError(
                format!("REFER rejected with {}", resp.status_code),
                self.id(),
            )),
        }
    }

    pub(super) fn set_media(&self, session: MediaSession) -> Arc<MediaSession> {
        let session = Arc::new(session);
        if let Ok(mut media) = self.media.write() {
            media.replace(session.clone());
        }
        info!(id = %self.id(), "media session: {}", session);
        self.event_sender
            .send(DialogEvent::Media(self.id(), session.clone()))
            .ok();
        session
    }

    /// Direction we prefer for the next offer or answer.
    pub(super) fn preferred_direction(&self) -> MediaDirection {
        if self.local_hold.load(Ordering::Relaxed) {
            MediaDirection::SendOnly
        } else {
            MediaDirection::SendRecv
        }
    }

    /// Hold or resume by re-INVITE. A 491 collision is retried once after
    /// a randomized backoff; a second one fails with `GlobState`. A 2xx
    /// whose answer cannot be accepted ends the call with BYE.
    pub(super) async fn renegotiate(&self, hold: bool) -> Result<Arc<MediaSession>> {
        let Ok(_guard) = self.renegotiation.try_lock() else {
            return Err(Error::GlobState(self.id()));
        };
        if !self.is_confirmed() {
            return Err(Error::InvalidStateError(format!(
                "re-INVITE needs a confirmed dialog, {} is {}",
                self.id(),
                self.state()
            )));
        }
        let direction = if hold {
            MediaDirection::SendOnly
        } else {
            MediaDirection::SendRecv
        };
        let mut collided = false;
        loop {
            let offer = self.negotiator.create_offer(direction)?;
            let headers = vec![Header::ContentType("application/sdp".into())];
            let request = self.make_request(
                Method::Invite,
                None,
                Some(headers),
                Some(offer.to_string().into_bytes()),
            )?;
            let resp = match self.do_reinvite(request).await {
                Ok(resp) => resp,
                Err(e @ Error::TimeoutError(_)) => {
                    return Err(self.abort(TerminatedReason::Timeout, e.to_string()))
                }
                Err(e) => return Err(self.abort(TerminatedReason::TransportFailure, e.to_string())),
            };
            match resp.status_code {
                StatusCode::RequestPending if !collided => {
                    collided = true;
                    let backoff = self.glare_backoff();
                    info!(id = %self.id(), ?backoff, "re-INVITE collided, retrying");
                    tokio::time::sleep(backoff).await;
                }
                StatusCode::RequestPending => return Err(Error::GlobState(self.id())),
                StatusCode::CallTransactionDoesNotExist | StatusCode::RequestTimeout => {
                    return Err(self.abort(
                        TerminatedReason::TransportFailure,
                        resp.status_code.to_string(),
                    ))
                }
                ref s if s.kind() == StatusCodeKind::Successful => {
                    let negotiated = SessionDescription::from_body(&resp.body)
                        .and_then(|answer| self.negotiator.negotiate(&offer, &answer));
                    return match negotiated {
                        Ok(session) => {
                            self.local_hold.store(hold, Ordering::Relaxed);
                            Ok(self.set_media(session))
                        }
                        Err(e) => {
                            // the peer already switched to its answer
                            warn!(id = %self.id(), "re-INVITE answer rejected, hanging up: {}", e);
                            self.transition(DialogInput::Terminate(
                                TerminatedReason::MediaFailure(e.to_string()),
                            ))
                            .ok();
                            self.send_bye().await;
                            Err(e)
                        }
                    };
                }
                _ => {
                    return Err(Error::DialogError(
                        format!("re-INVITE rejected with {}", resp.status_code),
                        self.id(),
                    ))
                }
            }
        }
    }

    /// After a 491 the side with the larger local tag yields: it waits
    /// 2.1-4s, the other side 0-2s.
    fn glare_backoff(&self) -> Duration {
        let millis = if self.local_tag() > self.remote_tag() {
            rand::random_range(2100..=4000)
        } else {
            rand::random_range(0..=2000)
        };
        Duration::from_millis(millis)
    }

    /// Send a re-INVITE and ACK its 2xx. Non-2xx finals are ACKed by the
    /// transaction itself.
    async fn do_reinvite(&self, request: Request) -> Result<Response> {
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request, self.endpoint_inner.clone(), None);
        tx.destination = route_destination(&tx.original);
        tx.send().await?;
        while let Some(msg) = tx.receive().await? {
            let SipMessage::Response(resp) = msg else {
                continue;
            };
            match resp.status_code.kind() {
                StatusCodeKind::Provisional => continue,
                StatusCodeKind::Successful => {
                    self.update_remote_from_response(&resp)?;
                    let ack = self
                        .endpoint_inner
                        .make_ack(locked(&self.remote_uri), &resp)?;
                    tx.send_ack(ack).await?;
                    return Ok(resp);
                }
                _ => return Ok(resp),
            }
        }
        Err(Error::DialogError(
            "re-INVITE ended without a response".to_string(),
            self.id(),
        ))
    }

    /// Answer a re-INVITE from the remote side and wait for its ACK. A
    /// re-INVITE during our own renegotiation gets 491.
    async fn handle_reinvite(&self, tx: &mut Transaction) -> Result<()> {
        let Ok(_guard) = self.renegotiation.try_lock() else {
            info!(id = %self.id(), "re-INVITE while renegotiating, 491");
            return self.reply(tx, StatusCode::RequestPending, None, None).await;
        };
        if !self.is_confirmed() {
            return self.reply(tx, StatusCode::RequestPending, None, None).await;
        }
        let answered = SessionDescription::from_body(&tx.original.body).and_then(|offer| {
            self.negotiator
                .answer(&offer, self.preferred_direction())
        });
        let (answer, session) = match answered {
            Ok(answered) => answered,
            Err(e) => {
                info!(id = %self.id(), "re-INVITE not acceptable: {}", e);
                return self
                    .reply(tx, StatusCode::NotAcceptableHere, None, None)
                    .await;
            }
        };
        self.update_remote_target(&tx.original)?;
        self.endpoint_inner
            .wait_ack(DialogId::try_from(&tx.original)?, tx.key.clone());
        let headers = vec![Header::ContentType("application/sdp".into())];
        self.reply(
            tx,
            StatusCode::OK,
            Some(headers),
            Some(answer.to_string().into_bytes()),
        )
        .await?;
        loop {
            match tx.receive().await {
                Ok(Some(SipMessage::Request(req))) if req.method == Method::Ack => {
                    self.set_media(session);
                    return Ok(());
                }
                Ok(Some(_)) => continue,
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!(id = %self.id(), "no ACK for re-INVITE: {}", e);
                    self.transition(DialogInput::Terminate(TerminatedReason::Timeout))
                        .ok();
                    self.send_bye().await;
                    return Err(e);
                }
            }
        }
    }

    /// Serve a request the remote side sent inside this dialog.
    pub(super) async fn handle(&self, tx: &mut Transaction) -> Result<()> {
        let cseq = tx.original.cseq_header()?.seq()?;
        let remote_seq = self.remote_seq.load(Ordering::Relaxed);
        if remote_seq > 0 && cseq <= remote_seq {
            info!(
                id = %self.id(),
                "CSeq {} not above {}, rejecting {}", cseq, remote_seq, tx.original.method
            );
            return self
                .reply(tx, StatusCode::ServerInternalError, None, None)
                .await;
        }
        self.remote_seq.store(cseq, Ordering::Relaxed);

        match tx.original.method {
            Method::Bye => {
                let state = self.state();
                if state.transition(&DialogInput::Terminate(TerminatedReason::RemoteBye)).is_none() {
                    return self
                        .reply(tx, StatusCode::CallTransactionDoesNotExist, None, None)
                        .await;
                }
                self.reply(tx, StatusCode::OK, None, None).await?;
                self.transition(DialogInput::Terminate(TerminatedReason::RemoteBye))?;
                Ok(())
            }
            Method::Invite => self.handle_reinvite(tx).await,
            Method::Info => {
                self.reply(tx, StatusCode::OK, None, None).await?;
                self.event_sender
                    .send(DialogEvent::Info(self.id(), tx.original.clone()))
                    .ok();
                Ok(())
            }
            Method::Refer => {
                let target = tx.original.headers.iter().find_map(|h| match h {
                    Header::Other(name, value)
                        if name.eq_ignore_ascii_case("refer-to")
                            || name.eq_ignore_ascii_case("r") =>
                    {
                        parse_name_addr(value).ok()
                    }
                    _ => None,
                });
                let Some(target) = target else {
                    return self.reply(tx, StatusCode::BadRequest, None, None).await;
                };
                self.reply(tx, StatusCode::Accepted, None, None).await?;
                self.event_sender
                    .send(DialogEvent::Refer(self.id(), target))
                    .ok();
                Ok(())
            }
            Method::Options => self.reply(tx, StatusCode::OK, None, None).await,
            _ => {
                self.reply(tx, StatusCode::MethodNotAllowed, None, None)
                    .await
            }
        }
    }
}

impl std::fmt::Debug for DialogInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} {} {}", self.role, self.id(), self.state())
    }
}

/// A dialog of either role, as kept by the dialog layer.
#[derive(Clone)]
pub enum Dialog {
    ServerInvite(ServerInviteDialog),
    ClientInvite(ClientInviteDialog),
}

impl Dialog {
    pub fn id(&self) -> DialogId {
        self.inner().id()
    }

    pub fn state(&self) -> DialogState {
        self.inner().state()
    }

    pub(super) fn inner(&self) -> &DialogInnerRef {
        match self {
            Dialog::ServerInvite(d) => &d.inner,
            Dialog::ClientInvite(d) => &d.inner,
        }
    }

    pub fn media(&self) -> Option<Arc<MediaSession>> {
        self.inner().media()
    }

    pub async fn handle(&self, tx: &mut Transaction) -> Result<()> {
        self.inner().handle(tx).await
    }

    /// End the dialog whatever its state: CANCEL, reject or BYE.
    pub async fn hangup(&self) -> Result<()> {
        match self {
            Dialog::ServerInvite(d) => d.hangup().await,
            Dialog::ClientInvite(d) => d.hangup().await,
        }
    }
}
