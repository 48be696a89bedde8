use super::{
    authenticate::handle_client_authenticate,
    dialog::{locked, DialogInnerRef, DialogInput, DialogState, TerminatedReason},
    DialogId,
};
use crate::{
    media::{MediaSession, SessionDescription, SessionDescriptionExt},
    transaction::{
        key::{TransactionKey, TransactionRole},
        transaction::Transaction,
    },
    Error, Result,
};
use rsip::{
    prelude::HeadersExt, Header, Method, Response, SipMessage, StatusCode, StatusCodeKind,
};
use std::sync::{atomic::Ordering, Arc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Caller side of an INVITE dialog.
///
/// Created by [`super::DialogLayer::create_client_invite_dialog`] together
/// with the INVITE transaction, which is then driven by `process_invite`.
#[derive(Clone)]
pub struct ClientInviteDialog {
    pub(super) inner: DialogInnerRef,
}

impl ClientInviteDialog {
    pub fn id(&self) -> DialogId {
        self.inner.id()
    }

    pub fn state(&self) -> DialogState {
        self.inner.state()
    }

    pub fn media(&self) -> Option<Arc<MediaSession>> {
        self.inner.media()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel_token
    }

    /// The INVITE as last sent, credentials included.
    pub fn initial_request(&self) -> Result<rsip::Request> {
        Ok(self.inner.initial_request.lock()?.clone())
    }

    /// CANCEL the pending INVITE. Before any provisional response the
    /// CANCEL is held back and goes out with the first one.
    pub async fn cancel(&self) -> Result<()> {
        let send_now = {
            let state = self.inner.state.lock()?;
            match *state {
                DialogState::Idle => false,
                DialogState::Early => true,
                ref state => {
                    return Err(Error::InvalidStateError(format!(
                        "cannot cancel {} in {}",
                        self.inner.id(),
                        state
                    )))
                }
            }
        };
        self.inner.cancelled.store(true, Ordering::SeqCst);
        if send_now {
            self.send_cancel().await?;
        } else {
            info!(id = %self.id(), "cancel deferred until a provisional response");
        }
        Ok(())
    }

    pub async fn bye(&self) -> Result<()> {
        self.inner.bye().await
    }

    pub async fn hangup(&self) -> Result<()> {
        if self.inner.state().can_cancel() {
            self.cancel().await
        } else {
            self.inner.bye().await
        }
    }

    pub async fn info(&self, content_type: &str, body: Vec<u8>) -> Result<Response> {
        self.inner.info(content_type, body).await
    }

    pub async fn refer(&self, target: &rsip::Uri) -> Result<Response> {
        self.inner.refer(target).await
    }

    pub async fn hold(&self) -> Result<Arc<MediaSession>> {
        self.inner.renegotiate(true).await
    }

    pub async fn resume(&self) -> Result<Arc<MediaSession>> {
        self.inner.renegotiate(false).await
    }

    pub async fn handle(&self, tx: &mut Transaction) -> Result<()> {
        self.inner.handle(tx).await
    }

    /// CANCEL mirrors the INVITE as sent: same branch, Call-ID, From, To
    /// and CSeq number. Sent at most once. The INVITE gives up 64*T1
    /// later if no final response arrives.
    async fn send_cancel(&self) -> Result<()> {
        if self.inner.cancel_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let invite = locked(&self.inner.initial_request);
        let invite_key = TransactionKey::from_request(&invite, TransactionRole::Client)?;
        let mut cancel = invite;
        cancel.method = Method::Cancel;
        cancel.body.clear();
        cancel.headers.retain(|h| {
            matches!(
                h,
                Header::Via(_)
                    | Header::CallId(_)
                    | Header::From(_)
                    | Header::To(_)
                    | Header::CSeq(_)
                    | Header::Route(_)
                    | Header::MaxForwards(_)
            )
        });
        cancel.cseq_header_mut()?.mut_method(Method::Cancel)?;
        cancel
            .headers
            .push(Header::ContentLength(Default::default()));
        cancel.headers.push(Header::UserAgent(
            self.inner.endpoint_inner.user_agent.clone().into(),
        ));
        self.inner
            .endpoint_inner
            .invite_cancelled(&invite_key);
        match self.inner.do_request(cancel).await {
            Ok(Some(resp)) => info!(id = %self.id(), "CANCEL answered with {}", resp.status_code),
            Ok(None) => warn!(id = %self.id(), "CANCEL got no response"),
            Err(e) => warn!(id = %self.id(), "CANCEL failed: {}", e),
        }
        Ok(())
    }

    fn cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Drive the INVITE transaction until a final response. Returns the
    /// dialog id (with the remote tag once known) and the final response;
    /// a 2xx whose SDP answer cannot be accepted is ACKed, hung up with BYE
    /// and reported as the negotiation error.
    pub async fn process_invite(
        &self,
        mut tx: Transaction,
    ) -> Result<(DialogId, Option<Response>)> {
        if let Err(e) = tx.send().await {
            self.inner
                .transition(DialogInput::Terminate(TerminatedReason::TransportFailure))
                .ok();
            return Err(e);
        }
        *self.inner.initial_request.lock()? = tx.original.clone();

        let mut auth_sent = false;
        loop {
            let msg = match tx.receive().await {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) => {
                    let reason = match e {
                        _ if self.cancelled() => TerminatedReason::LocalCancel,
                        Error::TimeoutError(_) => TerminatedReason::Timeout,
                        _ => TerminatedReason::TransportFailure,
                    };
                    self.inner.transition(DialogInput::Terminate(reason)).ok();
                    return Err(e);
                }
            };
            let SipMessage::Response(resp) = msg else {
                continue;
            };
            match resp.status_code.kind() {
                StatusCodeKind::Provisional => {
                    if resp.status_code != StatusCode::Trying {
                        self.on_provisional(&resp).await?;
                    }
                }
                StatusCodeKind::Successful => return self.on_answered(&mut tx, resp).await,
                _ => {
                    let challenged = matches!(
                        resp.status_code,
                        StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired
                    );
                    if challenged && !auth_sent && !self.cancelled() {
                        if let Some(cred) = &self.inner.credential {
                            auth_sent = true;
                            let seq = self.inner.increment_local_seq();
                            tx = handle_client_authenticate(seq, &tx, resp, cred)?;
                            if let Err(e) = tx.send().await {
                                self.inner
                                    .transition(DialogInput::Terminate(
                                        TerminatedReason::TransportFailure,
                                    ))
                                    .ok();
                                return Err(e);
                            }
                            *self.inner.initial_request.lock()? = tx.original.clone();
                            continue;
                        }
                    }
                    let reason = if self.cancelled() {
                        TerminatedReason::LocalCancel
                    } else if challenged {
                        TerminatedReason::AuthFailed
                    } else {
                        TerminatedReason::RemoteReject(resp.status_code.clone())
                    };
                    info!(id = %self.id(), "call failed with {}", resp.status_code);
                    self.inner.transition(DialogInput::Terminate(reason)).ok();
                    return Ok((self.id(), Some(resp)));
                }
            }
        }
        Ok((self.id(), None))
    }

    async fn on_provisional(&self, resp: &Response) -> Result<()> {
        if let Some(tag) = resp.to_header()?.tag()? {
            self.inner.update_remote_tag(&tag.to_string())?;
        }
        self.inner.transition(DialogInput::Provisional).ok();
        if self.cancelled() {
            // keep reading responses to the INVITE while the CANCEL runs
            let dialog = self.clone();
            tokio::spawn(async move {
                if let Err(e) = dialog.send_cancel().await {
                    warn!(id = %dialog.id(), "deferred CANCEL failed: {}", e);
                }
            });
        }
        Ok(())
    }

    async fn on_answered(
        &self,
        tx: &mut Transaction,
        resp: Response,
    ) -> Result<(DialogId, Option<Response>)> {
        if let Some(tag) = resp.to_header()?.tag()? {
            self.inner.update_remote_tag(&tag.to_string())?;
        }
        self.inner.update_remote_from_response(&resp)?;
        let ack = self
            .inner
            .endpoint_inner
            .make_ack(locked(&self.inner.remote_uri), &resp)?;
        if let Err(e) = tx.send_ack(ack).await {
            warn!(id = %self.id(), "failed to send ACK: {}", e);
        }

        if self.cancelled() {
            info!(id = %self.id(), "answered after CANCEL, hanging up");
            self.inner
                .transition(DialogInput::Terminate(TerminatedReason::LocalCancel))
                .ok();
            self.inner.send_bye().await;
            return Ok((self.id(), Some(resp)));
        }

        let offer = self.inner.local_offer.lock()?.take();
        let negotiated = match offer {
            Some(offer) => SessionDescription::from_body(&resp.body)
                .and_then(|answer| self.inner.negotiator.negotiate(&offer, &answer)),
            None => Err(Error::NoCommonMediaError("no offer was sent".to_string())),
        };
        match negotiated {
            Ok(session) => {
                self.inner.transition(DialogInput::Confirm)?;
                self.inner.set_media(session);
                Ok((self.id(), Some(resp)))
            }
            Err(e) => {
                warn!(id = %self.id(), "answer rejected, hanging up: {}", e);
                self.inner
                    .transition(DialogInput::Terminate(TerminatedReason::MediaFailure(
                        e.to_string(),
                    )))
                    .ok();
                self.inner.send_bye().await;
                Err(e)
            }
        }
    }
}
