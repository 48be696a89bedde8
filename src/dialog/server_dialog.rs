use super::{
    dialog::{DialogInnerRef, DialogInput, DialogState, TerminatedReason},
    DialogId,
};
use crate::{
    media::{MediaSession, SessionDescription, SessionDescriptionExt},
    transaction::{transaction::Transaction, TransactionEvent, TransactionEventSender},
    Error, Result,
};
use rsip::{Header, Method, Request, Response, SipMessage, StatusCode, StatusCodeKind};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callee side of an INVITE dialog.
///
/// The SDP offer is answered when the dialog is created, so a call whose
/// media cannot be agreed is never surfaced. `ringing`, `accept` and
/// `reject` queue responses on the INVITE transaction, which is driven by
/// `handle_invite` in its own task.
#[derive(Clone)]
pub struct ServerInviteDialog {
    pub(super) inner: DialogInnerRef,
    pub(super) tu_sender: Arc<Mutex<Option<TransactionEventSender>>>,
    pub(super) pending: Arc<Mutex<Option<(SessionDescription, MediaSession)>>>,
}

impl ServerInviteDialog {
    pub(super) fn new(inner: DialogInnerRef) -> Self {
        Self {
            inner,
            tu_sender: Arc::new(Mutex::new(None)),
            pending: Arc::new(Mutex::new(None)),
        }
    }

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

    pub fn initial_request(&self) -> Result<Request> {
        Ok(self.inner.initial_request.lock()?.clone())
    }

    /// Bind the dialog to its INVITE transaction and answer the offer.
    pub(super) fn attach(&self, tx: &Transaction) -> Result<()> {
        self.tu_sender.lock()?.replace(tx.tu_sender.clone());
        self.inner
            .endpoint_inner
            .wait_ack(self.id(), tx.key.clone());
        let offer = SessionDescription::from_body(&tx.original.body)?;
        let answered = self
            .inner
            .negotiator
            .answer(&offer, self.inner.preferred_direction())?;
        self.pending.lock()?.replace(answered);
        Ok(())
    }

    fn respond(&self, resp: Response) -> Result<()> {
        let tu_sender = self.tu_sender.lock()?;
        let Some(sender) = tu_sender.as_ref() else {
            return Err(Error::InvalidStateError(format!(
                "INVITE transaction of {} is gone",
                self.id()
            )));
        };
        sender
            .send(TransactionEvent::Respond(resp))
            .map_err(|_| Error::DialogError("INVITE transaction closed".to_string(), self.id()))
    }

    pub fn ringing(&self) -> Result<()> {
        self.inner.transition(DialogInput::Provisional)?;
        let original = self.initial_request()?;
        let resp = self
            .inner
            .make_response(&original, StatusCode::Ringing, None, None);
        self.respond(resp)
    }

    /// Send the 2xx with the SDP answer. The dialog is confirmed when the
    /// ACK arrives.
    pub fn accept(&self) -> Result<()> {
        let answer = match self.pending.lock()?.as_ref() {
            Some((answer, _)) => answer.to_string(),
            None => {
                return Err(Error::InvalidStateError(format!(
                    "{} has no SDP answer",
                    self.id()
                )))
            }
        };
        self.inner.transition(DialogInput::AnswerSent)?;
        let original = self.initial_request()?;
        let headers = vec![Header::ContentType("application/sdp".into())];
        let resp = self.inner.make_response(
            &original,
            StatusCode::OK,
            Some(headers),
            Some(answer.into_bytes()),
        );
        info!(id = %self.id(), "call accepted");
        self.respond(resp)
    }

    pub fn reject(&self, status: StatusCode) -> Result<()> {
        if matches!(
            status.kind(),
            StatusCodeKind::Provisional | StatusCodeKind::Successful
        ) {
            return Err(Error::InvalidStateError(format!(
                "{} is not a rejection",
                status
            )));
        }
        self.inner
            .transition(DialogInput::Terminate(TerminatedReason::LocalReject(
                status.clone(),
            )))?;
        let original = self.initial_request()?;
        let resp = self.inner.make_response(&original, status, None, None);
        self.respond(resp)
    }

    pub async fn bye(&self) -> Result<()> {
        self.inner.bye().await
    }

    /// Reject while unanswered, BYE afterwards.
    pub async fn hangup(&self) -> Result<()> {
        if self.inner.state().can_cancel() {
            self.reject(StatusCode::Decline)
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

    /// Drive the INVITE transaction: queued responses go out, the ACK
    /// confirms the dialog, a CANCEL before the answer ends it with 487. No
    /// ACK for our 2xx ends the dialog with BYE.
    pub async fn handle_invite(&self, mut tx: Transaction) -> Result<()> {
        let result = loop {
            match tx.receive().await {
                Ok(Some(SipMessage::Request(req))) => match req.method {
                    Method::Ack if self.inner.state().waiting_ack() => {
                        if self.inner.transition(DialogInput::Confirm).is_ok() {
                            let answered = self.pending.lock()?.take();
                            if let Some((_, session)) = answered {
                                self.inner.set_media(session);
                            }
                        }
                    }
                    Method::Cancel => {
                        let cancelled = self
                            .inner
                            .transition(DialogInput::Terminate(TerminatedReason::RemoteCancel));
                        if cancelled.is_ok() {
                            info!(id = %self.id(), "call cancelled by caller");
                            self.inner
                                .reply(&mut tx, StatusCode::RequestTerminated, None, None)
                                .await?;
                        }
                    }
                    method => debug!(id = %self.id(), %method, "ignored on INVITE transaction"),
                },
                Ok(Some(_)) => {}
                Ok(None) => break Ok(()),
                Err(e) => {
                    if self.inner.state().waiting_ack() {
                        warn!(id = %self.id(), "no ACK for 2xx: {}", e);
                        self.inner
                            .transition(DialogInput::Terminate(TerminatedReason::Timeout))
                            .ok();
                        self.inner.send_bye().await;
                    } else {
                        self.inner
                            .transition(DialogInput::Terminate(TerminatedReason::TransportFailure))
                            .ok();
                    }
                    break Err(e);
                }
            }
        };
        if let Ok(mut tu_sender) = self.tu_sender.lock() {
            tu_sender.take();
        }
        result
    }
}
