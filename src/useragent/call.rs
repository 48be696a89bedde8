use crate::{
    dialog::{Dialog, DialogId, DialogState},
    media::MediaSession,
    Error, Result,
};
use rsip::StatusCode;
use std::{fmt, sync::Arc};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

/// Application handle on one call. Cloning is cheap; all clones drive
/// the same dialog.
#[derive(Clone)]
pub struct CallHandle {
    dialog: Dialog,
    direction: CallDirection,
    remote: rsip::Uri,
}

impl CallHandle {
    pub(super) fn new(dialog: Dialog, direction: CallDirection, remote: rsip::Uri) -> Self {
        CallHandle {
            dialog,
            direction,
            remote,
        }
    }

    /// The dialog id. The remote tag is filled in once the peer answers,
    /// the Call-ID never changes.
    pub fn id(&self) -> DialogId {
        self.dialog.id()
    }

    pub fn call_id(&self) -> String {
        self.id().call_id
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn remote_uri(&self) -> &rsip::Uri {
        &self.remote
    }

    pub fn state(&self) -> DialogState {
        self.dialog.state()
    }

    pub fn media(&self) -> Option<Arc<MediaSession>> {
        self.dialog.media()
    }

    fn invalid(&self, operation: &str) -> Error {
        Error::InvalidStateError(format!(
            "cannot {} {:?} call {} in {}",
            operation,
            self.direction,
            self.id(),
            self.state()
        ))
    }

    /// Accept a ringing incoming call.
    pub fn answer(&self) -> Result<()> {
        match &self.dialog {
            Dialog::ServerInvite(dialog) if self.state().can_cancel() => dialog.accept(),
            _ => Err(self.invalid("answer")),
        }
    }

    /// Decline a ringing incoming call with 603.
    pub fn reject(&self) -> Result<()> {
        self.reject_with(StatusCode::Decline)
    }

    pub fn reject_with(&self, status: StatusCode) -> Result<()> {
        match &self.dialog {
            Dialog::ServerInvite(dialog) if self.state().can_cancel() => dialog.reject(status),
            _ => Err(self.invalid("reject")),
        }
    }

    /// CANCEL or decline an unanswered call, BYE an answered one.
    pub async fn hang_up(&self) -> Result<()> {
        if self.state().is_terminated() {
            return Err(self.invalid("hang up"));
        }
        info!(id = %self.id(), "hanging up");
        self.dialog.hangup().await
    }

    pub async fn hold(&self) -> Result<Arc<MediaSession>> {
        if !self.state().is_confirmed() {
            return Err(self.invalid("hold"));
        }
        match &self.dialog {
            Dialog::ServerInvite(dialog) => dialog.hold().await,
            Dialog::ClientInvite(dialog) => dialog.hold().await,
        }
    }

    pub async fn resume(&self) -> Result<Arc<MediaSession>> {
        if !self.state().is_confirmed() {
            return Err(self.invalid("resume"));
        }
        match &self.dialog {
            Dialog::ServerInvite(dialog) => dialog.resume().await,
            Dialog::ClientInvite(dialog) => dialog.resume().await,
        }
    }

    /// Blind transfer: ask the peer to call `target`.
    pub async fn transfer(&self, target: &str) -> Result<()> {
        if !self.state().is_confirmed() {
            return Err(self.invalid("transfer"));
        }
        let target = rsip::Uri::try_from(target)?;
        match &self.dialog {
            Dialog::ServerInvite(dialog) => dialog.refer(&target).await?,
            Dialog::ClientInvite(dialog) => dialog.refer(&target).await?,
        };
        info!(id = %self.id(), %target, "transfer accepted");
        Ok(())
    }

    pub async fn send_info(&self, content_type: &str, body: Vec<u8>) -> Result<()> {
        if !self.state().is_confirmed() {
            return Err(self.invalid("send INFO on"));
        }
        let resp = match &self.dialog {
            Dialog::ServerInvite(dialog) => dialog.info(content_type, body).await?,
            Dialog::ClientInvite(dialog) => dialog.info(content_type, body).await?,
        };
        if resp.status_code.kind() != rsip::StatusCodeKind::Successful {
            return Err(Error::DialogError(
                format!("INFO refused with {}", resp.status_code),
                self.id(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("id", &self.id())
            .field("direction", &self.direction)
            .field("remote", &self.remote.to_string())
            .field("state", &self.state())
            .finish()
    }
}
