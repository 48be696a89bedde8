use super::call::CallHandle;
use crate::{
    dialog::{DialogId, DialogState},
    media::MediaSession,
};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

/// What the application observes, in the order it happened.
#[derive(Debug, Clone)]
pub enum UserAgentEvent {
    /// A new call is ringing. Always delivered before any state change of
    /// the same call.
    IncomingCall(CallHandle),
    CallState(DialogId, DialogState),
    /// Negotiation completed, or a renegotiation replaced the session.
    MediaUpdated(DialogId, Arc<MediaSession>),
    Info {
        id: DialogId,
        content_type: Option<String>,
        body: Vec<u8>,
    },
    /// The peer asked us to call `target` (REFER).
    TransferRequested(DialogId, rsip::Uri),
    Registered {
        server: rsip::Uri,
        expires: u32,
    },
    /// Registration gave up after `attempts` consecutive failures. Calls
    /// in progress are not affected.
    RegistrationLost {
        server: rsip::Uri,
        attempts: u32,
    },
}

impl UserAgentEvent {
    pub fn dialog_id(&self) -> Option<DialogId> {
        match self {
            UserAgentEvent::IncomingCall(call) => Some(call.id()),
            UserAgentEvent::CallState(id, _)
            | UserAgentEvent::MediaUpdated(id, _)
            | UserAgentEvent::Info { id, .. }
            | UserAgentEvent::TransferRequested(id, _) => Some(id.clone()),
            UserAgentEvent::Registered { .. } | UserAgentEvent::RegistrationLost { .. } => None,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(UserAgentEvent) + Send + Sync>;
pub(super) type EventReceiver = UnboundedReceiver<UserAgentEvent>;

/// The single delivery queue and the one handler slot it drains into.
pub(super) struct EventQueue {
    sender: UnboundedSender<UserAgentEvent>,
    handler: RwLock<Option<EventHandler>>,
}

impl EventQueue {
    pub fn new(sender: UnboundedSender<UserAgentEvent>) -> Self {
        EventQueue {
            sender,
            handler: RwLock::new(None),
        }
    }

    pub fn push(&self, event: UserAgentEvent) {
        if self.sender.send(event).is_err() {
            debug!("event queue closed");
        }
    }

    /// Install `handler`, replacing the previous one.
    pub fn set_handler(&self, handler: EventHandler) {
        match self.handler.write() {
            Ok(mut slot) => {
                if slot.replace(handler).is_some() {
                    debug!("event handler replaced");
                }
            }
            Err(e) => warn!("event handler slot poisoned: {}", e),
        }
    }

    pub fn clear_handler(&self) {
        if let Ok(mut slot) = self.handler.write() {
            slot.take();
        }
    }

    pub fn handler(&self) -> Option<EventHandler> {
        self.handler.read().ok().and_then(|slot| slot.clone())
    }

    pub fn has_handler(&self) -> bool {
        self.handler().is_some()
    }

    fn deliver(&self, event: UserAgentEvent) {
        match self.handler() {
            Some(handler) => handler(event),
            None => debug!(?event, "no handler, event dropped"),
        }
    }

    /// Hand queued events to the current handler one at a time.
    pub async fn dispatch(&self, receiver: &mut EventReceiver) {
        while let Some(event) = receiver.recv().await {
            self.deliver(event);
        }
    }

    pub fn drain(&self, receiver: &mut EventReceiver) {
        while let Ok(event) = receiver.try_recv() {
            self.deliver(event);
        }
    }
}
