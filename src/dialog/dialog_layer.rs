use super::authenticate::Credential;
use super::dialog::{DialogEventSender, DialogInner};
use super::{dialog::Dialog, server_dialog::ServerInviteDialog, DialogId};
use crate::media::MediaNegotiator;
use crate::transaction::key::TransactionRole;
use crate::transaction::make_tag;
use crate::transaction::{endpoint::EndpointInnerRef, transaction::Transaction};
use crate::{Error, Result};
use rsip::Request;
use std::sync::atomic::{AtomicU32, Ordering};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};
use tracing::info;

pub struct DialogLayerInner {
    pub(super) last_seq: AtomicU32,
    pub(super) dialogs: RwLock<HashMap<DialogId, Dialog>>,
}
pub type DialogLayerInnerRef = Arc<DialogLayerInner>;

/// The table of live dialogs, keyed by `DialogId`.
pub struct DialogLayer {
    pub endpoint: EndpointInnerRef,
    pub inner: DialogLayerInnerRef,
}

impl DialogLayer {
    pub fn new(endpoint: EndpointInnerRef) -> Self {
        Self {
            endpoint,
            inner: Arc::new(DialogLayerInner {
                last_seq: AtomicU32::new(0),
                dialogs: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Create the callee dialog for an initial INVITE and answer its offer.
    /// Fails with the negotiation error when the offer is unacceptable; the
    /// dialog is then never stored and the caller should reply 488.
    pub fn create_server_invite_dialog(
        &self,
        tx: &Transaction,
        event_sender: DialogEventSender,
        credential: Option<Credential>,
        contact: Option<rsip::Uri>,
        negotiator: Arc<MediaNegotiator>,
    ) -> Result<ServerInviteDialog> {
        let mut id = DialogId::try_from(&tx.original)?;
        if !id.to_tag.is_empty() {
            return Err(Error::DialogError(
                "INVITE with a To tag matches no dialog".to_string(),
                id,
            ));
        }
        id.to_tag = make_tag().to_string();

        let dlg_inner = DialogInner::new(
            TransactionRole::Server,
            id.clone(),
            tx.original.clone(),
            self.endpoint.clone(),
            event_sender,
            credential,
            contact,
            negotiator,
        )?;
        let dialog = ServerInviteDialog::new(Arc::new(dlg_inner));
        dialog.attach(tx)?;
        self.inner
            .dialogs
            .write()?
            .insert(id.clone(), Dialog::ServerInvite(dialog.clone()));
        info!(%id, "server invite dialog created");
        Ok(dialog)
    }

    pub fn increment_last_seq(&self) -> u32 {
        self.inner.last_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up a dialog from either side's point of view. A caller dialog
    /// that has not learned the remote tag yet is found by its own tag.
    pub fn get_dialog(&self, id: &DialogId) -> Option<Dialog> {
        let dialogs = self.inner.dialogs.read().ok()?;
        if let Some(dialog) = dialogs.get(id) {
            return Some(dialog.clone());
        }
        let swap_id = id.swapped();
        if let Some(dialog) = dialogs.get(&swap_id) {
            return Some(dialog.clone());
        }
        let early_id = DialogId {
            to_tag: String::new(),
            ..swap_id
        };
        dialogs.get(&early_id).cloned()
    }

    pub fn remove_dialog(&self, id: &DialogId) -> Option<Dialog> {
        let mut dialogs = self.inner.dialogs.write().ok()?;
        let early_id = DialogId {
            to_tag: String::new(),
            ..id.clone()
        };
        let removed = dialogs
            .remove(id)
            .or_else(|| dialogs.remove(&id.swapped()))
            .or_else(|| dialogs.remove(&early_id));
        if removed.is_some() {
            info!(%id, "dialog removed");
        }
        removed
    }

    /// Store `dialog` under its current id in place of `old`.
    pub(super) fn rekey(&self, old: &DialogId, dialog: Dialog) {
        let id = dialog.id();
        if &id == old {
            return;
        }
        if let Ok(mut dialogs) = self.inner.dialogs.write() {
            dialogs.remove(old);
            if !dialog.state().is_terminated() {
                dialogs.insert(id, dialog);
            }
        }
    }

    pub(super) fn insert(&self, id: DialogId, dialog: Dialog) -> Result<()> {
        self.inner.dialogs.write()?.insert(id, dialog);
        Ok(())
    }

    pub fn match_dialog(&self, req: &Request) -> Option<Dialog> {
        let id = DialogId::try_from(req).ok()?;
        self.get_dialog(&id)
    }

    pub fn dialogs(&self) -> Vec<Dialog> {
        self.inner
            .dialogs
            .read()
            .map(|d| d.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.dialogs.read().map(|d| d.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
