use super::{
    authenticate::Credential,
    client_dialog::ClientInviteDialog,
    dialog::{Dialog, DialogEventSender, DialogInner},
    dialog_layer::DialogLayer,
    DialogId,
};
use crate::{
    media::{MediaDirection, MediaNegotiator, SessionDescription},
    transaction::{
        key::{TransactionKey, TransactionRole},
        make_tag,
        transaction::Transaction,
    },
    transport::SipAddr,
    Result,
};
use rsip::{Header, Request, Response};
use std::sync::Arc;
use tracing::{debug, info};

/// Parameters of an outgoing call.
#[derive(Clone, Debug)]
pub struct InviteOption {
    pub caller: rsip::Uri,
    pub callee: rsip::Uri,
    pub contact: rsip::Uri,
    pub credential: Option<Credential>,
    /// Send the INVITE here instead of the callee's host.
    pub destination: Option<SipAddr>,
    pub headers: Option<Vec<Header>>,
}

impl DialogLayer {
    pub fn make_invite_request(
        &self,
        opt: &InviteOption,
        offer: &SessionDescription,
    ) -> Result<Request> {
        let last_seq = self.increment_last_seq();
        let to = rsip::typed::To {
            display_name: None,
            uri: opt.callee.clone(),
            params: vec![],
        };
        let from = rsip::typed::From {
            display_name: None,
            uri: opt.caller.clone(),
            params: vec![],
        }
        .with_tag(make_tag());

        let via = self.endpoint.get_via(None, None)?;
        let mut request = self.endpoint.make_request(
            rsip::Method::Invite,
            opt.callee.clone(),
            via,
            from,
            to,
            last_seq,
        );

        let contact = rsip::typed::Contact {
            display_name: None,
            uri: opt.contact.clone(),
            params: vec![],
        };
        request
            .headers
            .unique_push(rsip::Header::Contact(contact.into()));
        request
            .headers
            .unique_push(Header::ContentType("application/sdp".into()));
        for header in opt.headers.clone().unwrap_or_default() {
            request.headers.unique_push(header);
        }
        request.body = offer.to_string().into_bytes();
        request.headers.unique_push(Header::ContentLength(
            (request.body.len() as u32).into(),
        ));
        Ok(request)
    }

    /// Build the INVITE with a fresh SDP offer and the caller dialog that
    /// owns it. The transaction is returned unsent; pass it to
    /// `process_client_invite`.
    pub fn create_client_invite_dialog(
        &self,
        opt: InviteOption,
        event_sender: DialogEventSender,
        negotiator: Arc<MediaNegotiator>,
    ) -> Result<(ClientInviteDialog, Transaction)> {
        let offer = negotiator.create_offer(MediaDirection::SendRecv)?;
        let request = self.make_invite_request(&opt, &offer)?;
        let id = DialogId::try_from(&request)?;
        let dlg_inner = DialogInner::new(
            TransactionRole::Client,
            id.clone(),
            request.clone(),
            self.endpoint.clone(),
            event_sender,
            opt.credential,
            Some(opt.contact),
            negotiator,
        )?;
        dlg_inner.local_offer.lock()?.replace(offer);

        let dialog = ClientInviteDialog {
            inner: Arc::new(dlg_inner),
        };
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request, self.endpoint.clone(), None);
        tx.destination = opt.destination;
        self.insert(id.clone(), Dialog::ClientInvite(dialog.clone()))?;
        info!(%id, "client invite dialog created");
        Ok((dialog, tx))
    }

    /// Run the INVITE of `dialog` to its final response and keep the
    /// dialog table keyed by the id the answer established.
    pub async fn process_client_invite(
        &self,
        dialog: &ClientInviteDialog,
        tx: Transaction,
    ) -> Result<Option<Response>> {
        let early_id = dialog.id();
        let result = dialog.process_invite(tx).await;
        let dialog_id = dialog.id();
        debug!(%early_id, %dialog_id, "invite processed");
        if dialog.state().is_terminated() {
            self.remove_dialog(&early_id);
            self.remove_dialog(&dialog_id);
        } else {
            self.rekey(&early_id, Dialog::ClientInvite(dialog.clone()));
        }
        result.map(|(_, resp)| resp)
    }

    /// Create the caller dialog and wait for the call to be answered or
    /// fail.
    pub async fn do_invite(
        &self,
        opt: InviteOption,
        event_sender: DialogEventSender,
        negotiator: Arc<MediaNegotiator>,
    ) -> Result<(ClientInviteDialog, Option<Response>)> {
        let (dialog, tx) = self.create_client_invite_dialog(opt, event_sender, negotiator)?;
        let resp = self.process_client_invite(&dialog, tx).await?;
        Ok((dialog, resp))
    }
}
