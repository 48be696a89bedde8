use crate::{Error, Result};
use rsip::prelude::{HeadersExt, UntypedHeader};

pub mod authenticate;
pub mod client_dialog;
pub mod dialog;
pub mod dialog_layer;
pub mod invitation;
pub mod registration;
pub mod server_dialog;

pub use dialog::{Dialog, DialogEvent, DialogState, TerminatedReason};
pub use dialog_layer::DialogLayer;

#[cfg(test)]
mod tests;

/// Identifies a dialog by Call-ID and the two tags, oriented the way they
/// appear in the From and To of the initial INVITE. `to_tag` is empty
/// until the callee answers with one.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct DialogId {
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: String,
}

impl DialogId {
    /// The same dialog as seen by the other side.
    pub fn swapped(&self) -> DialogId {
        DialogId {
            call_id: self.call_id.clone(),
            from_tag: self.to_tag.clone(),
            to_tag: self.from_tag.clone(),
        }
    }
}

fn dialog_id_from_headers<T: HeadersExt>(msg: &T) -> Result<DialogId> {
    let call_id = msg.call_id_header()?.value().to_string();
    let from_tag = match msg.from_header()?.tag()? {
        Some(tag) => tag.to_string(),
        None => return Err(Error::Error("from tag not found".to_string())),
    };
    let to_tag = match msg.to_header()?.tag()? {
        Some(tag) => tag.to_string(),
        None => String::new(),
    };
    Ok(DialogId {
        call_id,
        from_tag,
        to_tag,
    })
}

impl TryFrom<&rsip::Request> for DialogId {
    type Error = Error;

    fn try_from(request: &rsip::Request) -> Result<Self> {
        dialog_id_from_headers(request)
    }
}

impl TryFrom<&rsip::Response> for DialogId {
    type Error = Error;

    fn try_from(response: &rsip::Response) -> Result<Self> {
        dialog_id_from_headers(response)
    }
}

impl std::fmt::Display for DialogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.call_id, self.from_tag, self.to_tag)
    }
}
