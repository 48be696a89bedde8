use crate::transport::SipConnection;
use rand::{distr::Alphanumeric, Rng};
use rsip::{prelude::UntypedHeader, SipMessage};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub mod endpoint;
pub mod key;
pub mod message;
pub mod state;
pub mod timer;
pub mod transaction;
pub use endpoint::{Endpoint, EndpointBuilder, EndpointInner, EndpointInnerRef, EndpointOption};
pub use state::{TimerKind, TransactionState, TransactionType};
pub use transaction::Transaction;

#[cfg(test)]
mod tests;

pub const TO_TAG_LEN: usize = 8;
pub const BRANCH_LEN: usize = 12;
pub const CALL_ID_LEN: usize = 22;
pub const BRANCH_PREFIX: &str = "z9hG4bK";

/// Events posted to a live transaction by the endpoint, or by a
/// transaction user that does not own it (`Respond`).
#[derive(Debug)]
pub enum TransactionEvent {
    Received(SipMessage, Option<SipConnection>),
    Respond(rsip::Response),
    Timer(TimerKind),
    TransportClosed(crate::transport::SipAddr),
    /// A CANCEL for this INVITE went out.
    Cancelled,
    Terminate,
}

pub type TransactionEventReceiver = UnboundedReceiver<TransactionEvent>;
pub type TransactionEventSender = UnboundedSender<TransactionEvent>;
pub type TransactionReceiver = UnboundedReceiver<Transaction>;
pub type TransactionSender = UnboundedSender<Transaction>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransactionTimer {
    Fire(key::TransactionKey, TimerKind),
    Cleanup(key::TransactionKey),
}

impl TransactionTimer {
    pub fn key(&self) -> &key::TransactionKey {
        match self {
            TransactionTimer::Fire(key, _) => key,
            TransactionTimer::Cleanup(key) => key,
        }
    }
}

impl std::fmt::Display for TransactionTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionTimer::Fire(key, kind) => write!(f, "{}: {}", kind, key),
            TransactionTimer::Cleanup(key) => write!(f, "TimerCleanup: {}", key),
        }
    }
}

static BRANCH_COUNTER: AtomicU64 = AtomicU64::new(1);

pub fn random_text(count: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(count)
        .map(char::from)
        .collect()
}

/// A branch that is unique for the life of the process: random text plus
/// a monotonically increasing counter.
pub fn make_via_branch() -> rsip::Param {
    let seq = BRANCH_COUNTER.fetch_add(1, Ordering::Relaxed);
    rsip::Param::Branch(rsip::param::Branch::new(format!(
        "{}{}.{:x}",
        BRANCH_PREFIX,
        random_text(BRANCH_LEN),
        seq
    )))
}

pub fn make_call_id(domain: Option<&str>) -> rsip::headers::CallId {
    match domain {
        Some(domain) => rsip::headers::CallId::new(format!("{}@{}", random_text(CALL_ID_LEN), domain)),
        None => rsip::headers::CallId::new(random_text(CALL_ID_LEN)),
    }
}

pub fn make_tag() -> rsip::param::Tag {
    rsip::param::Tag::new(random_text(TO_TAG_LEN))
}
