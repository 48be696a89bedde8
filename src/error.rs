use crate::{dialog::DialogId, transaction::key::TransactionKey, transport::SipAddr};
use thiserror::Error as ThisError;

#[derive(Debug, Clone, ThisError)]
pub enum Error {
    /// Invalid or incompatible configuration, rejected before any network activity.
    #[error("config error: {0}")]
    ConfigError(String),

    #[error("bind error: {0} ({1})")]
    BindError(String, SipAddr),

    #[error("tls error: {0}")]
    TlsError(String),

    #[error("send error: {0} ({1})")]
    SendError(String, SipAddr),

    #[error("transaction timed out: {0}")]
    TimeoutError(TransactionKey),

    #[error("no common media: {0}")]
    NoCommonMediaError(String),

    #[error("srtp policy violated: {0}")]
    SecurityPolicyError(String),

    #[error("dialog aborted: {0} ({1})")]
    DialogAbortedError(String, DialogId),

    /// Renegotiation collision, the 491 Request Pending case.
    #[error("renegotiation already in progress: {0}")]
    GlobState(DialogId),

    #[error("invalid state: {0}")]
    InvalidStateError(String),

    #[error("call setup failed: {0}")]
    CallSetupError(String),

    #[error("sip message error: {0}")]
    SipMessageError(String),

    #[error("transport layer error: {0} ({1})")]
    TransportLayerError(String, SipAddr),

    #[error("transaction error: {0} ({1})")]
    TransactionError(String, TransactionKey),

    #[error("dialog error: {0} ({1})")]
    DialogError(String, DialogId),

    #[error("registration error: {0}")]
    RegistrationError(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("{0}")]
    Error(String),
}

impl Error {
    /// Errors that abort call setup when they surface from an INVITE.
    pub fn is_call_setup_failure(&self) -> bool {
        matches!(
            self,
            Error::TimeoutError(_)
                | Error::NoCommonMediaError(_)
                | Error::SecurityPolicyError(_)
                | Error::CallSetupError(_)
                | Error::SendError(_, _)
                | Error::TransportLayerError(_, _)
        )
    }
}

impl From<rsip::Error> for Error {
    fn from(e: rsip::Error) -> Self {
        Error::SipMessageError(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(e: std::net::AddrParseError) -> Self {
        Error::Error(e.to_string())
    }
}

impl From<std::fmt::Error> for Error {
    fn from(e: std::fmt::Error) -> Self {
        Error::Error(e.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::TlsError(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Error(e.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Error::Error(format!("lock poisoned: {}", e))
    }
}
