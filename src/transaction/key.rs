use crate::{Error, Result};
use rsip::headers::UntypedHeader;
use rsip::{
    param::Tag,
    prelude::{HeadersExt, ToTypedHeader},
    HostWithPort, Method,
};
use std::hash::Hash;

/// Which side of the exchange owns the transaction. A UA that sends a
/// request to itself has a client and a server transaction with the same
/// branch, so the role is part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    Client,
    Server,
}

impl std::fmt::Display for TransactionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionRole::Client => write!(f, "c"),
            TransactionRole::Server => write!(f, "s"),
        }
    }
}

/// Key for peers that do not put a magic-cookie branch in their Via.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rfc2543 {
    pub role: TransactionRole,
    pub method: Method,
    pub cseq: u32,
    pub from_tag: Tag,
    pub call_id: String,
    pub via_host_port: HostWithPort,
}

impl Hash for Rfc2543 {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.role.hash(state);
        self.method.to_string().hash(state);
        self.cseq.hash(state);
        self.from_tag.to_string().hash(state);
        self.call_id.hash(state);
        self.via_host_port.to_string().hash(state);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rfc3261 {
    pub role: TransactionRole,
    pub branch: String,
    pub method: Method,
    pub cseq: u32,
    pub from_tag: Tag,
    pub call_id: String,
}

impl Hash for Rfc3261 {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.role.hash(state);
        self.branch.hash(state);
        self.method.to_string().hash(state);
        self.cseq.hash(state);
        self.from_tag.to_string().hash(state);
        self.call_id.hash(state);
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum TransactionKey {
    RFC3261(Rfc3261),
    RFC2543(Rfc2543),
    Invalid,
}

impl std::fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionKey::RFC3261(k) => write!(
                f,
                "{}.{} {}/{} {}({})",
                k.role, k.call_id, k.method, k.cseq, k.from_tag, k.branch,
            ),
            TransactionKey::RFC2543(k) => write!(
                f,
                "{}.{} {}/{} {}[{}]",
                k.role, k.call_id, k.method, k.cseq, k.from_tag, k.via_host_port
            ),
            TransactionKey::Invalid => write!(f, "INVALID"),
        }
    }
}

impl TransactionKey {
    /// ACK for a non-2xx final response and CANCEL share the branch of
    /// the INVITE; both map onto the INVITE transaction via `with_method`.
    pub fn from_request(req: &rsip::Request, role: TransactionRole) -> Result<Self> {
        let via = req.via_header()?.typed()?;
        let method = match req.method() {
            Method::Ack => Method::Invite,
            m => m.clone(),
        };
        let from_tag = req.from_header()?.tag()?.ok_or(Error::TransactionError(
            "from tag missing".to_string(),
            TransactionKey::Invalid,
        ))?;
        let call_id = req.call_id_header()?.value().to_string();
        let cseq = req.cseq_header()?.seq()?;
        match via.branch() {
            Some(branch) => Ok(TransactionKey::RFC3261(Rfc3261 {
                role,
                branch: branch.to_string(),
                method,
                cseq,
                from_tag,
                call_id,
            })),
            None => Ok(TransactionKey::RFC2543(Rfc2543 {
                role,
                method,
                cseq,
                from_tag,
                call_id,
                via_host_port: via.uri.host_with_port,
            })),
        }
    }

    pub fn from_response(resp: &rsip::Response, role: TransactionRole) -> Result<Self> {
        let via = resp.via_header()?.typed()?;
        let cseq = resp.cseq_header()?;
        let method = cseq.method()?;
        let from_tag = resp.from_header()?.tag()?.ok_or(Error::TransactionError(
            "from tag missing".to_string(),
            TransactionKey::Invalid,
        ))?;
        let call_id = resp.call_id_header()?.value().to_string();
        match via.branch() {
            Some(branch) => Ok(TransactionKey::RFC3261(Rfc3261 {
                role,
                branch: branch.to_string(),
                method,
                cseq: cseq.seq()?,
                from_tag,
                call_id,
            })),
            None => Ok(TransactionKey::RFC2543(Rfc2543 {
                role,
                method,
                cseq: cseq.seq()?,
                from_tag,
                call_id,
                via_host_port: via.uri.host_with_port,
            })),
        }
    }

    pub fn with_method(&self, method: Method) -> Self {
        match self {
            TransactionKey::RFC3261(k) => TransactionKey::RFC3261(Rfc3261 {
                method,
                ..k.clone()
            }),
            TransactionKey::RFC2543(k) => TransactionKey::RFC2543(Rfc2543 {
                method,
                ..k.clone()
            }),
            TransactionKey::Invalid => TransactionKey::Invalid,
        }
    }

    pub fn role(&self) -> Option<TransactionRole> {
        match self {
            TransactionKey::RFC3261(k) => Some(k.role),
            TransactionKey::RFC2543(k) => Some(k.role),
            TransactionKey::Invalid => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsip::headers::*;

    fn register_request() -> rsip::Request {
        rsip::Request {
            method: Method::Register,
            uri: rsip::Uri {
                scheme: Some(rsip::Scheme::Sips),
                host_with_port: rsip::Domain::from("example.com").into(),
                ..Default::default()
            },
            headers: vec![
                Via::new("SIP/2.0/TLS client.biloxi.example.com:5061;branch=z9hG4bKnashd92")
                    .into(),
                CSeq::new("2 REGISTER").into(),
                From::new("Bob <sips:bob@biloxi.example.com>;tag=ja743ks76zlflH").into(),
                CallId::new("1j9FpLxk3uxtm8tn@biloxi.example.com").into(),
            ]
            .into(),
            version: rsip::Version::V2,
            body: Default::default(),
        }
    }

    #[test]
    fn test_request_and_response_keys_match() -> Result<()> {
        let req = register_request();
        let key = TransactionKey::from_request(&req, TransactionRole::Client)?;
        assert_eq!(
            key,
            TransactionKey::RFC3261(Rfc3261 {
                role: TransactionRole::Client,
                branch: "z9hG4bKnashd92".to_string(),
                method: Method::Register,
                cseq: 2,
                from_tag: Tag::new("ja743ks76zlflH"),
                call_id: "1j9FpLxk3uxtm8tn@biloxi.example.com".to_string(),
            })
        );

        let resp = rsip::Response {
            status_code: rsip::StatusCode::OK,
            version: rsip::Version::V2,
            headers: req.headers.clone(),
            body: Default::default(),
        };
        assert_eq!(
            TransactionKey::from_response(&resp, TransactionRole::Client)?,
            key
        );
        assert_ne!(
            TransactionKey::from_request(&req, TransactionRole::Server)?,
            key
        );
        Ok(())
    }

    #[test]
    fn test_ack_and_cancel_map_to_invite() -> Result<()> {
        let mut invite = register_request();
        invite.method = Method::Invite;
        invite.headers.unique_push(CSeq::new("2 INVITE").into());
        let invite_key = TransactionKey::from_request(&invite, TransactionRole::Server)?;

        let mut ack = invite.clone();
        ack.method = Method::Ack;
        ack.headers.unique_push(CSeq::new("2 ACK").into());
        assert_eq!(
            TransactionKey::from_request(&ack, TransactionRole::Server)?,
            invite_key
        );

        let mut cancel = invite.clone();
        cancel.method = Method::Cancel;
        cancel.headers.unique_push(CSeq::new("2 CANCEL").into());
        let cancel_key = TransactionKey::from_request(&cancel, TransactionRole::Server)?;
        assert_ne!(cancel_key, invite_key);
        assert_eq!(cancel_key.with_method(Method::Invite), invite_key);
        Ok(())
    }

    #[test]
    fn test_missing_from_tag() {
        let mut req = register_request();
        req.headers
            .unique_push(From::new("Bob <sips:bob@biloxi.example.com>").into());
        assert!(TransactionKey::from_request(&req, TransactionRole::Server).is_err());
    }
}
