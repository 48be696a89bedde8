use crate::transaction::{
    key::{TransactionKey, TransactionRole},
    make_via_branch, random_text,
    transaction::Transaction,
};
use crate::{Error, Result};
use rsip::headers::auth::AuthQop;
use rsip::prelude::{HasHeaders, HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::services::DigestGenerator;
use rsip::typed::{Authorization, ProxyAuthorization};
use rsip::{Header, Param, Response, StatusCode};
use serde::Deserialize;

const CNONCE_LEN: usize = 8;

/// Digest credentials for registrar and proxy challenges.
#[derive(Clone, Debug, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub realm: Option<String>,
}

/// The challenge of a 401 or 407, as a typed WWW-Authenticate.
fn challenge_of(resp: &Response) -> Result<rsip::typed::WwwAuthenticate> {
    let challenge = resp.headers().iter().find_map(|h| match h {
        Header::WwwAuthenticate(h) if resp.status_code == StatusCode::Unauthorized => {
            Some(h.typed())
        }
        Header::ProxyAuthenticate(h)
            if resp.status_code == StatusCode::ProxyAuthenticationRequired =>
        {
            Some(rsip::headers::WwwAuthenticate::new(h.value()).typed())
        }
        _ => None,
    });
    match challenge {
        Some(challenge) => Ok(challenge?),
        None => Err(Error::Error(format!(
            "{} without a matching authenticate header",
            resp.status_code
        ))),
    }
}

/// Answer a 401/407 challenge: the request of `tx` is copied with the
/// given CSeq, a fresh branch and the computed Authorization (401) or
/// Proxy-Authorization (407). The returned transaction is not sent yet.
pub fn handle_client_authenticate(
    new_seq: u32,
    tx: &Transaction,
    resp: Response,
    cred: &Credential,
) -> Result<Transaction> {
    let challenge = challenge_of(&resp)?;
    if let Some(realm) = &cred.realm {
        if !realm.eq_ignore_ascii_case(&challenge.realm) {
            return Err(Error::Error(format!(
                "challenge realm {} does not match {}",
                challenge.realm, realm
            )));
        }
    }

    let mut new_req = tx.original.clone();
    new_req.cseq_header_mut()?.mut_seq(new_seq)?;

    let auth_qop = challenge.qop.as_ref().map(|_| AuthQop::Auth {
        cnonce: random_text(CNONCE_LEN),
        nc: 1,
    });

    let generator = DigestGenerator {
        username: cred.username.as_str(),
        password: cred.password.as_str(),
        algorithm: challenge.algorithm.unwrap_or_default(),
        nonce: challenge.nonce.as_str(),
        method: &tx.original.method,
        qop: auth_qop.as_ref(),
        uri: &tx.original.uri,
        realm: challenge.realm.as_str(),
    };

    let auth = Authorization {
        scheme: challenge.scheme,
        username: cred.username.clone(),
        realm: challenge.realm.clone(),
        nonce: challenge.nonce.clone(),
        uri: tx.original.uri.clone(),
        response: generator.compute(),
        algorithm: challenge.algorithm,
        opaque: challenge.opaque,
        qop: auth_qop,
    };

    let mut via = tx.original.via_header()?.typed()?;
    via.params.retain(|p| !matches!(p, Param::Branch(_)));
    via.params.push(make_via_branch());
    new_req.headers_mut().unique_push(Header::Via(via.into()));

    new_req.headers_mut().retain(|h| {
        !matches!(
            h,
            Header::Authorization(_) | Header::ProxyAuthorization(_)
        )
    });
    match resp.status_code {
        StatusCode::ProxyAuthenticationRequired => new_req
            .headers_mut()
            .push(Header::ProxyAuthorization(ProxyAuthorization(auth).into())),
        _ => new_req
            .headers_mut()
            .push(Header::Authorization(auth.into())),
    }

    let key = TransactionKey::from_request(&new_req, TransactionRole::Client)?;
    Ok(Transaction::new_client(
        key,
        new_req,
        tx.endpoint_inner.clone(),
        tx.connection.clone(),
    ))
}
