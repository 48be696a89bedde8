use super::create_test_endpoint;
use crate::dialog::authenticate::{handle_client_authenticate, Credential};
use crate::transaction::{
    key::{TransactionKey, TransactionRole},
    transaction::Transaction,
};
use rsip::headers::*;
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Request, Response, StatusCode};

const CHALLENGE: &str = r#"Digest realm="example.com", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", algorithm=MD5, qop="auth""#;

fn register_request(branch: &str) -> Request {
    Request {
        method: rsip::Method::Register,
        uri: rsip::Uri::try_from("sip:example.com:5060").expect("uri"),
        headers: vec![
            Via::new(format!(
                "SIP/2.0/UDP alice.example.com:5060;branch={};rport",
                branch
            ))
            .into(),
            CSeq::new("1 REGISTER").into(),
            From::new("Alice <sip:alice@example.com>;tag=1928301774").into(),
            To::new("Alice <sip:alice@example.com>").into(),
            CallId::new("a84b4c76e66710@pc33.atlanta.com").into(),
            MaxForwards::new("70").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: vec![],
    }
}

fn challenge_response(status_code: StatusCode) -> Response {
    let challenge: rsip::Header = match status_code {
        StatusCode::ProxyAuthenticationRequired => ProxyAuthenticate::new(CHALLENGE).into(),
        _ => WwwAuthenticate::new(CHALLENGE).into(),
    };
    Response {
        status_code,
        version: rsip::Version::V2,
        headers: vec![
            Via::new("SIP/2.0/UDP alice.example.com:5060;branch=z9hG4bKnashds").into(),
            CSeq::new("1 REGISTER").into(),
            From::new("Alice <sip:alice@example.com>;tag=1928301774").into(),
            To::new("Alice <sip:alice@example.com>;tag=srv").into(),
            CallId::new("a84b4c76e66710@pc33.atlanta.com").into(),
            challenge,
        ]
        .into(),
        body: vec![],
    }
}

fn credential(realm: Option<&str>) -> Credential {
    Credential {
        username: "alice".to_string(),
        password: "secret123".to_string(),
        realm: realm.map(|r| r.to_string()),
    }
}

fn branch_of(req: &Request) -> String {
    req.via_header()
        .expect("via")
        .typed()
        .expect("typed via")
        .params
        .iter()
        .find_map(|p| match p {
            rsip::Param::Branch(b) => Some(b.to_string()),
            _ => None,
        })
        .expect("branch")
}

#[tokio::test]
async fn test_www_authenticate_challenge() -> crate::Result<()> {
    let endpoint = create_test_endpoint().await?;
    let original = register_request("z9hG4bKoriginal123");
    let key = TransactionKey::from_request(&original, TransactionRole::Client)?;
    let tx = Transaction::new_client(key.clone(), original, endpoint.inner.clone(), None);

    let new_tx = handle_client_authenticate(
        2,
        &tx,
        challenge_response(StatusCode::Unauthorized),
        &credential(None),
    )?;
    let retry = &new_tx.original;
    assert_eq!(retry.cseq_header()?.seq()?, 2);
    assert_ne!(new_tx.key, key);

    let branch = branch_of(retry);
    assert_ne!(branch, "z9hG4bKoriginal123");
    assert!(branch.starts_with("z9hG4bK"));
    let via = retry.via_header()?.typed()?;
    assert!(via.params.iter().any(
        |p| matches!(p, rsip::Param::Other(key, _) if key.value().eq_ignore_ascii_case("rport"))
    ));

    let authorization = retry
        .headers
        .iter()
        .find_map(|h| match h {
            rsip::Header::Authorization(a) => Some(a.value().to_string()),
            _ => None,
        })
        .expect("Authorization header");
    assert!(authorization.contains(r#"username="alice""#));
    assert!(authorization.contains(r#"realm="example.com""#));
    assert!(authorization.contains("qop="));
    assert!(authorization.contains("response="));
    assert!(!retry
        .headers
        .iter()
        .any(|h| matches!(h, rsip::Header::ProxyAuthorization(_))));
    Ok(())
}

#[tokio::test]
async fn test_proxy_authenticate_challenge() -> crate::Result<()> {
    let endpoint = create_test_endpoint().await?;
    let original = register_request("z9hG4bKproxy1");
    let key = TransactionKey::from_request(&original, TransactionRole::Client)?;
    let tx = Transaction::new_client(key, original, endpoint.inner.clone(), None);

    let new_tx = handle_client_authenticate(
        5,
        &tx,
        challenge_response(StatusCode::ProxyAuthenticationRequired),
        &credential(Some("EXAMPLE.com")),
    )?;
    let retry = &new_tx.original;
    assert_eq!(retry.cseq_header()?.seq()?, 5);
    assert!(retry
        .headers
        .iter()
        .any(|h| matches!(h, rsip::Header::ProxyAuthorization(_))));
    assert!(!retry
        .headers
        .iter()
        .any(|h| matches!(h, rsip::Header::Authorization(_))));
    Ok(())
}

#[tokio::test]
async fn test_challenge_for_another_realm() -> crate::Result<()> {
    let endpoint = create_test_endpoint().await?;
    let original = register_request("z9hG4bKrealm1");
    let key = TransactionKey::from_request(&original, TransactionRole::Client)?;
    let tx = Transaction::new_client(key, original, endpoint.inner.clone(), None);

    assert!(handle_client_authenticate(
        2,
        &tx,
        challenge_response(StatusCode::Unauthorized),
        &credential(Some("other.org")),
    )
    .is_err());

    // a 401 without WWW-Authenticate cannot be answered
    let mut bare = challenge_response(StatusCode::Unauthorized);
    bare.headers
        .retain(|h| !matches!(h, rsip::Header::WwwAuthenticate(_)));
    assert!(handle_client_authenticate(2, &tx, bare, &credential(None)).is_err());
    Ok(())
}
