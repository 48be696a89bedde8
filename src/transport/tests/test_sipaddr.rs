use crate::transport::{SipAddr, SipConnection};
use rsip::{
    headers::*,
    prelude::{HeadersExt, UntypedHeader},
    HostWithPort, SipMessage,
};
use std::net::SocketAddr;

fn register_with_via(via: &str) -> rsip::Request {
    rsip::Request {
        method: rsip::Method::Register,
        uri: rsip::Uri::try_from("sip:127.0.0.1:2025").expect("uri"),
        headers: vec![Via::new(via).into()].into(),
        version: rsip::Version::V2,
        body: Default::default(),
    }
}

#[test]
fn test_via_received_and_rport() {
    let req = register_with_via("SIP/2.0/UDP restsend.com:5061;branch=z9hG4bKnashd92;rport");
    let target = SipConnection::parse_target_from_via(req.via_header().expect("via"))
        .expect("parse_target_from_via");
    assert_eq!(
        target,
        HostWithPort {
            host: "restsend.com".parse().expect("host"),
            port: Some(5061.into()),
        }
    );

    let source: SocketAddr = "192.168.1.100:40000".parse().expect("addr");
    let msg = SipConnection::update_msg_received(req.into(), source).expect("update");
    let SipMessage::Request(req) = msg else {
        panic!("expected request");
    };
    let target = SipConnection::parse_target_from_via(req.via_header().expect("via"))
        .expect("parse_target_from_via");
    assert_eq!(target, source.into());
    // exactly one rport survives
    let via = req.via_header().expect("via").value().to_string();
    assert_eq!(via.matches("rport").count(), 1, "{}", via);
}

#[test]
fn test_via_unchanged_when_source_matches() {
    let req = register_with_via("SIP/2.0/TCP 127.0.0.1:5060;branch=z9hG4bKsame");
    let source: SocketAddr = "127.0.0.1:5060".parse().expect("addr");
    let msg = SipConnection::update_msg_received(req.clone().into(), source).expect("update");
    let SipMessage::Request(updated) = msg else {
        panic!("expected request");
    };
    assert_eq!(
        updated.via_header().expect("via").value(),
        req.via_header().expect("via").value()
    );
}

#[test]
fn test_sipaddr_from_uri() {
    let uri = rsip::Uri::try_from("sip:proxy1.example.org:25060;transport=tcp").expect("uri");
    let addr = SipAddr::try_from(&uri).expect("SipAddr::try_from");
    assert_eq!(addr.r#type, Some(rsip::transport::Transport::Tcp));
    assert!(addr.is_reliable());

    let uri = rsip::Uri::try_from("sips:bob@10.0.0.1").expect("uri");
    let addr = SipAddr::try_from(&uri).expect("SipAddr::try_from");
    assert_eq!(addr.r#type, Some(rsip::transport::Transport::Tls));
    assert_eq!(
        addr.get_socketaddr().expect("socketaddr"),
        "10.0.0.1:5061".parse::<SocketAddr>().expect("addr")
    );

    let uri = rsip::Uri::try_from("sip:bob@10.0.0.1").expect("uri");
    let addr = SipAddr::try_from(&uri).expect("SipAddr::try_from");
    assert_eq!(addr.r#type, Some(rsip::transport::Transport::Udp));
    assert!(!addr.is_reliable());
    assert_eq!(rsip::Uri::from(&addr).to_string(), "sip:10.0.0.1");
}

#[test]
fn test_domain_has_no_socketaddr() {
    let uri = rsip::Uri::try_from("sip:bob@example.com").expect("uri");
    let addr = SipAddr::try_from(&uri).expect("SipAddr::try_from");
    assert!(addr.get_socketaddr().is_err());
}
