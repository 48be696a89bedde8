use super::{endpoint::Endpoint, EndpointBuilder, EndpointOption};
use crate::{
    transport::{channel::ChannelConnection, udp::UdpConnection, SipAddr, TransportLayer},
    Result,
};
use rsip::headers::*;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod test_client;
mod test_endpoint;

pub(super) fn fast_option() -> EndpointOption {
    EndpointOption {
        t1: Duration::from_millis(10),
        t2: Duration::from_millis(40),
        t4: Duration::from_millis(50),
        max_retransmits: 3,
        timer_interval: Duration::from_millis(5),
        callid_suffix: None,
    }
}

pub(super) async fn create_test_endpoint(
    addr: Option<&str>,
    option: Option<EndpointOption>,
) -> Result<Endpoint> {
    let token = CancellationToken::new();
    let tl = TransportLayer::new(token.child_token());

    if let Some(addr) = addr {
        let conn = UdpConnection::create_connection(addr.parse()?, None).await?;
        tl.add_transport(conn.into());
    }

    let endpoint = EndpointBuilder::new()
        .user_agent("rsipua-test")
        .cancel_token(token)
        .transport_layer(tl)
        .option(option.unwrap_or_default())
        .build();
    Ok(endpoint)
}

/// Endpoint wired to an in-memory peer. The returned connection is the
/// peer's end: what it sends arrives at the endpoint.
pub(super) fn create_channel_endpoint() -> (Endpoint, ChannelConnection) {
    let token = CancellationToken::new();
    let tl = TransportLayer::new(token.child_token());
    let (local, peer) = ChannelConnection::pair(
        SipAddr::from(std::net::SocketAddr::from(([127, 0, 0, 1], 5060))),
        SipAddr::from(std::net::SocketAddr::from(([127, 0, 0, 1], 5070))),
    );
    tl.add_transport(local.into());
    let endpoint = EndpointBuilder::new()
        .user_agent("rsipua-test")
        .cancel_token(token)
        .transport_layer(tl)
        .build();
    (endpoint, peer)
}

pub(super) fn make_request(method: rsip::Method, branch: &str, cseq: u32) -> rsip::Request {
    rsip::Request {
        method: method.clone(),
        uri: rsip::Uri::try_from("sip:bob@127.0.0.1:5060").expect("uri"),
        headers: vec![
            Via::new(format!("SIP/2.0/UDP 127.0.0.1:5070;branch={}", branch)).into(),
            CSeq::new(format!("{} {}", cseq, method)).into(),
            From::new("Alice <sip:alice@127.0.0.1>;tag=alice-tag").into(),
            To::new("Bob <sip:bob@127.0.0.1>").into(),
            CallId::new("test-call-id@127.0.0.1").into(),
            Contact::new("<sip:alice@127.0.0.1:5070>").into(),
            MaxForwards::new("70").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: Default::default(),
    }
}
