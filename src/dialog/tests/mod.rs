use crate::media::{Codec, MediaNegotiator, SrtpPolicy};
use crate::transaction::endpoint::{Endpoint, EndpointBuilder, EndpointOption};
use crate::transport::{udp::UdpConnection, SipAddr, TransportEvent, TransportLayer};
use crate::Result;
use rsip::{
    headers::*,
    prelude::{HeadersExt, UntypedHeader},
    Method, SipMessage, StatusCode,
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

mod test_authenticate;
mod test_client_dialog;

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

/// Endpoint on an ephemeral loopback UDP port.
pub(super) async fn create_test_endpoint() -> Result<Endpoint> {
    let token = CancellationToken::new();
    let tl = TransportLayer::new(token.child_token());
    let conn = UdpConnection::create_connection("127.0.0.1:0".parse()?, None).await?;
    tl.add_transport(conn.into());
    let endpoint = EndpointBuilder::new()
        .user_agent("rsipua-test")
        .cancel_token(token)
        .transport_layer(tl)
        .option(fast_option())
        .build();
    Ok(endpoint)
}

pub(super) fn endpoint_addr(endpoint: &Endpoint) -> SipAddr {
    endpoint
        .get_addrs()
        .first()
        .cloned()
        .expect("endpoint bound")
}

pub(super) fn negotiator(codecs: Vec<Codec>, port: u16) -> Arc<MediaNegotiator> {
    Arc::new(MediaNegotiator::new(
        codecs,
        SrtpPolicy::Disabled,
        format!("127.0.0.1:{}", port).parse().expect("rtp addr"),
    ))
}

/// The far end of a call, speaking raw SIP over its own UDP socket.
pub(super) struct Peer {
    pub conn: UdpConnection,
    rx: UnboundedReceiver<TransportEvent>,
}

impl Peer {
    pub async fn bind() -> Result<Self> {
        let conn = UdpConnection::create_connection("127.0.0.1:0".parse()?, None).await?;
        let (sender, rx) = unbounded_channel();
        let serve = conn.clone();
        tokio::spawn(async move { serve.serve_loop(sender).await.ok() });
        Ok(Peer { conn, rx })
    }

    pub fn host(&self) -> String {
        self.conn.get_addr().addr.to_string()
    }

    pub async fn send(&self, msg: impl Into<SipMessage>, to: &SipAddr) {
        self.conn.send(msg.into(), Some(to)).await.expect("peer send");
    }

    pub async fn recv(&mut self) -> Option<SipMessage> {
        loop {
            match timeout(Duration::from_secs(2), self.rx.recv()).await {
                Ok(Some(TransportEvent::Incoming(msg, _, _))) => return Some(msg),
                Ok(Some(_)) => continue,
                _ => return None,
            }
        }
    }

    /// Next request of `method`, skipping everything else.
    pub async fn expect_request(&mut self, method: Method) -> rsip::Request {
        loop {
            match self.recv().await {
                Some(SipMessage::Request(req)) if req.method == method => return req,
                Some(_) => continue,
                None => panic!("no {} received", method),
            }
        }
    }

    /// Next response other than 100.
    pub async fn expect_response(&mut self) -> rsip::Response {
        loop {
            match self.recv().await {
                Some(SipMessage::Response(resp)) if resp.status_code != StatusCode::Trying => {
                    return resp
                }
                Some(_) => continue,
                None => panic!("no response received"),
            }
        }
    }

    /// No `method` request arrives within `wait`. Retransmissions of
    /// other requests are ignored.
    pub async fn never_sees(&mut self, method: Method, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(TransportEvent::Incoming(SipMessage::Request(req), _, _)))
                    if req.method == method =>
                {
                    return false
                }
                Ok(Some(_)) => continue,
                _ => return true,
            }
        }
    }
}

/// INVITE from the peer (alice) to the endpoint (bob).
pub(super) fn make_invite(
    peer: &Peer,
    target: &SipAddr,
    branch: &str,
    from_tag: &str,
    sdp: Option<String>,
) -> rsip::Request {
    let body = sdp.unwrap_or_default().into_bytes();
    let mut headers: Vec<rsip::Header> = vec![
        Via::new(format!("SIP/2.0/UDP {};branch={}", peer.host(), branch)).into(),
        CSeq::new("1 INVITE").into(),
        From::new(format!("Alice <sip:alice@{}>;tag={}", peer.host(), from_tag)).into(),
        To::new(format!("Bob <sip:bob@{}>", target.addr)).into(),
        CallId::new(format!("{}@test", from_tag)).into(),
        Contact::new(format!("<sip:alice@{}>", peer.host())).into(),
        MaxForwards::new("70").into(),
    ];
    if !body.is_empty() {
        headers.push(ContentType::new("application/sdp").into());
    }
    headers.push(ContentLength::new(body.len().to_string()).into());
    rsip::Request {
        method: Method::Invite,
        uri: rsip::Uri::try_from(format!("sip:bob@{}", target.addr)).expect("uri"),
        headers: headers.into(),
        version: rsip::Version::V2,
        body,
    }
}

/// Response built by hand the way a remote UA would, with `to_tag` and
/// the peer's Contact.
pub(super) fn make_peer_response(
    peer: &Peer,
    req: &rsip::Request,
    status_code: StatusCode,
    to_tag: Option<&str>,
    sdp: Option<String>,
) -> rsip::Response {
    let body = sdp.unwrap_or_default().into_bytes();
    let mut headers = req.headers.clone();
    headers.retain(|h| {
        matches!(
            h,
            rsip::Header::Via(_)
                | rsip::Header::CallId(_)
                | rsip::Header::From(_)
                | rsip::Header::CSeq(_)
        )
    });
    let to = req.to_header().expect("to").clone();
    let to = match to_tag {
        Some(tag) => To::new(format!("{};tag={}", to.value(), tag)),
        None => to,
    };
    headers.push(to.into());
    headers.push(Contact::new(format!("<sip:bob@{}>", peer.host())).into());
    if !body.is_empty() {
        headers.push(ContentType::new("application/sdp").into());
    }
    headers.push(ContentLength::new(body.len().to_string()).into());
    rsip::Response {
        status_code,
        version: rsip::Version::V2,
        headers,
        body,
    }
}

/// In-dialog request from the peer, following the To/From of `resp`.
pub(super) fn make_peer_request(
    peer: &Peer,
    target: &SipAddr,
    method: Method,
    resp: &rsip::Response,
    branch: &str,
    cseq: u32,
) -> rsip::Request {
    rsip::Request {
        method: method.clone(),
        uri: rsip::Uri::try_from(format!("sip:bob@{}", target.addr)).expect("uri"),
        headers: vec![
            Via::new(format!("SIP/2.0/UDP {};branch={}", peer.host(), branch)).into(),
            CSeq::new(format!("{} {}", cseq, method)).into(),
            resp.from_header().expect("from").clone().into(),
            resp.to_header().expect("to").clone().into(),
            resp.call_id_header().expect("call-id").clone().into(),
            Contact::new(format!("<sip:alice@{}>", peer.host())).into(),
            MaxForwards::new("70").into(),
            ContentLength::new("0").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: vec![],
    }
}
