use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::transaction::Transaction;
use crate::transaction::TransactionState;
use crate::transport::udp::UdpConnection;
use crate::{transport::TransportEvent, Error, Result};
use rsip::{
    prelude::{HeadersExt, ToTypedHeader},
    Method, SipMessage, StatusCode,
};
use std::time::Duration;
use tokio::{
    select,
    sync::mpsc::unbounded_channel,
    time::{sleep, timeout},
};

async fn client_request(
    endpoint: &super::Endpoint,
    method: Method,
    peer: &UdpConnection,
) -> Result<rsip::Request> {
    let mut req = super::make_request(method, "z9hG4bKreplaced", 1);
    req.uri = rsip::Uri {
        scheme: Some(rsip::Scheme::Sip),
        host_with_port: peer.get_addr().addr.clone(),
        ..Default::default()
    };
    let via = endpoint.inner.get_via(None, None)?;
    req.headers.unique_push(rsip::Header::Via(via.into()));
    Ok(req)
}

fn response_to(req: &rsip::Request, status_code: StatusCode) -> SipMessage {
    rsip::Response {
        status_code,
        version: rsip::Version::V2,
        headers: req.headers.clone(),
        body: Default::default(),
    }
    .into()
}

#[tokio::test]
async fn test_client_transaction() -> Result<()> {
    let endpoint = super::create_test_endpoint(Some("127.0.0.1:0"), Some(super::fast_option())).await?;
    let peer = UdpConnection::create_connection("127.0.0.1:0".parse()?, None).await?;
    let (sender, mut receiver) = unbounded_channel();
    let peer_loop = peer.clone();
    tokio::spawn(async move { peer_loop.serve_loop(sender).await.ok() });

    tokio::spawn(async move {
        if let Some(TransportEvent::Incoming(SipMessage::Request(req), connection, _)) =
            receiver.recv().await
        {
            connection
                .send(response_to(&req, StatusCode::Trying), None)
                .await
                .expect("send trying");
            sleep(Duration::from_millis(20)).await;
            connection
                .send(response_to(&req, StatusCode::OK), None)
                .await
                .expect("send ok");
        }
    });

    let register = client_request(&endpoint, Method::Register, &peer).await?;
    let recv_loop = async {
        let key = TransactionKey::from_request(&register, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, register, endpoint.inner.clone(), None);
        tx.send().await?;
        let mut statuses = vec![];
        while let Some(msg) = tx.receive().await? {
            if let SipMessage::Response(resp) = msg {
                statuses.push(resp.status_code);
            }
        }
        assert_eq!(statuses, vec![StatusCode::Trying, StatusCode::OK]);
        assert_eq!(tx.state, TransactionState::Terminated);
        Ok::<_, Error>(())
    };

    select! {
        r = recv_loop => r?,
        _ = endpoint.serve() => panic!("must not reach here"),
        _ = sleep(Duration::from_secs(2)) => panic!("timeout waiting"),
    }
    Ok(())
}

#[tokio::test]
async fn test_client_transaction_timeout() -> Result<()> {
    let endpoint = super::create_test_endpoint(Some("127.0.0.1:0"), Some(super::fast_option())).await?;
    let peer = UdpConnection::create_connection("127.0.0.1:0".parse()?, None).await?;
    let (sender, mut receiver) = unbounded_channel();
    let peer_loop = peer.clone();
    tokio::spawn(async move { peer_loop.serve_loop(sender).await.ok() });

    let options = client_request(&endpoint, Method::Options, &peer).await?;
    let recv_loop = async {
        let key = TransactionKey::from_request(&options, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key.clone(), options, endpoint.inner.clone(), None);
        tx.send().await?;
        match tx.receive().await {
            Err(Error::TimeoutError(k)) => assert_eq!(k, key),
            other => panic!("expected timeout, got {:?}", other.map(|m| m.is_some())),
        }
        // reported once
        assert!(matches!(tx.receive().await, Ok(None)));
        Ok::<_, Error>(())
    };

    select! {
        r = recv_loop => r?,
        _ = endpoint.serve() => panic!("must not reach here"),
        _ = sleep(Duration::from_secs(2)) => panic!("timeout waiting"),
    }

    let mut copies = 0;
    while let Ok(Some(_)) = timeout(Duration::from_millis(50), receiver.recv()).await {
        copies += 1;
    }
    // original plus max_retransmits
    assert_eq!(copies, 1 + super::fast_option().max_retransmits);
    Ok(())
}

#[tokio::test]
async fn test_client_invite_sends_ack_for_non_2xx() -> Result<()> {
    let endpoint = super::create_test_endpoint(Some("127.0.0.1:0"), Some(super::fast_option())).await?;
    let peer = UdpConnection::create_connection("127.0.0.1:0".parse()?, None).await?;
    let (sender, mut receiver) = unbounded_channel();
    let peer_loop = peer.clone();
    tokio::spawn(async move { peer_loop.serve_loop(sender).await.ok() });

    let invite = client_request(&endpoint, Method::Invite, &peer).await?;
    let invite_key = TransactionKey::from_request(&invite, TransactionRole::Client)?;

    let peer_server = async {
        loop {
            match receiver.recv().await {
                Some(TransportEvent::Incoming(SipMessage::Request(req), connection, _)) => {
                    match req.method {
                        Method::Invite => {
                            let mut busy = response_to(&req, StatusCode::BusyHere);
                            if let SipMessage::Response(resp) = &mut busy {
                                let to = resp
                                    .to_header()?
                                    .typed()?
                                    .with_tag(rsip::param::Tag::new("busy1"));
                                resp.headers.unique_push(rsip::Header::To(to.into()));
                            }
                            connection.send(busy, None).await?;
                        }
                        Method::Ack => return Ok::<_, Error>(req),
                        _ => {}
                    }
                }
                Some(_) => continue,
                None => panic!("peer closed"),
            }
        }
    };

    let client = async {
        let mut tx = Transaction::new_client(invite_key.clone(), invite, endpoint.inner.clone(), None);
        tx.send().await?;
        let mut final_status = None;
        while let Some(msg) = tx.receive().await? {
            if let SipMessage::Response(resp) = msg {
                final_status = Some(resp.status_code);
            }
        }
        Ok::<_, Error>(final_status)
    };

    let (ack, status) = select! {
        r = async { tokio::join!(peer_server, client) } => (r.0?, r.1?),
        _ = endpoint.serve() => panic!("must not reach here"),
        _ = sleep(Duration::from_secs(2)) => panic!("timeout waiting"),
    };
    assert_eq!(status, Some(StatusCode::BusyHere));
    assert_eq!(
        TransactionKey::from_request(&ack, TransactionRole::Client)?,
        invite_key,
        "non-2xx ACK shares the INVITE branch"
    );
    Ok(())
}
