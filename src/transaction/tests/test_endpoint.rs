use crate::transport::{udp::UdpConnection, TransportEvent};
use rsip::{Method, SipMessage, StatusCode};
use std::time::Duration;
use tokio::{select, sync::mpsc::unbounded_channel, time::sleep};

#[tokio::test]
async fn test_endpoint_serve() {
    let endpoint = super::create_test_endpoint(None, None)
        .await
        .expect("create_test_endpoint");
    select! {
        _ = async {
            sleep(Duration::from_millis(10)).await;
            endpoint.shutdown();
            sleep(Duration::from_secs(1)).await;
        } => {
            panic!("must not reach here");
        }
        _ = endpoint.serve() => {}
    }
}

#[tokio::test]
async fn test_endpoint_recvrequests() {
    let endpoint = super::create_test_endpoint(Some("127.0.0.1:0"), None)
        .await
        .expect("create_test_endpoint");
    let addr = endpoint
        .get_addrs()
        .first()
        .expect("must have connection")
        .to_owned();
    let mut incoming = endpoint.incoming_transactions().expect("incoming");

    let send_loop = async {
        let test_conn =
            UdpConnection::create_connection("127.0.0.1:0".parse().expect("addr"), None)
                .await
                .expect("create_connection");
        let buf = "REGISTER sip:bob@restsend.com SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:5999;branch=z9hG4bKraw1\r\n\
From: <sip:bob@restsend.com>;tag=raw1\r\n\
To: <sip:bob@restsend.com>\r\n\
Call-ID: raw-call-id\r\n\
CSeq: 1 REGISTER\r\n\
Content-Length: 0\r\n\r\n";
        test_conn
            .send_raw(buf.as_bytes(), &addr)
            .await
            .expect("send_raw");
        sleep(Duration::from_secs(1)).await;
    };

    select! {
        _ = send_loop => {
            panic!("must not reach here");
        }
        _ = endpoint.serve() => {}
        tx = incoming.recv() => {
            let tx = tx.expect("incoming");
            assert_eq!(tx.original.method, Method::Register);
            assert_eq!(tx.original.uri.to_string(), "sip:bob@restsend.com");
        }
    }
}

#[tokio::test]
async fn test_unmatched_cancel_gets_481() {
    let (endpoint, peer) = super::create_channel_endpoint();
    let (peer_tx, mut peer_rx) = unbounded_channel();
    let peer_loop = peer.clone();
    tokio::spawn(async move { peer_loop.serve_loop(peer_tx).await.ok() });

    let cancel = super::make_request(Method::Cancel, "z9hG4bKnotthere", 1);
    peer.send(cancel.into()).await.expect("send cancel");

    select! {
        _ = endpoint.serve() => panic!("endpoint exited"),
        event = peer_rx.recv() => match event {
            Some(TransportEvent::Incoming(SipMessage::Response(resp), _, _)) => {
                assert_eq!(resp.status_code, StatusCode::CallTransactionDoesNotExist);
            }
            other => panic!("unexpected event {:?}", other),
        },
        _ = sleep(Duration::from_secs(1)) => panic!("no response to CANCEL"),
    }
}
