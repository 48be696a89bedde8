use crate::{
    transport::{
        udp::UdpConnection, SipConnection, TlsConfig, TransportEvent, TransportKind,
        TransportLayer,
    },
    Error, Result,
};
use rsip::{headers::*, SipMessage};
use std::time::Duration;
use tokio::{sync::mpsc::unbounded_channel, time::timeout};
use tokio_util::sync::CancellationToken;

fn options_request(target: &rsip::Uri) -> SipMessage {
    rsip::Request {
        method: rsip::Method::Options,
        uri: target.clone(),
        headers: vec![
            Via::new("SIP/2.0/TCP 127.0.0.1:5060;branch=z9hG4bKtl1").into(),
            CSeq::new("1 OPTIONS").into(),
            From::new("<sip:alice@127.0.0.1>;tag=tl1").into(),
            To::new("<sip:bob@127.0.0.1>").into(),
            CallId::new("transport-layer-test").into(),
            ContentLength::new("0").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: Default::default(),
    }
    .into()
}

#[tokio::test]
async fn test_bind_reports_actual_port() -> Result<()> {
    let tl = TransportLayer::new(CancellationToken::new());
    let udp = tl
        .bind(TransportKind::Udp, "127.0.0.1:0".parse()?, None)
        .await?;
    assert_ne!(udp.get_socketaddr()?.port(), 0);
    let tcp = tl
        .bind(TransportKind::Tcp, "127.0.0.1:0".parse()?, None)
        .await?;
    assert_eq!(tcp.r#type, Some(rsip::transport::Transport::Tcp));
    assert_eq!(tl.get_addrs().len(), 2);

    match tl
        .bind(TransportKind::Tcp, tcp.get_socketaddr()?, None)
        .await
    {
        Err(Error::BindError(_, _)) => {}
        other => panic!("expected BindError, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_tls_bind_needs_certificate() -> Result<()> {
    let tl = TransportLayer::new(CancellationToken::new());
    tl.set_tls_config(TlsConfig::default())?;
    match tl
        .bind(TransportKind::Tls, "127.0.0.1:0".parse()?, None)
        .await
    {
        Err(Error::BindError(_, addr)) => {
            assert_eq!(addr.r#type, Some(rsip::transport::Transport::Tls))
        }
        other => panic!("expected BindError, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_added_transport_is_served() -> Result<()> {
    let tl = TransportLayer::new(CancellationToken::new());
    assert!(tl.is_empty());
    let conn = UdpConnection::create_connection("127.0.0.1:0".parse()?, None).await?;
    let addr = conn.get_addr().clone();
    tl.add_transport(conn.into());
    assert_eq!(tl.len(), 1);
    assert_eq!(tl.get_addrs(), vec![addr]);
    Ok(())
}

#[tokio::test]
async fn test_lookup_without_transport() -> Result<()> {
    let tl = TransportLayer::new(CancellationToken::new());
    let uri = rsip::Uri::try_from("sip:bob@127.0.0.1:5060")?;
    assert!(matches!(
        tl.lookup(&uri).await,
        Err(Error::TransportLayerError(_, _))
    ));
    Ok(())
}

#[tokio::test]
async fn test_tcp_connect_send_and_close() -> Result<()> {
    let token = CancellationToken::new();
    let server = TransportLayer::new(token.child_token());
    let listen = server
        .bind(TransportKind::Tcp, "127.0.0.1:0".parse()?, None)
        .await?;
    let (server_tx, mut server_rx) = unbounded_channel();
    server.serve_listens(server_tx).await?;

    let client = TransportLayer::new(token.child_token());
    let (client_tx, mut client_rx) = unbounded_channel();
    client.serve_listens(client_tx).await?;

    let target = rsip::Uri::from(&listen);
    let connection = client.lookup(&target).await?;
    assert!(matches!(connection, SipConnection::Tcp(_)));
    assert!(connection.is_reliable());
    // a second lookup reuses the established stream
    let again = client.lookup(&target).await?;
    assert_eq!(again.table_key(), connection.table_key());
    assert_eq!(client.len(), 1);

    connection.send(options_request(&target), None).await?;
    let received = loop {
        match timeout(Duration::from_secs(1), server_rx.recv()).await {
            Ok(Some(TransportEvent::Incoming(msg, _, _))) => break msg,
            Ok(Some(_)) => continue,
            _ => panic!("server did not receive the request"),
        }
    };
    assert!(matches!(received, SipMessage::Request(ref r) if r.method == rsip::Method::Options));

    assert!(client.close_transport(&connection.table_key()));
    let closed = loop {
        match timeout(Duration::from_secs(1), client_rx.recv()).await {
            Ok(Some(TransportEvent::Closed(c))) => break c,
            Ok(Some(_)) => continue,
            _ => panic!("no Closed event"),
        }
    };
    assert_eq!(closed.table_key(), connection.table_key());
    assert!(client.is_empty());
    token.cancel();
    Ok(())
}
