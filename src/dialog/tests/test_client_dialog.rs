use super::{create_test_endpoint, endpoint_addr, make_peer_response, negotiator, Peer};
use crate::dialog::{
    dialog::{DialogEvent, DialogState, TerminatedReason},
    dialog_layer::DialogLayer,
    invitation::InviteOption,
};
use crate::media::{Codec, MediaDirection, SessionDescription, SessionDescriptionExt};
use crate::transaction::endpoint::Endpoint;
use rsip::{
    prelude::{HeadersExt, UntypedHeader},
    Method, StatusCode,
};
use std::{sync::Arc, time::Duration};
use tokio::{select, sync::mpsc::unbounded_channel, time::sleep};

fn invite_option(endpoint: &Endpoint, peer: &Peer) -> InviteOption {
    let local = endpoint_addr(endpoint);
    InviteOption {
        caller: rsip::Uri::try_from(format!("sip:alice@{}", local.addr)).expect("caller"),
        callee: rsip::Uri::try_from(format!("sip:bob@{}", peer.host())).expect("callee"),
        contact: rsip::Uri::try_from(format!("sip:alice@{}", local.addr)).expect("contact"),
        credential: None,
        destination: None,
        headers: None,
    }
}

#[tokio::test]
async fn test_outgoing_call_answered_then_bye() -> crate::Result<()> {
    let endpoint = create_test_endpoint().await?;
    let target = endpoint_addr(&endpoint);
    let mut peer = Peer::bind().await?;
    let dialog_layer = Arc::new(DialogLayer::new(endpoint.inner.clone()));
    let (event_sender, mut events) = unbounded_channel();
    let callee = negotiator(vec![Codec::pcma(), Codec::g722()], 5000);

    let (dialog, tx) = dialog_layer.create_client_invite_dialog(
        invite_option(&endpoint, &peer),
        event_sender,
        negotiator(vec![Codec::pcmu(), Codec::pcma()], 4000),
    )?;
    assert_eq!(dialog.state(), DialogState::Idle);
    assert_eq!(dialog_layer.len(), 1);

    let test_loop = async {
        let layer = dialog_layer.clone();
        let driver = dialog.clone();
        let invite_task =
            tokio::spawn(async move { layer.process_client_invite(&driver, tx).await });

        let invite = peer.expect_request(Method::Invite).await;
        assert_eq!(invite.cseq_header()?.seq()?, 1);
        let offer = SessionDescription::from_body(&invite.body)?;
        let (answer, _) = callee.answer(&offer, MediaDirection::SendRecv)?;

        let ringing = make_peer_response(&peer, &invite, StatusCode::Ringing, Some("bob1"), None);
        peer.send(ringing, &target).await;
        let ok = make_peer_response(
            &peer,
            &invite,
            StatusCode::OK,
            Some("bob1"),
            Some(answer.to_string()),
        );
        peer.send(ok, &target).await;

        let ack = peer.expect_request(Method::Ack).await;
        assert_eq!(ack.cseq_header()?.seq()?, 1);
        assert_eq!(ack.to_header()?.tag()?.map(|t| t.to_string()), Some("bob1".to_string()));
        assert_eq!(ack.uri.to_string(), format!("sip:bob@{}", peer.host()));

        let resp = invite_task.await.expect("join")?.expect("final response");
        assert_eq!(resp.status_code, StatusCode::OK);
        assert_eq!(dialog.state(), DialogState::Confirmed);
        let id = dialog.id();
        assert_eq!(id.to_tag, "bob1");
        assert!(dialog_layer.get_dialog(&id).is_some());
        assert_eq!(dialog.media().expect("media").codec, Codec::pcma());

        let mut seen = vec![];
        while let Ok(event) = events.try_recv() {
            match event {
                DialogEvent::State(_, state) => seen.push(state.to_string()),
                DialogEvent::Media(_, media) => seen.push(media.codec.name.clone()),
                _ => {}
            }
        }
        assert_eq!(seen, vec!["Early", "Confirmed", "PCMA"]);

        let hangup = dialog.clone();
        let bye_task = tokio::spawn(async move { hangup.hangup().await });
        let bye = peer.expect_request(Method::Bye).await;
        assert_eq!(bye.cseq_header()?.seq()?, 2);
        assert_eq!(bye.uri.to_string(), format!("sip:bob@{}", peer.host()));
        peer.send(
            make_peer_response(&peer, &bye, StatusCode::OK, None, None),
            &target,
        )
        .await;
        bye_task.await.expect("join")?;
        assert_eq!(
            dialog.state(),
            DialogState::Terminated(TerminatedReason::LocalBye)
        );
        Ok::<_, crate::Error>(())
    };

    select! {
        r = test_loop => r?,
        _ = endpoint.serve() => panic!("endpoint exited"),
        _ = sleep(Duration::from_secs(5)) => panic!("test timed out"),
    }
    Ok(())
}

#[tokio::test]
async fn test_cancel_waits_for_provisional() -> crate::Result<()> {
    let endpoint = create_test_endpoint().await?;
    let target = endpoint_addr(&endpoint);
    let mut peer = Peer::bind().await?;
    let dialog_layer = Arc::new(DialogLayer::new(endpoint.inner.clone()));
    let (event_sender, _events) = unbounded_channel();

    let (dialog, tx) = dialog_layer.create_client_invite_dialog(
        invite_option(&endpoint, &peer),
        event_sender,
        negotiator(vec![Codec::pcmu()], 4000),
    )?;

    let test_loop = async {
        let layer = dialog_layer.clone();
        let driver = dialog.clone();
        let invite_task =
            tokio::spawn(async move { layer.process_client_invite(&driver, tx).await });

        let invite = peer.expect_request(Method::Invite).await;
        dialog.cancel().await?;
        // nothing to cancel on the wire yet
        assert!(
            peer.never_sees(Method::Cancel, Duration::from_millis(100))
                .await
        );

        peer.send(
            make_peer_response(&peer, &invite, StatusCode::Ringing, Some("bob2"), None),
            &target,
        )
        .await;
        let cancel = peer.expect_request(Method::Cancel).await;
        assert_eq!(cancel.cseq_header()?.seq()?, invite.cseq_header()?.seq()?);
        assert_eq!(cancel.via_header()?.value(), invite.via_header()?.value());
        assert!(cancel.to_header()?.tag()?.is_none());

        peer.send(
            make_peer_response(&peer, &cancel, StatusCode::OK, Some("bob2"), None),
            &target,
        )
        .await;
        peer.send(
            make_peer_response(
                &peer,
                &invite,
                StatusCode::RequestTerminated,
                Some("bob2"),
                None,
            ),
            &target,
        )
        .await;
        // the transaction ACKs the 487 itself
        let ack = peer.expect_request(Method::Ack).await;
        assert_eq!(ack.via_header()?.value(), invite.via_header()?.value());

        let resp = invite_task.await.expect("join")?.expect("final response");
        assert_eq!(resp.status_code, StatusCode::RequestTerminated);
        assert_eq!(
            dialog.state(),
            DialogState::Terminated(TerminatedReason::LocalCancel)
        );
        assert!(dialog_layer.is_empty());
        // once terminated there is nothing left to cancel
        assert!(dialog.cancel().await.is_err());
        Ok::<_, crate::Error>(())
    };

    select! {
        r = test_loop => r?,
        _ = endpoint.serve() => panic!("endpoint exited"),
        _ = sleep(Duration::from_secs(5)) => panic!("test timed out"),
    }
    Ok(())
}

#[tokio::test]
async fn test_rejected_and_unanswerable_calls() -> crate::Result<()> {
    let endpoint = create_test_endpoint().await?;
    let target = endpoint_addr(&endpoint);
    let mut peer = Peer::bind().await?;
    let dialog_layer = Arc::new(DialogLayer::new(endpoint.inner.clone()));
    let (event_sender, _events) = unbounded_channel();

    let test_loop = async {
        // busy
        let (dialog, tx) = dialog_layer.create_client_invite_dialog(
            invite_option(&endpoint, &peer),
            event_sender.clone(),
            negotiator(vec![Codec::pcmu()], 4000),
        )?;
        let layer = dialog_layer.clone();
        let driver = dialog.clone();
        let invite_task =
            tokio::spawn(async move { layer.process_client_invite(&driver, tx).await });
        let invite = peer.expect_request(Method::Invite).await;
        peer.send(
            make_peer_response(&peer, &invite, StatusCode::BusyHere, Some("bob3"), None),
            &target,
        )
        .await;
        let resp = invite_task.await.expect("join")?.expect("final response");
        assert_eq!(resp.status_code, StatusCode::BusyHere);
        assert_eq!(
            dialog.state(),
            DialogState::Terminated(TerminatedReason::RemoteReject(StatusCode::BusyHere))
        );
        assert!(dialog_layer.is_empty());
        assert!(dialog.bye().await.is_err());
        let first_call_id = invite.call_id_header()?.value().to_string();

        // answered with a codec we never offered: ACK, then BYE
        let (dialog, tx) = dialog_layer.create_client_invite_dialog(
            invite_option(&endpoint, &peer),
            event_sender.clone(),
            negotiator(vec![Codec::pcmu()], 4000),
        )?;
        let layer = dialog_layer.clone();
        let driver = dialog.clone();
        let invite_task =
            tokio::spawn(async move { layer.process_client_invite(&driver, tx).await });
        let invite = loop {
            let next = peer.expect_request(Method::Invite).await;
            // skip retransmissions of the first call
            if next.call_id_header()?.value() != first_call_id {
                break next;
            }
        };
        let bogus = negotiator(vec![Codec::g722()], 5000).create_offer(MediaDirection::SendRecv)?;
        peer.send(
            make_peer_response(
                &peer,
                &invite,
                StatusCode::OK,
                Some("bob4"),
                Some(bogus.to_string()),
            ),
            &target,
        )
        .await;
        peer.expect_request(Method::Ack).await;
        let bye = peer.expect_request(Method::Bye).await;
        peer.send(
            make_peer_response(&peer, &bye, StatusCode::OK, None, None),
            &target,
        )
        .await;
        let err = invite_task.await.expect("join").err().expect("media failure");
        assert!(matches!(err, crate::Error::NoCommonMediaError(_)), "{}", err);
        assert!(matches!(
            dialog.state(),
            DialogState::Terminated(TerminatedReason::MediaFailure(_))
        ));
        assert!(dialog_layer.is_empty());
        Ok::<_, crate::Error>(())
    };

    select! {
        r = test_loop => r?,
        _ = endpoint.serve() => panic!("endpoint exited"),
        _ = sleep(Duration::from_secs(5)) => panic!("test timed out"),
    }
    Ok(())
}

#[tokio::test]
async fn test_cancel_gives_up_without_final_response() -> crate::Result<()> {
    let endpoint = create_test_endpoint().await?;
    let target = endpoint_addr(&endpoint);
    let mut peer = Peer::bind().await?;
    let dialog_layer = Arc::new(DialogLayer::new(endpoint.inner.clone()));
    let (event_sender, _events) = unbounded_channel();

    let (dialog, tx) = dialog_layer.create_client_invite_dialog(
        invite_option(&endpoint, &peer),
        event_sender,
        negotiator(vec![Codec::pcmu()], 4000),
    )?;

    let test_loop = async {
        let layer = dialog_layer.clone();
        let driver = dialog.clone();
        let invite_task =
            tokio::spawn(async move { layer.process_client_invite(&driver, tx).await });

        let invite = peer.expect_request(Method::Invite).await;
        peer.send(
            make_peer_response(&peer, &invite, StatusCode::Ringing, Some("bob5"), None),
            &target,
        )
        .await;
        while dialog.state() != DialogState::Early {
            sleep(Duration::from_millis(5)).await;
        }

        // the peer never answers the CANCEL nor the INVITE
        dialog.hangup().await?;
        peer.expect_request(Method::Cancel).await;

        let err = invite_task.await.expect("join").err().expect("invite gave up");
        assert!(matches!(err, crate::Error::TimeoutError(_)), "{}", err);
        assert_eq!(
            dialog.state(),
            DialogState::Terminated(TerminatedReason::LocalCancel)
        );
        assert!(dialog_layer.is_empty());
        Ok::<_, crate::Error>(())
    };

    select! {
        r = test_loop => r?,
        _ = endpoint.serve() => panic!("endpoint exited"),
        _ = sleep(Duration::from_secs(5)) => panic!("test timed out"),
    }
    Ok(())
}
