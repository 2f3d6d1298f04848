mod common;

use anyhow::Result;
use serde_json::json;

use common::{ANSWER_SDP, Call, MockDataChannel, SessionHarness, candidate, eventually};
use room_rtc::error::{NegotiationError, NegotiationStage};
use room_rtc::peer::{
    ConnectionState, IceConnectionState, LocalStream, PeerEvent, PrimitiveEvent, SdpType,
    SessionDescription, TrackInfo,
};
use room_rtc::protocol::{MediaKind, SignalBody, SignalMessage};

fn from_peer(peer_id: &str, body: SignalBody) -> SignalMessage {
    SignalMessage::new(peer_id, "room-1", body).with_target("self")
}

fn candidate_signal(peer_id: &str, n: usize) -> SignalMessage {
    let c = candidate(n);
    from_peer(
        peer_id,
        SignalBody::Candidate {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
        },
    )
}

#[test_timeout::tokio_timeout_test(10)]
async fn offer_is_transformed_applied_and_sent() -> Result<()> {
    let mut harness = SessionHarness::connected("peer-a").await?;

    let offer = harness.handle.create_offer().await?;
    assert!(!offer.sdp.contains("H264"));
    assert!(offer.sdp.contains("stereo=1"));
    assert!(offer.sdp.contains("b=AS:64"));

    let sent = harness.sink.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].target.as_deref(), Some("peer-a"));
    assert_eq!(sent[0].mid, "self");
    assert_eq!(sent[0].body, SignalBody::Offer { sdp: offer.sdp.clone() });
    assert_eq!(
        harness.pc.calls(),
        vec![Call::CreateOffer, Call::SetLocal(SdpType::Offer)]
    );

    let names: Vec<&str> = harness.drain_events().iter().map(PeerEvent::name).collect();
    assert!(names.contains(&"peer:local_offer:success"));
    assert!(names.contains(&"peer:local_description:success"));
    assert!(names.contains(&"peer:signalingstate"));

    harness
        .handle
        .handle_signal(from_peer(
            "peer-a",
            SignalBody::Answer {
                sdp: ANSWER_SDP.to_string(),
            },
        ))
        .await?;
    let snapshot = harness.handle.snapshot().await?;
    assert_eq!(snapshot.connection_state, ConnectionState::Connected);
    assert_eq!(
        snapshot.remote_description,
        Some(SessionDescription::answer(ANSWER_SDP))
    );
    Ok(())
}

#[test_timeout::tokio_timeout_test(10)]
async fn second_offer_is_rejected_while_round_in_flight() -> Result<()> {
    let harness = SessionHarness::connected("peer-a").await?;
    harness.handle.create_offer().await?;

    let err = harness.handle.create_offer().await.unwrap_err();
    assert_eq!(err, NegotiationError::RoundInFlight(ConnectionState::Offering));

    let err = harness
        .handle
        .set_remote_description(SessionDescription::offer("v=0\r\n"))
        .await
        .unwrap_err();
    assert_eq!(err, NegotiationError::RoundInFlight(ConnectionState::Offering));
    assert_eq!(harness.sink.types(), vec!["offer"]);
    Ok(())
}

#[test_timeout::tokio_timeout_test(10)]
async fn glare_offer_is_discarded() -> Result<()> {
    let mut harness = SessionHarness::connected("peer-a").await?;
    harness.handle.create_offer().await?;
    harness
        .handle
        .handle_signal(from_peer(
            "peer-a",
            SignalBody::Offer {
                sdp: "v=0\r\n".into(),
            },
        ))
        .await?;
    let event = harness
        .wait_for(|event| matches!(event, PeerEvent::Discarded { .. }))
        .await;
    assert!(matches!(
        event,
        PeerEvent::Discarded {
            message_type: "offer",
            ..
        }
    ));
    assert!(!harness.pc.calls().contains(&Call::SetRemote(SdpType::Offer)));
    Ok(())
}

#[test_timeout::tokio_timeout_test(10)]
async fn candidates_buffer_until_remote_description_then_apply_in_order() -> Result<()> {
    let harness = SessionHarness::connected("peer-b").await?;

    for n in 1..=3 {
        harness.handle.handle_signal(candidate_signal("peer-b", n)).await?;
    }
    let snapshot = harness.handle.snapshot().await?;
    assert_eq!(snapshot.pending_candidates, 3);
    assert!(!snapshot.applying_candidates_immediately);
    assert!(harness.pc.calls().is_empty());

    harness
        .handle
        .handle_signal(from_peer(
            "peer-b",
            SignalBody::Offer {
                sdp: "v=0\r\n".into(),
            },
        ))
        .await?;
    harness.handle.handle_signal(candidate_signal("peer-b", 4)).await?;

    let c = |n| Call::AddCandidate(candidate(n).candidate);
    assert_eq!(
        harness.pc.calls(),
        vec![
            Call::SetRemote(SdpType::Offer),
            c(1),
            c(2),
            c(3),
            Call::CreateAnswer,
            Call::SetLocal(SdpType::Answer),
            c(4),
        ]
    );

    let snapshot = harness.handle.snapshot().await?;
    assert_eq!(snapshot.pending_candidates, 0);
    assert!(snapshot.applying_candidates_immediately);
    assert_eq!(snapshot.connection_state, ConnectionState::Connected);
    assert_eq!(harness.sink.types(), vec!["answer"]);
    Ok(())
}

#[test_timeout::tokio_timeout_test(10)]
async fn rejected_candidate_does_not_fail_the_session() -> Result<()> {
    let harness = SessionHarness::connected("peer-b").await?;
    harness
        .handle
        .handle_signal(from_peer(
            "peer-b",
            SignalBody::Offer {
                sdp: "v=0\r\n".into(),
            },
        ))
        .await?;
    harness.pc.fail("add_ice_candidate");
    harness.handle.add_candidate(candidate(7)).await?;
    let snapshot = harness.handle.snapshot().await?;
    assert_eq!(snapshot.connection_state, ConnectionState::Connected);
    Ok(())
}

#[test_timeout::tokio_timeout_test(10)]
async fn close_mid_negotiation_discards_late_result() -> Result<()> {
    let harness = SessionHarness::connected("peer-c").await?;
    let gate = harness.pc.gate_offer();

    let handle = harness.handle.clone();
    let pending = tokio::spawn(async move { handle.create_offer().await });
    harness.pc.offer_entered.notified().await;

    harness.handle.disconnect().await?;
    gate.notify_one();

    assert_eq!(pending.await?, Err(NegotiationError::Closed));
    assert!(harness.handle.is_closed());
    assert_eq!(harness.pc.calls(), vec![Call::Close]);
    assert!(harness.sink.sent().is_empty());

    let snapshot = harness.handle.snapshot().await?;
    assert_eq!(snapshot.connection_state, ConnectionState::Closed);
    assert!(snapshot.local_description.is_none());
    Ok(())
}

#[test_timeout::tokio_timeout_test(10)]
async fn messages_for_closed_session_are_discarded() -> Result<()> {
    let mut harness = SessionHarness::connected("peer-c").await?;
    harness.handle.disconnect().await?;
    harness.drain_events();

    harness
        .handle
        .handle_signal(from_peer(
            "peer-c",
            SignalBody::Answer {
                sdp: ANSWER_SDP.into(),
            },
        ))
        .await?;
    harness.handle.handle_signal(candidate_signal("peer-c", 1)).await?;

    let discarded: Vec<&str> = harness
        .drain_events()
        .into_iter()
        .filter_map(|event| match event {
            PeerEvent::Discarded { message_type, .. } => Some(message_type),
            _ => None,
        })
        .collect();
    assert_eq!(discarded, vec!["answer", "candidate"]);
    assert_eq!(harness.pc.calls(), vec![Call::Close]);
    assert_eq!(
        harness.handle.create_offer().await,
        Err(NegotiationError::Closed)
    );
    Ok(())
}

#[test_timeout::tokio_timeout_test(10)]
async fn primitive_failure_moves_session_to_failed_until_restart() -> Result<()> {
    let mut harness = SessionHarness::connected("peer-d").await?;
    harness.pc.fail("set_remote_description");

    let err = harness
        .handle
        .handle_signal(from_peer(
            "peer-d",
            SignalBody::Offer {
                sdp: "v=0\r\n".into(),
            },
        ))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        NegotiationError::Primitive {
            stage: NegotiationStage::SetRemoteDescription,
            ..
        }
    ));
    let names: Vec<&str> = harness.drain_events().iter().map(PeerEvent::name).collect();
    assert!(names.contains(&"peer:remote_description:error"));
    assert!(names.contains(&"peer:failed"));

    assert!(matches!(
        harness.handle.create_offer().await,
        Err(NegotiationError::InvalidState {
            state: ConnectionState::Failed,
            ..
        })
    ));

    harness.pc.heal("set_remote_description");
    harness.handle.restart().await?;
    let snapshot = harness.handle.snapshot().await?;
    assert_eq!(snapshot.connection_state, ConnectionState::Offering);
    assert_eq!(harness.sink.types(), vec!["offer"]);
    Ok(())
}

#[test_timeout::tokio_timeout_test(10)]
async fn offer_generation_failure_reports_local_offer_failure() -> Result<()> {
    let mut harness = SessionHarness::connected("peer-d").await?;
    harness.pc.fail("create_offer");
    let err = harness.handle.create_offer().await.unwrap_err();
    assert!(matches!(
        err,
        NegotiationError::Primitive {
            stage: NegotiationStage::CreateOffer,
            ..
        }
    ));
    let event = harness
        .wait_for(|event| matches!(event, PeerEvent::LocalOffer(_)))
        .await;
    assert_eq!(event.name(), "peer:local_offer:failure");
    assert!(harness.sink.sent().is_empty());
    Ok(())
}

#[test_timeout::tokio_timeout_test(10)]
async fn unsent_offer_fails_the_round_until_restart() -> Result<()> {
    let mut harness = SessionHarness::connected("peer-d").await?;
    harness.sink.set_rejecting(true);

    assert!(matches!(
        harness.handle.create_offer().await,
        Err(NegotiationError::Send(_))
    ));
    harness
        .wait_for(|event| matches!(event, PeerEvent::Failed { .. }))
        .await;
    assert_eq!(
        harness.handle.snapshot().await?.connection_state,
        ConnectionState::Failed
    );
    assert!(matches!(
        harness.handle.create_offer().await,
        Err(NegotiationError::InvalidState {
            state: ConnectionState::Failed,
            ..
        })
    ));

    harness.sink.set_rejecting(false);
    harness.handle.restart().await?;
    assert_eq!(
        harness.handle.snapshot().await?.connection_state,
        ConnectionState::Offering
    );
    assert_eq!(harness.sink.types(), vec!["offer"]);
    Ok(())
}

#[test_timeout::tokio_timeout_test(10)]
async fn unsent_answer_does_not_report_connected() -> Result<()> {
    let mut harness = SessionHarness::connected("peer-d").await?;
    harness.sink.set_rejecting(true);

    let result = harness
        .handle
        .handle_signal(from_peer(
            "peer-d",
            SignalBody::Offer {
                sdp: "v=0\r\n".into(),
            },
        ))
        .await;
    assert!(matches!(result, Err(NegotiationError::Send(_))));

    let names: Vec<&str> = harness.drain_events().iter().map(PeerEvent::name).collect();
    assert!(names.contains(&"peer:failed"));
    assert_eq!(
        harness.handle.snapshot().await?.connection_state,
        ConnectionState::Failed
    );
    assert!(harness.sink.sent().is_empty());
    Ok(())
}

#[test_timeout::tokio_timeout_test(10)]
async fn restart_signal_supersedes_round_and_drops_buffered_candidates() -> Result<()> {
    let harness = SessionHarness::connected("peer-e").await?;
    harness.handle.create_offer().await?;
    harness.handle.handle_signal(candidate_signal("peer-e", 1)).await?;
    assert_eq!(harness.handle.snapshot().await?.pending_candidates, 1);

    harness
        .handle
        .handle_signal(from_peer("peer-e", SignalBody::Restart))
        .await?;
    let snapshot = harness.handle.snapshot().await?;
    assert_eq!(snapshot.pending_candidates, 0);
    assert_eq!(snapshot.connection_state, ConnectionState::Offering);
    assert_eq!(harness.sink.types(), vec!["offer", "offer"]);
    Ok(())
}

#[test_timeout::tokio_timeout_test(10)]
async fn data_channels_are_classified_by_label() -> Result<()> {
    let mut harness = SessionHarness::connected("peer-f").await?;

    assert_eq!(harness.handle.create_data_channel(None).await?, "main");
    assert_eq!(
        harness
            .handle
            .create_data_channel(Some("file-1".into()))
            .await?,
        "file-1"
    );
    harness
        .factory
        .raise(PrimitiveEvent::DataChannel(MockDataChannel::new("file-2")));
    harness
        .wait_for(|event| {
            matches!(event, PeerEvent::DataChannel { label, main: false } if label == "file-2")
        })
        .await;

    let snapshot = harness.handle.snapshot().await?;
    assert_eq!(snapshot.main_channel.as_deref(), Some("main"));
    assert_eq!(snapshot.transfer_channels, vec!["file-1", "file-2"]);

    harness.handle.send_text(None, "hello").await?;
    assert_eq!(
        harness.handle.send_text(Some("missing".into()), "x").await,
        Err(NegotiationError::UnknownChannel("missing".into()))
    );
    Ok(())
}

#[test_timeout::tokio_timeout_test(10)]
async fn newer_inbound_stream_replaces_previous_one() -> Result<()> {
    let mut harness = SessionHarness::connected("peer-g").await?;
    let track = |stream: &str, id: &str, kind| TrackInfo {
        stream_id: stream.to_string(),
        track_id: id.to_string(),
        kind,
    };

    harness
        .factory
        .raise(PrimitiveEvent::Track(track("s1", "a1", MediaKind::Audio)));
    harness
        .factory
        .raise(PrimitiveEvent::Track(track("s1", "v1", MediaKind::Video)));
    harness
        .factory
        .raise(PrimitiveEvent::Track(track("s2", "a2", MediaKind::Audio)));

    let first = harness
        .wait_for(|event| matches!(event, PeerEvent::StreamAttached { .. }))
        .await;
    assert_eq!(
        first,
        PeerEvent::StreamAttached {
            stream_id: "s1".into(),
            replaced: false
        }
    );
    let second = harness
        .wait_for(|event| matches!(event, PeerEvent::StreamAttached { .. }))
        .await;
    assert_eq!(
        second,
        PeerEvent::StreamAttached {
            stream_id: "s2".into(),
            replaced: true
        }
    );

    let stream = harness.handle.snapshot().await?.inbound_stream.unwrap();
    assert_eq!(stream.stream_id, "s2");
    assert_eq!(stream.tracks.len(), 1);
    Ok(())
}

#[test_timeout::tokio_timeout_test(10)]
async fn local_candidates_and_ice_state_flow_out() -> Result<()> {
    let mut harness = SessionHarness::connected("peer-h").await?;
    harness
        .factory
        .raise(PrimitiveEvent::IceCandidate(candidate(9)));
    let sink = harness.sink.clone();
    eventually(|| sink.types() == vec!["candidate"]).await;
    let sent = harness.sink.sent();
    assert_eq!(sent[0].target.as_deref(), Some("peer-h"));

    harness
        .factory
        .raise(PrimitiveEvent::IceConnectionState(IceConnectionState::Disconnected));
    harness
        .wait_for(|event| *event == PeerEvent::ConnectionState(ConnectionState::Disconnected))
        .await;
    assert_eq!(
        harness.handle.snapshot().await?.ice_state,
        IceConnectionState::Disconnected
    );
    Ok(())
}

#[test_timeout::tokio_timeout_test(10)]
async fn peer_metadata_follows_signals_and_events() -> Result<()> {
    let harness = SessionHarness::connected("peer-i").await?;
    harness
        .handle
        .handle_signal(from_peer(
            "peer-i",
            SignalBody::UserDataUpdate {
                user_data: json!({"name": "grace"}),
            },
        ))
        .await?;
    harness
        .handle
        .handle_signal(from_peer(
            "peer-i",
            SignalBody::MuteEvent {
                kind: MediaKind::Audio,
                muted: true,
            },
        ))
        .await?;
    harness.handle.create_offer().await?;

    let record = harness.store.peer("peer-i").unwrap();
    assert_eq!(record.user_data, json!({"name": "grace"}));
    assert!(record.audio_muted);
    assert_eq!(
        record.last_event.as_deref(),
        Some("peer:signalingstate")
    );
    Ok(())
}

#[test_timeout::tokio_timeout_test(10)]
async fn send_stream_renegotiates_connected_session() -> Result<()> {
    let harness = SessionHarness::connected("peer-j").await?;
    harness
        .handle
        .handle_signal(from_peer(
            "peer-j",
            SignalBody::Offer {
                sdp: "v=0\r\n".into(),
            },
        ))
        .await?;
    harness
        .handle
        .send_stream(LocalStream {
            id: "cam".into(),
            audio: true,
            video: true,
        })
        .await?;
    assert!(harness.pc.calls().contains(&Call::AddStream("cam".into())));
    assert_eq!(harness.sink.types(), vec!["answer", "offer"]);
    let snapshot = harness.handle.snapshot().await?;
    assert_eq!(snapshot.connection_state, ConnectionState::Offering);
    assert_eq!(snapshot.local_stream.map(|s| s.id), Some("cam".to_string()));
    Ok(())
}

#[test_timeout::tokio_timeout_test(10)]
async fn bye_closes_the_session() -> Result<()> {
    let harness = SessionHarness::connected("peer-k").await?;
    harness
        .handle
        .handle_signal(from_peer("peer-k", SignalBody::Bye))
        .await?;
    assert!(harness.handle.is_closed());
    assert_eq!(
        harness.handle.snapshot().await?.connection_state,
        ConnectionState::Closed
    );
    Ok(())
}

#[test_timeout::tokio_timeout_test(10)]
async fn operations_before_connect_report_not_started() -> Result<()> {
    let harness = SessionHarness::spawn("peer-l");
    assert_eq!(
        harness.handle.create_offer().await,
        Err(NegotiationError::NotStarted)
    );
    assert!(matches!(
        harness.handle.create_answer().await,
        Err(NegotiationError::InvalidState { .. })
    ));
    Ok(())
}
