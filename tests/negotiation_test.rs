//! Negotiation end-to-end tests.
//!
//! These run both peer sessions against real in-process peer connections:
//! offers and answers are generated by a local "server side" connection
//! and routed through the control hub exactly like messages arriving over
//! the signaling transport. No network is involved.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::mpsc;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use roomlink::config::RoomConfig;
use roomlink::hub::SignalHub;
use roomlink::media::{ParticipantInfo, ParticipantState};
use roomlink::peer::PeerSessionFactory;
use roomlink::signaling::messages::{
    JoinResponse, RoomInfo, SessionDescription, SignalRequest, SignalResponse, SignalTarget,
    Trickle,
};

/// Initialize tracing for tests (call once per test)
fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,webrtc=warn")
        .try_init();
}

fn local_participant() -> ParticipantInfo {
    ParticipantInfo {
        sid: "PA_local".to_string(),
        identity: "tester".to_string(),
        name: String::new(),
        state: ParticipantState::Joined,
        tracks: Vec::new(),
        metadata: String::new(),
    }
}

/// Join data with zero ICE servers: the sessions configure against an
/// empty server list.
fn join_response() -> JoinResponse {
    JoinResponse {
        room: RoomInfo {
            sid: "RM_test".to_string(),
            name: "test-room".to_string(),
            num_participants: 1,
        },
        participant: local_participant(),
        other_participants: Vec::new(),
        ice_servers: Vec::new(),
        subscriber_primary: true,
        force_relay: false,
        ping_interval_secs: 0,
        ping_timeout_secs: 0,
    }
}

/// Build a hub with both sessions configured from the join response, plus
/// the outbound queue the transport would normally drain.
async fn connected_hub() -> Result<(Arc<SignalHub>, mpsc::UnboundedReceiver<Bytes>)> {
    let config = RoomConfig::default();
    let factory = PeerSessionFactory::new(&config)?;
    let hub = Arc::new(SignalHub::new(factory, config));
    let outbound = hub.take_outbound().expect("outbound queue");

    hub.handle(SignalResponse::Join(join_response())).await?;
    Ok((hub, outbound))
}

/// A server-side peer connection with a data channel so its offers carry
/// an application media section.
async fn server_peer() -> Result<RTCPeerConnection> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let api = APIBuilder::new().with_media_engine(media_engine).build();
    let pc = api.new_peer_connection(Default::default()).await?;
    pc.create_data_channel("server", None).await?;
    Ok(pc)
}

fn candidate_init_json(port: u16) -> String {
    serde_json::json!({
        "candidate": format!(
            "candidate:3604246083 1 udp 2122260223 127.0.0.1 {port} typ host generation 0"
        ),
        "sdpMid": "0",
        "sdpMLineIndex": 0,
    })
    .to_string()
}

/// Pull outbound frames until one matches the predicate.
async fn expect_request<F>(
    outbound: &mut mpsc::UnboundedReceiver<Bytes>,
    mut predicate: F,
) -> SignalRequest
where
    F: FnMut(&SignalRequest) -> bool,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), outbound.recv())
            .await
            .expect("outbound request before timeout")
            .expect("outbound queue open");
        let request: SignalRequest = serde_json::from_slice(&frame).expect("valid request");
        if predicate(&request) {
            return request;
        }
    }
}

#[tokio::test]
async fn test_join_configures_both_sessions() -> Result<()> {
    init_test_tracing();
    let (hub, _outbound) = connected_hub().await?;

    assert!(hub.join_response().await.is_some());
    assert_eq!(
        hub.local_participant().await.map(|p| p.sid),
        Some("PA_local".to_string())
    );
    // both sessions hold configured handles: candidate queueing works on
    // each without NoPeerConnection
    hub.factory()
        .subscriber()
        .add_remote_candidate(&candidate_init_json(40_000))
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_trickle_before_remote_description_queues_then_flushes() -> Result<()> {
    init_test_tracing();
    let (hub, mut outbound) = connected_hub().await?;
    let subscriber = Arc::clone(hub.factory().subscriber());

    // candidates arriving before the remote offer are preserved in order
    for port in [50_000u16, 50_001, 50_002] {
        hub.handle(SignalResponse::Trickle(Trickle {
            target: SignalTarget::Subscriber,
            candidate_init: candidate_init_json(port),
        }))
        .await?;
    }
    assert_eq!(subscriber.pending_candidate_count().await, 3);

    // the server's offer arrives; the subscriber answers and the queue is
    // flushed exactly once
    let server = server_peer().await?;
    let offer = server.create_offer(None).await?;
    server.set_local_description(offer.clone()).await?;

    let handled = hub
        .handle(SignalResponse::Offer(SessionDescription::offer(offer.sdp)))
        .await?;
    assert!(handled);
    assert_eq!(subscriber.pending_candidate_count().await, 0);

    let answer = expect_request(&mut outbound, |r| matches!(r, SignalRequest::Answer(_))).await;
    let SignalRequest::Answer(answer) = answer else {
        unreachable!()
    };
    assert!(answer.sdp.contains("v=0"));

    // a late candidate applies immediately without queueing
    hub.handle(SignalResponse::Trickle(Trickle {
        target: SignalTarget::Subscriber,
        candidate_init: candidate_init_json(50_003),
    }))
    .await?;
    assert_eq!(subscriber.pending_candidate_count().await, 0);

    hub.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_negotiate_emits_exactly_one_offer() -> Result<()> {
    init_test_tracing();
    let (hub, mut outbound) = connected_hub().await?;
    let publisher = Arc::clone(hub.factory().publisher());

    let negotiation = {
        let publisher = Arc::clone(&publisher);
        let hub = Arc::clone(&hub);
        tokio::spawn(async move { publisher.negotiate(&hub).await })
    };

    // the machine emits its offer and waits for the answer
    let offer = expect_request(&mut outbound, |r| matches!(r, SignalRequest::Offer(_))).await;
    let SignalRequest::Offer(offer) = offer else {
        unreachable!()
    };

    // a second negotiate while the offer is in flight is a no-op; the
    // trailing drain below proves it emitted nothing
    let _ = publisher.negotiate(&hub).await?;

    // answer from the server side concludes the round
    let server = server_peer().await?;
    server
        .set_remote_description(RTCSessionDescription::offer(offer.sdp)?)
        .await?;
    let answer = server.create_answer(None).await?;
    server.set_local_description(answer.clone()).await?;

    hub.handle(SignalResponse::Answer(SessionDescription::answer(
        answer.sdp,
    )))
    .await?;

    let final_state = negotiation.await??;
    assert_eq!(final_state, RTCSignalingState::Stable);

    // no second offer ever went out
    let mut extra_offers = 0;
    while let Ok(frame) = outbound.try_recv() {
        if matches!(
            serde_json::from_slice::<SignalRequest>(&frame),
            Ok(SignalRequest::Offer(_))
        ) {
            extra_offers += 1;
        }
    }
    assert_eq!(extra_offers, 0);

    hub.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_premature_answer_surfaces_an_error() -> Result<()> {
    init_test_tracing();
    let (hub, _outbound) = connected_hub().await?;

    // an answer with no offer in flight is consumed by the publisher and
    // rejected by the native handle; the router surfaces the failure
    let result = hub
        .handle(SignalResponse::Answer(SessionDescription::answer(
            "v=0".to_string(),
        )))
        .await;
    assert!(result.is_err());
    Ok(())
}
