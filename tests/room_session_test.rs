//! Room session orchestration tests against an in-process signaling
//! server: a local websocket endpoint hands out control messages and the
//! session's task group routes them into the hub.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use roomlink::config::RoomConfig;
use roomlink::media::{ParticipantInfo, ParticipantState};
use roomlink::room::RoomSession;
use roomlink::signaling::messages::{
    JoinResponse, ParticipantUpdate, RoomInfo, SignalResponse,
};

fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,webrtc=warn")
        .try_init();
}

fn participant(sid: &str, state: ParticipantState) -> ParticipantInfo {
    ParticipantInfo {
        sid: sid.to_string(),
        identity: format!("id-{sid}"),
        name: String::new(),
        state,
        tracks: Vec::new(),
        metadata: String::new(),
    }
}

fn join_response() -> JoinResponse {
    JoinResponse {
        room: RoomInfo {
            sid: "RM_ws".to_string(),
            name: "ws-room".to_string(),
            num_participants: 1,
        },
        participant: participant("PA_local", ParticipantState::Joined),
        other_participants: Vec::new(),
        ice_servers: Vec::new(),
        subscriber_primary: true,
        force_relay: false,
        ping_interval_secs: 0,
        ping_timeout_secs: 0,
    }
}

/// Serve one signaling connection: send the given messages, then hold the
/// socket open and drain whatever the client sends.
async fn spawn_signaling_server(messages: Vec<SignalResponse>) -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let messages = messages.clone();
            tokio::spawn(async move {
                let Ok(mut socket) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                for message in &messages {
                    let frame = serde_json::to_vec(message).unwrap();
                    if socket.send(Message::Binary(frame)).await.is_err() {
                        return;
                    }
                }
                while let Some(Ok(_)) = socket.next().await {}
            });
        }
    });
    Ok(format!("ws://{}", addr))
}

/// Poll an async condition until it holds or the deadline passes.
async fn wait_until<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn test_connect_routes_join_and_participant_updates() -> Result<()> {
    init_test_tracing();

    let url = spawn_signaling_server(vec![
        SignalResponse::Join(join_response()),
        SignalResponse::Update(ParticipantUpdate {
            participants: vec![participant("PA_other", ParticipantState::Active)],
        }),
    ])
    .await?;

    let session = Arc::new(RoomSession::new(RoomConfig::default())?);
    let hub = Arc::clone(session.hub());

    let connection = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.connect(&url, "test-token").await })
    };

    // the join snapshot lands in the hub
    assert!(
        wait_until(|| {
            let hub = Arc::clone(&hub);
            async move { hub.local_participant().await.is_some() }
        })
        .await,
        "join response routed into hub"
    );

    // the subsequent participant update merges into the registry
    assert!(
        wait_until(|| {
            let hub = Arc::clone(&hub);
            async move { hub.remote_participants().await.contains_key("PA_other") }
        })
        .await,
        "participant update routed into hub"
    );

    // cancelling the top-level task takes every loop down
    connection.abort();
    let _ = connection.await;
    hub.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_connect_rejects_bad_endpoint() -> Result<()> {
    init_test_tracing();
    let session = RoomSession::new(RoomConfig::default())?;
    let result = session.connect("ftp://not-a-room", "token").await;
    assert!(result.is_err());
    Ok(())
}
