//! Central room state and the control-message router.
//!
//! The hub owns the participant and track registries, the outbound request
//! queue and the application data-packet streams. Inbound control messages
//! are routed here: room-level messages mutate hub state, negotiation
//! messages are delegated to the publisher session and then the
//! subscriber. Hub maps are only mutated from the router task and from
//! publish/unpublish calls, each behind the hub's own locks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tracing::{debug, error, info, trace, warn};
use webrtc::api::API;

use crate::config::RoomConfig;
use crate::error::{Error, Result};
use crate::media::{
    ConnectionQualityInfo, ParticipantInfo, ParticipantState, RemoteStream, SpeakerInfo,
    TrackInfo, TrackKind, VideoDimensions, VideoQuality,
};
use crate::peer::{PeerEvent, PeerRole, PeerSessionFactory};
use crate::signaling::messages::{
    AddTrackRequest, ConnectionQualityUpdate, DataPacket, DataPayload, JoinResponse,
    MuteTrackRequest, ParticipantUpdate, Ping, SignalRequest, SignalResponse, SpeakersChanged,
    SubscriptionPermission, TrackPermission, Trickle, UpdateTrackSettings,
};

/// Capacity of the rendezvous/data broadcast channels.
const EVENT_BUFFER: usize = 64;

/// Central mutable room state plus the message router.
pub struct SignalHub {
    factory: PeerSessionFactory,
    config: RoomConfig,

    join_response: RwLock<Option<JoinResponse>>,
    local_participant: RwLock<Option<ParticipantInfo>>,
    remote_participants: RwLock<HashMap<String, ParticipantInfo>>,

    // per-kind track registries keyed by client track id; these feed the
    // add-track rendezvous
    audio_tracks: RwLock<HashMap<String, TrackInfo>>,
    video_tracks: RwLock<HashMap<String, TrackInfo>>,
    data_tracks: RwLock<HashMap<String, TrackInfo>>,
    track_events: broadcast::Sender<(TrackKind, String, TrackInfo)>,

    connection_quality: RwLock<HashMap<String, ConnectionQualityInfo>>,
    active_speakers: RwLock<Vec<SpeakerInfo>>,
    media_streams: RwLock<HashMap<String, RemoteStream>>,

    token_updates: watch::Sender<Option<String>>,

    // serialized control messages, drained by the transport's sender loop
    outbound_tx: mpsc::UnboundedSender<Bytes>,
    outbound_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,

    incoming_packets: broadcast::Sender<DataPacket>,
    outgoing_packets_tx: mpsc::UnboundedSender<DataPacket>,
    outgoing_packets_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<DataPacket>>>,
}

impl SignalHub {
    pub fn new(factory: PeerSessionFactory, config: RoomConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (outgoing_packets_tx, outgoing_packets_rx) = mpsc::unbounded_channel();
        let (track_events, _) = broadcast::channel(EVENT_BUFFER);
        let (incoming_packets, _) = broadcast::channel(EVENT_BUFFER);
        let (token_updates, _) = watch::channel(None);
        Self {
            factory,
            config,
            join_response: RwLock::new(None),
            local_participant: RwLock::new(None),
            remote_participants: RwLock::new(HashMap::new()),
            audio_tracks: RwLock::new(HashMap::new()),
            video_tracks: RwLock::new(HashMap::new()),
            data_tracks: RwLock::new(HashMap::new()),
            track_events,
            connection_quality: RwLock::new(HashMap::new()),
            active_speakers: RwLock::new(Vec::new()),
            media_streams: RwLock::new(HashMap::new()),
            token_updates,
            outbound_tx,
            outbound_rx: parking_lot::Mutex::new(Some(outbound_rx)),
            incoming_packets,
            outgoing_packets_tx,
            outgoing_packets_rx: parking_lot::Mutex::new(Some(outgoing_packets_rx)),
        }
    }

    pub fn factory(&self) -> &PeerSessionFactory {
        &self.factory
    }

    pub fn api(&self) -> &API {
        self.factory.api()
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // outbound queue

    /// Serialize a control message onto the outbound queue. Serialization
    /// failure drops the message with a log line; signaling is best-effort
    /// for non-critical updates.
    pub fn enqueue(&self, request: SignalRequest) {
        match serde_json::to_vec(&request) {
            Ok(frame) => {
                trace!("enqueue request: {:?}", request);
                let _ = self.outbound_tx.send(Bytes::from(frame));
            }
            Err(e) => {
                error!("failed to serialize control message, dropping: {}", e);
            }
        }
    }

    /// Take the outbound frame queue for the transport's sender loop.
    /// Yields `None` after the first call.
    pub fn take_outbound(&self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.outbound_rx.lock().take()
    }

    // ------------------------------------------------------------------
    // inbound routing

    /// Route one inbound control message. Room-level messages mutate hub
    /// state here; everything else is delegated to the publisher session
    /// and, when unhandled, the subscriber. Returns whether the message
    /// found a handler.
    pub async fn handle(self: &Arc<Self>, message: SignalResponse) -> Result<bool> {
        match message {
            SignalResponse::Update(update) => {
                self.merge_participants(update).await;
                Ok(true)
            }
            SignalResponse::TrackPublished(published) => {
                info!(
                    "track published: cid={} sid={}",
                    published.cid, published.track.sid
                );
                let kind = published.track.kind;
                self.track_map(kind)
                    .write()
                    .await
                    .insert(published.cid.clone(), published.track.clone());
                let _ = self
                    .track_events
                    .send((kind, published.cid, published.track));
                Ok(true)
            }
            SignalResponse::TrackUnpublished(unpublished) => {
                info!("track unpublished: sid={}", unpublished.track_sid);
                for map in [&self.audio_tracks, &self.video_tracks, &self.data_tracks] {
                    map.write()
                        .await
                        .retain(|_, info| info.sid != unpublished.track_sid);
                }
                Ok(true)
            }
            SignalResponse::Leave(leave) => {
                // server-initiated leave tears the sessions down; automatic
                // reconnection is a higher-layer policy
                warn!("server asked us to leave: {:?}", leave);
                self.factory.teardown().await;
                Ok(true)
            }
            SignalResponse::RefreshToken(refresh) => {
                debug!("refresh token received");
                self.token_updates.send_replace(Some(refresh.token));
                Ok(true)
            }
            SignalResponse::ConnectionQuality(update) => {
                self.replace_connection_quality(update).await;
                Ok(true)
            }
            SignalResponse::SpeakersChanged(update) => {
                self.replace_active_speakers(update).await;
                Ok(true)
            }
            SignalResponse::SubscribedQualityUpdate(update) => {
                debug!("subscribed quality update: {:?}", update);
                Ok(true)
            }
            SignalResponse::Pong(pong) => {
                trace!("pong: {}", pong.timestamp);
                Ok(true)
            }
            SignalResponse::StreamStateUpdate(update) => {
                debug!("stream state update: {:?}", update);
                Ok(true)
            }
            SignalResponse::SubscriptionPermissionUpdate(update) => {
                debug!("subscription permission update: {:?}", update);
                Ok(true)
            }
            SignalResponse::RoomUpdate(update) => {
                debug!("room update: {:?}", update);
                Ok(true)
            }
            // join / offer / answer / trickle go to the sessions
            other => {
                let handled = self
                    .factory
                    .publisher()
                    .handle_signal_response(&other, self)
                    .await?;
                if !handled {
                    return self
                        .factory
                        .subscriber()
                        .handle_signal_response(&other, self)
                        .await;
                }
                Ok(handled)
            }
        }
    }

    /// Merge active participants into the registry and drop everyone who
    /// transitioned to a non-active state.
    async fn merge_participants(&self, update: ParticipantUpdate) {
        let mut participants = self.remote_participants.write().await;
        for participant in update.participants {
            debug!(
                "participant update: {} -> {:?}",
                participant.sid, participant.state
            );
            match participant.state {
                ParticipantState::Active => {
                    participants.insert(participant.sid.clone(), participant);
                }
                _ => {
                    participants.remove(&participant.sid);
                }
            }
        }
    }

    async fn replace_connection_quality(&self, update: ConnectionQualityUpdate) {
        let snapshot = update
            .updates
            .into_iter()
            .map(|info| (info.participant_sid.clone(), info))
            .collect();
        *self.connection_quality.write().await = snapshot;
    }

    async fn replace_active_speakers(&self, update: SpeakersChanged) {
        let speakers: Vec<SpeakerInfo> =
            update.speakers.into_iter().filter(|s| s.active).collect();
        *self.active_speakers.write().await = speakers;
    }

    /// Store the join snapshot: once per connection attempt.
    pub async fn store_join_response(&self, join: &JoinResponse) {
        info!(
            "joined room '{}' as {}",
            join.room.name, join.participant.identity
        );
        *self.join_response.write().await = Some(join.clone());
        *self.local_participant.write().await = Some(join.participant.clone());
        let mut participants = self.remote_participants.write().await;
        for participant in &join.other_participants {
            participants.insert(participant.sid.clone(), participant.clone());
        }
    }

    // ------------------------------------------------------------------
    // peer event routing

    /// Drain target for a session's native event stream: forwards local
    /// candidates as trickle messages, maintains the stream registry, and
    /// feeds data-channel bytes into the inbound packet stream.
    pub async fn handle_peer_event(&self, role: PeerRole, event: PeerEvent) {
        match event {
            PeerEvent::CandidateGenerated(Some(candidate_init)) => {
                let target = match role {
                    PeerRole::Publisher => crate::signaling::messages::SignalTarget::Publisher,
                    PeerRole::Subscriber => crate::signaling::messages::SignalTarget::Subscriber,
                };
                self.enqueue(SignalRequest::Trickle(Trickle {
                    target,
                    candidate_init,
                }));
            }
            PeerEvent::CandidateGenerated(None) => {
                debug!("{}: ice gathering complete", role);
            }
            PeerEvent::TrackAdded { track, .. } => {
                let stream_id = track.stream_id();
                let (participant_sid, _) = RemoteStream::parse_stream_id(&stream_id);
                info!(
                    "{}: remote track {} on stream {}",
                    role,
                    track.id(),
                    stream_id
                );
                let mut streams = self.media_streams.write().await;
                let entry = streams
                    .entry(participant_sid.to_string())
                    .or_insert_with(|| RemoteStream {
                        participant_sid: participant_sid.to_string(),
                        track_ids: Vec::new(),
                    });
                let track_id = track.id();
                if !entry.track_ids.contains(&track_id) {
                    entry.track_ids.push(track_id);
                }
            }
            PeerEvent::DataChannelMessage { data, label } => {
                match serde_json::from_slice::<DataPacket>(&data) {
                    Ok(packet) => {
                        if let DataPayload::Speaker(update) = &packet.payload {
                            self.replace_active_speakers(update.clone()).await;
                        }
                        let _ = self.incoming_packets.send(packet);
                    }
                    Err(e) => {
                        warn!(
                            "dropping malformed data packet on '{}': {}",
                            label.as_str(),
                            e
                        );
                    }
                }
            }
            PeerEvent::ConnectionState(state) => {
                debug!("{}: connection state {}", role, state);
            }
            PeerEvent::NegotiationNeeded => {
                trace!("{}: negotiation needed", role);
            }
            other => {
                trace!("{}: unrouted peer event: {:?}", role, other);
            }
        }
    }

    // ------------------------------------------------------------------
    // add-track rendezvous

    fn track_map(&self, kind: TrackKind) -> &RwLock<HashMap<String, TrackInfo>> {
        match kind {
            TrackKind::Audio => &self.audio_tracks,
            TrackKind::Video => &self.video_tracks,
            TrackKind::Data => &self.data_tracks,
        }
    }

    /// Enqueue an add-track request and wait for the first matching entry
    /// in the per-kind registry under the request's client id.
    ///
    /// The rendezvous keys on the client-generated id alone; there is no
    /// request/response correlation id, so a stale acknowledgment for a
    /// previous attempt with the same id satisfies this wait.
    pub async fn send_add_track_request(&self, request: AddTrackRequest) -> Result<TrackInfo> {
        self.send_add_track_request_with_timeout(request, self.config.add_track_timeout)
            .await
    }

    pub async fn send_add_track_request_with_timeout(
        &self,
        request: AddTrackRequest,
        timeout: Duration,
    ) -> Result<TrackInfo> {
        let mut events = self.track_events.subscribe();
        let kind = request.kind;
        let cid = request.cid.clone();

        self.enqueue(SignalRequest::AddTrack(request));
        debug!("waiting for track published response for cid={}", cid);

        // an acknowledgment may already be in the registry
        if let Some(info) = self.track_map(kind).read().await.get(&cid) {
            return Ok(info.clone());
        }

        let wait = async {
            loop {
                match events.recv().await {
                    Ok((event_kind, event_cid, info))
                        if event_kind == kind && event_cid == cid =>
                    {
                        return Some(info);
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // the gap may have swallowed our event; the
                        // registry has the authoritative state
                        if let Some(info) = self.track_map(kind).read().await.get(&cid) {
                            return Some(info.clone());
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Some(info)) => {
                debug!("track published response received for cid={}", cid);
                Ok(info)
            }
            _ => Err(Error::Timeout("track published acknowledgment")),
        }
    }

    // ------------------------------------------------------------------
    // outbound helpers

    pub fn send_mute_track(&self, track_sid: &str, muted: bool) {
        self.enqueue(SignalRequest::Mute(MuteTrackRequest {
            sid: track_sid.to_string(),
            muted,
        }));
    }

    pub fn send_track_settings(
        &self,
        track_sids: Vec<String>,
        enabled: bool,
        dimensions: VideoDimensions,
        quality: VideoQuality,
        fps: u32,
    ) {
        self.enqueue(SignalRequest::TrackSettings(UpdateTrackSettings {
            track_sids,
            disabled: !enabled,
            width: dimensions.width,
            height: dimensions.height,
            quality,
            fps,
        }));
    }

    pub fn send_subscription_permission(
        &self,
        all_participants: bool,
        track_permissions: Vec<TrackPermission>,
    ) {
        self.enqueue(SignalRequest::SubscriptionPermission(
            SubscriptionPermission {
                all_participants,
                track_permissions,
            },
        ));
    }

    pub fn send_ping(&self, timestamp: i64) {
        self.enqueue(SignalRequest::Ping(Ping { timestamp }));
    }

    // ------------------------------------------------------------------
    // application data packets

    /// Queue an application data packet for delivery over the publisher's
    /// data channel.
    pub fn send_data_packet(&self, packet: DataPacket) {
        let _ = self.outgoing_packets_tx.send(packet);
    }

    /// Take the outgoing packet queue. Yields `None` after the first call.
    pub fn take_outgoing_packets(&self) -> Option<mpsc::UnboundedReceiver<DataPacket>> {
        self.outgoing_packets_rx.lock().take()
    }

    /// Subscribe to packets arriving over the data channels.
    pub fn incoming_packets(&self) -> broadcast::Receiver<DataPacket> {
        self.incoming_packets.subscribe()
    }

    // ------------------------------------------------------------------
    // observable state

    pub async fn join_response(&self) -> Option<JoinResponse> {
        self.join_response.read().await.clone()
    }

    pub async fn local_participant(&self) -> Option<ParticipantInfo> {
        self.local_participant.read().await.clone()
    }

    pub async fn remote_participants(&self) -> HashMap<String, ParticipantInfo> {
        self.remote_participants.read().await.clone()
    }

    pub async fn audio_tracks(&self) -> HashMap<String, TrackInfo> {
        self.audio_tracks.read().await.clone()
    }

    pub async fn video_tracks(&self) -> HashMap<String, TrackInfo> {
        self.video_tracks.read().await.clone()
    }

    pub async fn data_tracks(&self) -> HashMap<String, TrackInfo> {
        self.data_tracks.read().await.clone()
    }

    pub async fn connection_quality(&self) -> HashMap<String, ConnectionQualityInfo> {
        self.connection_quality.read().await.clone()
    }

    pub async fn active_speakers(&self) -> Vec<SpeakerInfo> {
        self.active_speakers.read().await.clone()
    }

    pub async fn media_streams(&self) -> HashMap<String, RemoteStream> {
        self.media_streams.read().await.clone()
    }

    pub fn token_updates(&self) -> watch::Receiver<Option<String>> {
        self.token_updates.subscribe()
    }

    // ------------------------------------------------------------------
    // teardown

    /// Close the hub's streams and tear both sessions down. Best-effort;
    /// never fails.
    pub async fn teardown(&self) {
        info!("hub teardown");
        self.factory.teardown().await;
        self.join_response.write().await.take();
    }
}

impl std::fmt::Debug for SignalHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalHub").finish_non_exhaustive()
    }
}
