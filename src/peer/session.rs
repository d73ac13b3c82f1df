//! One negotiation session per role, wrapping a native peer connection.
//!
//! The session owns the handle, the signaling/ice state mirrors, the
//! pending-candidate queue and the data channel handles. Every operation
//! against the native handle is funneled through this type so exactly one
//! writer touches it at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};
use webrtc::api::API;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::IceServerConfig;
use crate::error::{Error, Result};
use crate::media::{Publication, TrackKind, VideoFrame};
use crate::peer::events::{DataChannelLabel, PeerEvent, LOSSY_LABEL, RELIABLE_LABEL};
use crate::signaling::messages::JoinResponse;

/// Session role. Publisher sessions originate offers and own the outgoing
/// data channels; subscriber sessions only answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Publisher,
    Subscriber,
}

impl PeerRole {
    pub fn is_publisher(&self) -> bool {
        matches!(self, PeerRole::Publisher)
    }
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerRole::Publisher => write!(f, "publisher"),
            PeerRole::Subscriber => write!(f, "subscriber"),
        }
    }
}

/// Sender side of a published track: the local sample track plus the
/// transceiver it rides on.
pub struct Transmitter {
    pub track: Arc<TrackLocalStaticSample>,
    pub transceiver: Arc<RTCRtpTransceiver>,
}

impl Transmitter {
    /// Write one encoded frame into the outgoing track.
    pub async fn write_frame(&self, frame: &VideoFrame) -> Result<()> {
        self.track
            .write_sample(&Sample {
                data: frame.data.clone(),
                duration: frame.duration,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

/// A negotiation session: role flag, native handle (absent until
/// configured), state mirrors, pending-candidate queue and data channels.
pub struct PeerSession {
    role: PeerRole,
    static_ice_servers: Vec<IceServerConfig>,

    pc: RwLock<Option<Arc<RTCPeerConnection>>>,

    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,

    // state mirrors, updated only by the native delegate callbacks
    signaling_state: Arc<watch::Sender<RTCSignalingState>>,
    connection_state: Arc<watch::Sender<RTCPeerConnectionState>>,
    ice_connection_state: Arc<watch::Sender<RTCIceConnectionState>>,
    ice_gathering_state: Arc<watch::Sender<RTCIceGathererState>>,

    /// Candidates that arrived before the remote description. Flushed and
    /// cleared exactly once, right after the remote description applies.
    pending_candidates: Mutex<Vec<String>>,

    /// At most one offer attempt runs at a time.
    pub(crate) offer_in_progress: AtomicBool,
    pub(crate) offer_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,

    reliable_channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    lossy_channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
}

impl PeerSession {
    pub fn new(role: PeerRole, static_ice_servers: Vec<IceServerConfig>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (signaling_state, _) = watch::channel(RTCSignalingState::Stable);
        let (connection_state, _) = watch::channel(RTCPeerConnectionState::New);
        let (ice_connection_state, _) = watch::channel(RTCIceConnectionState::New);
        let (ice_gathering_state, _) = watch::channel(RTCIceGathererState::New);
        Self {
            role,
            static_ice_servers,
            pc: RwLock::new(None),
            events_tx,
            events_rx: parking_lot::Mutex::new(Some(events_rx)),
            signaling_state: Arc::new(signaling_state),
            connection_state: Arc::new(connection_state),
            ice_connection_state: Arc::new(ice_connection_state),
            ice_gathering_state: Arc::new(ice_gathering_state),
            pending_candidates: Mutex::new(Vec::new()),
            offer_in_progress: AtomicBool::new(false),
            offer_task: parking_lot::Mutex::new(None),
            reliable_channel: Arc::new(RwLock::new(None)),
            lossy_channel: Arc::new(RwLock::new(None)),
        }
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// Take the session's event stream. Yields `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events_rx.lock().take()
    }

    pub fn signaling_state(&self) -> watch::Receiver<RTCSignalingState> {
        self.signaling_state.subscribe()
    }

    pub fn connection_state(&self) -> watch::Receiver<RTCPeerConnectionState> {
        self.connection_state.subscribe()
    }

    pub fn ice_connection_state(&self) -> watch::Receiver<RTCIceConnectionState> {
        self.ice_connection_state.subscribe()
    }

    pub async fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.lock().await.len()
    }

    pub(crate) async fn require_pc(&self) -> Result<Arc<RTCPeerConnection>> {
        self.pc
            .read()
            .await
            .clone()
            .ok_or(Error::NoPeerConnection)
    }

    /// Build the native handle from the join data, wire the delegate
    /// callbacks and capture the handle's initial states.
    ///
    /// ICE servers come from the join response unless a static override
    /// was configured; a forced-relay room restricts the transport policy.
    pub async fn configure(&self, api: &API, join: &JoinResponse) -> Result<()> {
        let mut config = RTCConfiguration {
            ice_servers: self.ice_servers_for(join),
            ..Default::default()
        };
        if join.force_relay {
            config.ice_transport_policy = RTCIceTransportPolicy::Relay;
        }

        info!("configuring {} peer connection", self.role);

        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(|e| Error::CreatePeerConnection(e.to_string()))?;
        let pc = Arc::new(pc);

        self.wire_callbacks(&pc);

        // capture the handle's initial states into the mirrors
        self.signaling_state.send_replace(pc.signaling_state());
        self.connection_state.send_replace(pc.connection_state());
        self.ice_connection_state
            .send_replace(pc.ice_connection_state());

        *self.pc.write().await = Some(pc);
        Ok(())
    }

    fn ice_servers_for(&self, join: &JoinResponse) -> Vec<RTCIceServer> {
        if !self.static_ice_servers.is_empty() {
            return self
                .static_ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone(),
                    credential: s.credential.clone(),
                    ..Default::default()
                })
                .collect();
        }
        join.ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone(),
                credential: s.credential.clone(),
                ..Default::default()
            })
            .collect()
    }

    fn wire_callbacks(&self, pc: &Arc<RTCPeerConnection>) {
        let events = self.events_tx.clone();
        let mirror = Arc::clone(&self.signaling_state);
        pc.on_signaling_state_change(Box::new(move |state| {
            mirror.send_replace(state);
            let _ = events.send(PeerEvent::SignalingState(state));
            Box::pin(async {})
        }));

        let events = self.events_tx.clone();
        let mirror = Arc::clone(&self.connection_state);
        pc.on_peer_connection_state_change(Box::new(move |state| {
            mirror.send_replace(state);
            let _ = events.send(PeerEvent::ConnectionState(state));
            Box::pin(async {})
        }));

        let events = self.events_tx.clone();
        let mirror = Arc::clone(&self.ice_connection_state);
        pc.on_ice_connection_state_change(Box::new(move |state| {
            mirror.send_replace(state);
            let _ = events.send(PeerEvent::IceConnectionState(state));
            Box::pin(async {})
        }));

        let events = self.events_tx.clone();
        let mirror = Arc::clone(&self.ice_gathering_state);
        pc.on_ice_gathering_state_change(Box::new(move |state| {
            mirror.send_replace(state);
            let _ = events.send(PeerEvent::IceGatheringState(state));
            Box::pin(async {})
        }));

        let events = self.events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let init_json = candidate.and_then(|c| match c.to_json() {
                Ok(init) => serde_json::to_string(&init).ok(),
                Err(e) => {
                    warn!("failed to serialize local candidate: {}", e);
                    None
                }
            });
            let _ = events.send(PeerEvent::CandidateGenerated(init_json));
            Box::pin(async {})
        }));

        let events = self.events_tx.clone();
        pc.on_track(Box::new(move |track, receiver, _transceiver| {
            let _ = events.send(PeerEvent::TrackAdded { track, receiver });
            Box::pin(async {})
        }));

        let events = self.events_tx.clone();
        let reliable_slot = Arc::clone(&self.reliable_channel);
        let lossy_slot = Arc::clone(&self.lossy_channel);
        pc.on_data_channel(Box::new(move |channel| {
            let events = events.clone();
            let reliable_slot = Arc::clone(&reliable_slot);
            let lossy_slot = Arc::clone(&lossy_slot);
            Box::pin(async move {
                let label = DataChannelLabel::from(channel.label());
                debug!("remote data channel opened: {}", label.as_str());
                Self::wire_data_channel(&channel, label.clone(), &events);
                match label {
                    DataChannelLabel::Reliable => {
                        *reliable_slot.write().await = Some(Arc::clone(&channel));
                    }
                    DataChannelLabel::Lossy => {
                        *lossy_slot.write().await = Some(Arc::clone(&channel));
                    }
                    DataChannelLabel::Other(_) => {}
                }
                let _ = events.send(PeerEvent::DataChannelOpened { label, channel });
            })
        }));

        let events = self.events_tx.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let _ = events.send(PeerEvent::NegotiationNeeded);
            Box::pin(async {})
        }));
    }

    fn wire_data_channel(
        channel: &Arc<RTCDataChannel>,
        label: DataChannelLabel,
        events: &mpsc::UnboundedSender<PeerEvent>,
    ) {
        let tx = events.clone();
        let open_label = label.clone();
        channel.on_open(Box::new(move || {
            let _ = tx.send(PeerEvent::DataChannelStateChanged {
                label: open_label.clone(),
                state: RTCDataChannelState::Open,
            });
            Box::pin(async {})
        }));

        let tx = events.clone();
        let close_label = label.clone();
        channel.on_close(Box::new(move || {
            let _ = tx.send(PeerEvent::DataChannelStateChanged {
                label: close_label.clone(),
                state: RTCDataChannelState::Closed,
            });
            Box::pin(async {})
        }));

        let tx = events.clone();
        let message_label = label.clone();
        channel.on_message(Box::new(move |message| {
            let _ = tx.send(PeerEvent::DataChannelMessage {
                label: message_label.clone(),
                data: message.data,
            });
            Box::pin(async {})
        }));

        let error_label = label;
        channel.on_error(Box::new(move |e| {
            warn!("data channel '{}' error: {}", error_label.as_str(), e);
            Box::pin(async {})
        }));
    }

    /// Open the reliable and lossy data channels by label. Publisher only;
    /// a subscriber receives its channels from the remote side instead.
    pub async fn configure_data_channels(&self) -> Result<()> {
        if !self.role.is_publisher() {
            return Ok(());
        }
        let pc = self.require_pc().await?;

        let reliable = pc
            .create_data_channel(
                RELIABLE_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        Self::wire_data_channel(&reliable, DataChannelLabel::Reliable, &self.events_tx);
        *self.reliable_channel.write().await = Some(reliable);

        let lossy = pc
            .create_data_channel(
                LOSSY_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    max_retransmits: Some(0),
                    ..Default::default()
                }),
            )
            .await?;
        Self::wire_data_channel(&lossy, DataChannelLabel::Lossy, &self.events_tx);
        *self.lossy_channel.write().await = Some(lossy);

        Ok(())
    }

    /// Queue the candidate while no remote description is set, otherwise
    /// apply it right away.
    pub async fn add_remote_candidate(&self, candidate_init: &str) -> Result<()> {
        let pc = self.require_pc().await?;
        if pc.remote_description().await.is_none() {
            debug!("{}: queueing candidate until remote description", self.role);
            self.pending_candidates
                .lock()
                .await
                .push(candidate_init.to_string());
            return Ok(());
        }
        self.apply_candidate(&pc, candidate_init).await
    }

    async fn apply_candidate(&self, pc: &RTCPeerConnection, candidate_init: &str) -> Result<()> {
        // candidates travel as candidate-init JSON; a bare candidate
        // string is accepted as a fallback
        let init = serde_json::from_str::<RTCIceCandidateInit>(candidate_init).unwrap_or_else(
            |_| RTCIceCandidateInit {
                candidate: candidate_init.to_string(),
                sdp_mid: None,
                sdp_mline_index: None,
                username_fragment: None,
            },
        );
        pc.add_ice_candidate(init).await?;
        Ok(())
    }

    /// Apply the remote description, then flush the pending candidates by
    /// applying them concurrently. The first failure is surfaced after the
    /// whole batch ran; the queue is cleared either way.
    pub async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<()> {
        let pc = self.require_pc().await?;
        pc.set_remote_description(desc).await?;

        let pending = std::mem::take(&mut *self.pending_candidates.lock().await);
        if !pending.is_empty() {
            debug!("{}: flushing {} pending candidates", self.role, pending.len());
            let results = join_all(
                pending
                    .iter()
                    .map(|candidate| self.apply_candidate(&pc, candidate)),
            )
            .await;
            for result in results {
                result?;
            }
        }
        Ok(())
    }

    pub async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<()> {
        let pc = self.require_pc().await?;
        pc.set_local_description(desc).await?;
        Ok(())
    }

    pub async fn create_offer(&self) -> Result<RTCSessionDescription> {
        let pc = self.require_pc().await?;
        Ok(pc.create_offer(None).await?)
    }

    pub async fn create_answer(&self) -> Result<RTCSessionDescription> {
        let pc = self.require_pc().await?;
        Ok(pc.create_answer(None).await?)
    }

    /// Send bytes on the preferred data channel, falling back to the other
    /// when the preferred one is not open.
    pub async fn send(&self, data: &Bytes, preferred: DataChannelLabel) -> Result<usize> {
        let (primary, fallback) = match preferred {
            DataChannelLabel::Lossy => (&self.lossy_channel, &self.reliable_channel),
            _ => (&self.reliable_channel, &self.lossy_channel),
        };

        let channel = match primary.read().await.clone() {
            Some(channel) if channel.ready_state() == RTCDataChannelState::Open => channel,
            _ => fallback
                .read()
                .await
                .clone()
                .ok_or(Error::NoDataChannel)?,
        };
        Ok(channel.send(data).await?)
    }

    /// Add a sendonly transceiver carrying a local sample track for the
    /// publication. Publisher only.
    pub async fn add_transceiver(&self, publication: &Publication) -> Result<Transmitter> {
        let pc = self.require_pc().await?;

        let capability = match publication.kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: webrtc::api::media_engine::MIME_TYPE_OPUS.to_string(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            _ => RTCRtpCodecCapability {
                mime_type: webrtc::api::media_engine::MIME_TYPE_H264.to_string(),
                clock_rate: 90_000,
                ..Default::default()
            },
        };

        let track = Arc::new(TrackLocalStaticSample::new(
            capability,
            publication.cid.clone(),
            publication.name.clone(),
        ));

        let init = RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Sendonly,
            send_encodings: Vec::new(),
        };
        let transceiver = pc
            .add_transceiver_from_track(
                Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>,
                Some(init),
            )
            .await
            .map_err(|e| Error::CreateTransceiver(e.to_string()))?;

        Ok(Transmitter { track, transceiver })
    }

    /// Remove every sender whose track carries the given id.
    pub async fn remove_track(&self, track_id: &str) -> Result<()> {
        let pc = self.require_pc().await?;
        for sender in pc.get_senders().await {
            if let Some(track) = sender.track().await {
                if track.id() == track_id {
                    pc.remove_track(&sender).await?;
                }
            }
        }
        Ok(())
    }

    /// Wait until the connection state mirror reports connected.
    pub async fn wait_until_connected(&self, timeout: std::time::Duration) -> Result<()> {
        let mut state = self.connection_state.subscribe();
        let connected = async {
            loop {
                if *state.borrow_and_update() == RTCPeerConnectionState::Connected {
                    return;
                }
                if state.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(timeout, connected)
            .await
            .map_err(|_| Error::Timeout("connected state"))?;
        if *self.connection_state.borrow() == RTCPeerConnectionState::Connected {
            Ok(())
        } else {
            Err(Error::Timeout("connected state"))
        }
    }

    /// Cancel the in-flight offer task, close the data channels and the
    /// native handle. Best-effort: failures are logged, never surfaced.
    pub async fn teardown(&self) {
        info!("{} session teardown", self.role);

        if let Some(task) = self.offer_task.lock().take() {
            task.abort();
        }

        for slot in [&self.reliable_channel, &self.lossy_channel] {
            if let Some(channel) = slot.write().await.take() {
                if let Err(e) = channel.close().await {
                    warn!("error closing data channel: {}", e);
                }
            }
        }

        if let Some(pc) = self.pc.write().await.take() {
            if let Err(e) = pc.close().await {
                warn!("error closing peer connection: {}", e);
            }
        }
        self.connection_state
            .send_replace(RTCPeerConnectionState::Closed);
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}
