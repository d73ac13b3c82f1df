//! Top-level room session.
//!
//! `connect` ties the signaling channel, the control hub and the two
//! negotiation sessions together under one cancel-on-first-completion
//! group: the channel run loop, one event router per session, the inbound
//! control-message router and the outbound data-packet pump. Whichever
//! ends first takes the rest down, after which the hub tears down.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RoomConfig;
use crate::error::{Error, Result};
use crate::hub::SignalHub;
use crate::media::audio::AudioDevice;
use crate::media::{Publication, VideoFrame, VideoQuality};
use crate::peer::{DataChannelLabel, PeerSession, PeerSessionFactory};
use crate::signaling::messages::{
    AddTrackRequest, DataPacket, DataPacketKind, DataPayload, SignalResponse, UserPacket,
};
use crate::signaling::SignalingChannel;

/// Pause before re-queueing a data packet that failed to send.
const PACKET_RETRY_DELAY: Duration = Duration::from_millis(250);

/// A connection to one room. Created at connect time, destroyed at
/// disconnect; room state is observed through the [`SignalHub`].
pub struct RoomSession {
    pub id: String,
    hub: Arc<SignalHub>,
    audio_device: AudioDevice,
    config: RoomConfig,
}

impl RoomSession {
    pub fn new(config: RoomConfig) -> Result<Self> {
        let factory = PeerSessionFactory::new(&config)?;
        let hub = Arc::new(SignalHub::new(factory, config.clone()));
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            hub,
            audio_device: AudioDevice::new(),
            config,
        })
    }

    pub fn hub(&self) -> &Arc<SignalHub> {
        &self.hub
    }

    pub fn audio_device(&self) -> &AudioDevice {
        &self.audio_device
    }

    /// Subscribe to application packets arriving over the data channels.
    pub fn incoming_packets(&self) -> broadcast::Receiver<DataPacket> {
        self.hub.incoming_packets()
    }

    /// Queue an application payload for delivery to the given participants.
    pub fn send_user_data(
        &self,
        payload: Vec<u8>,
        destination_sids: Vec<String>,
        kind: DataPacketKind,
    ) {
        self.hub.send_data_packet(DataPacket {
            kind,
            payload: DataPayload::User(UserPacket {
                participant_sid: String::new(),
                payload,
                destination_sids,
            }),
        });
    }

    /// Connect to the room and run until the connection ends or the future
    /// is cancelled. Always tears the hub down on the way out.
    pub async fn connect(&self, url: &str, token: &str) -> Result<()> {
        let endpoint = build_url(url, token)?;
        let channel = SignalingChannel::new(self.config.signaling.clone());
        let outbound = self
            .hub
            .take_outbound()
            .ok_or_else(|| Error::Signaling("session already connected".to_string()))?;
        let inbound = channel.inbound();

        info!("session {} connecting", self.id);
        let result = tokio::select! {
            r = channel.run(endpoint, outbound) => r,
            r = Self::route_peer_events(&self.hub, self.hub.factory().publisher()) => r,
            r = Self::route_peer_events(&self.hub, self.hub.factory().subscriber()) => r,
            r = Self::route_inbound(&self.hub, inbound) => r,
            r = self.pump_outgoing_packets() => r,
        };

        info!("session {} is disconnecting", self.id);
        channel.shutdown();
        self.hub.teardown().await;
        result
    }

    /// Drain one session's native event stream into the hub.
    async fn route_peer_events(hub: &Arc<SignalHub>, session: &Arc<PeerSession>) -> Result<()> {
        let mut events = session
            .take_events()
            .ok_or_else(|| Error::Signaling("session already connected".to_string()))?;
        while let Some(event) = events.recv().await {
            hub.handle_peer_event(session.role(), event).await;
        }
        debug!("{} event stream ended", session.role());
        Ok(())
    }

    /// Deserialize inbound frames and hand them to the hub router. A
    /// malformed frame is dropped with a log line and never aborts the
    /// router.
    async fn route_inbound(
        hub: &Arc<SignalHub>,
        mut inbound: broadcast::Receiver<Bytes>,
    ) -> Result<()> {
        loop {
            match inbound.recv().await {
                Ok(frame) => match serde_json::from_slice::<SignalResponse>(&frame) {
                    Ok(message) => {
                        debug!("incoming message: {:?}", message);
                        hub.handle(message).await?;
                    }
                    Err(e) => {
                        warn!("dropping malformed control message: {}", e);
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("inbound buffer overflowed, {} frames dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }

    /// Deliver queued application packets over the publisher's data
    /// channel, negotiating first when not yet connected. Failed packets
    /// are re-queued for retry.
    async fn pump_outgoing_packets(&self) -> Result<()> {
        let mut packets = self
            .hub
            .take_outgoing_packets()
            .ok_or_else(|| Error::Signaling("session already connected".to_string()))?;

        while let Some(packet) = packets.recv().await {
            let publisher = self.hub.factory().publisher();

            if let Err(e) = publisher
                .negotiate_if_not_connected(&self.hub, self.config.connected_timeout)
                .await
            {
                warn!("publisher not connected, re-queueing data packet: {}", e);
                tokio::time::sleep(PACKET_RETRY_DELAY).await;
                self.hub.send_data_packet(packet);
                continue;
            }

            let label = match packet.kind {
                DataPacketKind::Reliable => DataChannelLabel::Reliable,
                DataPacketKind::Lossy => DataChannelLabel::Lossy,
            };
            match serde_json::to_vec(&packet) {
                Ok(frame) => {
                    if let Err(e) = publisher.send(&Bytes::from(frame), label).await {
                        warn!("data packet send failed, re-queueing: {}", e);
                        tokio::time::sleep(PACKET_RETRY_DELAY).await;
                        self.hub.send_data_packet(packet);
                    }
                }
                Err(e) => {
                    error!("failed to serialize data packet, dropping: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Publish a video/audio pair and stream encoded frames until the
    /// source ends. On stop the tracks are muted, removed and the session
    /// renegotiates.
    pub async fn start_media_stream<S>(&self, mut frames: S, audio_enabled: bool) -> Result<()>
    where
        S: Stream<Item = VideoFrame> + Unpin + Send,
    {
        info!("session {} publishing media stream", self.id);

        let video_publication = Publication::video();
        let audio_publication = Publication::audio();
        let publisher = Arc::clone(self.hub.factory().publisher());

        // create the native senders and fire the add-track requests
        // concurrently; the server acknowledgment rendezvous keys on the
        // publication's client id
        let (video_tx, _audio_tx, video_info, audio_info) = tokio::try_join!(
            publisher.add_transceiver(&video_publication),
            publisher.add_transceiver(&audio_publication),
            self.hub
                .send_add_track_request(AddTrackRequest::from_publication(&video_publication)),
            self.hub
                .send_add_track_request(AddTrackRequest::from_publication(&audio_publication)),
        )?;

        publisher.offering_machine(&self.hub);
        publisher
            .wait_until_connected(self.config.connected_timeout)
            .await?;

        self.hub.send_track_settings(
            vec![video_info.sid.clone()],
            true,
            video_publication.dimensions,
            VideoQuality::High,
            30,
        );
        self.hub.send_mute_track(&audio_info.sid, !audio_enabled);
        self.audio_device.set_recording(audio_enabled).await;

        while let Some(frame) = frames.next().await {
            if let Err(e) = video_tx.write_frame(&frame).await {
                warn!("failed to write video frame: {}", e);
            }
        }

        info!("media stream ended, unpublishing");
        self.hub.send_mute_track(&video_info.sid, true);
        self.hub.send_mute_track(&audio_info.sid, true);
        self.audio_device.set_recording(false).await;

        if let Err(e) = publisher.remove_track(&video_publication.cid).await {
            warn!("failed to remove video track: {}", e);
        }
        if let Err(e) = publisher.remove_track(&audio_publication.cid).await {
            warn!("failed to remove audio track: {}", e);
        }

        // tell the other side the tracks are gone
        publisher.offering_machine(&self.hub);
        Ok(())
    }
}

/// Assemble the websocket endpoint from the server url and access token.
pub(crate) fn build_url(url: &str, token: &str) -> Result<String> {
    let trimmed = url.trim_end_matches('/');
    let base = if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else {
        return Err(Error::InvalidEndpoint(url.to_string()));
    };
    Ok(format!("{base}/rtc?access_token={token}&auto_subscribe=true"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_url_schemes() {
        assert_eq!(
            build_url("https://rooms.example.com", "tok").unwrap(),
            "wss://rooms.example.com/rtc?access_token=tok&auto_subscribe=true"
        );
        assert_eq!(
            build_url("ws://127.0.0.1:7880/", "tok").unwrap(),
            "ws://127.0.0.1:7880/rtc?access_token=tok&auto_subscribe=true"
        );
        assert!(matches!(
            build_url("ftp://nope", "tok"),
            Err(Error::InvalidEndpoint(_))
        ));
    }
}
