//! Offer/answer negotiation driving a session's native handle.
//!
//! The publisher's offering machine watches the signaling-state mirror and
//! walks it to a negotiated `stable` state; the subscriber never
//! originates offers and only answers what the server sends. Inbound
//! negotiation messages are routed here from the control hub.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use crate::error::{Error, Result};
use crate::hub::SignalHub;
use crate::peer::session::PeerSession;
use crate::signaling::messages::{
    SessionDescription, SignalRequest, SignalResponse, SignalTarget,
};

/// Clears the offer-in-progress flag when an offer attempt ends, including
/// by cancellation.
struct OfferGuard<'a>(&'a AtomicBool);

impl Drop for OfferGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl PeerSession {
    /// Run one offer round. A second call while an offer is in flight is a
    /// no-op returning the current signaling state; subscriber sessions
    /// never offer.
    pub async fn negotiate(&self, hub: &SignalHub) -> Result<RTCSignalingState> {
        if !self.role().is_publisher() {
            return Ok(*self.signaling_state().borrow());
        }
        if self.offer_in_progress.swap(true, Ordering::SeqCst) {
            debug!("offer already in progress, ignoring negotiate request");
            return Ok(*self.signaling_state().borrow());
        }
        let _guard = OfferGuard(&self.offer_in_progress);
        self.offer_machine(hub).await
    }

    /// The offering state machine. Exits with the terminal `stable` state
    /// once both descriptions are in place, or fails with `MakeOffer` when
    /// the state stream ends first.
    async fn offer_machine(&self, hub: &SignalHub) -> Result<RTCSignalingState> {
        let pc = self.require_pc().await?;
        let mut states = self.signaling_state();
        let mut first_offer_sent = false;

        debug!("{} offering machine >>> start", self.role());
        loop {
            let state = *states.borrow_and_update();
            let have_local = pc.local_description().await.is_some();
            let have_remote = pc.remote_description().await.is_some();

            match state {
                RTCSignalingState::Stable if !first_offer_sent => {
                    let offer = pc.create_offer(None).await?;
                    let sdp = offer.sdp.clone();
                    pc.set_local_description(offer).await?;
                    hub.enqueue(SignalRequest::Offer(SessionDescription::offer(sdp)));
                    first_offer_sent = true;
                }
                RTCSignalingState::HaveLocalOffer => {
                    debug!("{} is waiting for an answer", self.role());
                }
                RTCSignalingState::Stable if have_local && have_remote => {
                    debug!("{} offering machine <<< end", self.role());
                    return Ok(state);
                }
                other => {
                    debug!("{} ignoring signaling state {}", self.role(), other);
                }
            }

            if states.changed().await.is_err() {
                // the state stream ended before negotiation concluded
                return Err(Error::MakeOffer);
            }
        }
    }

    /// Fire-and-forget variant: cancels any previous offer task and runs a
    /// new offer round in the background.
    pub fn offering_machine(self: &Arc<Self>, hub: &Arc<SignalHub>) {
        if let Some(task) = self.offer_task.lock().take() {
            task.abort();
        }
        let session = Arc::clone(self);
        let hub = Arc::clone(hub);
        let task = tokio::spawn(async move {
            if let Err(e) = session.negotiate(&hub).await {
                warn!("offering machine failed: {}", e);
            }
        });
        *self.offer_task.lock() = Some(task);
    }

    /// Negotiate only when the connection is not already connected or
    /// connecting, then wait for it to come up.
    pub async fn negotiate_if_not_connected(
        &self,
        hub: &SignalHub,
        timeout: std::time::Duration,
    ) -> Result<()> {
        use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState as Pcs;
        let state = *self.connection_state().borrow();
        if matches!(state, Pcs::Connected | Pcs::Connecting) {
            return Ok(());
        }
        debug!("negotiating, connection state is {}", state);
        self.negotiate(hub).await?;
        self.wait_until_connected(timeout).await
    }

    /// Route one inbound control message into this session. Returns
    /// whether the message was consumed.
    pub async fn handle_signal_response(
        self: &Arc<Self>,
        message: &SignalResponse,
        hub: &Arc<SignalHub>,
    ) -> Result<bool> {
        let is_publisher = self.role().is_publisher();
        match message {
            // arrives first; the publisher stores the room snapshot and
            // both sessions configure their handles from it
            SignalResponse::Join(join) if is_publisher => {
                hub.store_join_response(join).await;
                self.configure(hub.api(), join).await?;
                self.configure_data_channels().await?;
                if !join.subscriber_primary {
                    self.offering_machine(hub);
                }
                // not consumed: the subscriber configures from it as well
                Ok(false)
            }
            SignalResponse::Join(join) => {
                self.configure(hub.api(), join).await?;
                Ok(true)
            }

            SignalResponse::Trickle(trickle)
                if trickle.target == SignalTarget::Publisher && is_publisher =>
            {
                self.add_remote_candidate(&trickle.candidate_init).await?;
                Ok(true)
            }
            SignalResponse::Trickle(trickle)
                if trickle.target == SignalTarget::Subscriber && !is_publisher =>
            {
                self.add_remote_candidate(&trickle.candidate_init).await?;
                Ok(true)
            }

            // answers conclude the publisher's offer round
            SignalResponse::Answer(answer) if is_publisher => {
                info!("applying remote answer");
                let desc = RTCSessionDescription::answer(answer.sdp.clone())?;
                self.set_remote_description(desc).await?;
                Ok(true)
            }

            // offers over signaling are for the subscribing session only
            SignalResponse::Offer(offer) if !is_publisher => {
                info!("applying remote offer, answering");
                let desc = RTCSessionDescription::offer(offer.sdp.clone())?;
                self.set_remote_description(desc).await?;
                let answer = self.create_answer().await?;
                let sdp = answer.sdp.clone();
                self.set_local_description(answer).await?;
                hub.enqueue(SignalRequest::Answer(SessionDescription::answer(sdp)));
                Ok(true)
            }

            _ => Ok(false),
        }
    }
}
