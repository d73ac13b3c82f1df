//! Shared native factory owning the two negotiation sessions.
//!
//! The webrtc `API` (media engine, codecs, interceptors) is built once per
//! factory and shared by both sessions; it is the process-wide engine
//! state, owned here rather than kept as a global.

use std::sync::Arc;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::interceptor::registry::Registry;

use crate::config::RoomConfig;
use crate::error::Result;
use crate::peer::session::{PeerRole, PeerSession};

/// Owns the shared webrtc API and exactly one publisher plus one
/// subscriber session.
pub struct PeerSessionFactory {
    api: API,
    publisher: Arc<PeerSession>,
    subscriber: Arc<PeerSession>,
}

impl PeerSessionFactory {
    /// Build the media engine with its default codecs and interceptors and
    /// create both sessions, unconfigured until join data arrives.
    pub fn new(config: &RoomConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let publisher = Arc::new(PeerSession::new(
            PeerRole::Publisher,
            config.ice_servers.clone(),
        ));
        let subscriber = Arc::new(PeerSession::new(
            PeerRole::Subscriber,
            config.ice_servers.clone(),
        ));

        Ok(Self {
            api,
            publisher,
            subscriber,
        })
    }

    pub fn api(&self) -> &API {
        &self.api
    }

    pub fn publisher(&self) -> &Arc<PeerSession> {
        &self.publisher
    }

    pub fn subscriber(&self) -> &Arc<PeerSession> {
        &self.subscriber
    }

    /// Tear both sessions down concurrently before the shared API drops.
    pub async fn teardown(&self) {
        tokio::join!(self.publisher.teardown(), self.subscriber.teardown());
    }
}
