//! Audio device seam.
//!
//! The actual audio session (hardware routing, echo cancellation, sample
//! delivery) lives outside this crate. The core only observes whether the
//! device should be playing or recording and flips those switches around
//! publish/unpublish; a delegate receives the capture lifecycle callbacks.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Receives capture lifecycle callbacks from the room session.
#[async_trait]
pub trait AudioDeviceDelegate: Send + Sync {
    async fn capture_started(&self);
    async fn capture_stopped(&self);
}

/// Handle to the external audio device collaborator.
pub struct AudioDevice {
    should_play: watch::Sender<bool>,
    should_record: watch::Sender<bool>,
    delegate: parking_lot::RwLock<Option<Arc<dyn AudioDeviceDelegate>>>,
}

impl Default for AudioDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDevice {
    pub fn new() -> Self {
        let (should_play, _) = watch::channel(false);
        let (should_record, _) = watch::channel(false);
        Self {
            should_play,
            should_record,
            delegate: parking_lot::RwLock::new(None),
        }
    }

    pub fn set_delegate(&self, delegate: Arc<dyn AudioDeviceDelegate>) {
        *self.delegate.write() = Some(delegate);
    }

    pub fn should_play(&self) -> watch::Receiver<bool> {
        self.should_play.subscribe()
    }

    pub fn should_record(&self) -> watch::Receiver<bool> {
        self.should_record.subscribe()
    }

    pub async fn set_recording(&self, recording: bool) {
        if *self.should_record.borrow() == recording {
            return;
        }
        debug!("audio device recording: {}", recording);
        self.should_record.send_replace(recording);
        let delegate = self.delegate.read().clone();
        if let Some(delegate) = delegate {
            if recording {
                delegate.capture_started().await;
            } else {
                delegate.capture_stopped().await;
            }
        }
    }

    pub fn set_playing(&self, playing: bool) {
        debug!("audio device playback: {}", playing);
        self.should_play.send_replace(playing);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDelegate {
        started: AtomicUsize,
        stopped: AtomicUsize,
    }

    #[async_trait]
    impl AudioDeviceDelegate for CountingDelegate {
        async fn capture_started(&self) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }
        async fn capture_stopped(&self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_recording_toggle_is_edge_triggered() {
        let device = AudioDevice::new();
        let delegate = Arc::new(CountingDelegate {
            started: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
        });
        device.set_delegate(Arc::clone(&delegate) as Arc<dyn AudioDeviceDelegate>);

        device.set_recording(true).await;
        device.set_recording(true).await;
        device.set_recording(false).await;

        assert_eq!(delegate.started.load(Ordering::SeqCst), 1);
        assert_eq!(delegate.stopped.load(Ordering::SeqCst), 1);
        assert!(!*device.should_record().borrow());
    }
}
