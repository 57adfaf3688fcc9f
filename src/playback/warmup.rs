//! Gesture-time audio unlock
//!
//! Constrained platforms only allow playback that was requested synchronously
//! inside a user gesture. By the time real audio exists (after a network round
//! trip) that gesture is gone. The unlocker plays a silent source on a reusable
//! sink while the gesture is still live; the manager later reuses that sink.

use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::platform::{AudioSink, AudioSinkFactory};
use crate::util::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnlockState {
    #[default]
    Locked,
    /// Silent play issued, waiting for the platform's answer
    Unlocking,
    Unlocked,
}

/// Per-client unlock state and the warmed sink it produced
#[derive(Clone)]
pub struct WarmupUnlocker {
    inner: Arc<Inner>,
}

struct Inner {
    factory: Arc<dyn AudioSinkFactory>,
    sink: Mutex<Option<Arc<dyn AudioSink>>>,
    state: watch::Sender<UnlockState>,
}

impl WarmupUnlocker {
    pub fn new(factory: Arc<dyn AudioSinkFactory>) -> Self {
        let (state, _) = watch::channel(UnlockState::Locked);
        Self {
            inner: Arc::new(Inner {
                factory,
                sink: Mutex::new(None),
                state,
            }),
        }
    }

    /// Unlock playback. Call synchronously from the input handler.
    ///
    /// The silent play request is issued before this returns; pausing and
    /// rewinding the sink happen once the platform answers. No-op when already
    /// unlocked or while an earlier unlock is settling.
    pub fn unlock(&self) {
        let mut claimed = false;
        self.inner.state.send_if_modified(|state| {
            if *state == UnlockState::Locked {
                *state = UnlockState::Unlocking;
                claimed = true;
                true
            } else {
                false
            }
        });
        if !claimed {
            log::debug!("WarmupUnlocker: unlock skipped ({:?})", self.state());
            return;
        }

        let sink = match self.sink_or_create() {
            Ok(sink) => sink,
            Err(e) => {
                log::warn!("WarmupUnlocker: failed to create warm-up sink: {}", e);
                self.inner.state.send_replace(UnlockState::Locked);
                return;
            }
        };

        log::info!("WarmupUnlocker: warming sink {}", sink.id());
        sink.set_source(&self.inner.factory.silent_source());
        let play = sink.play();

        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                log::warn!("WarmupUnlocker: no async runtime to settle warm-up");
                sink.pause();
                self.inner.state.send_replace(UnlockState::Locked);
                return;
            }
        };

        let inner = Arc::clone(&self.inner);
        handle.spawn(async move {
            match play.await {
                Ok(()) => {
                    sink.pause();
                    sink.rewind();
                    inner.state.send_replace(UnlockState::Unlocked);
                    log::info!("WarmupUnlocker: unlocked");
                }
                Err(e) => {
                    log::warn!("WarmupUnlocker: warm-up failed: {}", e);
                    inner.state.send_replace(UnlockState::Locked);
                }
            }
        });
    }

    pub fn state(&self) -> UnlockState {
        *self.inner.state.borrow()
    }

    pub fn is_unlocked(&self) -> bool {
        self.state() == UnlockState::Unlocked
    }

    pub fn watch_state(&self) -> watch::Receiver<UnlockState> {
        self.inner.state.subscribe()
    }

    /// Wait for an in-flight unlock to settle and return the outcome
    pub async fn wait_settled(&self) -> UnlockState {
        let mut rx = self.inner.state.subscribe();
        let settled = match rx.wait_for(|s| *s != UnlockState::Unlocking).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        settled
    }

    /// The warmed sink, only once unlocking has succeeded
    pub fn warmed_sink(&self) -> Option<Arc<dyn AudioSink>> {
        if !self.is_unlocked() {
            return None;
        }
        lock(&self.inner.sink).clone()
    }

    fn sink_or_create(&self) -> Result<Arc<dyn AudioSink>, crate::platform::SinkError> {
        let mut slot = lock(&self.inner.sink);
        if let Some(sink) = slot.as_ref() {
            return Ok(Arc::clone(sink));
        }
        let sink = self.inner.factory.create_sink()?;
        *slot = Some(Arc::clone(&sink));
        Ok(sink)
    }
}

impl std::fmt::Debug for WarmupUnlocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmupUnlocker")
            .field("state", &self.state())
            .finish()
    }
}
