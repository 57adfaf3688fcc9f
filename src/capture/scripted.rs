//! In-memory microphone for tests and headless runs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{CaptureError, MicrophoneSource, MicrophoneStream};
use crate::util::lock;

/// Microphone whose frames are pushed by the caller
#[derive(Clone)]
pub struct ScriptedMicrophone {
    inner: Arc<MicInner>,
}

struct MicInner {
    sample_rate: u32,
    failure: Mutex<Option<CaptureError>>,
    feed: Mutex<Option<mpsc::Sender<Vec<i16>>>>,
    open: Arc<AtomicBool>,
}

impl ScriptedMicrophone {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            inner: Arc::new(MicInner {
                sample_rate,
                failure: Mutex::new(None),
                feed: Mutex::new(None),
                open: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    /// Make the next `open()` fail
    pub fn fail_next_open(&self, error: CaptureError) {
        *lock(&self.inner.failure) = Some(error);
    }

    /// Deliver one frame. Returns `false` when no stream is open.
    pub async fn push(&self, frame: Vec<i16>) -> bool {
        let feed = lock(&self.inner.feed).clone();
        match feed {
            Some(tx) => tx.send(frame).await.is_ok(),
            None => false,
        }
    }

    /// End the stream as if the device went away
    pub fn unplug(&self) {
        lock(&self.inner.feed).take();
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MicrophoneSource for ScriptedMicrophone {
    async fn open(&self) -> Result<MicrophoneStream, CaptureError> {
        if let Some(error) = lock(&self.inner.failure).take() {
            return Err(error);
        }
        let (tx, rx) = mpsc::channel(64);
        *lock(&self.inner.feed) = Some(tx);
        self.inner.open.store(true, Ordering::SeqCst);

        let open = Arc::clone(&self.inner.open);
        Ok(MicrophoneStream::new(self.inner.sample_rate, rx, move || {
            open.store(false, Ordering::SeqCst);
        }))
    }
}
