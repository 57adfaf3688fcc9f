//! Realtime transcription WebSocket client
//!
//! Manages the WebSocket connection lifecycle for streaming transcription.
//!
//! # Connection Flow
//!
//! 1. `connect()` - Establish WebSocket (10s timeout), send the config message
//! 2. `send_audio_chunk()` - Queue binary audio frames (non-blocking)
//! 3. `subscribe()` - Receive transcription events and connection changes
//! 4. `disconnect()` - Send `end`, close, and suppress reconnection
//!
//! # Retry Strategy
//!
//! Unexpected closes and failed attempts reconnect with exponential backoff
//! (2s, 4s, 8s, 10s, 10s by default). The counter resets once the server
//! sends its first event on a connection. After the ceiling the client stays
//! disconnected until `connect()` is called again.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async_with_config, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::protocol::{websocket_url, AudioFormat, ClientMessage, EventStatus, TranscriptionEvent};
use super::reconnect::{ReconnectDecision, ReconnectPolicy, ReconnectState};
use super::StreamingError;
use crate::util::lock;

/// Connection timeout for the WebSocket handshake
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeConfig {
    /// Full `ws://` or `wss://` endpoint
    pub endpoint: String,
    pub language: String,
    pub sample_rate: u32,
    pub format: AudioFormat,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl RealtimeConfig {
    /// Defaults against a backend base URL (`http(s)://host`)
    pub fn for_backend(backend_url: &str) -> Self {
        Self {
            endpoint: websocket_url(backend_url),
            language: "pt".to_string(),
            sample_rate: 16000,
            format: AudioFormat::Pcm,
            connect_timeout: CONNECTION_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Snapshot published through [`RealtimeTranscriptionClient::watch_session`]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TranscriptionSession {
    pub session_id: Option<String>,
    pub connection_state: ConnectionState,
    pub reconnect_attempt: u32,
}

/// Broadcast to every subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Disconnected { reason: String },
    Transcription(TranscriptionEvent),
    ReconnectScheduled { attempt: u32, delay: Duration },
    Error(String),
    /// Reconnect ceiling reached; terminal until the next `connect()`
    GaveUp { attempts: u32 },
}

enum Outbound {
    Audio(Vec<u8>),
    Text(String),
    Close,
}

/// Live connection handles. `epoch` identifies the current socket so a
/// late close from a replaced socket is ignored.
#[derive(Default)]
struct Link {
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    connection: Option<CancellationToken>,
    pending_reconnect: Option<CancellationToken>,
    epoch: u64,
}

struct Shared {
    config: RealtimeConfig,
    session: watch::Sender<TranscriptionSession>,
    events: broadcast::Sender<ClientEvent>,
    link: Mutex<Link>,
    reconnect: Mutex<ReconnectState>,
    connect_lock: tokio::sync::Mutex<()>,
}

/// WebSocket client streaming microphone audio to the realtime backend
#[derive(Clone)]
pub struct RealtimeTranscriptionClient {
    shared: Arc<Shared>,
}

impl RealtimeTranscriptionClient {
    pub fn new(config: RealtimeConfig) -> Self {
        let (session, _) = watch::channel(TranscriptionSession::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let reconnect = ReconnectState::new(config.reconnect);
        Self {
            shared: Arc::new(Shared {
                config,
                session,
                events,
                link: Mutex::new(Link::default()),
                reconnect: Mutex::new(reconnect),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.shared.config
    }

    /// Open the connection and send the config message.
    ///
    /// Returns `true` once connected (or if already connected). A failed
    /// attempt returns `false` and, with reconnection enabled, schedules a
    /// retry. Calling this after `disconnect()` or a give-up re-arms
    /// reconnection.
    pub async fn connect(&self) -> bool {
        lock(&self.shared.reconnect).rearm();
        if let Some(pending) = lock(&self.shared.link).pending_reconnect.take() {
            pending.cancel();
        }
        connect_once(Arc::clone(&self.shared), false).await
    }

    /// Queue one binary audio frame
    pub fn send_audio_chunk(&self, bytes: Vec<u8>) -> Result<(), StreamingError> {
        let link = lock(&self.shared.link);
        match &link.outbound {
            Some(tx) => tx
                .send(Outbound::Audio(bytes))
                .map_err(|_| StreamingError::SendFailed("connection closed".to_string())),
            None => Err(StreamingError::NotConnected),
        }
    }

    /// Close deliberately: no reconnection, `end` is sent if the socket is open
    pub fn disconnect(&self) {
        log::info!("RealtimeClient: disconnecting");
        lock(&self.shared.reconnect).stop();

        let (outbound, pending) = {
            let mut link = lock(&self.shared.link);
            link.epoch += 1;
            link.connection = None;
            (link.outbound.take(), link.pending_reconnect.take())
        };
        if let Some(pending) = pending {
            pending.cancel();
        }

        let was_connected = match outbound {
            Some(tx) => {
                match ClientMessage::End.to_json() {
                    Ok(json) => {
                        let _ = tx.send(Outbound::Text(json));
                    }
                    Err(e) => log::warn!("RealtimeClient: failed to encode end message: {}", e),
                }
                let _ = tx.send(Outbound::Close);
                true
            }
            None => false,
        };

        self.shared.set_session(|s| {
            s.connection_state = ConnectionState::Disconnected;
            s.session_id = None;
            s.reconnect_attempt = 0;
        });
        if was_connected {
            self.shared.emit(ClientEvent::Disconnected {
                reason: "client disconnect".to_string(),
            });
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session().connection_state == ConnectionState::Connected
    }

    pub fn session(&self) -> TranscriptionSession {
        self.shared.session.borrow().clone()
    }

    pub fn watch_session(&self) -> watch::Receiver<TranscriptionSession> {
        self.shared.session.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }
}

impl Shared {
    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn set_session(&self, update: impl FnOnce(&mut TranscriptionSession)) {
        self.session.send_modify(update);
    }

    fn is_linked(&self) -> bool {
        lock(&self.link)
            .outbound
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// One text frame from the server
    fn handle_text(&self, text: &str, acknowledged: &mut bool) {
        let event = match TranscriptionEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("RealtimeClient: failed to parse message: {}", e);
                return;
            }
        };

        if !*acknowledged {
            *acknowledged = true;
            lock(&self.reconnect).on_session_acknowledged();
            self.set_session(|s| s.reconnect_attempt = 0);
        }

        if let Some(id) = event.session_id.as_deref() {
            self.session.send_if_modified(|s| {
                if s.session_id.is_none() {
                    log::info!("RealtimeClient: session {}", id);
                    s.session_id = Some(id.to_string());
                    true
                } else {
                    false
                }
            });
        }

        match event.status {
            EventStatus::Configured => log::info!("RealtimeClient: configuration accepted"),
            EventStatus::End => log::info!("RealtimeClient: session ended {:?}", event.stats),
            EventStatus::Error => {
                let message = event.error_message().unwrap_or("Unknown error").to_string();
                log::warn!("RealtimeClient: server error: {}", message);
                self.emit(ClientEvent::Error(message));
            }
            EventStatus::Unknown => log::debug!("RealtimeClient: unknown event status"),
            _ => {}
        }
        self.emit(ClientEvent::Transcription(event));
    }

    /// Socket ended. `reason` is `None` for deliberate closes.
    fn on_connection_closed(self: &Arc<Self>, epoch: u64, reason: Option<String>) {
        let Some(reason) = reason else {
            log::debug!("RealtimeClient: connection closed by client");
            return;
        };
        {
            let mut link = lock(&self.link);
            if link.epoch != epoch {
                return;
            }
            link.outbound = None;
            link.connection = None;
        }

        log::warn!("RealtimeClient: connection lost: {}", reason);
        self.set_session(|s| {
            s.connection_state = ConnectionState::Disconnected;
            s.session_id = None;
        });
        self.emit(ClientEvent::Disconnected {
            reason: reason.clone(),
        });
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let decision = lock(&self.reconnect).on_unexpected_close();
        match decision {
            ReconnectDecision::Retry { attempt, delay } => {
                log::info!(
                    "RealtimeClient: reconnecting in {:?} (attempt {}/{})",
                    delay,
                    attempt,
                    self.config.reconnect.max_attempts
                );
                self.set_session(|s| {
                    s.connection_state = ConnectionState::Reconnecting;
                    s.reconnect_attempt = attempt;
                });
                self.emit(ClientEvent::ReconnectScheduled { attempt, delay });

                let token = CancellationToken::new();
                if let Some(previous) = lock(&self.link).pending_reconnect.replace(token.clone()) {
                    previous.cancel();
                }
                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            connect_once(shared, true).await;
                        }
                    }
                });
            }
            ReconnectDecision::GiveUp { attempts } => {
                let error = StreamingError::ReconnectExhausted { attempts };
                log::error!("RealtimeClient: {}", error);
                self.set_session(|s| s.connection_state = ConnectionState::Disconnected);
                self.emit(ClientEvent::Error(error.to_string()));
                self.emit(ClientEvent::GaveUp { attempts });
            }
            ReconnectDecision::Stopped => {
                self.set_session(|s| s.connection_state = ConnectionState::Disconnected);
            }
        }
    }
}

/// Single connection attempt. Boxed because a failure schedules another
/// attempt that calls back into this function.
fn connect_once(shared: Arc<Shared>, reconnecting: bool) -> BoxFuture<'static, bool> {
    async move {
        let _guard = shared.connect_lock.lock().await;
        if shared.is_linked() {
            return true;
        }
        if reconnecting && lock(&shared.link).pending_reconnect.is_none() {
            // Cancelled by connect() or disconnect() while waiting for the lock
            return false;
        }
        lock(&shared.link).pending_reconnect = None;

        shared.set_session(|s| {
            s.connection_state = if reconnecting {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            };
        });
        log::info!("RealtimeClient: connecting to {}", shared.config.endpoint);
        // disconnect() bumps the epoch; a change during the handshake cancels it
        let started = lock(&shared.link).epoch;

        let socket = match open_socket(&shared.config).await {
            Ok(mut socket) => {
                if lock(&shared.link).epoch != started {
                    log::info!("RealtimeClient: disconnected during handshake, dropping socket");
                    let _ = socket.close(None).await;
                    return false;
                }
                socket
            }
            Err(_) if lock(&shared.link).epoch != started => return false,
            Err(e) => {
                log::warn!("RealtimeClient: {}", e);
                shared.set_session(|s| s.connection_state = ConnectionState::Disconnected);
                shared.emit(ClientEvent::Error(e.to_string()));
                drop(_guard);
                shared.schedule_reconnect();
                return false;
            }
        };

        let (write, read) = socket.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let epoch = {
            let mut link = lock(&shared.link);
            link.epoch += 1;
            link.outbound = Some(tx);
            link.connection = Some(token.clone());
            link.epoch
        };

        let attempt = lock(&shared.reconnect).attempts();
        shared.set_session(|s| {
            s.connection_state = ConnectionState::Connected;
            s.session_id = None;
            s.reconnect_attempt = attempt;
        });
        log::info!("RealtimeClient: connected");
        shared.emit(ClientEvent::Connected);

        tokio::spawn(run_connection(Arc::clone(&shared), write, read, rx, token, epoch));
        true
    }
    .boxed()
}

/// Handshake with timeout, then send the config message
async fn open_socket(config: &RealtimeConfig) -> Result<WsStream, StreamingError> {
    let (mut socket, _response) = timeout(
        config.connect_timeout,
        connect_async_with_config(config.endpoint.as_str(), None, true),
    )
    .await
    .map_err(|_| StreamingError::ConnectionFailed("Connection timeout".to_string()))?
    .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;

    let config_message =
        ClientMessage::config(&config.language, config.sample_rate, config.format)
            .to_json()
            .map_err(|e| StreamingError::ProtocolError(e.to_string()))?;
    socket
        .send(Message::Text(config_message))
        .await
        .map_err(|e| StreamingError::SendFailed(e.to_string()))?;
    Ok(socket)
}

/// Pump outbound frames and inbound events until the socket ends
async fn run_connection(
    shared: Arc<Shared>,
    mut write: SplitSink<WsStream, Message>,
    mut read: SplitStream<WsStream>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
    epoch: u64,
) {
    let mut acknowledged = false;
    let mut frames_sent: u64 = 0;

    let lost = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.close().await;
                break None;
            }
            message = outbound.recv() => match message {
                Some(Outbound::Audio(bytes)) => {
                    if let Err(e) = write.send(Message::Binary(bytes)).await {
                        break Some(StreamingError::SendFailed(e.to_string()).to_string());
                    }
                    frames_sent += 1;
                }
                Some(Outbound::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        break Some(StreamingError::SendFailed(e.to_string()).to_string());
                    }
                }
                Some(Outbound::Close) | None => {
                    if let Err(e) = write.close().await {
                        log::debug!("RealtimeClient: error closing WebSocket: {}", e);
                    }
                    break None;
                }
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => shared.handle_text(&text, &mut acknowledged),
                Some(Ok(Message::Close(frame))) => {
                    let detail = frame
                        .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                        .unwrap_or_else(|| "no close frame".to_string());
                    break Some(StreamingError::Disconnected(detail).to_string());
                }
                Some(Ok(_)) => {} // Ignore ping/pong/binary
                Some(Err(e)) => break Some(StreamingError::ProtocolError(e.to_string()).to_string()),
                None => break Some(StreamingError::Disconnected("stream ended".to_string()).to_string()),
            },
        }
    };

    log::debug!("RealtimeClient: connection task exiting after {} audio frames", frames_sent);
    shared.on_connection_closed(epoch, lost);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_for_backend() {
        let config = RealtimeConfig::for_backend("https://voice.example.com");
        assert_eq!(config.endpoint, "wss://voice.example.com/functions/v1/realtime-stt");
        assert_eq!(config.language, "pt");
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.format, AudioFormat::Pcm);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.reconnect.max_attempts, 5);
    }

    #[test]
    fn test_send_before_connect_fails() {
        let client = RealtimeTranscriptionClient::new(RealtimeConfig::for_backend("http://127.0.0.1:1"));
        assert!(matches!(
            client.send_audio_chunk(vec![0, 1]),
            Err(StreamingError::NotConnected)
        ));
        assert_eq!(client.session().connection_state, ConnectionState::Disconnected);
    }

    #[test]
    fn test_disconnect_when_idle_is_quiet() {
        let client = RealtimeTranscriptionClient::new(RealtimeConfig::for_backend("http://127.0.0.1:1"));
        let mut events = client.subscribe();
        client.disconnect();
        assert!(events.try_recv().is_err());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_failed_connect_without_reconnect() {
        let mut config = RealtimeConfig::for_backend("http://127.0.0.1:1");
        config.reconnect = ReconnectPolicy::disabled();
        config.connect_timeout = Duration::from_secs(2);
        let client = RealtimeTranscriptionClient::new(config);
        let mut events = client.subscribe();

        assert!(!client.connect().await);
        assert_eq!(client.session().connection_state, ConnectionState::Disconnected);
        assert!(matches!(events.try_recv(), Ok(ClientEvent::Error(_))));
    }
}
