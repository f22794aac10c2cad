//! The live session: one duplex voice conversation with the remote model,
//! from `connect` through steady-state streaming to `disconnect`.

use crate::{
    audio,
    backoff::ReconnectBackoff,
    capture::{AnalysisTap, CaptureControl, CaptureHandle, CaptureSource, MicCapture},
    config::Config,
    models::{
        ConnectError, ConversationContext, SessionError, SessionEvents, TranscriptMessage, Voice,
    },
    playback::{PlaybackBuffer, PlaybackHandle, PlaybackOutput, PlaybackQueue, Speaker},
    protocol,
    transport::{ChannelEvent, Connector, WsConnector},
};
use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

/// Where the session is in its lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Reconnecting,
    Closed,
}

/// State the background loops share with the caller-facing handle.
struct Shared {
    state: Mutex<SessionState>,
    backoff: Mutex<ReconnectBackoff>,
    /// Set once by `disconnect`; late channel events must not act after this.
    closing: AtomicBool,
    events: Arc<dyn SessionEvents>,
}

/// Resources bound to one connection attempt. A reconnect destroys the old
/// binding and creates a fresh one.
struct Connection {
    outbound: mpsc::Sender<String>,
    capture_control: CaptureControl,
    playback: PlaybackQueue,
    send_task: JoinHandle<()>,
    recv_task: JoinHandle<()>,
}

impl Connection {
    /// Best-effort, total teardown: every step runs even if an earlier one
    /// found nothing left to release.
    async fn teardown(self) {
        self.recv_task.abort();
        self.send_task.abort();
        self.capture_control.stop();
        self.playback.shutdown().await;
        // Dropping the sender closes the writer pump and with it the socket.
        drop(self.outbound);
    }
}

/// A live streaming conversation. Holds at most one socket and one
/// microphone binding at a time; reconnects recreate both while the caller
/// carries the conversation context across the gap.
pub struct LiveSession {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    capture: Arc<dyn CaptureSource>,
    output: Arc<dyn PlaybackOutput>,
    model: String,
    conn: tokio::sync::Mutex<Option<Connection>>,
}

impl LiveSession {
    pub fn new(
        connector: Arc<dyn Connector>,
        capture: Arc<dyn CaptureSource>,
        output: Arc<dyn PlaybackOutput>,
        events: Arc<dyn SessionEvents>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::Idle),
                backoff: Mutex::new(ReconnectBackoff::new()),
                closing: AtomicBool::new(false),
                events,
            }),
            connector,
            capture,
            output,
            model: model.into(),
            conn: tokio::sync::Mutex::new(None),
        }
    }

    /// Wires the production backends: websocket transport, default
    /// microphone and default speaker.
    pub fn from_config(config: &Config, events: Arc<dyn SessionEvents>) -> Self {
        Self::new(
            Arc::new(WsConnector::new(config)),
            Arc::new(MicCapture::new()),
            Arc::new(Speaker::new()),
            events,
            config.live_model.clone(),
        )
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.shared.state)
    }

    /// Opens the microphone and the channel, sends the setup handshake and
    /// starts the streaming loops. Audio flows once the remote side
    /// acknowledges the handshake, which also fires `on_status_change(true)`.
    ///
    /// Post-connect failures never surface through this call; they arrive via
    /// `on_error` and `on_unexpected_disconnect`.
    pub async fn connect(
        &self,
        context: &ConversationContext,
        voice: Voice,
    ) -> Result<(), ConnectError> {
        let previous = {
            let mut state = lock(&self.shared.state);
            match *state {
                SessionState::Closed => return Err(ConnectError::Closed),
                SessionState::Connecting | SessionState::Active => {
                    return Err(ConnectError::AlreadyConnected);
                }
                previous @ (SessionState::Idle | SessionState::Reconnecting) => {
                    *state = SessionState::Connecting;
                    previous
                }
            }
        };

        match self.establish(context, voice).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut state = lock(&self.shared.state);
                if *state == SessionState::Connecting {
                    *state = match e {
                        ConnectError::PermissionDenied(_) | ConnectError::Configuration(_) => {
                            SessionState::Closed
                        }
                        _ => previous,
                    };
                }
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        context: &ConversationContext,
        voice: Voice,
    ) -> Result<(), ConnectError> {
        // A reconnect destroys the old socket/microphone binding first.
        if let Some(old) = self.conn.lock().await.take() {
            debug!("tearing down stale connection before reconnect");
            old.teardown().await;
        }

        let tap = AnalysisTap::new();
        let capture = self.capture.open(tap.clone()).await?;
        let sink = self.output.open().await?;
        let channel = self.connector.connect().await?;

        // `disconnect` may have run while the devices or the channel were
        // opening. Dropping the fresh handles here releases them.
        if self.shared.closing.load(Ordering::SeqCst) {
            return Err(ConnectError::Closed);
        }

        let setup = protocol::setup_message(&self.model, voice, context);
        let payload =
            serde_json::to_string(&setup).map_err(|e| ConnectError::Transport(e.to_string()))?;
        channel
            .outbound
            .send(payload)
            .await
            .map_err(|_| ConnectError::Transport("channel closed before setup".into()))?;
        info!(
            voice = voice.as_str(),
            history = context.history.len(),
            "setup sent; awaiting acknowledgment"
        );

        let acked = Arc::new(AtomicBool::new(false));
        let playback = PlaybackQueue::start(sink);
        let capture_control = capture.control();
        let send_task = tokio::spawn(send_loop(
            self.shared.clone(),
            capture,
            channel.outbound.clone(),
            acked.clone(),
        ));
        let recv_task = tokio::spawn(receive_loop(
            self.shared.clone(),
            channel.inbound,
            playback.handle(),
            acked,
            capture_control.clone(),
        ));

        let connection = Connection {
            outbound: channel.outbound,
            capture_control,
            playback,
            send_task,
            recv_task,
        };
        // Re-check under the slot lock: a `disconnect` that ran after the
        // check above found the slot empty, so this connection must not
        // survive it.
        let mut slot = self.conn.lock().await;
        if self.shared.closing.load(Ordering::SeqCst) {
            drop(slot);
            connection.teardown().await;
            return Err(ConnectError::Closed);
        }
        *slot = Some(connection);
        drop(slot);

        self.shared.events.on_audio_visualizer_data(tap);
        Ok(())
    }

    /// Terminal, idempotent shutdown: cancels any pending reconnect (further
    /// `connect` calls fail with `Closed`), force-stops playback, releases
    /// the microphone and closes the channel. After this returns no further
    /// listener callbacks occur for this instance.
    pub async fn disconnect(&self) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let was_active = {
            let mut state = lock(&self.shared.state);
            let was_active = *state == SessionState::Active;
            *state = SessionState::Closed;
            was_active
        };
        if let Some(conn) = self.conn.lock().await.take() {
            conn.teardown().await;
        }
        if was_active {
            self.shared.events.on_status_change(false);
        }
        info!("session closed");
    }

    /// Next backoff delay for the caller to schedule a reconnect with.
    /// Increments the attempt counter; the counter resets automatically on
    /// every handshake-acknowledged connection.
    pub fn get_reconnect_delay(&self) -> Duration {
        lock(&self.shared.backoff).next_delay()
    }

    pub fn reset_reconnect_attempts(&self) {
        lock(&self.shared.backoff).reset();
    }
}

/// Forwards capture blocks to the channel once the handshake is
/// acknowledged. Blocks captured before acknowledgment are dropped, not
/// queued.
async fn send_loop(
    shared: Arc<Shared>,
    mut capture: CaptureHandle,
    outbound: mpsc::Sender<String>,
    acked: Arc<AtomicBool>,
) {
    while let Some(block) = capture.next_block().await {
        if shared.closing.load(Ordering::SeqCst) {
            break;
        }
        if !acked.load(Ordering::SeqCst) {
            continue;
        }
        let message = protocol::audio_chunk(&block);
        let payload = match serde_json::to_string(&message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to serialize audio chunk");
                continue;
            }
        };
        match outbound.try_send(payload) {
            Ok(()) => {}
            // Drop-newest: slow transmission must not queue stale speech.
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("transmit backlog full; dropping newest block");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
    debug!("send loop finished");
}

/// Dispatches inbound channel events until closure. Late events after
/// `disconnect` are discarded without acting.
async fn receive_loop(
    shared: Arc<Shared>,
    mut inbound: mpsc::Receiver<ChannelEvent>,
    playback: PlaybackHandle,
    acked: Arc<AtomicBool>,
    capture: CaptureControl,
) {
    while let Some(event) = inbound.recv().await {
        if shared.closing.load(Ordering::SeqCst) {
            break;
        }
        match event {
            ChannelEvent::Message(text) => {
                handle_server_message(&shared, &playback, &acked, &text).await;
            }
            ChannelEvent::Closed { reason } => {
                warn!(?reason, "live channel closed unexpectedly");
                // The device is not held across the caller's backoff gap; a
                // later `connect` opens a fresh one.
                capture.stop();
                let was_active = {
                    let mut state = lock(&shared.state);
                    let was_active = *state == SessionState::Active;
                    if *state != SessionState::Closed {
                        *state = SessionState::Reconnecting;
                    }
                    was_active
                };
                if let Some(reason) = reason {
                    shared.events.on_error(SessionError::Channel(reason));
                }
                if was_active {
                    shared.events.on_status_change(false);
                }
                shared.events.on_unexpected_disconnect();
                break;
            }
        }
    }
    debug!("receive loop finished");
}

async fn handle_server_message(
    shared: &Arc<Shared>,
    playback: &PlaybackHandle,
    acked: &AtomicBool,
    text: &str,
) {
    let message: protocol::ServerMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "skipping malformed server message");
            shared.events.on_error(SessionError::Parse(e.to_string()));
            return;
        }
    };

    if message.setup_complete.is_some() && !acked.swap(true, Ordering::SeqCst) {
        {
            let mut state = lock(&shared.state);
            if *state == SessionState::Connecting {
                *state = SessionState::Active;
            }
        }
        lock(&shared.backoff).reset();
        info!("setup acknowledged; session active");
        shared.events.on_status_change(true);
    }

    let Some(content) = message.server_content else {
        return;
    };

    if content.interrupted == Some(true) {
        debug!("barge-in: flushing playback");
        playback.flush().await;
    }

    if let Some(turn) = content.model_turn {
        for part in turn.parts {
            if let Some(blob) = part.inline_data {
                match audio::decode_f32_from_base64_i16(&blob.data) {
                    Ok(samples) if samples.is_empty() => {}
                    Ok(samples) => {
                        if !playback.enqueue(PlaybackBuffer::new(samples)) {
                            warn!("playback queue saturated; dropping audio chunk");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "skipping undecodable audio payload");
                        shared.events.on_error(SessionError::Decode(e.to_string()));
                    }
                }
            }
            if let Some(fragment) = part.text {
                // One transcript entry per fragment, in arrival order.
                shared
                    .events
                    .on_message(TranscriptMessage::assistant(fragment));
            }
        }
    }

    // Informational only; no state transition.
    if content.turn_complete == Some(true) {
        debug!("turn complete");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
