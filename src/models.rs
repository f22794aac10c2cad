//! Caller-facing types: conversation context, transcript entries, the
//! listener interface and the session error taxonomy.

use crate::capture::AnalysisTap;
use uuid::Uuid;

/// Who produced a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

/// One conversation turn. Append-only; never mutated after creation.
#[derive(Debug, Clone)]
pub struct TranscriptMessage {
    pub id: Uuid,
    pub role: Role,
    pub text: String,
}

impl TranscriptMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }
}

/// Immutable snapshot of the prior analysis plus the messages exchanged so
/// far. Owned by the caller; the session only reads it at (re)connect time.
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    /// The big-picture narrative from the prior analysis.
    pub big_picture: String,
    /// The opportunity narrative from the prior analysis.
    pub hidden_opportunity: String,
    /// Transcript accumulated so far, carried across reconnects.
    pub history: Vec<TranscriptMessage>,
}

/// The prebuilt synthesized-voice identities offered by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Voice {
    Puck,
    Charon,
    Kore,
    Fenrir,
    Aoede,
}

impl Voice {
    pub fn as_str(&self) -> &'static str {
        match self {
            Voice::Puck => "Puck",
            Voice::Charon => "Charon",
            Voice::Kore => "Kore",
            Voice::Fenrir => "Fenrir",
            Voice::Aoede => "Aoede",
        }
    }
}

/// Failures that can be returned from `LiveSession::connect`.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("microphone access was refused: {0}")]
    PermissionDenied(String),
    #[error("missing or invalid configuration: {0}")]
    Configuration(String),
    #[error("failed to open the live channel: {0}")]
    Transport(String),
    #[error("a connection is already in progress for this session")]
    AlreadyConnected,
    #[error("session has been closed")]
    Closed,
}

/// Errors surfaced through `SessionEvents::on_error` after a session is
/// established. None of these tear the session down.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("live channel error: {0}")]
    Channel(String),
    #[error("undecodable audio payload: {0}")]
    Decode(String),
    #[error("malformed server message: {0}")]
    Parse(String),
}

/// Listener interface the session invokes on its caller, one method per
/// event. Callbacks may arrive from background tasks at any time before
/// `disconnect` returns.
pub trait SessionEvents: Send + Sync + 'static {
    /// A new transcript entry arrived; the caller appends it to its history.
    fn on_message(&self, message: TranscriptMessage);
    /// The session became active (handshake acknowledged) or stopped being so.
    fn on_status_change(&self, active: bool);
    /// A non-fatal mid-session error.
    fn on_error(&self, error: SessionError);
    /// Hands the caller a live analysis tap for waveform rendering. Invoked
    /// once per successful `connect`.
    fn on_audio_visualizer_data(&self, tap: AnalysisTap);
    /// The channel closed without a preceding `disconnect`. The caller decides
    /// whether to retry, using `get_reconnect_delay` to schedule the attempt.
    fn on_unexpected_disconnect(&self);
}
