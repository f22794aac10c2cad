//! Brainstorm Live Session Library
//!
//! This library contains the duplex voice-conversation core for the
//! Brainstorm client: microphone capture, PCM encoding, the bidirectional
//! channel to the generative-audio model, ordered playback of synthesized
//! audio, waveform visualization, and the reconnect policy. The `live`
//! binary is a thin caller around this library.
//!
//! - `session`: the live session lifecycle, from `connect` to `disconnect`.
//! - `protocol`: the JSON wire format exchanged with the remote model.
//! - `transport`: the websocket channel behind the `Connector` seam.
//! - `capture` / `playback`: audio device backends and the playback queue.
//! - `visualizer`: the amplitude-trace redraw loop.
//! - `backoff`: exponential reconnect delay.

pub mod audio;
pub mod backoff;
pub mod capture;
pub mod config;
pub mod models;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod visualizer;

pub use models::{
    ConnectError, ConversationContext, Role, SessionError, SessionEvents, TranscriptMessage, Voice,
};
pub use session::{LiveSession, SessionState};
