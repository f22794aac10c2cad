//! Terminal caller for the live voice session.
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing logging.
//! 3. Starting a live session with the narratives given on the command line.
//! 4. Running the caller side of the contract: appending transcript entries,
//!    rendering the waveform, and scheduling reconnects with backoff.
//! 5. Ending the session on Ctrl+C.

use anyhow::Context;
use brainstorm_live::{
    ConnectError, ConversationContext, LiveSession, SessionError, SessionEvents,
    TranscriptMessage, Voice,
    capture::AnalysisTap,
    config::Config,
    visualizer::{VisualizerHandle, WaveformSurface, visualize},
};
use std::io::Write;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Events forwarded from the session's background tasks to the main loop.
enum CallerEvent {
    Message(TranscriptMessage),
    Status(bool),
    Error(SessionError),
    Visualizer(AnalysisTap),
    Disconnected,
}

struct ChannelEvents {
    tx: mpsc::UnboundedSender<CallerEvent>,
}

impl SessionEvents for ChannelEvents {
    fn on_message(&self, message: TranscriptMessage) {
        let _ = self.tx.send(CallerEvent::Message(message));
    }
    fn on_status_change(&self, active: bool) {
        let _ = self.tx.send(CallerEvent::Status(active));
    }
    fn on_error(&self, error: SessionError) {
        let _ = self.tx.send(CallerEvent::Error(error));
    }
    fn on_audio_visualizer_data(&self, tap: AnalysisTap) {
        let _ = self.tx.send(CallerEvent::Visualizer(tap));
    }
    fn on_unexpected_disconnect(&self) {
        let _ = self.tx.send(CallerEvent::Disconnected);
    }
}

/// A one-line amplitude meter on stdout.
#[derive(Default)]
struct TerminalWave;

const METER_WIDTH: u32 = 60;

impl WaveformSurface for TerminalWave {
    fn width(&self) -> u32 {
        METER_WIDTH
    }
    fn height(&self) -> u32 {
        2
    }
    fn is_alive(&self) -> bool {
        true
    }
    fn draw_polyline(&mut self, points: &[(f32, f32)]) {
        // Height is 2, so the center line sits at y = 1.0.
        let peak = points
            .iter()
            .map(|&(_, y)| (y - 1.0).abs())
            .fold(0.0f32, f32::max)
            .min(1.0);
        let filled = (peak * METER_WIDTH as f32) as usize;
        let mut out = std::io::stdout().lock();
        let _ = write!(
            out,
            "\r[{}{}]",
            "#".repeat(filled),
            " ".repeat(METER_WIDTH as usize - filled)
        );
        let _ = out.flush();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();

    let mut args = std::env::args().skip(1);
    let big_picture = args
        .next()
        .unwrap_or_else(|| "an unexplored product direction".to_string());
    let hidden_opportunity = args
        .next()
        .unwrap_or_else(|| "a niche the market has not priced in".to_string());

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let events = Arc::new(ChannelEvents { tx: event_tx });
    let session = LiveSession::from_config(&config, events);

    let mut context = ConversationContext {
        big_picture,
        hidden_opportunity,
        history: Vec::new(),
    };

    session
        .connect(&context, Voice::Kore)
        .await
        .context("Failed to start the live session")?;
    info!("Live session started. Press Ctrl+C to end the conversation.");

    let mut visualizer: Option<VisualizerHandle> = None;
    'main: loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal. Shutting down gracefully...");
                break 'main;
            }
            Some(event) = event_rx.recv() => match event {
                CallerEvent::Message(message) => {
                    println!();
                    info!(role = ?message.role, "{}", message.text);
                    context.history.push(message);
                }
                CallerEvent::Status(active) => info!(active, "session status changed"),
                CallerEvent::Error(error) => warn!(%error, "session error"),
                CallerEvent::Visualizer(tap) => {
                    visualizer = Some(visualize(tap, TerminalWave));
                }
                CallerEvent::Disconnected => {
                    // The caller owns the retry decision; the session only
                    // supplies the delay. Context and history carry over.
                    loop {
                        let delay = session.get_reconnect_delay();
                        warn!(?delay, "connection lost; retrying after backoff");
                        tokio::time::sleep(delay).await;
                        match session.connect(&context, Voice::Kore).await {
                            Ok(()) => break,
                            Err(ConnectError::Closed) => break 'main,
                            Err(e) => warn!(error = %e, "reconnect attempt failed"),
                        }
                    }
                }
            },
            else => break 'main,
        }
    }

    if let Some(visualizer) = visualizer.take() {
        visualizer.cancel();
    }
    session.disconnect().await;
    info!("Session ended.");
    Ok(())
}
