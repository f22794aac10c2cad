//! Waveform rendering: a redraw loop over the analysis tap. Presentation
//! only; never on the critical path of the session.

use crate::capture::AnalysisTap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Redraw cadence, roughly one display frame.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// Something that can take an amplitude polyline. Rendering stops on cancel
/// or once the surface reports itself gone.
pub trait WaveformSurface: Send + 'static {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    /// True while the surface can still be drawn to.
    fn is_alive(&self) -> bool;
    /// Receives one connected polyline spanning the surface width.
    fn draw_polyline(&mut self, points: &[(f32, f32)]);
}

/// Cancellation handle returned by [`visualize`]. Canceling stops the redraw
/// loop without touching the audio tap.
pub struct VisualizerHandle {
    task: JoinHandle<()>,
}

impl VisualizerHandle {
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for VisualizerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Starts the redraw cycle: once per frame, snapshot the tap's time-domain
/// window, map each unsigned sample onto a centered trace and hand the
/// polyline to the surface.
pub fn visualize(tap: AnalysisTap, mut surface: impl WaveformSurface) -> VisualizerHandle {
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(FRAME_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !surface.is_alive() {
                debug!("waveform surface gone; stopping redraw loop");
                break;
            }
            let data = tap.snapshot();
            if data.is_empty() {
                continue;
            }
            surface.draw_polyline(&trace(&data, surface.width(), surface.height()));
        }
    });
    VisualizerHandle { task }
}

/// Maps tap bytes (0..=255, centered on 128) onto surface coordinates, with a
/// closing point on the center line at the right edge.
fn trace(data: &[u8], width: u32, height: u32) -> Vec<(f32, f32)> {
    let width = width as f32;
    let height = height as f32;
    let slice_width = width / data.len() as f32;
    let mut points = Vec::with_capacity(data.len() + 1);
    for (i, &value) in data.iter().enumerate() {
        let y = (value as f32 / 128.0) * height / 2.0;
        points.push((i as f32 * slice_width, y));
    }
    points.push((width, height / 2.0));
    points
}
