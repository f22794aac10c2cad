//! Microphone capture: a device thread delivering fixed-size 16 kHz mono
//! blocks, plus the analysis tap the visualizer reads.

use crate::{
    audio::{self, CAPTURE_BLOCK_FRAMES, MIC_SAMPLE_RATE},
    models::ConnectError,
};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::{
    HeapRb,
    traits::{Consumer, Producer, Split},
};
use rubato::Resampler;
use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Samples retained for waveform rendering, matching the analysis window of
/// the browser-era implementation.
pub const TAP_WINDOW: usize = 2048;

/// How many capture blocks may wait for the send loop before newer blocks
/// are dropped.
const FRAME_QUEUE_DEPTH: usize = 8;

/// A shared window over the most recent time-domain samples, stored in the
/// unsigned byte form the visualizer consumes. Cloning shares the window.
#[derive(Clone, Default)]
pub struct AnalysisTap {
    window: Arc<Mutex<VecDeque<u8>>>,
}

impl AnalysisTap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends normalized samples, discarding the oldest past the window.
    pub fn push(&self, samples: &[f32]) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        for &sample in samples {
            window.push_back(audio::f32_to_tap_byte(sample));
        }
        while window.len() > TAP_WINDOW {
            window.pop_front();
        }
    }

    /// Copies out the current window, oldest sample first.
    pub fn snapshot(&self) -> Vec<u8> {
        let window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.iter().copied().collect()
    }
}

/// Stops the capture device without consuming the block receiver. Cloneable
/// so teardown can reach the device while the send loop owns the handle.
#[derive(Clone)]
pub struct CaptureControl {
    stop: Arc<AtomicBool>,
}

impl CaptureControl {
    pub fn new(stop: Arc<AtomicBool>) -> Self {
        Self { stop }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// An open microphone: a stream of fixed-size sample blocks and the control
/// to release the device. Dropping the handle releases the device.
pub struct CaptureHandle {
    frames: mpsc::Receiver<Vec<f32>>,
    control: CaptureControl,
}

impl CaptureHandle {
    pub fn new(frames: mpsc::Receiver<Vec<f32>>, control: CaptureControl) -> Self {
        Self { frames, control }
    }

    pub fn control(&self) -> CaptureControl {
        self.control.clone()
    }

    /// Next block of `CAPTURE_BLOCK_FRAMES` mono samples at 16 kHz, or `None`
    /// once the device is released.
    pub async fn next_block(&mut self) -> Option<Vec<f32>> {
        self.frames.recv().await
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.control.stop();
    }
}

/// Opens a capture device. Implemented by the real microphone and by test
/// doubles that inject blocks directly.
#[async_trait]
pub trait CaptureSource: Send + Sync + 'static {
    async fn open(&self, tap: AnalysisTap) -> Result<CaptureHandle, ConnectError>;
}

/// The default input device, captured on a dedicated thread because the
/// platform stream is not `Send`. Device-rate audio is resampled to 16 kHz.
#[derive(Default)]
pub struct MicCapture;

impl MicCapture {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CaptureSource for MicCapture {
    async fn open(&self, tap: AnalysisTap) -> Result<CaptureHandle, ConnectError> {
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let (ready_tx, ready_rx) = oneshot::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        std::thread::Builder::new()
            .name("mic-capture".into())
            .spawn(move || run_input_thread(frame_tx, tap, ready_tx, thread_stop))
            .map_err(|e| ConnectError::PermissionDenied(e.to_string()))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(CaptureHandle::new(frame_rx, CaptureControl::new(stop))),
            Ok(Err(reason)) => Err(ConnectError::PermissionDenied(reason)),
            Err(_) => Err(ConnectError::PermissionDenied(
                "capture thread exited before the device opened".into(),
            )),
        }
    }
}

fn run_input_thread(
    frame_tx: mpsc::Sender<Vec<f32>>,
    tap: AnalysisTap,
    ready_tx: oneshot::Sender<Result<(), String>>,
    stop: Arc<AtomicBool>,
) {
    let host = cpal::default_host();
    let Some(device) = host.default_input_device() else {
        let _ = ready_tx.send(Err("no input device available".into()));
        return;
    };
    let supported = match device.default_input_config() {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(e.to_string()));
            return;
        }
    };
    if supported.sample_format() != cpal::SampleFormat::F32 {
        let _ = ready_tx.send(Err(format!(
            "unsupported input sample format {:?}",
            supported.sample_format()
        )));
        return;
    }
    let config: cpal::StreamConfig = supported.into();
    let channels = config.channels as usize;
    let device_rate = config.sample_rate.0;

    // The stream callback only pushes into a lock-free ring; all resampling
    // and block assembly happens on this thread.
    let ring = HeapRb::<f32>::new((device_rate as usize).max(MIC_SAMPLE_RATE as usize));
    let (mut producer, mut consumer) = ring.split();

    let stream = match device.build_input_stream(
        &config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            for frame in data.chunks(channels) {
                let _ = producer.try_push(frame[0]);
            }
        },
        |err| warn!(error = %err, "input stream error"),
        None,
    ) {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(e.to_string()));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(e.to_string()));
        return;
    }
    info!(device_rate, channels, "microphone capture started");
    let _ = ready_tx.send(Ok(()));

    let resampler_chunk = 1024usize;
    let mut resampler = if device_rate != MIC_SAMPLE_RATE {
        match audio::create_resampler(device_rate, MIC_SAMPLE_RATE, resampler_chunk) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!(error = %e, "failed to create capture resampler; stopping capture");
                return;
            }
        }
    } else {
        None
    };

    let mut scratch = vec![0.0f32; resampler_chunk];
    let mut pending: Vec<f32> = Vec::new();
    let mut block: Vec<f32> = Vec::with_capacity(CAPTURE_BLOCK_FRAMES);

    while !stop.load(Ordering::SeqCst) {
        let drained = consumer.pop_slice(&mut scratch);
        if drained == 0 {
            std::thread::sleep(Duration::from_millis(10));
            continue;
        }
        match resampler.as_mut() {
            Some(resampler) => {
                pending.extend_from_slice(&scratch[..drained]);
                while pending.len() >= resampler_chunk {
                    match resampler.process(&[&pending[..resampler_chunk]], None) {
                        Ok(resampled) => block.extend_from_slice(&resampled[0]),
                        Err(e) => warn!(error = %e, "capture resampling failed"),
                    }
                    pending.drain(..resampler_chunk);
                }
            }
            None => block.extend_from_slice(&scratch[..drained]),
        }
        while block.len() >= CAPTURE_BLOCK_FRAMES {
            let rest = block.split_off(CAPTURE_BLOCK_FRAMES);
            let full = std::mem::replace(&mut block, rest);
            tap.push(&full);
            // Drop-newest under backpressure so stale speech is never queued.
            if let Err(mpsc::error::TrySendError::Full(_)) = frame_tx.try_send(full) {
                debug!("capture queue full; dropping newest block");
            }
        }
    }
    drop(stream);
    debug!("microphone capture stopped");
}
