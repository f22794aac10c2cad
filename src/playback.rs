//! Playback of synthesized audio: a strict FIFO queue in front of a sink,
//! with barge-in flushing and forced stop on teardown.

use crate::{
    audio::{self, SYNTH_SAMPLE_RATE},
    models::ConnectError,
};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use rubato::Resampler;
use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, warn};

/// One decoded chunk of synthesized audio awaiting playback, mono at
/// `SYNTH_SAMPLE_RATE`.
#[derive(Debug, Clone)]
pub struct PlaybackBuffer {
    pub samples: Vec<f32>,
}

impl PlaybackBuffer {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / SYNTH_SAMPLE_RATE as f64)
    }
}

/// A device that plays one buffer at a time. `play` resolves when the buffer
/// has fully drained; dropping the future mid-flight followed by `stop` must
/// silence the device immediately.
#[async_trait]
pub trait PlaybackSink: Send + 'static {
    async fn play(&mut self, buffer: &PlaybackBuffer);
    fn stop(&mut self);
}

/// Opens a playback sink. Implemented by the real speaker and test doubles.
#[async_trait]
pub trait PlaybackOutput: Send + Sync + 'static {
    async fn open(&self) -> Result<Box<dyn PlaybackSink>, ConnectError>;
}

enum Cmd {
    Enqueue(PlaybackBuffer),
    Flush,
}

/// Cloneable handle the receive path uses to feed and flush the queue.
#[derive(Clone)]
pub struct PlaybackHandle {
    tx: mpsc::Sender<Cmd>,
}

impl PlaybackHandle {
    /// Queues a buffer behind whatever is already playing. Returns false when
    /// the queue is saturated and the buffer was dropped.
    pub fn enqueue(&self, buffer: PlaybackBuffer) -> bool {
        match self.tx.try_send(Cmd::Enqueue(buffer)) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "playback queue rejected buffer");
                false
            }
        }
    }

    /// Discards everything queued and silences the current buffer. Buffers
    /// enqueued after this call play normally.
    pub async fn flush(&self) {
        let _ = self.tx.send(Cmd::Flush).await;
    }
}

/// Owns the queue task. FIFO ordering is strict: the next buffer starts only
/// after the previous one finishes.
pub struct PlaybackQueue {
    tx: mpsc::Sender<Cmd>,
    task: JoinHandle<()>,
}

impl PlaybackQueue {
    pub fn start(sink: Box<dyn PlaybackSink>) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let task = tokio::spawn(run_queue(sink, rx));
        Self { tx, task }
    }

    pub fn handle(&self) -> PlaybackHandle {
        PlaybackHandle {
            tx: self.tx.clone(),
        }
    }

    /// Forced stop: silences the sink, drops all queued buffers and waits for
    /// the queue task to finish.
    pub async fn shutdown(self) {
        let _ = self.tx.send(Cmd::Flush).await;
        drop(self.tx);
        let _ = self.task.await;
    }
}

enum PlayOutcome {
    Finished,
    Flushed,
    Closed,
}

async fn run_queue(mut sink: Box<dyn PlaybackSink>, mut rx: mpsc::Receiver<Cmd>) {
    let mut queue: VecDeque<PlaybackBuffer> = VecDeque::new();
    'outer: loop {
        let Some(current) = queue.pop_front() else {
            match rx.recv().await {
                Some(Cmd::Enqueue(buffer)) => {
                    queue.push_back(buffer);
                    continue;
                }
                Some(Cmd::Flush) => {
                    sink.stop();
                    continue;
                }
                None => break,
            }
        };

        let outcome = {
            let play = sink.play(&current);
            tokio::pin!(play);
            loop {
                tokio::select! {
                    _ = &mut play => break PlayOutcome::Finished,
                    cmd = rx.recv() => match cmd {
                        Some(Cmd::Enqueue(buffer)) => queue.push_back(buffer),
                        Some(Cmd::Flush) => break PlayOutcome::Flushed,
                        None => break PlayOutcome::Closed,
                    },
                }
            }
        };
        match outcome {
            PlayOutcome::Finished => {}
            PlayOutcome::Flushed => {
                sink.stop();
                queue.clear();
            }
            PlayOutcome::Closed => {
                sink.stop();
                break 'outer;
            }
        }
    }
}

/// The default output device. Samples are resampled from the 24 kHz wire rate
/// to the device rate and fed to the stream callback through a shared buffer;
/// `stop` clears that buffer, silencing playback immediately.
#[derive(Default)]
pub struct Speaker;

impl Speaker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PlaybackOutput for Speaker {
    async fn open(&self) -> Result<Box<dyn PlaybackSink>, ConnectError> {
        let shared: Arc<Mutex<VecDeque<f32>>> = Arc::new(Mutex::new(VecDeque::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread_shared = shared.clone();
        let thread_stop = stop.clone();
        std::thread::Builder::new()
            .name("speaker".into())
            .spawn(move || run_output_thread(thread_shared, ready_tx, thread_stop))
            .map_err(|e| ConnectError::PermissionDenied(e.to_string()))?;

        let device_rate = match ready_rx.await {
            Ok(Ok(rate)) => rate,
            Ok(Err(reason)) => return Err(ConnectError::PermissionDenied(reason)),
            Err(_) => {
                return Err(ConnectError::PermissionDenied(
                    "playback thread exited before the device opened".into(),
                ));
            }
        };

        let resampler_chunk = 1024usize;
        let resampler = if device_rate != SYNTH_SAMPLE_RATE {
            Some(
                audio::create_resampler(SYNTH_SAMPLE_RATE, device_rate, resampler_chunk)
                    .map_err(|e| ConnectError::PermissionDenied(e.to_string()))?,
            )
        } else {
            None
        };

        Ok(Box::new(SpeakerSink {
            shared,
            stop,
            resampler,
            resampler_chunk,
            pending: Vec::new(),
        }))
    }
}

struct SpeakerSink {
    shared: Arc<Mutex<VecDeque<f32>>>,
    stop: Arc<AtomicBool>,
    resampler: Option<rubato::FastFixedIn<f32>>,
    resampler_chunk: usize,
    pending: Vec<f32>,
}

#[async_trait]
impl PlaybackSink for SpeakerSink {
    async fn play(&mut self, buffer: &PlaybackBuffer) {
        let duration = buffer.duration();
        match self.resampler.as_mut() {
            Some(resampler) => {
                self.pending.extend_from_slice(&buffer.samples);
                let chunk = self.resampler_chunk;
                let mut queue = self.shared.lock().unwrap_or_else(|e| e.into_inner());
                while self.pending.len() >= chunk {
                    match resampler.process(&[&self.pending[..chunk]], None) {
                        Ok(resampled) => queue.extend(resampled[0].iter().copied()),
                        Err(e) => warn!(error = %e, "playback resampling failed"),
                    }
                    self.pending.drain(..chunk);
                }
            }
            None => {
                let mut queue = self.shared.lock().unwrap_or_else(|e| e.into_inner());
                queue.extend(buffer.samples.iter().copied());
            }
        }
        tokio::time::sleep(duration).await;
    }

    fn stop(&mut self) {
        self.pending.clear();
        self.shared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl Drop for SpeakerSink {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn run_output_thread(
    shared: Arc<Mutex<VecDeque<f32>>>,
    ready_tx: oneshot::Sender<Result<u32, String>>,
    stop: Arc<AtomicBool>,
) {
    let host = cpal::default_host();
    let Some(device) = host.default_output_device() else {
        let _ = ready_tx.send(Err("no output device available".into()));
        return;
    };
    let supported = match device.default_output_config() {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(e.to_string()));
            return;
        }
    };
    if supported.sample_format() != cpal::SampleFormat::F32 {
        let _ = ready_tx.send(Err(format!(
            "unsupported output sample format {:?}",
            supported.sample_format()
        )));
        return;
    }
    let config: cpal::StreamConfig = supported.into();
    let channels = config.channels as usize;
    let device_rate = config.sample_rate.0;

    let stream = match device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let mut queue = shared.lock().unwrap_or_else(|e| e.into_inner());
            for frame in data.chunks_mut(channels) {
                let sample = queue.pop_front().unwrap_or(0.0);
                for out in frame {
                    *out = sample;
                }
            }
        },
        |err| warn!(error = %err, "output stream error"),
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
    let _ = ready_tx.send(Ok(device_rate));

    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(20));
    }
    drop(stream);
    debug!("speaker output stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[derive(Clone, Debug, PartialEq)]
    enum SinkEvent {
        Started(Duration),
        Stopped,
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        events: Arc<Mutex<Vec<(Instant, SinkEvent)>>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<(Instant, SinkEvent)> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PlaybackSink for RecordingSink {
        async fn play(&mut self, buffer: &PlaybackBuffer) {
            let duration = buffer.duration();
            self.events
                .lock()
                .unwrap()
                .push((Instant::now(), SinkEvent::Started(duration)));
            tokio::time::sleep(duration).await;
        }

        fn stop(&mut self) {
            self.events
                .lock()
                .unwrap()
                .push((Instant::now(), SinkEvent::Stopped));
        }
    }

    fn buffer_with_duration(millis: u64) -> PlaybackBuffer {
        let frames = (SYNTH_SAMPLE_RATE as u64 * millis / 1000) as usize;
        PlaybackBuffer::new(vec![0.0; frames])
    }

    #[tokio::test(start_paused = true)]
    async fn buffers_play_in_order_without_overlap() {
        let sink = RecordingSink::default();
        let queue = PlaybackQueue::start(Box::new(sink.clone()));
        let handle = queue.handle();

        assert!(handle.enqueue(buffer_with_duration(500)));
        assert!(handle.enqueue(buffer_with_duration(200)));
        tokio::time::sleep(Duration::from_secs(2)).await;

        let events = sink.events();
        assert_eq!(events.len(), 2);
        let (first_start, SinkEvent::Started(first_len)) = events[0].clone() else {
            panic!("expected a start event");
        };
        let second_start = events[1].0;
        assert!(second_start >= first_start + first_len);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn flush_discards_queue_but_not_later_buffers() {
        let sink = RecordingSink::default();
        let queue = PlaybackQueue::start(Box::new(sink.clone()));
        let handle = queue.handle();

        handle.enqueue(buffer_with_duration(10_000));
        handle.enqueue(buffer_with_duration(10_000));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.flush().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.enqueue(buffer_with_duration(100));
        tokio::time::sleep(Duration::from_secs(1)).await;

        let events: Vec<SinkEvent> = sink.events().into_iter().map(|(_, e)| e).collect();
        assert_eq!(
            events,
            vec![
                SinkEvent::Started(buffer_with_duration(10_000).duration()),
                SinkEvent::Stopped,
                SinkEvent::Started(buffer_with_duration(100).duration()),
            ]
        );
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn flush_while_idle_does_not_swallow_the_next_buffer() {
        let sink = RecordingSink::default();
        let queue = PlaybackQueue::start(Box::new(sink.clone()));
        let handle = queue.handle();

        handle.flush().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.enqueue(buffer_with_duration(100));
        tokio::time::sleep(Duration::from_secs(1)).await;

        let events: Vec<SinkEvent> = sink.events().into_iter().map(|(_, e)| e).collect();
        assert!(
            events.contains(&SinkEvent::Started(buffer_with_duration(100).duration())),
            "buffer after an idle flush must still play: {events:?}"
        );
        queue.shutdown().await;
    }
}
