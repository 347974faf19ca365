//! Audio playback of streamed response fragments
//!
//! [`PlaybackSink`] runs on its own thread, draining a [`PlaybackQueue`] into
//! an [`OutputDevice`]. [`PlaybackHandle::interrupt`] can be called from any
//! thread to drop everything still queued.

use cpal::traits::DeviceTrait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::audio::buffer::{
    create_playback_queue, Dequeued, PlaybackFragment, SharedPlaybackQueue,
};
use crate::audio::device::{is_fatal_stream_error, output_device, pick_config, StreamThread};
use crate::audio::resample::StreamResampler;
use crate::codec::decoder::{i16_to_f32, Pcm16Decoder};
use crate::config::AudioConfig;
use crate::error::DeviceError;

/// Synchronous sink for mono PCM16 samples
pub trait OutputDevice: Send {
    /// Write samples, returning once the device has taken them
    fn write(&mut self, samples: &[i16]) -> Result<(), DeviceError>;

    /// Let buffered audio finish and release the device
    fn close(&mut self) {}
}

/// Longest a write may wait without the device consuming anything
const STALL_TIMEOUT: Duration = Duration::from_secs(1);

/// Mono samples waiting for the output callback
///
/// `Speaker::write` pushes and then waits for the level to fall; the cpal
/// callback pulls through [`SampleBuffer::fill`].
#[derive(Clone)]
pub struct SampleBuffer {
    samples: Arc<Mutex<VecDeque<f32>>>,
    failed: Arc<AtomicBool>,
    stall_timeout: Duration,
}

impl SampleBuffer {
    pub fn new(stall_timeout: Duration) -> Self {
        Self {
            samples: Arc::new(Mutex::new(VecDeque::new())),
            failed: Arc::new(AtomicBool::new(false)),
            stall_timeout,
        }
    }

    pub fn push(&self, samples: &[f32]) {
        self.samples.lock().extend(samples.iter().copied());
    }

    /// Fill interleaved `data`, one buffered sample per frame across all
    /// channels. Silence once the buffer runs dry.
    pub fn fill(&self, data: &mut [f32], channels: usize) {
        let mut samples = self.samples.lock();
        for frame in data.chunks_mut(channels.max(1)) {
            frame.fill(samples.pop_front().unwrap_or(0.0));
        }
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.samples.lock().clear();
    }

    /// The device is gone; waiting writers fail
    pub fn fail(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    /// Block until at most `level` samples remain.
    ///
    /// Fails with `WriteFailed` (dropping what is buffered) when the level
    /// stops falling for the stall timeout.
    pub fn wait_below(&self, level: usize) -> Result<(), DeviceError> {
        let mut last_len = usize::MAX;
        let mut last_progress = Instant::now();

        loop {
            if self.failed.load(Ordering::SeqCst) {
                return Err(DeviceError::StreamError("output stream failed".to_string()));
            }

            let len = self.len();
            if len <= level {
                return Ok(());
            }
            if len < last_len {
                last_len = len;
                last_progress = Instant::now();
            } else if last_progress.elapsed() > self.stall_timeout {
                self.clear();
                return Err(DeviceError::WriteFailed("output device stalled".to_string()));
            }

            thread::sleep(Duration::from_millis(5));
        }
    }
}

/// Default or named speaker through cpal
///
/// Samples are converted to the device rate when the device does not offer
/// the playback rate.
pub struct Speaker {
    buffer: SampleBuffer,
    low_water: usize,
    device_rate: u32,
    resampler: Option<StreamResampler>,
    converted: Vec<f32>,
    resampled: Vec<f32>,
    stream: Option<StreamThread>,
}

impl Speaker {
    pub fn open(config: &AudioConfig) -> Result<Self, DeviceError> {
        let buffer = SampleBuffer::new(STALL_TIMEOUT);
        let device_name = config.output_device.clone();
        let sample_rate = config.playback_sample_rate;
        let opened_rate = Arc::new(AtomicU32::new(sample_rate));

        let stream = {
            let output = buffer.clone();
            let errors = buffer.clone();
            let opened_rate = opened_rate.clone();
            StreamThread::spawn("playback-speaker", move || {
                let device = output_device(device_name.as_deref())?;
                let configs = device
                    .supported_output_configs()
                    .map_err(|e| DeviceError::CpalError(e.to_string()))?;
                let config = pick_config(configs, sample_rate)?;
                let channels = config.channels as usize;
                opened_rate.store(config.sample_rate.0, Ordering::SeqCst);

                tracing::info!(
                    "Playing to {} at {}Hz, {} channel(s)",
                    device.name().unwrap_or_else(|_| "Unknown".to_string()),
                    config.sample_rate.0,
                    channels
                );

                device
                    .build_output_stream(
                        &config,
                        // Mono source, duplicated across device channels
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            output.fill(data, channels)
                        },
                        move |err| {
                            if is_fatal_stream_error(&err) {
                                tracing::error!("Playback device lost: {}", err);
                                errors.fail();
                            } else {
                                tracing::warn!("Playback stream error: {}", err);
                            }
                        },
                        None,
                    )
                    .map_err(|e| DeviceError::StreamError(e.to_string()))
            })?
        };

        let device_rate = opened_rate.load(Ordering::SeqCst);
        let resampler = StreamResampler::between(sample_rate, device_rate)?;
        if resampler.is_some() {
            tracing::info!("Resampling playback {}Hz -> {}Hz", sample_rate, device_rate);
        }

        Ok(Self {
            buffer,
            low_water: config.output_low_water(device_rate),
            device_rate,
            resampler,
            converted: Vec::new(),
            resampled: Vec::new(),
            stream: Some(stream),
        })
    }
}

impl OutputDevice for Speaker {
    fn write(&mut self, samples: &[i16]) -> Result<(), DeviceError> {
        if self.stream.is_none() {
            return Err(DeviceError::Closed);
        }

        self.converted.clear();
        self.converted.extend(samples.iter().map(|&s| i16_to_f32(s)));
        match &mut self.resampler {
            Some(resampler) => {
                self.resampled.clear();
                resampler.process(&self.converted, &mut self.resampled);
                self.buffer.push(&self.resampled);
            }
            None => self.buffer.push(&self.converted),
        }
        self.buffer.wait_below(self.low_water)
    }

    fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Some(resampler) = &mut self.resampler {
                self.resampled.clear();
                resampler.flush(&mut self.resampled);
                self.buffer.push(&self.resampled);
            }
            if let Err(e) = self.buffer.wait_below(0) {
                tracing::debug!("Discarding buffered playback: {}", e);
            }
            stream.stop();
            tracing::debug!("Speaker at {}Hz closed", self.device_rate);
        }
    }
}

impl Drop for Speaker {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Default)]
struct SinkShared {
    interrupted: AtomicBool,
    interrupts: AtomicU64,
    fragments_discarded: AtomicU64,
}

/// Producer-side handle: enqueue, interrupt, close
#[derive(Clone)]
pub struct PlaybackHandle {
    queue: SharedPlaybackQueue,
    shared: Arc<SinkShared>,
}

impl PlaybackHandle {
    /// Queue a fragment for playback. Returns false once the sink is closed.
    pub fn enqueue(&self, fragment: PlaybackFragment) -> bool {
        self.queue.push(fragment)
    }

    /// Drop every queued fragment. Never waits on the playback thread; the
    /// fragment currently being written still finishes.
    pub fn interrupt(&self) -> usize {
        let dropped = self.queue.clear();
        self.shared.interrupted.store(true, Ordering::SeqCst);
        self.shared.interrupts.fetch_add(1, Ordering::Relaxed);
        self.shared
            .fragments_discarded
            .fetch_add(dropped as u64, Ordering::Relaxed);
        dropped
    }

    /// Enqueue the sentinel; the sink plays what is queued, then exits
    pub fn close(&self) -> bool {
        self.queue.close()
    }

    pub fn is_interrupted(&self) -> bool {
        self.shared.interrupted.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

/// Playback statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub fragments_played: u64,
    pub fragments_rejected: u64,
    pub write_failures: u64,
    pub interrupts: u64,
    pub fragments_discarded: u64,
    pub played_ms: u64,
}

/// Drains the playback queue into an output device
pub struct PlaybackSink {
    queue: SharedPlaybackQueue,
    shared: Arc<SinkShared>,
    device: Box<dyn OutputDevice>,
    decoder: Pcm16Decoder,
    poll_interval: Duration,
}

impl PlaybackSink {
    /// The sink owns the only consumer side of its queue
    pub fn new(device: Box<dyn OutputDevice>, config: &AudioConfig) -> Self {
        Self {
            queue: create_playback_queue(),
            shared: Arc::new(SinkShared::default()),
            device,
            decoder: Pcm16Decoder::new(config.playback_sample_rate),
            poll_interval: config.poll_interval(),
        }
    }

    pub fn handle(&self) -> PlaybackHandle {
        PlaybackHandle {
            queue: self.queue.clone(),
            shared: self.shared.clone(),
        }
    }

    /// Drain until the sentinel. Only a fatal device error ends it early.
    pub fn run(mut self) -> Result<PlaybackStats, DeviceError> {
        let mut stats = PlaybackStats::default();

        loop {
            let fragment = match self.queue.pop_timeout(self.poll_interval) {
                Dequeued::Fragment(fragment) => fragment,
                Dequeued::TimedOut => continue,
                Dequeued::Sentinel => break,
            };

            if self.shared.interrupted.swap(false, Ordering::SeqCst) {
                tracing::debug!("Resuming playback after interrupt");
            }

            let samples = match self.decoder.decode(fragment.data()) {
                Ok(samples) => samples,
                Err(e) => {
                    tracing::warn!("Dropping playback fragment: {}", e);
                    stats.fragments_rejected += 1;
                    continue;
                }
            };
            if samples.is_empty() {
                continue;
            }

            match self.device.write(&samples) {
                Ok(()) => stats.fragments_played += 1,
                Err(e) if !e.is_fatal() => {
                    tracing::warn!("Playback write failed: {}", e);
                    stats.write_failures += 1;
                }
                Err(e) => {
                    tracing::error!("Playback device lost: {}", e);
                    self.queue.close();
                    self.device.close();
                    return Err(e);
                }
            }
        }

        self.device.close();

        stats.interrupts = self.shared.interrupts.load(Ordering::Relaxed);
        stats.fragments_discarded = self.shared.fragments_discarded.load(Ordering::Relaxed);
        stats.played_ms = self.decoder.decoded_ms();
        tracing::debug!("Playback finished: {:?}", stats);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingOutput;

    fn test_config() -> AudioConfig {
        AudioConfig {
            poll_interval_ms: 10,
            ..AudioConfig::default()
        }
    }

    fn pcm(samples: &[i16]) -> PlaybackFragment {
        PlaybackFragment::new(
            samples
                .iter()
                .flat_map(|s| s.to_le_bytes())
                .collect::<Vec<u8>>(),
        )
    }

    #[test]
    fn test_fill_duplicates_channels_then_silence() {
        let buffer = SampleBuffer::new(STALL_TIMEOUT);
        buffer.push(&[0.5, -0.5]);

        let mut data = [1.0f32; 6];
        buffer.fill(&mut data, 2);
        assert_eq!(data, [0.5, 0.5, -0.5, -0.5, 0.0, 0.0]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_write_waits_for_consumer() {
        let buffer = SampleBuffer::new(STALL_TIMEOUT);
        buffer.push(&[0.1; 1000]);

        let consumer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                let mut data = [0.0f32; 100];
                for _ in 0..20 {
                    thread::sleep(Duration::from_millis(5));
                    buffer.fill(&mut data, 1);
                }
            })
        };

        let started = Instant::now();
        buffer.wait_below(200).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(buffer.len() <= 200);
        consumer.join().unwrap();
    }

    #[test]
    fn test_stalled_device_fails_write() {
        let buffer = SampleBuffer::new(Duration::from_millis(50));
        buffer.push(&[0.1; 10]);

        let result = buffer.wait_below(0);
        assert!(matches!(result, Err(DeviceError::WriteFailed(_))));
        assert!(!result.unwrap_err().is_fatal());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drain_on_close_empties_buffer() {
        let buffer = SampleBuffer::new(STALL_TIMEOUT);
        buffer.push(&[0.1; 300]);

        let consumer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                let mut data = [0.0f32; 64];
                while !buffer.is_empty() {
                    thread::sleep(Duration::from_millis(2));
                    buffer.fill(&mut data, 1);
                }
            })
        };

        buffer.wait_below(0).unwrap();
        assert!(buffer.is_empty());
        consumer.join().unwrap();
    }

    #[test]
    fn test_lost_device_fails_waiting_write() {
        let buffer = SampleBuffer::new(STALL_TIMEOUT);
        buffer.push(&[0.1; 10]);
        buffer.fail();

        let result = buffer.wait_below(0);
        assert!(matches!(result, Err(DeviceError::StreamError(_))));
        assert!(result.unwrap_err().is_fatal());
    }

    #[test]
    fn test_plays_in_order_until_sentinel() {
        let (output, recorded) = RecordingOutput::new();
        let sink = PlaybackSink::new(Box::new(output), &test_config());
        let handle = sink.handle();

        handle.enqueue(pcm(&[1, 2]));
        handle.enqueue(pcm(&[3]));
        handle.close();

        let stats = sink.run().unwrap();
        assert_eq!(stats.fragments_played, 2);
        assert_eq!(recorded.writes(), vec![vec![1, 2], vec![3]]);
        assert!(recorded.is_closed());
    }

    #[test]
    fn test_bad_fragment_does_not_stop_playback() {
        let (output, recorded) = RecordingOutput::new();
        let sink = PlaybackSink::new(Box::new(output), &test_config());
        let handle = sink.handle();

        handle.enqueue(PlaybackFragment::new(vec![1u8, 2, 3]));
        handle.enqueue(pcm(&[5]));
        handle.close();

        let stats = sink.run().unwrap();
        assert_eq!(stats.fragments_rejected, 1);
        assert_eq!(stats.fragments_played, 1);
        assert_eq!(recorded.writes(), vec![vec![5]]);
    }

    #[test]
    fn test_write_failure_is_recovered() {
        let (output, recorded) = RecordingOutput::new();
        recorded.fail_next(DeviceError::WriteFailed("underrun".into()));
        let sink = PlaybackSink::new(Box::new(output), &test_config());
        let handle = sink.handle();

        handle.enqueue(pcm(&[1]));
        handle.enqueue(pcm(&[2]));
        handle.close();

        let stats = sink.run().unwrap();
        assert_eq!(stats.write_failures, 1);
        assert_eq!(recorded.writes(), vec![vec![2]]);
    }

    #[test]
    fn test_fatal_device_error_ends_sink() {
        let (output, recorded) = RecordingOutput::new();
        recorded.fail_next(DeviceError::StreamError("unplugged".into()));
        let sink = PlaybackSink::new(Box::new(output), &test_config());
        let handle = sink.handle();

        handle.enqueue(pcm(&[1]));
        handle.enqueue(pcm(&[2]));

        let result = thread::spawn(move || sink.run()).join().unwrap();
        assert!(matches!(result, Err(DeviceError::StreamError(_))));
        assert!(recorded.writes().is_empty());
        assert!(!handle.enqueue(pcm(&[3])));
    }

    #[test]
    fn test_interrupt_drops_queued_fragments() {
        let (output, recorded) = RecordingOutput::new();
        let sink = PlaybackSink::new(Box::new(output), &test_config());
        let handle = sink.handle();

        for n in 1..=3 {
            handle.enqueue(pcm(&[n]));
        }
        assert_eq!(handle.interrupt(), 3);
        assert!(handle.is_interrupted());
        assert_eq!(handle.queued(), 0);

        handle.enqueue(pcm(&[4]));
        handle.close();

        let stats = sink.run().unwrap();
        assert_eq!(recorded.writes(), vec![vec![4]]);
        assert_eq!(stats.interrupts, 1);
        assert_eq!(stats.fragments_discarded, 3);
    }

    #[test]
    fn test_interrupt_on_empty_queue() {
        let (output, recorded) = RecordingOutput::new();
        let sink = PlaybackSink::new(Box::new(output), &test_config());
        let handle = sink.handle();

        assert_eq!(handle.interrupt(), 0);
        handle.enqueue(pcm(&[8]));
        handle.close();

        sink.run().unwrap();
        assert_eq!(recorded.writes(), vec![vec![8]]);
    }

    #[test]
    fn test_interrupt_races_with_running_sink() {
        let (output, recorded) = RecordingOutput::with_delay(Duration::from_millis(30));
        let sink = PlaybackSink::new(Box::new(output), &test_config());
        let handle = sink.handle();
        let playback = thread::spawn(move || sink.run());

        for n in 1..=3 {
            handle.enqueue(pcm(&[n]));
        }
        let interrupter = {
            let handle = handle.clone();
            thread::spawn(move || handle.interrupt())
        };
        interrupter.join().unwrap();
        assert_eq!(handle.queued(), 0);

        handle.enqueue(pcm(&[4]));
        handle.close();
        playback.join().unwrap().unwrap();

        let writes = recorded.writes();
        assert_eq!(writes.last(), Some(&vec![4]));
        // Whatever slipped through before the cut is a prefix of 1, 2, 3
        let before: Vec<i16> = writes[..writes.len() - 1].iter().map(|w| w[0]).collect();
        assert_eq!(before, (1..=before.len() as i16).collect::<Vec<_>>());
    }
}
