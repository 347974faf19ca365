//! Audio capture from the input device
//!
//! The device callback runs on a driver-owned thread and pushes fixed-size
//! frames into an unbounded crossbeam channel. [`FrameSource::frames`] pulls
//! from that channel, joining whatever has piled up into one batch per send.

use bytes::{Bytes, BytesMut};
use cpal::traits::DeviceTrait;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::audio::buffer::{AudioBatch, AudioFrame};
use crate::audio::device::{input_device, is_fatal_stream_error, pick_config, StreamThread};
use crate::audio::resample::StreamResampler;
use crate::codec::encoder::write_pcm16;
use crate::config::AudioConfig;
use crate::constants::PCM16_SAMPLE_BYTES;
use crate::error::DeviceError;

/// Lifecycle of a source or sink. Moves Open to Closed once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Closed,
}

/// Something that delivers frames to a [`FrameProducer`] from its own thread
pub trait InputDevice: Send {
    /// Begin asynchronous delivery
    fn start(&mut self, producer: FrameProducer) -> Result<(), DeviceError>;

    /// Stop delivery. Called at most once, after a successful start or not.
    fn stop(&mut self);
}

/// Item in the capture buffer
enum Captured {
    Frame(AudioFrame),
    /// The device failed after start; nothing more will arrive
    Failed(DeviceError),
    /// Sentinel pushed by `close`
    End,
}

/// Write end of the capture buffer, handed to the device callbacks
#[derive(Clone)]
pub struct FrameProducer {
    tx: Sender<Captured>,
    sequence: Arc<AtomicU64>,
}

impl FrameProducer {
    /// Enqueue one frame. Never blocks.
    pub fn push(&self, data: Bytes) -> bool {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.tx.send(Captured::Frame(AudioFrame::new(data, sequence))).is_ok()
    }

    /// Report a device failure. Frames already queued are still delivered,
    /// then `frames()` ends and the error is kept for [`FrameSource::take_fault`].
    pub fn fail(&self, error: DeviceError) -> bool {
        self.tx.send(Captured::Failed(error)).is_ok()
    }

    fn push_sentinel(&self) {
        let _ = self.tx.send(Captured::End);
    }
}

/// Cuts callback-sized sample slices into fixed-size PCM16 mono frames
pub struct FrameAssembler {
    channels: usize,
    frame_bytes: usize,
    pending: BytesMut,
    mono: Vec<f32>,
    resampler: Option<StreamResampler>,
    resampled: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(channels: u16, samples_per_frame: usize) -> Self {
        let frame_bytes = samples_per_frame * PCM16_SAMPLE_BYTES;
        Self {
            channels: channels.max(1) as usize,
            frame_bytes,
            pending: BytesMut::with_capacity(frame_bytes * 2),
            mono: Vec::new(),
            resampler: None,
            resampled: Vec::new(),
        }
    }

    /// Convert from the device rate before framing
    pub fn with_resampler(mut self, resampler: StreamResampler) -> Self {
        self.resampler = Some(resampler);
        self
    }

    /// Feed interleaved samples, calling `emit` for every completed frame
    pub fn push_samples(&mut self, data: &[f32], mut emit: impl FnMut(Bytes)) {
        self.mono.clear();
        if self.channels == 1 {
            self.mono.extend_from_slice(data);
        } else {
            self.mono.extend(
                data.chunks(self.channels)
                    .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
            );
        }

        match &mut self.resampler {
            Some(resampler) => {
                self.resampled.clear();
                resampler.process(&self.mono, &mut self.resampled);
                write_pcm16(&self.resampled, &mut self.pending);
            }
            None => write_pcm16(&self.mono, &mut self.pending),
        }

        while self.pending.len() >= self.frame_bytes {
            emit(self.pending.split_to(self.frame_bytes).freeze());
        }
    }

    /// Bytes waiting for a complete frame
    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }
}

/// Default or named microphone through cpal
pub struct Microphone {
    device_name: Option<String>,
    sample_rate: u32,
    samples_per_frame: usize,
    stream: Option<StreamThread>,
}

impl Microphone {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device_name: config.input_device.clone(),
            sample_rate: config.capture_sample_rate,
            samples_per_frame: config.samples_per_frame(),
            stream: None,
        }
    }
}

impl InputDevice for Microphone {
    fn start(&mut self, producer: FrameProducer) -> Result<(), DeviceError> {
        if self.stream.is_some() {
            return Ok(());
        }

        let device_name = self.device_name.clone();
        let sample_rate = self.sample_rate;
        let samples_per_frame = self.samples_per_frame;

        let stream = StreamThread::spawn("capture-mic", move || {
            let device = input_device(device_name.as_deref())?;
            let configs = device
                .supported_input_configs()
                .map_err(|e| DeviceError::CpalError(e.to_string()))?;
            let config = pick_config(configs, sample_rate)?;
            let device_rate = config.sample_rate.0;

            tracing::info!(
                "Capturing from {} at {}Hz, {} channel(s), {} samples/frame",
                device.name().unwrap_or_else(|_| "Unknown".to_string()),
                device_rate,
                config.channels,
                samples_per_frame
            );

            let mut assembler = FrameAssembler::new(config.channels, samples_per_frame);
            if let Some(resampler) = StreamResampler::between(device_rate, sample_rate)? {
                tracing::info!("Resampling capture {}Hz -> {}Hz", device_rate, sample_rate);
                assembler = assembler.with_resampler(resampler);
            }

            let errors = producer.clone();
            device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        assembler.push_samples(data, |frame| {
                            producer.push(frame);
                        });
                    },
                    move |err| {
                        if is_fatal_stream_error(&err) {
                            errors.fail(DeviceError::StreamError(err.to_string()));
                        } else {
                            tracing::warn!("Capture stream error: {}", err);
                        }
                    },
                    None,
                )
                .map_err(|e| DeviceError::StreamError(e.to_string()))
        })?;

        self.stream = Some(stream);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
            tracing::debug!("Microphone stopped");
        }
    }
}

/// Pull-based, closeable source of captured audio
pub struct FrameSource {
    device: Mutex<Box<dyn InputDevice>>,
    producer: FrameProducer,
    receiver: Receiver<Captured>,
    fault: Mutex<Option<DeviceError>>,
    opened: AtomicBool,
    closed: AtomicBool,
    poll_interval: Duration,
    frames_delivered: AtomicU64,
}

impl FrameSource {
    pub fn new(device: Box<dyn InputDevice>, config: &AudioConfig) -> Self {
        let (tx, receiver) = unbounded();
        Self {
            device: Mutex::new(device),
            producer: FrameProducer {
                tx,
                sequence: Arc::new(AtomicU64::new(0)),
            },
            receiver,
            fault: Mutex::new(None),
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            poll_interval: config.poll_interval(),
            frames_delivered: AtomicU64::new(0),
        }
    }

    /// Start the device. A no-op when already open.
    pub fn open(&self) -> Result<(), DeviceError> {
        if self.is_closed() {
            return Err(DeviceError::Closed);
        }
        if self.opened.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut device = self.device.lock();
        // close() may have run while we waited for the lock
        if self.is_closed() {
            return Err(DeviceError::Closed);
        }
        if self.opened.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = device.start(self.producer.clone()) {
            self.opened.store(false, Ordering::SeqCst);
            return Err(e);
        }

        tracing::debug!("Frame source opened");
        Ok(())
    }

    /// Batches of captured audio until the source is closed
    pub fn frames(&self) -> Frames<'_> {
        Frames {
            source: self,
            finished: false,
        }
    }

    /// Stop the device and wake any reader. Returns true for the call that
    /// actually closed the source.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.device.lock().stop();
        self.producer.push_sentinel();
        tracing::debug!(
            "Frame source closed after {} frames",
            self.frames_delivered.load(Ordering::Relaxed)
        );
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> StreamState {
        if self.is_closed() {
            StreamState::Closed
        } else {
            StreamState::Open
        }
    }

    /// Device failure that ended `frames()`, if any
    pub fn take_fault(&self) -> Option<DeviceError> {
        self.fault.lock().take()
    }

    fn record_fault(&self, error: DeviceError) {
        tracing::error!("Capture device failed: {}", error);
        let mut fault = self.fault.lock();
        if fault.is_none() {
            *fault = Some(error);
        }
    }

    /// Frames handed out through `frames()` so far
    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered.load(Ordering::Relaxed)
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Iterator returned by [`FrameSource::frames`]
pub struct Frames<'a> {
    source: &'a FrameSource,
    finished: bool,
}

impl Frames<'_> {
    fn wait_first(&mut self) -> Option<AudioFrame> {
        loop {
            match self.source.receiver.recv_timeout(self.source.poll_interval) {
                Ok(Captured::Frame(frame)) => return Some(frame),
                Ok(Captured::Failed(e)) => {
                    self.source.record_fault(e);
                    return None;
                }
                Ok(Captured::End) | Err(RecvTimeoutError::Disconnected) => return None,
                Err(RecvTimeoutError::Timeout) => {
                    if self.source.is_closed() && self.source.receiver.is_empty() {
                        return None;
                    }
                }
            }
        }
    }
}

impl Iterator for Frames<'_> {
    type Item = AudioBatch;

    fn next(&mut self) -> Option<AudioBatch> {
        if self.finished {
            return None;
        }

        let Some(first) = self.wait_first() else {
            self.finished = true;
            return None;
        };

        let mut frames = vec![first];
        loop {
            match self.source.receiver.try_recv() {
                Ok(Captured::Frame(frame)) => frames.push(frame),
                Ok(Captured::Failed(e)) => {
                    self.source.record_fault(e);
                    self.finished = true;
                    break;
                }
                Ok(Captured::End) => {
                    // Yield what was drained, end on the next call
                    self.finished = true;
                    break;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        self.source
            .frames_delivered
            .fetch_add(frames.len() as u64, Ordering::Relaxed);
        AudioBatch::concat(&frames)
    }
}
