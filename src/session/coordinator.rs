//! Duplex streaming coordinator
//!
//! Three threads share one session:
//!
//! - **capture**: `FrameSource::frames()` → base64 → `input_audio_buffer.append`
//! - **receive**: `TransportChannel::receive()` → playback queue, or
//!   `interrupt()` on `input_audio_buffer.speech_started`
//! - **playback**: `PlaybackSink::run()`
//!
//! None of them waits on another. The session ends when any of them hits a
//! fatal error (or on [`SessionControl::shutdown`]); the first cause wins and
//! closes the frame source, the playback queue and the transport exactly
//! once, which lets every thread run out on its own.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use thiserror::Error;

use crate::audio::buffer::PlaybackFragment;
use crate::audio::capture::{FrameSource, InputDevice};
use crate::audio::playback::{OutputDevice, PlaybackHandle, PlaybackSink, PlaybackStats};
use crate::codec::{decode_payload, encode_payload};
use crate::config::AudioConfig;
use crate::error::{DeviceError, Error, Result, TransportError};
use crate::network::transport::TransportChannel;
use crate::protocol::{ClientEvent, Envelope, ServerEvent};

const IDLE: u8 = 0;
const STREAMING: u8 = 1;
const TERMINATED: u8 = 2;

/// Coordinator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Streaming,
    Terminated,
}

/// Why the session ended
#[derive(Error, Debug)]
pub enum Termination {
    #[error("transport: {0}")]
    Transport(TransportError),

    #[error("device: {0}")]
    Device(DeviceError),

    #[error("startup failed")]
    StartFailed,

    #[error("local shutdown")]
    Shutdown,
}

#[derive(Default)]
struct SessionCounters {
    batches_sent: AtomicU64,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    fragments_received: AtomicU64,
    fragments_rejected: AtomicU64,
    interrupts: AtomicU64,
    protocol_errors: AtomicU64,
}

struct Shared {
    state: AtomicU8,
    cause: Mutex<Option<Termination>>,
    source: FrameSource,
    transport: Arc<dyn TransportChannel>,
    playback: PlaybackHandle,
    counters: SessionCounters,
}

impl Shared {
    fn state(&self) -> SessionState {
        match self.state.load(Ordering::SeqCst) {
            IDLE => SessionState::Idle,
            STREAMING => SessionState::Streaming,
            _ => SessionState::Terminated,
        }
    }

    fn is_terminated(&self) -> bool {
        self.state.load(Ordering::SeqCst) == TERMINATED
    }

    /// Enter Terminated. Only the first call records its cause and
    /// releases resources.
    fn terminate(&self, cause: Termination) -> bool {
        if self.state.swap(TERMINATED, Ordering::SeqCst) == TERMINATED {
            return false;
        }

        match &cause {
            Termination::Shutdown => tracing::info!("Session shutting down"),
            other => tracing::warn!("Session terminated by {}", other),
        }
        *self.cause.lock() = Some(cause);

        self.source.close();
        self.playback.close();
        self.transport.close();
        true
    }

    fn capture_loop(&self) {
        for batch in self.source.frames() {
            if self.is_terminated() {
                break;
            }

            let audio = encode_payload(&batch.data);
            if let Err(e) = self.transport.send(ClientEvent::append_audio(audio).into()) {
                if !self.is_terminated() {
                    tracing::error!("Failed to send audio: {}", e);
                }
                self.terminate(Termination::Transport(e));
                break;
            }

            self.counters.batches_sent.fetch_add(1, Ordering::Relaxed);
            self.counters
                .frames_sent
                .fetch_add(batch.frame_count as u64, Ordering::Relaxed);
            self.counters
                .bytes_sent
                .fetch_add(batch.data.len() as u64, Ordering::Relaxed);
        }

        if let Some(e) = self.source.take_fault() {
            self.terminate(Termination::Device(e));
        }

        tracing::debug!("Capture loop finished");
    }

    fn receive_loop(&self) {
        while !self.is_terminated() {
            match self.transport.receive() {
                Ok(envelope) => self.dispatch(envelope),
                Err(e) => {
                    self.terminate(Termination::Transport(e));
                    break;
                }
            }
        }

        tracing::debug!("Receive loop finished");
    }

    fn dispatch(&self, envelope: Envelope) {
        tracing::debug!("Received {}", envelope.kind);

        match ServerEvent::try_from(envelope) {
            Ok(ServerEvent::AudioDelta { delta }) => match decode_payload(&delta) {
                Ok(data) => {
                    self.counters.fragments_received.fetch_add(1, Ordering::Relaxed);
                    if !self.playback.enqueue(PlaybackFragment::new(data)) {
                        tracing::debug!("Playback closed, dropping fragment");
                    }
                }
                Err(e) => {
                    tracing::warn!("Dropping audio delta: {}", e);
                    self.counters.fragments_rejected.fetch_add(1, Ordering::Relaxed);
                }
            },
            Ok(ServerEvent::SpeechStarted) => {
                let dropped = self.playback.interrupt();
                self.counters.interrupts.fetch_add(1, Ordering::Relaxed);
                tracing::info!("Speech started - interrupting ({} fragments dropped)", dropped);
            }
            Ok(ServerEvent::RemoteError { message }) => {
                tracing::warn!("Remote error: {}", message);
            }
            Ok(ServerEvent::Other(_)) => {}
            Err(e) => {
                tracing::warn!("Ignoring message: {}", e);
                self.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Cloneable handle for stopping a running session from elsewhere
#[derive(Clone)]
pub struct SessionControl {
    shared: Arc<Shared>,
}

impl SessionControl {
    /// End the session locally. A no-op once it has ended.
    pub fn shutdown(&self) -> bool {
        self.shared.terminate(Termination::Shutdown)
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }
}

/// Totals reported when the session ends
#[derive(Debug, Default)]
pub struct SessionSummary {
    pub batches_sent: u64,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub fragments_received: u64,
    pub fragments_rejected: u64,
    pub interrupts: u64,
    pub protocol_errors: u64,
    pub playback: Option<PlaybackStats>,
    pub cause: Option<Termination>,
}

impl SessionSummary {
    /// Turn a fatal termination cause into an error
    pub fn into_result(mut self) -> Result<SessionSummary> {
        match self.cause.take() {
            Some(Termination::Transport(e)) => Err(Error::Transport(e)),
            Some(Termination::Device(e)) => Err(Error::Device(e)),
            other => {
                self.cause = other;
                Ok(self)
            }
        }
    }
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} frames sent in {} batches ({:.1} KB), {} fragments received, {} interrupts",
            self.frames_sent,
            self.batches_sent,
            self.bytes_sent as f64 / 1024.0,
            self.fragments_received,
            self.interrupts
        )?;
        if let Some(playback) = &self.playback {
            write!(
                f,
                ", {} fragments played ({:.1}s)",
                playback.fragments_played,
                playback.played_ms as f64 / 1000.0
            )?;
        }
        Ok(())
    }
}

/// Owns the capture, receive and playback threads of one session
pub struct StreamCoordinator {
    shared: Arc<Shared>,
    sink: Option<PlaybackSink>,
    capture: Option<JoinHandle<()>>,
    receive: Option<JoinHandle<()>>,
    playback: Option<JoinHandle<Option<PlaybackStats>>>,
}

impl StreamCoordinator {
    pub fn new(
        config: &AudioConfig,
        transport: Arc<dyn TransportChannel>,
        input: Box<dyn InputDevice>,
        output: Box<dyn OutputDevice>,
    ) -> Self {
        let sink = PlaybackSink::new(output, config);
        let shared = Arc::new(Shared {
            state: AtomicU8::new(IDLE),
            cause: Mutex::new(None),
            source: FrameSource::new(input, config),
            transport,
            playback: sink.handle(),
            counters: SessionCounters::default(),
        });

        Self {
            shared,
            sink: Some(sink),
            capture: None,
            receive: None,
            playback: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn control(&self) -> SessionControl {
        SessionControl {
            shared: self.shared.clone(),
        }
    }

    /// Idle → Streaming: open the input and launch all three threads
    pub fn start(&mut self) -> Result<()> {
        if self
            .shared
            .state
            .compare_exchange(IDLE, STREAMING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyStarted);
        }

        if let Err(e) = self.shared.source.open() {
            self.shared.terminate(Termination::StartFailed);
            return Err(e.into());
        }

        if let Err(e) = self.spawn_threads() {
            self.shared.terminate(Termination::StartFailed);
            return Err(e.into());
        }

        tracing::info!("Streaming started");
        Ok(())
    }

    fn spawn_threads(&mut self) -> std::io::Result<()> {
        if let Some(sink) = self.sink.take() {
            let shared = self.shared.clone();
            self.playback = Some(thread::Builder::new().name("playback".to_string()).spawn(
                move || match sink.run() {
                    Ok(stats) => Some(stats),
                    Err(e) => {
                        shared.terminate(Termination::Device(e));
                        None
                    }
                },
            )?);
        }

        let shared = self.shared.clone();
        self.capture = Some(
            thread::Builder::new()
                .name("capture".to_string())
                .spawn(move || shared.capture_loop())?,
        );

        let shared = self.shared.clone();
        self.receive = Some(
            thread::Builder::new()
                .name("receive".to_string())
                .spawn(move || shared.receive_loop())?,
        );

        Ok(())
    }

    /// Block until every thread has finished and report the totals
    pub fn wait(mut self) -> SessionSummary {
        for (name, handle) in [("capture", self.capture.take()), ("receive", self.receive.take())] {
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    tracing::error!("{} thread panicked", name);
                    self.shared.terminate(Termination::Shutdown);
                }
            }
        }

        let playback = match self.playback.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                tracing::error!("playback thread panicked");
                None
            }),
            None => None,
        };

        let counters = &self.shared.counters;
        SessionSummary {
            batches_sent: counters.batches_sent.load(Ordering::Relaxed),
            frames_sent: counters.frames_sent.load(Ordering::Relaxed),
            bytes_sent: counters.bytes_sent.load(Ordering::Relaxed),
            fragments_received: counters.fragments_received.load(Ordering::Relaxed),
            fragments_rejected: counters.fragments_rejected.load(Ordering::Relaxed),
            interrupts: counters.interrupts.load(Ordering::Relaxed),
            protocol_errors: counters.protocol_errors.load(Ordering::Relaxed),
            playback,
            cause: self.shared.cause.lock().take(),
        }
    }
}

impl Drop for StreamCoordinator {
    fn drop(&mut self) {
        self.shared.terminate(Termination::Shutdown);
        for handle in [self.capture.take(), self.receive.take()].into_iter().flatten() {
            let _ = handle.join();
        }
        if let Some(handle) = self.playback.take() {
            let _ = handle.join();
        }
    }
}
