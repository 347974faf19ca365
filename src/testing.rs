//! Test doubles for devices and transport

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::audio::capture::{FrameProducer, InputDevice};
use crate::audio::playback::OutputDevice;
use crate::error::{DeviceError, TransportError};
use crate::network::transport::TransportChannel;
use crate::protocol::Envelope;

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[derive(Default)]
struct InputState {
    producer: Option<FrameProducer>,
    starts: usize,
    stops: usize,
}

/// Input device whose frames are pushed by the test
pub struct ManualInput {
    state: Arc<Mutex<InputState>>,
    fail_start: bool,
}

/// Test side of a [`ManualInput`]
#[derive(Clone)]
pub struct InputControl {
    state: Arc<Mutex<InputState>>,
}

impl ManualInput {
    pub fn new() -> (Self, InputControl) {
        Self::build(false)
    }

    /// An input whose `start` reports a missing device
    pub fn failing() -> (Self, InputControl) {
        Self::build(true)
    }

    fn build(fail_start: bool) -> (Self, InputControl) {
        let state = Arc::new(Mutex::new(InputState::default()));
        (
            Self {
                state: state.clone(),
                fail_start,
            },
            InputControl { state },
        )
    }
}

impl InputDevice for ManualInput {
    fn start(&mut self, producer: FrameProducer) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.starts += 1;
        if self.fail_start {
            return Err(DeviceError::DeviceNotFound("manual".to_string()));
        }
        state.producer = Some(producer);
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.state.lock();
        state.stops += 1;
        state.producer = None;
    }
}

impl InputControl {
    /// Deliver one frame as the device callback would. False once stopped.
    pub fn push(&self, data: &[u8]) -> bool {
        match &self.state.lock().producer {
            Some(producer) => producer.push(Bytes::copy_from_slice(data)),
            None => false,
        }
    }

    /// Report a device failure as the stream error callback would
    pub fn fail(&self, error: DeviceError) -> bool {
        match &self.state.lock().producer {
            Some(producer) => producer.fail(error),
            None => false,
        }
    }

    pub fn starts(&self) -> usize {
        self.state.lock().starts
    }

    pub fn stops(&self) -> usize {
        self.state.lock().stops
    }
}

#[derive(Default)]
struct OutputState {
    writes: Vec<Vec<i16>>,
    failures: VecDeque<DeviceError>,
    closed: bool,
}

/// Output device that records every write
pub struct RecordingOutput {
    state: Arc<Mutex<OutputState>>,
    delay: Duration,
}

/// Test side of a [`RecordingOutput`]
#[derive(Clone)]
pub struct OutputLog {
    state: Arc<Mutex<OutputState>>,
}

impl RecordingOutput {
    pub fn new() -> (Self, OutputLog) {
        Self::with_delay(Duration::ZERO)
    }

    /// Each write takes `delay`, like a device playing in real time
    pub fn with_delay(delay: Duration) -> (Self, OutputLog) {
        let state = Arc::new(Mutex::new(OutputState::default()));
        (
            Self {
                state: state.clone(),
                delay,
            },
            OutputLog { state },
        )
    }
}

impl OutputDevice for RecordingOutput {
    fn write(&mut self, samples: &[i16]) -> Result<(), DeviceError> {
        if let Some(e) = self.state.lock().failures.pop_front() {
            return Err(e);
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        self.state.lock().writes.push(samples.to_vec());
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().closed = true;
    }
}

impl OutputLog {
    pub fn writes(&self) -> Vec<Vec<i16>> {
        self.state.lock().writes.clone()
    }

    /// Make the next write fail with `error`
    pub fn fail_next(&self, error: DeviceError) {
        self.state.lock().failures.push_back(error);
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// In-memory transport: the test delivers inbound messages and inspects
/// what was sent
pub struct MockTransport {
    inbound_tx: Mutex<Option<Sender<Envelope>>>,
    inbound: Receiver<Envelope>,
    sent: Mutex<Vec<Envelope>>,
    send_limit: Option<usize>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    /// Sends succeed `limit` times, then fail
    pub fn failing_after(limit: usize) -> Arc<Self> {
        Self::build(Some(limit))
    }

    fn build(send_limit: Option<usize>) -> Arc<Self> {
        let (tx, rx) = unbounded();
        Arc::new(Self {
            inbound_tx: Mutex::new(Some(tx)),
            inbound: rx,
            sent: Mutex::new(Vec::new()),
            send_limit,
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
        })
    }

    pub fn deliver(&self, message: Envelope) {
        if let Some(tx) = self.inbound_tx.lock().as_ref() {
            let _ = tx.send(message);
        }
    }

    /// Simulate the remote end closing the connection
    pub fn hang_up(&self) {
        self.inbound_tx.lock().take();
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

impl TransportChannel for MockTransport {
    fn send(&self, message: Envelope) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let mut sent = self.sent.lock();
        if self.send_limit.is_some_and(|limit| sent.len() >= limit) {
            return Err(TransportError::SendFailed("connection reset".to_string()));
        }
        sent.push(message);
        Ok(())
    }

    fn receive(&self) -> Result<Envelope, TransportError> {
        self.inbound.recv().map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.hang_up();
    }
}
