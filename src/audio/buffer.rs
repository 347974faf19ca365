//! Audio buffers shared between the streaming threads
//!
//! Captured audio travels as [`AudioFrame`]s through an unbounded crossbeam
//! channel (see `audio::capture`). Received audio travels as
//! [`PlaybackFragment`]s through a [`PlaybackQueue`], which needs one thing a
//! channel cannot give: clearing everything queued in a single step while the
//! producer and the consumer keep running.

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Fixed-duration chunk of captured PCM16 audio
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioFrame {
    /// PCM16 LE mono bytes
    pub data: Bytes,
    /// Capture order, starting at 0
    pub sequence: u64,
}

impl AudioFrame {
    pub fn new(data: Bytes, sequence: u64) -> Self {
        Self { data, sequence }
    }
}

/// Consecutive frames drained from the capture buffer in one go
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioBatch {
    /// Concatenated frame bytes
    pub data: Bytes,
    /// Sequence number of the first frame in the batch
    pub first_sequence: u64,
    /// Number of frames joined
    pub frame_count: usize,
}

impl AudioBatch {
    /// Join frames in order. Returns `None` for an empty slice.
    pub fn concat(frames: &[AudioFrame]) -> Option<Self> {
        let first = frames.first()?;
        if frames.len() == 1 {
            return Some(Self {
                data: first.data.clone(),
                first_sequence: first.sequence,
                frame_count: 1,
            });
        }

        let total = frames.iter().map(|f| f.data.len()).sum();
        let mut data = BytesMut::with_capacity(total);
        for frame in frames {
            data.extend_from_slice(&frame.data);
        }

        Some(Self {
            data: data.freeze(),
            first_sequence: first.sequence,
            frame_count: frames.len(),
        })
    }
}

/// Decoded response audio waiting to be played
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaybackFragment(Bytes);

impl PlaybackFragment {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    pub fn data(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Result of a bounded wait on the playback queue
#[derive(Debug, PartialEq, Eq)]
pub enum Dequeued {
    Fragment(PlaybackFragment),
    /// Producer is done, nothing more will arrive
    Sentinel,
    /// Nothing arrived within the wait
    TimedOut,
}

enum Slot {
    Fragment(PlaybackFragment),
    Sentinel,
}

struct QueueInner {
    slots: VecDeque<Slot>,
    closed: bool,
}

/// FIFO of playback fragments with an atomic clear
///
/// Every operation runs under one lock, so `clear` is a cut: a fragment
/// pushed before `clear` returns is either already popped or gone, and a
/// fragment pushed after it is delivered normally.
pub struct PlaybackQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                slots: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Enqueue a fragment. Returns false once the queue is closed.
    pub fn push(&self, fragment: PlaybackFragment) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        inner.slots.push_back(Slot::Fragment(fragment));
        drop(inner);
        self.available.notify_one();
        true
    }

    /// Mark the queue closed and enqueue the sentinel behind pending
    /// fragments. Returns true for the call that actually closed it.
    pub fn close(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        inner.closed = true;
        inner.slots.push_back(Slot::Sentinel);
        drop(inner);
        self.available.notify_all();
        true
    }

    /// Drop every queued fragment, keeping a queued sentinel.
    /// Returns the number of fragments dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.slots.len();
        inner.slots.retain(|slot| matches!(slot, Slot::Sentinel));
        before - inner.slots.len()
    }

    /// Pop the next item, waiting at most `timeout`
    pub fn pop_timeout(&self, timeout: Duration) -> Dequeued {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();

        loop {
            match inner.slots.pop_front() {
                Some(Slot::Fragment(fragment)) => return Dequeued::Fragment(fragment),
                // The sentinel stays observable for any later pop
                Some(Slot::Sentinel) => return Dequeued::Sentinel,
                None if inner.closed => return Dequeued::Sentinel,
                None => {}
            }

            if self.available.wait_until(&mut inner, deadline).timed_out() {
                return match inner.slots.pop_front() {
                    Some(Slot::Fragment(fragment)) => Dequeued::Fragment(fragment),
                    Some(Slot::Sentinel) => Dequeued::Sentinel,
                    None if inner.closed => Dequeued::Sentinel,
                    None => Dequeued::TimedOut,
                };
            }
        }
    }

    /// Pop without waiting
    pub fn try_pop(&self) -> Dequeued {
        self.pop_timeout(Duration::ZERO)
    }

    /// Number of queued fragments (the sentinel is not counted)
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Fragment(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl Default for PlaybackQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe handle to a playback queue
pub type SharedPlaybackQueue = Arc<PlaybackQueue>;

/// Create a new shared playback queue
pub fn create_playback_queue() -> SharedPlaybackQueue {
    Arc::new(PlaybackQueue::new())
}
