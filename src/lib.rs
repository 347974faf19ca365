//! # Voice Duplex
//!
//! Full-duplex voice chat against a realtime speech API: the microphone is
//! streamed up while spoken responses stream down, and playback is cut the
//! moment the remote side hears the user talk again.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               CLIENT                                     │
//! │  ┌────────────┐   driver     ┌──────────────┐                            │
//! │  │ Microphone │──callback──▶ │CaptureBuffer │  (crossbeam, unbounded)    │
//! │  └────────────┘              └──────┬───────┘                            │
//! │                                     │ frames(): block, drain, batch      │
//! │                                     ▼                                    │
//! │                              ┌──────────────┐                            │
//! │                              │Capture Thread│  base64 + append envelope  │
//! │                              └──────┬───────┘                            │
//! │                                     ▼                                    │
//! │  ┌───────────────────────────────────────────────────────────────────┐   │
//! │  │         TransportChannel (network::websocket) - one socket         │   │
//! │  └───────────────────────────────────────────────────────────────────┘   │
//! │                                     │                                    │
//! │                              ┌──────▼───────┐  speech_started            │
//! │                              │Receive Thread│────────────┐               │
//! │                              └──────┬───────┘            │ interrupt()   │
//! │                                     │ audio.delta        ▼               │
//! │                              ┌──────▼───────┐    ┌──────────────┐        │
//! │                              │PlaybackQueue │◀───│ atomic clear │        │
//! │                              └──────┬───────┘    └──────────────┘        │
//! │                                     ▼                                    │
//! │  ┌────────────┐              ┌──────────────┐                            │
//! │  │  Speaker   │◀──write──────│PlaybackThread│                            │
//! │  └────────────┘              └──────────────┘                            │
//! └──────────────────────────────────────────────────────────────────────────┘
//!                                       ▲ │
//!                                       │ ▼  WebSocket (JSON envelopes)
//!                               Realtime speech API
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod prompt;
pub mod protocol;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Capture sample rate (speech-grade)
    pub const DEFAULT_CAPTURE_SAMPLE_RATE: u32 = 16000;

    /// Rate of the PCM16 audio the realtime API sends back, and the rate it
    /// assumes for PCM16 input unless told otherwise
    pub const REMOTE_PCM16_SAMPLE_RATE: u32 = 24000;

    /// Playback decode and output device rate
    pub const DEFAULT_PLAYBACK_SAMPLE_RATE: u32 = REMOTE_PCM16_SAMPLE_RATE;

    /// Captured frame duration in milliseconds
    pub const DEFAULT_FRAME_DURATION_MS: u32 = 100;

    /// Bounded wait for queue polling
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

    /// Upper bound for the polling wait
    pub const MAX_POLL_INTERVAL_MS: u64 = 10_000;

    /// Audio kept buffered ahead of the speaker
    pub const DEFAULT_OUTPUT_LATENCY_MS: u32 = 50;

    /// Upper bound for the speaker buffer
    pub const MAX_OUTPUT_LATENCY_MS: u32 = 5_000;

    /// Bytes per PCM16 sample
    pub const PCM16_SAMPLE_BYTES: usize = 2;

    pub const DEFAULT_REALTIME_URL: &str =
        "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview-2024-10-01";

    pub const DEFAULT_VOICE: &str = "alloy";

    pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";
}
