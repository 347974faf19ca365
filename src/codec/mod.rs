//! PCM16 codec helpers
//!
//! The wire format is fixed: mono 16-bit little-endian PCM carried as
//! base64 inside JSON envelopes.

pub mod encoder;
pub mod decoder;

pub use encoder::{encode_payload, write_pcm16};
pub use decoder::{decode_payload, decode_pcm16, Pcm16Decoder};
