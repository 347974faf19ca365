//! PCM16 encoder
//!
//! Converts captured samples to 16-bit little-endian PCM and wraps batches
//! as base64 payloads for `input_audio_buffer.append`.

use base64::Engine;
use bytes::{BufMut, BytesMut};

/// Convert one f32 sample in [-1.0, 1.0] to i16
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Append f32 samples to `out` as PCM16 LE
pub fn write_pcm16(samples: &[f32], out: &mut BytesMut) {
    out.reserve(samples.len() * 2);
    for &sample in samples {
        out.put_i16_le(f32_to_i16(sample));
    }
}

/// Base64 payload for one `input_audio_buffer.append`
pub fn encode_payload(pcm: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(pcm)
}
