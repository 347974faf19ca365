//! PCM16 decoder
//!
//! Turns `response.audio.delta` payloads back into bytes, and bytes into
//! samples for the output device.

use base64::Engine;
use bytes::Bytes;

use crate::error::DecodeError;

/// Decode a base64 payload into raw bytes
pub fn decode_payload(payload: &str) -> Result<Bytes, DecodeError> {
    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map(Bytes::from)
        .map_err(|e| DecodeError::Base64(e.to_string()))
}

/// Interpret bytes as mono PCM16 LE samples
pub fn decode_pcm16(data: &[u8]) -> Result<Vec<i16>, DecodeError> {
    if data.len() % 2 != 0 {
        return Err(DecodeError::OddLength(data.len()));
    }

    Ok(data
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Convert one i16 sample to f32 in [-1.0, 1.0)
#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

/// PCM16 decoder that keeps track of how much audio it produced
pub struct Pcm16Decoder {
    sample_rate: u32,
    samples_produced: u64,
}

impl Pcm16Decoder {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            samples_produced: 0,
        }
    }

    /// Decode one fragment to samples
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>, DecodeError> {
        let samples = decode_pcm16(data)?;
        self.samples_produced += samples.len() as u64;
        Ok(samples)
    }

    /// Duration of decoded audio so far, in milliseconds
    pub fn decoded_ms(&self) -> u64 {
        self.samples_produced * 1000 / u64::from(self.sample_rate.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_payload() {
        assert_eq!(&decode_payload("AAEC").unwrap()[..], &[0x00, 0x01, 0x02]);
        assert!(matches!(
            decode_payload("not base64!"),
            Err(DecodeError::Base64(_))
        ));
    }

    #[test]
    fn test_decode_pcm16() {
        let samples = decode_pcm16(&[0xff, 0x7f, 0x00, 0x80, 0x01, 0x00]).unwrap();
        assert_eq!(samples, vec![32767, -32768, 1]);
        assert_eq!(decode_pcm16(&[0x01]), Err(DecodeError::OddLength(1)));
    }

    #[test]
    fn test_decoded_duration() {
        let mut decoder = Pcm16Decoder::new(24000);
        decoder.decode(&[0u8; 48000]).unwrap();
        assert!(decoder.decode(&[0u8; 3]).is_err());
        decoder.decode(&[0u8; 4800]).unwrap();
        assert_eq!(decoder.decoded_ms(), 1100);
    }

    #[test]
    fn test_i16_to_f32_range() {
        assert_eq!(i16_to_f32(0), 0.0);
        assert_eq!(i16_to_f32(i16::MIN), -1.0);
        assert!(i16_to_f32(i16::MAX) < 1.0);
    }
}
