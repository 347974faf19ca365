//! Sample rate conversion for devices that do not offer the wire rate

use rubato::{FftFixedIn, Resampler};

use crate::error::DeviceError;

/// Input frames per resampler chunk
const CHUNK_FRAMES: usize = 1024;

/// Streaming mono resampler
///
/// Input accumulates until a full chunk is available, so output lags input
/// by at most one chunk.
pub struct StreamResampler {
    resampler: FftFixedIn<f32>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self, DeviceError> {
        let resampler =
            FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, CHUNK_FRAMES, 2, 1)
                .map_err(|e| {
                    DeviceError::UnsupportedFormat(format!(
                        "cannot resample {} Hz to {} Hz: {}",
                        from_rate, to_rate, e
                    ))
                })?;

        Ok(Self {
            resampler,
            pending: Vec::with_capacity(CHUNK_FRAMES * 2),
        })
    }

    /// A resampler from `from_rate` to `to_rate`, or `None` when they match
    pub fn between(from_rate: u32, to_rate: u32) -> Result<Option<Self>, DeviceError> {
        if from_rate == to_rate {
            return Ok(None);
        }
        Self::new(from_rate, to_rate).map(Some)
    }

    /// Feed samples, appending whatever complete chunks produce to `out`
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        self.pending.extend_from_slice(input);

        let mut offset = 0;
        loop {
            let needed = self.resampler.input_frames_next();
            if self.pending.len() - offset < needed {
                break;
            }

            let chunk = &self.pending[offset..offset + needed];
            match self.resampler.process(&[chunk], None) {
                Ok(resampled) => {
                    if let Some(channel) = resampled.into_iter().next() {
                        out.extend(channel);
                    }
                }
                Err(e) => tracing::warn!("Resampling failed: {}", e),
            }
            offset += needed;
        }

        self.pending.drain(..offset);
    }

    /// Push out buffered input, padded with silence
    pub fn flush(&mut self, out: &mut Vec<f32>) {
        if self.pending.is_empty() {
            return;
        }
        let needed = self.resampler.input_frames_next();
        let padding = needed.saturating_sub(self.pending.len());
        self.process(&vec![0.0; padding], out);
        self.pending.clear();
    }

    /// Input samples waiting for a complete chunk
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
