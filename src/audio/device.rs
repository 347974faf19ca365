//! Audio device enumeration and stream threads

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::bounded;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::DeviceError;

/// Device description for `--list-devices`
#[derive(Debug, Clone, Serialize)]
pub struct AudioDeviceInfo {
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// List all available audio devices
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    let default_input_name = host
        .default_input_device()
        .and_then(|d| d.name().ok());
    let default_output_name = host
        .default_output_device()
        .and_then(|d| d.name().ok());

    if let Ok(input_devices) = host.input_devices() {
        for device in input_devices {
            if let Ok(name) = device.name() {
                let is_default = default_input_name.as_ref() == Some(&name);
                let (sample_rates, channels) = get_device_capabilities(&device, true);

                devices.push(AudioDeviceInfo {
                    id: format!("input:{}", name),
                    name,
                    is_input: true,
                    is_output: false,
                    is_default,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    if let Ok(output_devices) = host.output_devices() {
        for device in output_devices {
            if let Ok(name) = device.name() {
                let is_default = default_output_name.as_ref() == Some(&name);
                let (sample_rates, channels) = get_device_capabilities(&device, false);

                if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                    existing.is_output = true;
                    existing.is_default |= is_default;
                } else {
                    devices.push(AudioDeviceInfo {
                        id: format!("output:{}", name),
                        name,
                        is_input: false,
                        is_output: true,
                        is_default,
                        sample_rates,
                        channels,
                    });
                }
            }
        }
    }

    devices
}

/// Speech-relevant rates a device supports, and its channel counts
fn get_device_capabilities(device: &cpal::Device, is_input: bool) -> (Vec<u32>, Vec<u16>) {
    let configs: Vec<cpal::SupportedStreamConfigRange> = if is_input {
        device
            .supported_input_configs()
            .map(|iter| iter.collect())
            .unwrap_or_default()
    } else {
        device
            .supported_output_configs()
            .map(|iter| iter.collect())
            .unwrap_or_default()
    };

    let mut sample_rates = Vec::new();
    let mut channels = Vec::new();
    for config in &configs {
        for rate_val in [16000u32, 24000, 44100, 48000] {
            let rate = cpal::SampleRate(rate_val);
            if rate >= config.min_sample_rate()
                && rate <= config.max_sample_rate()
                && !sample_rates.contains(&rate_val)
            {
                sample_rates.push(rate_val);
            }
        }
        if !channels.contains(&config.channels()) {
            channels.push(config.channels());
        }
    }

    sample_rates.sort_unstable();
    channels.sort_unstable();
    (sample_rates, channels)
}

/// Find an input device by name, or the default one
pub fn input_device(name: Option<&str>) -> Result<cpal::Device, DeviceError> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .input_devices()
            .map_err(|e| DeviceError::CpalError(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| DeviceError::DeviceNotFound(format!("input:{}", name))),
        None => host
            .default_input_device()
            .ok_or_else(|| DeviceError::DeviceNotFound("No default input device".to_string())),
    }
}

/// Find an output device by name, or the default one
pub fn output_device(name: Option<&str>) -> Result<cpal::Device, DeviceError> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .output_devices()
            .map_err(|e| DeviceError::CpalError(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| DeviceError::DeviceNotFound(format!("output:{}", name))),
        None => host
            .default_output_device()
            .ok_or_else(|| DeviceError::DeviceNotFound("No default output device".to_string())),
    }
}

/// Pick a stream config for `sample_rate`, preferring f32 and fewer channels.
///
/// When no range offers `sample_rate`, the closest rate a range does offer is
/// chosen and the caller resamples.
pub fn pick_config(
    configs: impl IntoIterator<Item = cpal::SupportedStreamConfigRange>,
    sample_rate: u32,
) -> Result<cpal::StreamConfig, DeviceError> {
    let nearest = |c: &cpal::SupportedStreamConfigRange| {
        sample_rate.clamp(c.min_sample_rate().0, c.max_sample_rate().0)
    };

    configs
        .into_iter()
        .min_by_key(|c| {
            (
                c.sample_format() != cpal::SampleFormat::F32,
                nearest(c).abs_diff(sample_rate),
                c.channels(),
            )
        })
        .map(|c| {
            let rate = cpal::SampleRate(nearest(&c));
            c.with_sample_rate(rate).config()
        })
        .ok_or_else(|| DeviceError::UnsupportedFormat("device offers no stream configs".to_string()))
}

/// Whether a stream error means the device is gone.
///
/// Backend-specific reports (xruns and the like) are transient.
pub fn is_fatal_stream_error(err: &cpal::StreamError) -> bool {
    matches!(err, cpal::StreamError::DeviceNotAvailable)
}

/// Dedicated thread that owns a cpal stream
///
/// cpal streams are not `Send`, so the stream is built, played and dropped
/// on its own thread. Build failures are reported back to the caller of
/// [`StreamThread::spawn`].
pub struct StreamThread {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StreamThread {
    pub fn spawn<F>(name: &str, build: F) -> Result<Self, DeviceError>
    where
        F: FnOnce() -> Result<cpal::Stream, DeviceError> + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();
        let (ready_tx, ready_rx) = bounded::<Result<(), DeviceError>>(1);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(DeviceError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
                // Stream is dropped here, stopping the device
            })
            .map_err(|e| DeviceError::StreamError(e.to_string()))?;

        let mut stream_thread = Self {
            running,
            handle: Some(handle),
        };

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(stream_thread),
            Ok(Err(e)) => {
                stream_thread.stop();
                Err(e)
            }
            Err(_) => {
                stream_thread.stop();
                Err(DeviceError::StreamError("stream thread exited".to_string()))
            }
        }
    }

    /// Stop the stream and join the thread
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop();
    }
}
