//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod playback;
pub mod resample;

pub use buffer::{AudioBatch, AudioFrame, PlaybackFragment, PlaybackQueue};
pub use capture::{FrameSource, InputDevice, Microphone, StreamState};
pub use device::{list_devices, AudioDeviceInfo};
pub use playback::{OutputDevice, PlaybackHandle, PlaybackSink, PlaybackStats, SampleBuffer, Speaker};
pub use resample::StreamResampler;
