//! Audio subsystem module

pub mod buffer;
pub mod pipeline;
pub mod source;

#[cfg(feature = "device-capture")]
pub mod capture;
#[cfg(feature = "device-capture")]
pub mod device;

pub use buffer::{AudioFrame, SampleAccumulator};
pub use pipeline::{AudioCapturePipeline, CaptureStats};
pub use source::{AudioSource, ToneSource};

#[cfg(feature = "device-capture")]
pub use capture::DeviceSource;
#[cfg(feature = "device-capture")]
pub use device::{get_input_device, list_input_devices, AudioDeviceInfo};
