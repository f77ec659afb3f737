//! Video encoding from a drawn surface

pub mod codec;
pub mod encoder;

pub use codec::{SoftwareJpegCodec, VideoCodec};
pub use encoder::VideoEncoder;
