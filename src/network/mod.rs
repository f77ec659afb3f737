//! Network subsystem: RTP framing and UDP transport

pub mod jpeg;
pub mod packetizer;
pub mod payload;
pub mod rtcp;
pub mod rtp;
pub mod udp;

pub use jpeg::JpegPayload;
pub use packetizer::{Destination, Packetizer, PacketizerStats};
pub use payload::{Fragment, OpusPayload, PayloadFormat};
pub use rtp::RtpHeader;
pub use udp::{create_listener, create_socket};
