//! Media streams: one encoder paired with one packetizer

pub mod audio;
pub mod video;

use std::net::IpAddr;

use crate::error::StreamError;
use crate::network::Destination;

pub use audio::AudioStream;
pub use video::VideoStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// An encoder feeding a packetizer, as bound to a session
///
/// `start` returns once the encoder produces output; `stop` halts the
/// packetizer before the encoder so no half-torn-down encoder is drained.
pub trait MediaStream: Send {
    fn kind(&self) -> MediaKind;

    /// Allocate encoder resources and fix the session description
    fn configure(&mut self) -> Result<(), StreamError>;

    fn start(&mut self) -> Result<(), StreamError>;

    fn stop(&mut self);

    /// Free every resource; safe in any state
    fn release(&mut self);

    fn is_streaming(&self) -> bool;

    /// Media block of the session description
    fn session_description(&self) -> Result<String, StreamError>;

    /// Negotiated RTP port on the receiving side
    fn rtp_port(&self) -> u16;

    /// Negotiated RTCP port on the receiving side
    fn rtcp_port(&self) -> u16;

    /// Replace the primary destination
    fn set_destination(&self, ip: IpAddr, rtp_port: u16, rtcp_port: u16);

    fn add_destination(&self, destination: Destination);

    fn remove_destination(&self, destination: &Destination) -> bool;

    fn mute(&self);

    fn unmute(&self);

    fn is_muted(&self) -> bool;
}

/// Destination of a client at `ip` on the stream's negotiated ports
pub fn client_destination(stream: &dyn MediaStream, ip: IpAddr) -> Destination {
    Destination::new(ip, stream.rtp_port(), stream.rtcp_port())
}
