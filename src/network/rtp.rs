//! RTP fixed header (RFC 3550 §5.1)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           synchronization source (SSRC) identifier            |
//! +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
//! ```

use bytes::{BufMut, BytesMut};

use crate::error::NetworkError;

pub const RTP_VERSION: u8 = 2;
pub const RTP_HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    /// Append the 12-byte header to `buf`
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(RTP_VERSION << 6);
        buf.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7f));
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
    }

    /// Parse a packet into its header and payload
    ///
    /// CSRC entries and header extensions are skipped, padding is removed.
    pub fn parse(packet: &[u8]) -> Result<(RtpHeader, &[u8]), NetworkError> {
        if packet.len() < RTP_HEADER_LEN || packet[0] >> 6 != RTP_VERSION {
            return Err(NetworkError::InvalidPacket);
        }

        let padding = packet[0] & 0x20 != 0;
        let extension = packet[0] & 0x10 != 0;
        let csrc_count = (packet[0] & 0x0f) as usize;

        let header = RtpHeader {
            marker: packet[1] & 0x80 != 0,
            payload_type: packet[1] & 0x7f,
            sequence: u16::from_be_bytes([packet[2], packet[3]]),
            timestamp: u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
            ssrc: u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]),
        };

        let mut start = RTP_HEADER_LEN + csrc_count * 4;
        if extension {
            if packet.len() < start + 4 {
                return Err(NetworkError::InvalidPacket);
            }
            let words = u16::from_be_bytes([packet[start + 2], packet[start + 3]]) as usize;
            start += 4 + words * 4;
        }

        let mut end = packet.len();
        if padding {
            let pad = packet[end - 1] as usize;
            if pad == 0 || pad > end {
                return Err(NetworkError::InvalidPacket);
            }
            end -= pad;
        }
        if start > end {
            return Err(NetworkError::InvalidPacket);
        }

        Ok((header, &packet[start..end]))
    }
}
