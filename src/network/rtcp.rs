//! RTCP sender report (RFC 3550 §6.4.1), without reception report blocks

use bytes::{BufMut, Bytes, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

pub const RTCP_SENDER_REPORT: u8 = 200;
pub const SENDER_REPORT_LEN: usize = 28;

/// Seconds between 1900-01-01 (NTP epoch) and 1970-01-01
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_timestamp: u64,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

impl SenderReport {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SENDER_REPORT_LEN);
        buf.put_u8(2 << 6);
        buf.put_u8(RTCP_SENDER_REPORT);
        // Length in 32-bit words minus one
        buf.put_u16((SENDER_REPORT_LEN / 4 - 1) as u16);
        buf.put_u32(self.ssrc);
        buf.put_u64(self.ntp_timestamp);
        buf.put_u32(self.rtp_timestamp);
        buf.put_u32(self.packet_count);
        buf.put_u32(self.octet_count);
        buf.freeze()
    }

    pub fn parse(data: &[u8]) -> Option<SenderReport> {
        if data.len() < SENDER_REPORT_LEN || data[0] >> 6 != 2 || data[1] != RTCP_SENDER_REPORT {
            return None;
        }
        let u32_at = |i: usize| u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        Some(SenderReport {
            ssrc: u32_at(4),
            ntp_timestamp: ((u32_at(8) as u64) << 32) | u32_at(12) as u64,
            rtp_timestamp: u32_at(16),
            packet_count: u32_at(20),
            octet_count: u32_at(24),
        })
    }
}

/// Current wall clock as a 64-bit NTP timestamp (32.32 fixed point)
pub fn ntp_now() -> u64 {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let seconds = now.as_secs() + NTP_UNIX_OFFSET;
    let fraction = ((now.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (seconds << 32) | fraction
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_report_layout() {
        let report = SenderReport {
            ssrc: 0x0102_0304,
            ntp_timestamp: ntp_now(),
            rtp_timestamp: 16_000,
            packet_count: 50,
            octet_count: 4_000,
        };
        let bytes = report.to_bytes();

        assert_eq!(bytes.len(), SENDER_REPORT_LEN);
        assert_eq!(bytes[0], 0x80);
        assert_eq!(bytes[1], 200);
        assert_eq!(&bytes[2..4], &[0, 6]);
        assert_eq!(SenderReport::parse(&bytes), Some(report));
    }

    #[test]
    fn test_ntp_epoch() {
        // Any time after 2020 is past 3.79e9 NTP seconds
        assert!(ntp_now() >> 32 > 3_786_825_600);
    }
}
