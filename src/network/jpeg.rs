//! RTP payload format for JPEG-compressed video (RFC 2435)
//!
//! Baseline JFIF pictures are reduced to their entropy-coded scan; the
//! receiver rebuilds the headers from the 8-byte JPEG header and the
//! in-band quantization tables (Q = 255) carried on the first fragment.

use bytes::{BufMut, BytesMut};

use crate::error::NetworkError;
use crate::media::EncodedFrame;
use crate::network::payload::{Fragment, PayloadFormat};

/// Static payload type assigned to JPEG
pub const JPEG_PAYLOAD_TYPE: u8 = 26;
pub const JPEG_CLOCK_RATE: u32 = 90_000;

const JPEG_HEADER_LEN: usize = 8;
const QUANT_HEADER_LEN: usize = 4;
/// Q values of 128 and above mean the tables travel in-band
const DYNAMIC_Q: u8 = 255;
/// Width and height are sent in 8-pixel blocks in one byte
pub const MAX_DIMENSION: u16 = 2040;

const SOI: u8 = 0xd8;
const EOI: u8 = 0xd9;
const SOF0: u8 = 0xc0;
const DHT: u8 = 0xc4;
const DQT: u8 = 0xdb;
const DRI: u8 = 0xdd;
const SOS: u8 = 0xda;

/// What RFC 2435 needs out of a JFIF picture
#[derive(Debug, PartialEq)]
pub struct JpegFrame<'a> {
    pub width: u16,
    pub height: u16,
    /// 0 for 4:2:2, 1 for 4:2:0 luma subsampling
    pub kind: u8,
    /// Concatenated 8-bit tables in zig-zag order
    pub tables: Vec<u8>,
    pub scan: &'a [u8],
}

impl<'a> JpegFrame<'a> {
    pub fn parse(data: &'a [u8]) -> Result<JpegFrame<'a>, NetworkError> {
        if data.len() < 4 || data[0] != 0xff || data[1] != SOI {
            return Err(NetworkError::InvalidPacket);
        }

        let mut tables = Vec::new();
        let mut size = None;
        let mut pos = 2;

        loop {
            if pos + 4 > data.len() || data[pos] != 0xff {
                return Err(NetworkError::InvalidPacket);
            }
            let marker = data[pos + 1];
            if marker == 0xff {
                pos += 1;
                continue;
            }
            let length = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
            if length < 2 || pos + 2 + length > data.len() {
                return Err(NetworkError::InvalidPacket);
            }
            let segment = &data[pos + 4..pos + 2 + length];

            match marker {
                DQT => parse_tables(segment, &mut tables)?,
                SOF0 => size = Some(parse_frame_header(segment)?),
                DRI if segment.len() >= 2 && segment[..2] != [0, 0] => {
                    return Err(NetworkError::UnsupportedPayload("restart markers".to_string()));
                }
                0xc1..=0xcf if marker != DHT && marker != 0xc8 && marker != 0xcc => {
                    return Err(NetworkError::UnsupportedPayload("non-baseline JPEG".to_string()));
                }
                SOS => {
                    let start = pos + 2 + length;
                    let end = if data.ends_with(&[0xff, EOI]) {
                        data.len() - 2
                    } else {
                        data.len()
                    };
                    let (width, height, kind) = size.ok_or(NetworkError::InvalidPacket)?;
                    if tables.is_empty() || start > end {
                        return Err(NetworkError::InvalidPacket);
                    }
                    return Ok(JpegFrame {
                        width,
                        height,
                        kind,
                        tables,
                        scan: &data[start..end],
                    });
                }
                _ => {}
            }
            pos += 2 + length;
        }
    }
}

fn parse_tables(segment: &[u8], tables: &mut Vec<u8>) -> Result<(), NetworkError> {
    let mut i = 0;
    while i < segment.len() {
        if segment[i] >> 4 != 0 {
            return Err(NetworkError::UnsupportedPayload("16-bit quantization tables".to_string()));
        }
        let table = segment.get(i + 1..i + 65).ok_or(NetworkError::InvalidPacket)?;
        tables.extend_from_slice(table);
        i += 65;
    }
    Ok(())
}

fn parse_frame_header(segment: &[u8]) -> Result<(u16, u16, u8), NetworkError> {
    if segment.len() < 6 {
        return Err(NetworkError::InvalidPacket);
    }
    let height = u16::from_be_bytes([segment[1], segment[2]]);
    let width = u16::from_be_bytes([segment[3], segment[4]]);
    let components = segment[5] as usize;
    if components != 3 || segment.len() < 6 + components * 3 {
        return Err(NetworkError::UnsupportedPayload(format!("{} colour components", components)));
    }
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(NetworkError::UnsupportedPayload(format!("{}x{} picture", width, height)));
    }

    let sampling = |c: usize| segment[6 + c * 3 + 1];
    if sampling(1) != 0x11 || sampling(2) != 0x11 {
        return Err(NetworkError::UnsupportedPayload("chroma subsampling".to_string()));
    }
    let kind = match sampling(0) {
        0x21 => 0,
        0x22 => 1,
        other => {
            return Err(NetworkError::UnsupportedPayload(format!(
                "luma sampling {}x{}",
                other >> 4,
                other & 0x0f
            )))
        }
    };
    Ok((width, height, kind))
}

/// JPEG over RTP
#[derive(Debug, Clone, Default)]
pub struct JpegPayload;

impl JpegPayload {
    pub fn new() -> Self {
        Self
    }
}

impl PayloadFormat for JpegPayload {
    fn payload_type(&self) -> u8 {
        JPEG_PAYLOAD_TYPE
    }

    fn clock_rate(&self) -> u32 {
        JPEG_CLOCK_RATE
    }

    fn encoding_name(&self) -> &'static str {
        "JPEG"
    }

    fn fragment(&mut self, frame: &EncodedFrame, max_payload: usize) -> Result<Vec<Fragment>, NetworkError> {
        let jpeg = JpegFrame::parse(&frame.data)?;
        let first_overhead = JPEG_HEADER_LEN + QUANT_HEADER_LEN + jpeg.tables.len();
        if max_payload <= first_overhead {
            return Err(NetworkError::PacketTooLarge(first_overhead));
        }

        let mut fragments = Vec::new();
        let mut offset = 0;
        while offset < jpeg.scan.len() || fragments.is_empty() {
            let first = offset == 0;
            let room = if first {
                max_payload - first_overhead
            } else {
                max_payload - JPEG_HEADER_LEN
            };
            let end = (offset + room).min(jpeg.scan.len());

            let mut payload = BytesMut::with_capacity(max_payload);
            payload.put_u8(0); // type-specific
            payload.put_uint(offset as u64, 3);
            payload.put_u8(jpeg.kind);
            payload.put_u8(DYNAMIC_Q);
            payload.put_u8(jpeg.width.div_ceil(8) as u8);
            payload.put_u8(jpeg.height.div_ceil(8) as u8);
            if first {
                payload.put_u8(0); // MBZ
                payload.put_u8(0); // 8-bit precision for every table
                payload.put_u16(jpeg.tables.len() as u16);
                payload.put_slice(&jpeg.tables);
            }
            payload.put_slice(&jpeg.scan[offset..end]);

            offset = end;
            fragments.push(Fragment {
                payload: payload.freeze(),
                marker: offset >= jpeg.scan.len(),
            });
        }
        Ok(fragments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use jpeg_encoder::{ColorType, Encoder, SamplingFactor};

    fn encode_picture(width: u16, height: u16) -> Vec<u8> {
        let pixels: Vec<u8> = (0..width as usize * height as usize)
            .flat_map(|i| [(i % 251) as u8, (i % 13) as u8 * 19, 128])
            .collect();
        let mut out = Vec::new();
        let mut encoder = Encoder::new(&mut out, 75);
        encoder.set_sampling_factor(SamplingFactor::F_2_2);
        encoder.encode(&pixels, width, height, ColorType::Rgb).unwrap();
        out
    }

    #[test]
    fn test_parse_encoder_output() {
        let data = encode_picture(64, 48);
        let jpeg = JpegFrame::parse(&data).unwrap();

        assert_eq!((jpeg.width, jpeg.height), (64, 48));
        assert_eq!(jpeg.kind, 1);
        assert_eq!(jpeg.tables.len(), 128);
        assert!(!jpeg.scan.is_empty());
        assert!(!jpeg.scan.ends_with(&[0xff, EOI]));
    }

    #[test]
    fn test_fragmentation() {
        let data = encode_picture(320, 240);
        let scan_len = JpegFrame::parse(&data).unwrap().scan.len();
        let frame = EncodedFrame::new(Bytes::from(data), 0, 0);

        let fragments = JpegPayload::new().fragment(&frame, 300).unwrap();
        assert!(fragments.len() > 1);
        assert!(fragments.iter().all(|f| f.payload.len() <= 300));
        assert!(fragments.last().unwrap().marker);
        assert!(fragments[..fragments.len() - 1].iter().all(|f| !f.marker));

        // First fragment: main header then the quantization table header
        let first = &fragments[0].payload;
        assert_eq!(&first[1..4], &[0, 0, 0]);
        assert_eq!(first[5], 255);
        assert_eq!(first[6], 40);
        assert_eq!(first[7], 30);
        assert_eq!(u16::from_be_bytes([first[10], first[11]]), 128);

        // Offsets are contiguous over the scan
        let mut expected = 0;
        for (i, fragment) in fragments.iter().enumerate() {
            let p = &fragment.payload;
            let offset = u32::from_be_bytes([0, p[1], p[2], p[3]]) as usize;
            assert_eq!(offset, expected);
            let header = if i == 0 { 8 + 4 + 128 } else { 8 };
            expected += p.len() - header;
        }
        assert_eq!(expected, scan_len);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(JpegFrame::parse(b"not a jpeg").is_err());
        let frame = EncodedFrame::new(Bytes::from_static(&[0xff, 0xd8, 0xff, 0xd9]), 0, 0);
        assert!(JpegPayload::new().fragment(&frame, 1388).is_err());
    }
}
