//! 16 kHz / 20 ms Opus over loopback: first packet, mute, unmute

use std::net::UdpSocket;
use std::time::{Duration, Instant};

use lan_media_streamer::audio::ToneSource;
use lan_media_streamer::config::AudioQuality;
use lan_media_streamer::network::RtpHeader;
use lan_media_streamer::stream::{AudioStream, MediaStream};

const FRAME: Duration = Duration::from_millis(20);

fn receiver() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(FRAME)).unwrap();
    socket
}

/// Packets that arrive within `window`
fn count_packets(socket: &UdpSocket, window: Duration) -> usize {
    let deadline = Instant::now() + window;
    let mut buf = [0u8; 1500];
    let mut count = 0;
    while Instant::now() < deadline {
        if socket.recv(&mut buf).is_ok() {
            count += 1;
        }
    }
    count
}

#[test]
fn mute_stops_packets_without_stopping_capture() {
    let socket = receiver();
    let port = socket.local_addr().unwrap().port();

    let quality = AudioQuality::new(16_000, 20.0, 1, 32_000).unwrap();
    let mut stream = AudioStream::new(Box::new(ToneSource::new(440.0)), quality, port, port + 1)
        .with_bind_address("127.0.0.1:0".parse().unwrap());
    stream.set_destination("127.0.0.1".parse().unwrap(), port, port + 1);
    stream.configure().unwrap();

    let started = Instant::now();
    stream.start().unwrap();

    // First packet within one frame interval of capture start, plus scheduling slack
    socket.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
    let mut buf = [0u8; 1500];
    let len = socket.recv(&mut buf).unwrap();
    assert!(started.elapsed() < Duration::from_millis(50) + Duration::from_millis(200));
    let (header, payload) = RtpHeader::parse(&buf[..len]).unwrap();
    assert_eq!(header.payload_type, 111);
    assert!(!payload.is_empty());
    socket.set_read_timeout(Some(FRAME)).unwrap();

    stream.mute();
    assert!(stream.is_muted());
    // Anything already handed to the socket before the mute
    count_packets(&socket, FRAME * 2);
    let encoded_before = stream.capture_stats().frames_encoded;

    assert_eq!(count_packets(&socket, FRAME * 5), 0);
    assert!(stream.is_streaming());
    assert!(stream.capture_stats().frames_encoded > encoded_before);
    assert!(stream.packetizer_stats().frames_suppressed > 0);

    stream.unmute();
    assert!(count_packets(&socket, FRAME * 10) > 0);

    stream.release();
    assert!(!stream.is_streaming());
}
