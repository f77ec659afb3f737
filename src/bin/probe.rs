//! Stream Probe
//!
//! Joins a streamer over its presence port, receives the RTP audio stream,
//! decodes it and prints per-second statistics.
//!
//! Usage: `probe [server-addr] [rtp-port]`

use anyhow::{Context, Result};
use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_media_streamer::{
    codec::OpusDecoder,
    constants::*,
    network::{jpeg::JPEG_PAYLOAD_TYPE, payload::OPUS_PAYLOAD_TYPE, RtpHeader},
};

#[derive(Default)]
struct Window {
    packets: u64,
    bytes: u64,
    lost: u64,
    decoded: u64,
    video: u64,
}

fn receive(server: TcpStream, socket: UdpSocket, running: Arc<AtomicBool>) -> Result<()> {
    let mut decoder = OpusDecoder::new(DEFAULT_SAMPLE_RATE, DEFAULT_CHANNELS)?;
    let mut presence = server;
    presence.set_nonblocking(true)?;
    socket.set_read_timeout(Some(Duration::from_millis(200)))?;

    let mut buf = [0u8; 2048];
    let mut expected: Option<u16> = None;
    let mut window = Window::default();
    let mut window_start = Instant::now();

    while running.load(Ordering::Relaxed) {
        match presence.read(&mut buf) {
            Ok(0) => {
                println!("Server closed the presence channel");
                break;
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(e).context("presence channel failed"),
        }

        match socket.recv(&mut buf) {
            Ok(len) => match RtpHeader::parse(&buf[..len]) {
                Ok((header, payload)) => {
                    window.packets += 1;
                    window.bytes += len as u64;

                    if header.payload_type == OPUS_PAYLOAD_TYPE {
                        if let Some(sequence) = expected {
                            let gap = header.sequence.wrapping_sub(sequence);
                            // Small forward gaps are losses, anything else is reordering
                            if gap > 0 && gap < 100 {
                                window.lost += gap as u64;
                                for _ in 0..gap {
                                    decoder.decode_plc()?;
                                }
                            }
                        }
                        expected = Some(header.sequence.wrapping_add(1));
                        match decoder.decode(payload) {
                            Ok(_) => window.decoded += 1,
                            Err(e) => tracing::warn!("Decode failed: {}", e),
                        }
                    } else if header.payload_type == JPEG_PAYLOAD_TYPE {
                        window.video += 1;
                    }
                }
                Err(e) => tracing::debug!("Ignoring packet: {}", e),
            },
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => return Err(e).context("media socket failed"),
        }

        if window_start.elapsed() >= Duration::from_secs(1) {
            println!(
                "  {} pkts ({:.1} kbps), {} decoded, {} lost, {} video",
                window.packets,
                window.bytes as f64 * 8.0 / 1000.0,
                window.decoded,
                window.lost,
                window.video
            );
            window = Window::default();
            window_start = Instant::now();
        }
    }

    println!(
        "Total: {} frames decoded, {} concealed",
        decoder.frames_decoded(),
        decoder.frames_lost()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let server_addr: SocketAddr = args
        .next()
        .unwrap_or_else(|| format!("127.0.0.1:{}", DEFAULT_SERVER_PORT))
        .parse()
        .context("invalid server address")?;
    let rtp_port: u16 = match args.next() {
        Some(port) => port.parse().context("invalid RTP port")?,
        None => DEFAULT_AUDIO_RTP_PORT,
    };

    let socket = UdpSocket::bind(("0.0.0.0", rtp_port)).with_context(|| format!("binding RTP port {}", rtp_port))?;
    let server = TcpStream::connect(server_addr).with_context(|| format!("connecting to {}", server_addr))?;
    tracing::info!("Joined {} receiving RTP on port {}", server_addr, rtp_port);

    let running = Arc::new(AtomicBool::new(true));
    let mut worker = {
        let running = running.clone();
        tokio::task::spawn_blocking(move || receive(server, socket, running))
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Stopping probe");
            running.store(false, Ordering::SeqCst);
            (&mut worker).await??;
        }
        result = &mut worker => result??,
    }

    Ok(())
}
