//! Encoded unit → RTP/UDP sender
//!
//! The `rtp-send` thread pops encoded units from the input [`FrameQueue`],
//! frames them with the configured [`PayloadFormat`] and sends every packet
//! to each destination. Muting keeps draining the queue so the encoder never
//! stalls, it only suppresses the send.

use bytes::BytesMut;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::constants::MAX_PACKET_SIZE;
use crate::error::{ConfigError, NetworkError, StreamError};
use crate::media::EncodedFrame;
use crate::network::payload::PayloadFormat;
use crate::network::rtcp::{ntp_now, SenderReport};
use crate::network::rtp::{RtpHeader, RTP_HEADER_LEN};
use crate::network::udp::create_socket;
use crate::queue::{FrameQueue, PopError};
use crate::util::join_with_timeout;

/// Sender report period
pub const RTCP_INTERVAL: Duration = Duration::from_secs(5);

const POP_TIMEOUT: Duration = Duration::from_millis(100);
const JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Where one receiver wants media and control packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Destination {
    pub rtp: SocketAddr,
    pub rtcp: SocketAddr,
}

impl Destination {
    pub fn new(ip: IpAddr, rtp_port: u16, rtcp_port: u16) -> Self {
        Self {
            rtp: SocketAddr::new(ip, rtp_port),
            rtcp: SocketAddr::new(ip, rtcp_port),
        }
    }
}

#[derive(Default)]
struct Destinations {
    primary: Option<Destination>,
    /// Per-client entries; the same address may appear once per client
    clients: Vec<Destination>,
}

impl Destinations {
    fn snapshot(&self) -> Vec<Destination> {
        let mut all: Vec<Destination> = self.primary.iter().chain(self.clients.iter()).copied().collect();
        all.sort();
        all.dedup();
        all
    }

    fn is_empty(&self) -> bool {
        self.primary.is_none() && self.clients.is_empty()
    }
}

#[derive(Default)]
struct Counters {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    frames_sent: AtomicU64,
    frames_suppressed: AtomicU64,
    send_errors: AtomicU64,
}

/// Packetizer statistics
#[derive(Debug, Clone, Default)]
pub struct PacketizerStats {
    /// RTP packets delivered, counted once per destination
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub frames_sent: u64,
    /// Units dropped while muted or without a destination
    pub frames_suppressed: u64,
    pub send_errors: u64,
}

/// RTP state that survives a stop/start cycle
struct SendStage {
    format: Box<dyn PayloadFormat>,
    /// Sequence number of the next packet
    sequence: u16,
    /// Random offset added to every media timestamp
    timestamp_offset: u32,
    /// Sender report counters
    packet_count: u32,
    octet_count: u32,
    /// RTP timestamp of the last packet sent, extrapolated in sender reports
    last_timestamp: u32,
    last_sent: Option<Instant>,
}

pub struct Packetizer {
    input: Arc<FrameQueue<EncodedFrame>>,
    /// Payload format and RTP counters while not running
    stage: Option<SendStage>,
    payload_type: u8,
    clock_rate: u32,
    encoding_name: &'static str,
    ssrc: u32,
    /// Local address of the send socket
    pub(crate) bind_address: SocketAddr,
    /// Created on first start and kept across restarts
    socket: Option<Arc<UdpSocket>>,
    /// Shared with the send thread; changes apply to the next packet
    destinations: Arc<Mutex<Destinations>>,
    /// Frames are consumed but not sent while set
    muted: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    rtcp_interval: Duration,
    /// Send thread; joining it hands the stage back
    thread: Option<JoinHandle<SendStage>>,
    counters: Arc<Counters>,
}

impl Packetizer {
    pub fn new(format: Box<dyn PayloadFormat>, input: Arc<FrameQueue<EncodedFrame>>) -> Self {
        let payload_type = format.payload_type();
        let clock_rate = format.clock_rate();
        let encoding_name = format.encoding_name();

        Self {
            input,
            stage: Some(SendStage {
                format,
                sequence: rand::random(),
                timestamp_offset: rand::random(),
                packet_count: 0,
                octet_count: 0,
                last_timestamp: 0,
                last_sent: None,
            }),
            payload_type,
            clock_rate,
            encoding_name,
            ssrc: rand::random(),
            bind_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            socket: None,
            destinations: Arc::new(Mutex::new(Destinations::default())),
            muted: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            rtcp_interval: RTCP_INTERVAL,
            thread: None,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Local address of the sending socket
    pub fn with_bind_address(mut self, bind_address: SocketAddr) -> Self {
        self.bind_address = bind_address;
        self
    }

    pub fn with_rtcp_interval(mut self, interval: Duration) -> Self {
        self.rtcp_interval = interval;
        self
    }

    /// Replace the primary destination
    pub fn set_destination(&self, ip: IpAddr, rtp_port: u16, rtcp_port: u16) {
        self.destinations.lock().primary = Some(Destination::new(ip, rtp_port, rtcp_port));
        tracing::debug!("Primary destination set to {}:{}", ip, rtp_port);
    }

    pub fn add_destination(&self, destination: Destination) {
        self.destinations.lock().clients.push(destination);
        tracing::debug!("Destination {} added", destination.rtp);
    }

    /// Remove one entry for `destination`; returns whether it was present
    pub fn remove_destination(&self, destination: &Destination) -> bool {
        let mut destinations = self.destinations.lock();
        match destinations.clients.iter().position(|d| d == destination) {
            Some(index) => {
                destinations.clients.remove(index);
                tracing::debug!("Destination {} removed", destination.rtp);
                true
            }
            None => false,
        }
    }

    /// Distinct destinations packets are currently sent to
    pub fn destinations(&self) -> Vec<Destination> {
        self.destinations.lock().snapshot()
    }

    pub fn start(&mut self) -> Result<(), StreamError> {
        if self.thread.is_some() {
            return Err(StreamError::AlreadyStarted);
        }
        if self.destinations.lock().is_empty() {
            return Err(ConfigError::MissingDestination.into());
        }
        let mut stage = self.stage.take().ok_or(StreamError::InvalidState("packetizer lost its sender state"))?;

        let socket = match &self.socket {
            Some(socket) => socket.clone(),
            None => match create_socket(self.bind_address) {
                Ok(socket) => {
                    let socket = Arc::new(socket);
                    self.socket = Some(socket.clone());
                    socket
                }
                Err(e) => {
                    self.stage = Some(stage);
                    return Err(e.into());
                }
            },
        };

        self.running.store(true, Ordering::SeqCst);
        let context = SendContext {
            input: self.input.clone(),
            socket,
            destinations: self.destinations.clone(),
            muted: self.muted.clone(),
            running: self.running.clone(),
            counters: self.counters.clone(),
            payload_type: self.payload_type,
            clock_rate: self.clock_rate,
            ssrc: self.ssrc,
            rtcp_interval: self.rtcp_interval,
        };

        // Restarted streams continue the sequence but start a fresh report period
        stage.last_sent = None;
        let handle = thread::Builder::new()
            .name("rtp-send".to_string())
            .spawn(move || context.run(stage))
            .map_err(|e| NetworkError::SendFailed(format!("failed to spawn sender thread: {}", e)))?;

        self.thread = Some(handle);
        tracing::info!(
            "Packetizer started ({} PT {}, SSRC {:08x})",
            self.encoding_name,
            self.payload_type,
            self.ssrc
        );
        Ok(())
    }

    /// Halt sending; a no-op when not running
    pub fn stop(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        self.running.store(false, Ordering::SeqCst);
        match join_with_timeout(handle, JOIN_TIMEOUT) {
            Some(stage) => self.stage = Some(stage),
            None => tracing::warn!("RTP sender thread did not return its state"),
        }
        tracing::info!("Packetizer stopped");
    }

    pub fn mute(&self) {
        self.muted.store(true, Ordering::SeqCst);
        tracing::debug!("Packetizer muted");
    }

    pub fn unmute(&self) {
        self.muted.store(false, Ordering::SeqCst);
        tracing::debug!("Packetizer unmuted");
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some() && self.running.load(Ordering::SeqCst)
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    pub fn encoding_name(&self) -> &'static str {
        self.encoding_name
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn stats(&self) -> PacketizerStats {
        PacketizerStats {
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            frames_sent: self.counters.frames_sent.load(Ordering::Relaxed),
            frames_suppressed: self.counters.frames_suppressed.load(Ordering::Relaxed),
            send_errors: self.counters.send_errors.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Packetizer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the sender thread shares with its owner
struct SendContext {
    input: Arc<FrameQueue<EncodedFrame>>,
    socket: Arc<UdpSocket>,
    destinations: Arc<Mutex<Destinations>>,
    muted: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    payload_type: u8,
    clock_rate: u32,
    ssrc: u32,
    rtcp_interval: Duration,
}

impl SendContext {
    fn run(self, mut stage: SendStage) -> SendStage {
        let mut buf = BytesMut::with_capacity(MAX_PACKET_SIZE);
        let mut last_report = Instant::now();

        while self.running.load(Ordering::Relaxed) {
            match self.input.pop_timeout(POP_TIMEOUT) {
                Ok(frame) => self.send_frame(&mut stage, &frame, &mut buf),
                Err(PopError::Timeout) => {}
                Err(PopError::Closed) => break,
            }

            if last_report.elapsed() >= self.rtcp_interval {
                last_report = Instant::now();
                self.send_report(&stage);
            }
        }
        stage
    }

    fn send_frame(&self, stage: &mut SendStage, frame: &EncodedFrame, buf: &mut BytesMut) {
        if self.muted.load(Ordering::Relaxed) {
            self.counters.frames_suppressed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let targets = self.destinations.lock().snapshot();
        if targets.is_empty() {
            self.counters.frames_suppressed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let fragments = match stage.format.fragment(frame, MAX_PACKET_SIZE - RTP_HEADER_LEN) {
            Ok(fragments) => fragments,
            Err(e) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Dropping frame {}: {}", frame.sequence, e);
                return;
            }
        };

        let timestamp = frame
            .media_timestamp(self.clock_rate)
            .wrapping_add(stage.timestamp_offset);

        for fragment in fragments {
            let header = RtpHeader {
                marker: fragment.marker,
                payload_type: self.payload_type,
                sequence: stage.sequence,
                timestamp,
                ssrc: self.ssrc,
            };
            stage.sequence = stage.sequence.wrapping_add(1);
            stage.packet_count = stage.packet_count.wrapping_add(1);
            stage.octet_count = stage.octet_count.wrapping_add(fragment.payload.len() as u32);

            buf.clear();
            header.write(buf);
            buf.extend_from_slice(&fragment.payload);

            for target in &targets {
                match self.socket.send_to(&buf[..], target.rtp) {
                    Ok(sent) => {
                        self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                        self.counters.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("Send to {} failed: {}", target.rtp, e);
                    }
                }
            }
        }

        stage.last_timestamp = timestamp;
        stage.last_sent = Some(Instant::now());
        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn send_report(&self, stage: &SendStage) {
        // Nothing to report before the first packet
        let Some(last_sent) = stage.last_sent else {
            return;
        };
        let elapsed_ticks = last_sent.elapsed().as_micros() as u64 * self.clock_rate as u64 / 1_000_000;
        let report = SenderReport {
            ssrc: self.ssrc,
            ntp_timestamp: ntp_now(),
            rtp_timestamp: stage.last_timestamp.wrapping_add(elapsed_ticks as u32),
            packet_count: stage.packet_count,
            octet_count: stage.octet_count,
        }
        .to_bytes();

        for target in self.destinations.lock().snapshot() {
            if let Err(e) = self.socket.send_to(&report, target.rtcp) {
                tracing::debug!("RTCP to {} failed: {}", target.rtcp, e);
            }
        }
    }
}
