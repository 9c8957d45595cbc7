#![deny(unsafe_code)]

//! Per-call media session: ICE candidate exchange or direct RTP, one RTP
//! stream with its RTCP pacer, and the capture-to-wire / wire-to-playback
//! paths.
//!
//! The session is driven by [`MediaSession::tick`] and reports progress
//! through events popped with [`MediaSession::pop_event`]:
//!
//! ```text
//! Idle ─gather()→ Gathering ─done→ Gathered ─start()→ Connecting ─ok→ Connected
//!                                                      ─fail→ Disconnected
//! Connected ─stop()→ Disconnected ─close()→ Closed
//! ```

use ice::{IceAgent, IceConnectionState, IceCredentials, IceEvent, IceGatheringState, ReceivedPkt};
use rtp::rtcp_types::{self, Compound};
use rtp::{ExtendedSequenceNumber, RtpPacket, RtpSession, RtpTimestamp, Ssrc};
use sdp_types::{Direction, SessionDescription};
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

mod codecs;
mod device;
mod sdp;

pub use codecs::{PayloadCodec, PcmaCodec, PcmuCodec, codec_by_name, codec_by_payload_type};
pub use device::{
    AudioCapture, AudioPlayback, CollectSink, DeviceError, NullSink, SilenceSource, ToneSource,
};

use sdp::RemoteMedia;

/// Ceiling for a single tick so pacers are serviced regularly
const MAX_TICK: Duration = Duration::from_millis(500);

const MAX_DATAGRAM: usize = 1500;

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Sdp(#[from] sdp_types::ParseSessionDescriptionError),
    #[error("session description has no audio media")]
    NoAudioMedia,
    #[error("no compatible codec in remote media description")]
    NoCompatibleCodec,
    #[error("operation invalid in state {0:?}")]
    InvalidState(SessionState),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Lifecycle state of a media session. Never regresses except through
/// [`MediaSession::stop`] / [`MediaSession::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Idle,
    Gathering,
    Gathered,
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

/// How media reaches the peer, decided once on the first remote SDP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Full ICE candidate exchange and connectivity checks
    IceFull,
    /// No ICE attributes in the remote SDP: send straight to the `c=`/`m=`
    /// address
    RtpDirect,
}

/// Events reported to the owner of the session
#[derive(Debug)]
pub enum SessionEvent {
    StateChanged {
        old: SessionState,
        new: SessionState,
    },
    /// The local session description is complete. Fires exactly once.
    SdpReady(String),
    Connected,
    Disconnected {
        reason: String,
    },
}

/// Media session configuration, taken from the owning agent's account
/// config
#[derive(Clone)]
pub struct MediaConfig {
    pub enable_audio: bool,
    pub audio_codec: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub frame_duration_ms: u32,
    pub direction: Direction,

    /// Video negotiation parameters. Stored for hosts that plug a video
    /// capable codec into the [`PayloadCodec`] seam; the built-in session
    /// negotiates audio only.
    pub enable_video: bool,
    pub video_codec: String,
    pub video_width: u32,
    pub video_height: u32,
    pub video_fps: u32,

    pub stun_server: Option<SocketAddr>,
    /// Relay configuration. Accepted and stored for hosts that plug in a
    /// relay-capable agent; the built-in agent does not generate `relay`
    /// candidates.
    pub turn_server: Option<SocketAddr>,
    pub turn_user: Option<String>,
    pub turn_pass: Option<String>,
    pub enable_turn: bool,
    pub ice_controlling: bool,
    pub ice_lite: bool,
    pub ice_gather_timeout: Duration,

    pub enable_rtcp: bool,
    pub jitter_buffer_ms: u32,

    /// 0 lets the OS assign the RTP port
    pub rtp_port: u16,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            enable_audio: true,
            audio_codec: "PCMU".into(),
            sample_rate: 8000,
            channels: 1,
            frame_duration_ms: 20,
            direction: Direction::SendRecv,
            enable_video: false,
            video_codec: "H264".into(),
            video_width: 640,
            video_height: 480,
            video_fps: 30,
            stun_server: None,
            turn_server: None,
            turn_user: None,
            turn_pass: None,
            enable_turn: false,
            ice_controlling: true,
            ice_lite: false,
            ice_gather_timeout: Duration::from_secs(3),
            enable_rtcp: true,
            jitter_buffer_ms: 100,
            rtp_port: 0,
        }
    }
}

/// Byte and packet counters of one session
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionStats {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
}

/// Per-call media session coordinator
pub struct MediaSession {
    config: MediaConfig,

    state: SessionState,
    mode: Option<TransportMode>,

    socket: Option<UdpSocket>,
    local_addr: Option<SocketAddr>,
    /// Address advertised in the SDP `c=` line
    advertised_ip: IpAddr,

    ice: IceAgent,
    gather_deadline: Option<Instant>,

    rtp_session: RtpSession,
    next_sequence: ExtendedSequenceNumber,
    next_timestamp: u64,
    last_rtcp: Option<Instant>,

    codec: Box<dyn PayloadCodec>,
    capture: Option<Box<dyn AudioCapture>>,
    playback: Option<Box<dyn AudioPlayback>>,

    remote: Option<RemoteMedia>,
    remote_addr: Option<SocketAddr>,

    local_sdp: Option<String>,
    stats: SessionStats,

    events: VecDeque<SessionEvent>,
    recv_buf: Vec<u8>,
    frame_buf: Vec<i16>,
}

impl MediaSession {
    pub fn new(config: MediaConfig) -> Self {
        let codec = codecs::codec_by_name(&config.audio_codec)
            .unwrap_or_else(|| Box::new(codecs::PcmuCodec));

        let ssrc = Ssrc(rand::random());

        let mut rtp_session = RtpSession::new(ssrc, codec.clock_rate());
        rtp_session.add_source_description_item(1, format!("lark-{:08x}", ssrc.0));

        let ice = IceAgent::new(
            IceCredentials::random(),
            config.ice_controlling,
            config.ice_lite,
        );

        let frame_len = (config.frame_duration_ms * config.sample_rate / 1000) as usize;

        MediaSession {
            config,
            state: SessionState::Idle,
            mode: None,
            socket: None,
            local_addr: None,
            advertised_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ice,
            gather_deadline: None,
            rtp_session,
            next_sequence: ExtendedSequenceNumber(u64::from(rand::random::<u16>())),
            next_timestamp: u64::from(rand::random::<u16>()),
            last_rtcp: None,
            codec,
            capture: None,
            playback: None,
            remote: None,
            remote_addr: None,
            local_sdp: None,
            stats: SessionStats::default(),
            events: VecDeque::new(),
            recv_buf: vec![0u8; MAX_DATAGRAM],
            frame_buf: vec![0i16; frame_len],
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transport_mode(&self) -> Option<TransportMode> {
        self.mode
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn ssrc(&self) -> Ssrc {
        self.rtp_session.ssrc()
    }

    /// The local session description. Valid once the state reached
    /// [`SessionState::Gathered`].
    pub fn local_sdp(&self) -> Option<&str> {
        self.local_sdp.as_deref()
    }

    /// Port of the bound media socket
    pub fn local_rtp_port(&self) -> Option<u16> {
        self.local_addr.map(|addr| addr.port())
    }

    pub fn set_capture_device(&mut self, device: Box<dyn AudioCapture>) {
        self.capture = Some(device);
    }

    pub fn set_playback_device(&mut self, device: Box<dyn AudioPlayback>) {
        self.playback = Some(device);
    }

    /// Bind the media socket and start gathering candidates.
    ///
    /// Without a configured STUN server only host candidates are gathered
    /// and gathering completes on the next [`tick`](MediaSession::tick).
    pub fn gather(&mut self) -> Result<(), MediaError> {
        if self.state != SessionState::Idle {
            return Err(MediaError::InvalidState(self.state));
        }

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.config.rtp_port))?;

        let port = socket.local_addr()?.port();

        let host_ips = non_loopback_v4_addrs();

        self.advertised_ip = host_ips
            .first()
            .copied()
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

        for ip in host_ips {
            self.ice.add_host_addr(SocketAddr::new(ip, port));
        }

        // loopback only hosts still need a usable candidate
        self.ice
            .add_host_addr(SocketAddr::new(self.advertised_ip, port));

        if let Some(stun_server) = self.config.stun_server {
            self.ice.add_stun_server(stun_server);
        }

        self.local_addr = Some(SocketAddr::new(self.advertised_ip, port));
        self.socket = Some(socket);
        self.gather_deadline = Some(Instant::now() + self.config.ice_gather_timeout);

        self.set_state(SessionState::Gathering);

        Ok(())
    }

    /// Apply the peer's session description.
    ///
    /// The first call decides the transport mode: any ICE attribute in the
    /// SDP selects [`TransportMode::IceFull`], otherwise media flows
    /// directly to the `c=`/`m=` address.
    pub fn set_remote_sdp(&mut self, raw: &str) -> Result<(), MediaError> {
        let parsed = SessionDescription::parse(raw)?;
        let remote = sdp::parse_remote_media(&parsed)?;

        if self.mode.is_none() {
            let mode = if sdp::offers_ice(&parsed) {
                TransportMode::IceFull
            } else {
                TransportMode::RtpDirect
            };

            log::debug!("transport mode decided: {mode:?}");
            self.mode = Some(mode);
        }

        // adopt the negotiated codec when it differs from the configured one
        if let Some(name) = remote.codec_name.as_deref()
            && !name.eq_ignore_ascii_case(self.codec.name())
            && let Some(codec) = codecs::codec_by_name(name)
        {
            self.codec = codec;
        } else if remote.codec_name.is_none()
            && remote.payload_type != self.codec.payload_type()
            && let Some(codec) = codecs::codec_by_payload_type(remote.payload_type)
        {
            self.codec = codec;
        }

        if self.mode == Some(TransportMode::IceFull)
            && let Some((credentials, candidates)) = remote.ice.clone()
        {
            self.ice.set_remote_data(credentials, &candidates);
        }

        if let Some(ip) = remote.addr {
            self.remote_addr = Some(SocketAddr::new(ip, remote.port));
        }

        self.remote = Some(remote);

        Ok(())
    }

    /// Add a single remote candidate received after the initial SDP
    /// (trickle)
    pub fn add_remote_candidate(&mut self, candidate: &sdp_types::IceCandidate) {
        self.ice.add_remote_candidate(candidate);
    }

    /// Begin connecting. Requires [`SessionState::Gathered`].
    ///
    /// In direct RTP mode there is nothing to negotiate and the session
    /// transitions straight to [`SessionState::Connected`].
    pub fn start(&mut self) -> Result<(), MediaError> {
        if self.state != SessionState::Gathered {
            return Err(MediaError::InvalidState(self.state));
        }

        match self.mode {
            Some(TransportMode::RtpDirect) => {
                self.set_state(SessionState::Connecting);
                self.set_state(SessionState::Connected);
                self.events.push_back(SessionEvent::Connected);
            }
            Some(TransportMode::IceFull) => {
                self.set_state(SessionState::Connecting);

                // the checks may have finished while signaling was still
                // exchanging the answer
                if self.ice.connection_state() == IceConnectionState::Connected {
                    self.set_state(SessionState::Connected);
                    self.events.push_back(SessionEvent::Connected);
                }
            }
            None => return Err(MediaError::InvalidState(self.state)),
        }

        Ok(())
    }

    /// Stop media flow. Idempotent.
    pub fn stop(&mut self) {
        if matches!(self.state, SessionState::Disconnected | SessionState::Closed) {
            return;
        }

        self.set_state(SessionState::Disconnected);
    }

    /// Final teardown, releases the socket
    pub fn close(&mut self) {
        self.stop();

        if self.state != SessionState::Closed {
            self.socket = None;
            self.set_state(SessionState::Closed);
        }
    }

    /// Next event to process. Must be called until it returns `None`.
    pub fn pop_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// Drive the session: receive datagrams, run ICE, pump RTP in both
    /// directions and pace RTCP. Sleeps at most
    /// `min(timeout, 500ms)` waiting for network input.
    pub fn tick(&mut self, timeout: Duration) -> Result<(), MediaError> {
        if matches!(self.state, SessionState::Idle | SessionState::Closed) {
            return Ok(());
        }

        let now = Instant::now();

        let timeout = [
            Some(timeout.min(MAX_TICK)),
            self.use_ice().then(|| self.ice.timeout(now)).flatten(),
            self.rtcp_remaining(now),
        ]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(Duration::ZERO);

        if let Err(e) = self.recv_pass(timeout) {
            self.fail_transport(&e.to_string());
            return Err(e.into());
        }

        let now = Instant::now();

        if self.use_ice() {
            self.ice.poll(now);
            self.drain_ice_events()?;
        }

        self.poll_gathering(now);

        if self.state == SessionState::Connected {
            self.pump_send()?;
            self.pump_rtcp(now)?;
            self.pump_playback()?;
        }

        Ok(())
    }

    fn use_ice(&self) -> bool {
        // during gathering the agent also runs in direct mode, it owns the
        // STUN server bindings
        self.mode != Some(TransportMode::RtpDirect)
            || matches!(self.state, SessionState::Gathering)
    }

    fn rtcp_remaining(&self, now: Instant) -> Option<Duration> {
        if !self.config.enable_rtcp || self.state != SessionState::Connected {
            return None;
        }

        let interval = self.rtp_session.rtcp_interval();

        Some(match self.last_rtcp {
            Some(last_rtcp) => (last_rtcp + interval).saturating_duration_since(now),
            None => Duration::ZERO,
        })
    }

    /// Read datagrams until the socket runs dry, waiting at most `timeout`
    /// for the first one
    fn recv_pass(&mut self, timeout: Duration) -> io::Result<()> {
        let Some(socket) = &self.socket else {
            return Ok(());
        };

        // block with a timeout for the first datagram, then drain without
        // waiting
        socket.set_nonblocking(false)?;
        socket.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        let mut first = true;

        loop {
            let result = {
                let socket = self.socket.as_ref().expect("checked above");
                socket.recv_from(&mut self.recv_buf)
            };

            let (len, source) = match result {
                Ok(ok) => ok,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            if first {
                // subsequent reads must not wait
                first = false;
                self.socket
                    .as_ref()
                    .expect("checked above")
                    .set_nonblocking(true)?;
            }

            let data = self.recv_buf[..len].to_vec();
            self.handle_datagram(data, source);
        }
    }

    /// Demultiplex a datagram by content: STUN by its leading byte and
    /// magic cookie, then RTCP by the payload type range, everything else
    /// is RTP.
    fn handle_datagram(&mut self, data: Vec<u8>, source: SocketAddr) {
        if stun_types::is_stun_message(&data) {
            if self.use_ice() || self.state == SessionState::Gathering {
                let destination = self
                    .local_addr
                    .unwrap_or(SocketAddr::new(self.advertised_ip, 0));

                self.ice.receive(ReceivedPkt {
                    data,
                    source,
                    destination,
                });
            }

            return;
        }

        if is_rtcp(&data) {
            if !self.config.enable_rtcp {
                return;
            }

            let compound = match Compound::parse(&data) {
                Ok(compound) => compound,
                Err(e) => {
                    log::debug!("failed to parse incoming RTCP packet, {e}");
                    return;
                }
            };

            for packet in compound {
                match packet {
                    Ok(packet) => self.rtp_session.recv_rtcp(packet),
                    Err(e) => {
                        log::debug!("bad packet in RTCP compound, {e}");
                        break;
                    }
                }
            }

            return;
        }

        match RtpPacket::parse(data) {
            Ok(packet) => {
                self.stats.rx_packets += 1;
                self.stats.rx_bytes += packet.payload.len() as u64;

                // RtpDirect sessions learn the peer's actual source address
                // from the first packet (symmetric RTP)
                if self.mode == Some(TransportMode::RtpDirect) && self.remote_addr.is_none() {
                    self.remote_addr = Some(source);
                }

                self.rtp_session.recv_rtp(packet);
            }
            Err(e) => {
                log::debug!("discarding datagram that parses as neither STUN/RTCP/RTP: {e}");
            }
        }
    }

    fn drain_ice_events(&mut self) -> Result<(), MediaError> {
        while let Some(event) = self.ice.pop_event() {
            match event {
                IceEvent::GatheringStateChanged { new, .. } => {
                    log::debug!("ice gathering state changed to {new:?}");
                }
                IceEvent::ConnectionStateChanged { old: _, new } => match new {
                    IceConnectionState::Connected => {
                        if self.state == SessionState::Connecting {
                            self.set_state(SessionState::Connected);
                            self.events.push_back(SessionEvent::Connected);
                        }
                    }
                    IceConnectionState::Failed => {
                        self.fail_transport("ice connectivity checks failed");
                    }
                    IceConnectionState::Disconnected => {
                        self.fail_transport("ice connection lost");
                    }
                    _ => {}
                },
                IceEvent::DiscoveredAddr { target } => {
                    log::debug!("media target discovered: {target}");
                    self.remote_addr = Some(target);
                }
                IceEvent::SendData { data, target } => {
                    self.send_raw(&data, target)?;
                }
            }
        }

        Ok(())
    }

    /// Complete gathering once the ICE agent finished or the configured
    /// deadline passed
    fn poll_gathering(&mut self, now: Instant) {
        if self.state != SessionState::Gathering {
            return;
        }

        let deadline_passed = self
            .gather_deadline
            .is_some_and(|deadline| now >= deadline);

        if self.ice.gathering_state() != IceGatheringState::Complete && !deadline_passed {
            return;
        }

        if deadline_passed && self.ice.gathering_state() != IceGatheringState::Complete {
            log::warn!("candidate gathering timed out, continuing with gathered candidates");
        }

        self.build_local_sdp();
        self.set_state(SessionState::Gathered);

        if let Some(local_sdp) = &self.local_sdp {
            self.events.push_back(SessionEvent::SdpReady(local_sdp.clone()));
        }
    }

    fn build_local_sdp(&mut self) {
        let Some(local_addr) = self.local_addr else {
            return;
        };

        // ICE attributes go into the offer unless the peer already chose
        // direct RTP
        let ice = (self.mode != Some(TransportMode::RtpDirect))
            .then(|| (self.ice.credentials(), self.ice.ice_candidates()));

        let sdp = sdp::build_local_sdp(sdp::LocalSdpParams {
            address: self.advertised_ip,
            port: local_addr.port(),
            payload_type: self.codec.payload_type(),
            codec_name: self.codec.name(),
            clock_rate: self.codec.clock_rate(),
            direction: self.config.direction,
            ice,
        });

        self.local_sdp = Some(sdp.to_string());
    }

    /// Capture one frame, encode it and put it on the wire
    fn pump_send(&mut self) -> Result<(), MediaError> {
        if !self.config.enable_audio || !self.config.direction.is_sending() {
            return Ok(());
        }

        let Some(remote_addr) = self.remote_addr else {
            return Ok(());
        };

        // a peer that declared itself sendonly/inactive is not listening
        if let Some(remote) = &self.remote
            && !remote.direction.is_receiving()
        {
            return Ok(());
        }

        let Some(capture) = &mut self.capture else {
            return Ok(());
        };

        let frame_duration = Duration::from_millis(u64::from(self.config.frame_duration_ms));

        let samples = match capture.read_frame(&mut self.frame_buf, frame_duration.min(Duration::from_millis(100))) {
            Ok(samples) => samples,
            Err(e) => {
                log::warn!("capture device failed: {e}");
                return Err(e.into());
            }
        };

        if samples == 0 {
            return Ok(());
        }

        let mut payload = Vec::with_capacity(samples);
        self.codec.encode(&self.frame_buf[..samples], &mut payload);

        let packet = RtpPacket {
            pt: self.codec.payload_type(),
            sequence_number: self.next_sequence.increase_one(),
            ssrc: self.rtp_session.ssrc(),
            timestamp: RtpTimestamp(self.next_timestamp as u32),
            payload: payload.into(),
        };

        self.next_timestamp += samples as u64;

        self.rtp_session.send_rtp(&packet);

        let bytes = packet.to_vec();
        self.send_raw(&bytes, remote_addr)?;

        Ok(())
    }

    /// Emit an RTCP report when the pacer interval elapsed
    fn pump_rtcp(&mut self, now: Instant) -> Result<(), MediaError> {
        if !self.config.enable_rtcp {
            return Ok(());
        }

        let Some(remote_addr) = self.remote_addr else {
            return Ok(());
        };

        let due = match self.last_rtcp {
            Some(last_rtcp) => now.duration_since(last_rtcp) >= self.rtp_session.rtcp_interval(),
            None => true,
        };

        if !due {
            return Ok(());
        }

        let mut buffer = vec![0u8; MAX_DATAGRAM];

        match self.rtp_session.write_rtcp_report(&mut buffer) {
            Ok(len) => {
                self.last_rtcp = Some(now);
                self.send_raw(&buffer[..len], remote_addr)?;
            }
            Err(e) => {
                log::warn!("failed to generate RTCP report, {e}");
            }
        }

        Ok(())
    }

    /// Move received frames from the jitter buffer to the playback device
    fn pump_playback(&mut self) -> Result<(), MediaError> {
        if !self.config.enable_audio || !self.config.direction.is_receiving() {
            return Ok(());
        }

        let Some(playback) = &mut self.playback else {
            return Ok(());
        };

        let jitter = Duration::from_millis(u64::from(self.config.jitter_buffer_ms));

        let mut decoded = Vec::with_capacity(self.frame_buf.len());

        while let Some(packet) = self.rtp_session.pop_rtp(Some(jitter)) {
            decoded.clear();
            self.codec.decode(&packet.payload, &mut decoded);

            playback.write_frame(packet.timestamp.0, &decoded)?;
        }

        Ok(())
    }

    fn send_raw(&mut self, bytes: &[u8], target: SocketAddr) -> Result<(), MediaError> {
        let Some(socket) = &self.socket else {
            return Ok(());
        };

        match socket.send_to(bytes, target) {
            Ok(sent) => {
                self.stats.tx_packets += 1;
                self.stats.tx_bytes += sent as u64;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // dropped, the next pacer interval resends
                log::debug!("media socket send would block, dropping packet");
                Ok(())
            }
            Err(e) => {
                self.fail_transport(&e.to_string());
                Err(e.into())
            }
        }
    }

    fn fail_transport(&mut self, reason: &str) {
        if matches!(self.state, SessionState::Disconnected | SessionState::Closed) {
            return;
        }

        log::warn!("media transport failed: {reason}");

        self.set_state(SessionState::Disconnected);
        self.events.push_back(SessionEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    fn set_state(&mut self, new: SessionState) {
        if self.state == new {
            return;
        }

        log::debug!("media session state {:?} -> {:?}", self.state, new);

        let old = std::mem::replace(&mut self.state, new);
        self.events.push_back(SessionEvent::StateChanged { old, new });
    }
}

/// RTCP detection by the payload-type octet (RFC 5761 section 4)
fn is_rtcp(data: &[u8]) -> bool {
    if data.len() < 2 {
        return false;
    }

    // RTP version 2 in the first octet, RTCP packet types 64..=95 after
    // masking the marker bit
    matches!(data[0], 128..=191) && matches!(data[1] & 0x7F, 64..=95)
}

/// Convert a device timestamp in microseconds to an RTP timestamp
pub fn device_us_to_rtp_timestamp(device_us: u64, sample_rate: u32) -> u32 {
    ((device_us * u64::from(sample_rate)) / 1_000_000) as u32
}

fn non_loopback_v4_addrs() -> Vec<IpAddr> {
    match local_ip_address::list_afinet_netifas() {
        Ok(interfaces) => interfaces
            .into_iter()
            .filter(|(_, ip)| ip.is_ipv4() && !ip.is_loopback())
            .map(|(_, ip)| ip)
            .collect(),
        Err(e) => {
            log::warn!("failed to enumerate local interfaces: {e}");
            vec![]
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rtcp_detection() {
        // RTCP SR has packet type 200 => second byte 200 (0xC8), & 0x7F = 72
        assert!(is_rtcp(&[0x80, 200]));
        assert!(is_rtcp(&[0x81, 201]));
        // payload type 0 (PCMU) is RTP
        assert!(!is_rtcp(&[0x80, 0]));
        // dynamic payload 96 is RTP (96 & 0x7F = 96, outside 64..=95)
        assert!(!is_rtcp(&[0x80, 96]));
        // STUN starts with 0
        assert!(!is_rtcp(&[0x00, 0x01]));
    }

    #[test]
    fn timestamp_conversion_law() {
        assert_eq!(device_us_to_rtp_timestamp(1_000_000, 8000), 8000);
        assert_eq!(device_us_to_rtp_timestamp(20_000, 8000), 160);
        assert_eq!(device_us_to_rtp_timestamp(0, 48000), 0);
    }

    #[test]
    fn mode_decision_is_sticky() {
        let mut session = MediaSession::new(MediaConfig::default());

        let plain = "v=0\r\n\
            o=- 1 1 IN IP4 127.0.0.1\r\n\
            s=-\r\n\
            c=IN IP4 127.0.0.1\r\n\
            t=0 0\r\n\
            m=audio 40000 RTP/AVP 0\r\n";

        session.set_remote_sdp(plain).unwrap();
        assert_eq!(session.transport_mode(), Some(TransportMode::RtpDirect));

        // a later SDP with ICE attributes must not flip the decision
        let with_ice = "v=0\r\n\
            o=- 1 2 IN IP4 127.0.0.1\r\n\
            s=-\r\n\
            c=IN IP4 127.0.0.1\r\n\
            t=0 0\r\n\
            m=audio 40000 RTP/AVP 0\r\n\
            a=ice-ufrag:abcd1234\r\n\
            a=ice-pwd:0123456789012345678901\r\n";

        session.set_remote_sdp(with_ice).unwrap();
        assert_eq!(session.transport_mode(), Some(TransportMode::RtpDirect));
    }

    #[test]
    fn gather_requires_idle() {
        let mut session = MediaSession::new(MediaConfig::default());

        session.gather().unwrap();

        assert!(matches!(
            session.gather(),
            Err(MediaError::InvalidState(SessionState::Gathering))
        ));
    }

    #[test]
    fn stop_is_idempotent() {
        let mut session = MediaSession::new(MediaConfig::default());

        session.stop();
        let first: Vec<_> = std::iter::from_fn(|| session.pop_event()).collect();

        session.stop();
        let second: Vec<_> = std::iter::from_fn(|| session.pop_event()).collect();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }
}
