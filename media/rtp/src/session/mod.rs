use crate::{
    ExtendedRtpTimestamp, ExtendedSequenceNumber, NtpTimestamp, RtpPacket, Ssrc,
};
use jitter_buffer::JitterBuffer;
use rtcp_types::{
    CompoundBuilder, ReceiverReport, ReceiverReportBuilder, ReportBlock, RtcpPacketWriterExt,
    RtcpWriteError, SdesBuilder, SdesChunk, SdesChunkBuilder, SdesItem, SenderReport,
    SenderReportBuilder,
};
use std::fmt;
use std::time::{Duration, Instant};

mod jitter_buffer;

const DEFAULT_JITTERBUFFER_LENGTH: Duration = Duration::from_millis(100);
const DEFAULT_RTCP_INTERVAL: Duration = Duration::from_secs(5);

/// Single RTP session (1 sender, many receivers).
///
/// Tracks the outbound sender statistics, keeps a jitter buffer per remote
/// SSRC and generates RTCP sender/receiver reports.
pub struct RtpSession {
    ssrc: Ssrc,
    clock_rate: u32,
    rtcp_interval: Duration,

    /// tag, value pairs for the RTCP source description (CNAME is tag 1)
    source_description_items: Vec<(u8, String)>,

    sender: Option<SenderState>,
    receiver: Vec<ReceiverState>,
}

impl fmt::Debug for RtpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpSession")
            .field("ssrc", &self.ssrc)
            .field("clock_rate", &self.clock_rate)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct SenderState {
    ntp_timestamp: NtpTimestamp,
    rtp_timestamp: ExtendedRtpTimestamp,

    sender_pkg_count: u32,
    sender_octet_count: u32,
}

#[derive(Debug, Default)]
struct ReceiverStats {
    jitter: f32,
    total_lost: u64,
    last_sr: Option<NtpTimestamp>,
}

struct ReceiverState {
    ssrc: Ssrc,

    jitter_buffer: JitterBuffer,

    last_rtp_received: Option<(Instant, ExtendedRtpTimestamp, ExtendedSequenceNumber)>,

    stats: ReceiverStats,
}

impl RtpSession {
    pub fn new(ssrc: Ssrc, clock_rate: u32) -> Self {
        Self {
            ssrc,
            clock_rate,
            rtcp_interval: DEFAULT_RTCP_INTERVAL,
            source_description_items: vec![],
            sender: None,
            receiver: vec![],
        }
    }

    pub fn with_rtcp_interval(mut self, rtcp_interval: Duration) -> Self {
        self.rtcp_interval = rtcp_interval;
        self
    }

    /// Add an item to the RTCP source description
    pub fn add_source_description_item(&mut self, tag: u8, value: String) {
        self.source_description_items.push((tag, value));
    }

    pub fn ssrc(&self) -> Ssrc {
        self.ssrc
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Minimum time between two RTCP reports of this session
    pub fn rtcp_interval(&self) -> Duration {
        self.rtcp_interval
    }

    /// Remote SSRCs the session received packets from
    pub fn remote_ssrc(&self) -> impl Iterator<Item = Ssrc> + '_ {
        self.receiver.iter().map(|r| r.ssrc)
    }

    /// Register an RTP packet before sending it out
    pub fn send_rtp(&mut self, packet: &RtpPacket) {
        let sender_state = self.sender.get_or_insert(SenderState {
            ntp_timestamp: NtpTimestamp::ZERO,
            rtp_timestamp: ExtendedRtpTimestamp(0),
            sender_pkg_count: 0,
            sender_octet_count: 0,
        });

        sender_state.ntp_timestamp = NtpTimestamp::now();
        sender_state.rtp_timestamp = sender_state.rtp_timestamp.guess_extended(packet.timestamp);

        sender_state.sender_pkg_count = sender_state.sender_pkg_count.wrapping_add(1);
        sender_state.sender_octet_count = sender_state
            .sender_octet_count
            .wrapping_add(packet.payload.len() as u32);
    }

    /// Number of packets registered for sending
    pub fn sent_packets(&self) -> u32 {
        self.sender.as_ref().map(|s| s.sender_pkg_count).unwrap_or(0)
    }

    /// Consume a received RTP packet into the matching jitter buffer
    pub fn recv_rtp(&mut self, packet: RtpPacket) {
        let receiver_state = if let Some(receiver_state) =
            self.receiver.iter_mut().find(|r| r.ssrc == packet.ssrc)
        {
            receiver_state
        } else {
            // don't allow an unbounded amount of receivers
            if self.receiver.len() > 32 {
                return;
            }

            self.receiver.push(ReceiverState {
                ssrc: packet.ssrc,
                jitter_buffer: JitterBuffer::default(),
                last_rtp_received: None,
                stats: ReceiverStats::default(),
            });

            self.receiver.last_mut().unwrap()
        };

        let now = Instant::now();

        if let Some((last_instant, last_timestamp, last_sequence_number)) =
            receiver_state.last_rtp_received
        {
            let timestamp = last_timestamp.guess_extended(packet.timestamp);
            let sequence_number = last_sequence_number.guess_extended(packet.sequence_number);

            // interarrival jitter (RFC 3550 section 6.4.1), only meaningful
            // when the timestamp advanced
            if timestamp > last_timestamp {
                let arrival = (now - last_instant).as_secs_f32() * self.clock_rate as f32;
                let transit = (timestamp.0 - last_timestamp.0) as f32;
                let d = (arrival - transit).abs();

                receiver_state.stats.jitter += (d - receiver_state.stats.jitter) / 16.;

                receiver_state.last_rtp_received = Some((now, timestamp, sequence_number));
            }

            receiver_state
                .jitter_buffer
                .push(timestamp, sequence_number, packet);
        } else {
            let timestamp = ExtendedRtpTimestamp(packet.timestamp.0.into());
            let sequence_number = ExtendedSequenceNumber(packet.sequence_number.0.into());

            receiver_state.last_rtp_received = Some((now, timestamp, sequence_number));

            receiver_state
                .jitter_buffer
                .push(timestamp, sequence_number, packet);
        }
    }

    /// Pop the next RTP packet that left the jitter buffer
    pub fn pop_rtp(&mut self, jitter_buffer_length: Option<Duration>) -> Option<RtpPacket> {
        let pop_earliest =
            Instant::now() - jitter_buffer_length.unwrap_or(DEFAULT_JITTERBUFFER_LENGTH);

        for receiver in &mut self.receiver {
            let Some((last_instant, last_timestamp, _)) = receiver.last_rtp_received else {
                continue;
            };

            let max_timestamp = map_instant_to_rtp_timestamp(
                last_instant,
                last_timestamp,
                self.clock_rate,
                pop_earliest,
            );

            if let Some(packet) = receiver.jitter_buffer.pop(max_timestamp) {
                return Some(packet);
            }
        }

        None
    }

    /// Ingest a received RTCP packet for stats
    pub fn recv_rtcp(&mut self, packet: rtcp_types::Packet<'_>) {
        if let rtcp_types::Packet::Sr(sr) = packet
            && let Some(receiver) = self
                .receiver
                .iter_mut()
                .find(|state| state.ssrc.0 == sr.ssrc())
        {
            receiver.stats.last_sr = Some(NtpTimestamp::now());
        }
    }

    fn generate_rtcp_report(&mut self) -> Result<SenderReportBuilder, ReceiverReportBuilder> {
        let now = NtpTimestamp::now();
        let mut report_blocks = vec![];

        for receiver in &mut self.receiver {
            let lost = receiver.jitter_buffer.lost;
            let received = receiver.jitter_buffer.received;

            receiver.stats.total_lost += lost;
            receiver.jitter_buffer.lost = 0;
            receiver.jitter_buffer.received = 0;

            let fraction_lost = if received + lost > 0 {
                ((lost as f64 / (received + lost) as f64) * 255.0) as u8
            } else {
                0
            };

            let (last_sr, delay) = if let Some(last_sr) = receiver.stats.last_sr {
                let delay = ((now - last_sr).as_secs_f64() * 65536.0) as u32;

                (last_sr.to_fixed_u32(), delay)
            } else {
                (0, 0)
            };

            let last_sequence_number = receiver
                .last_rtp_received
                .map(|(_, _, seq)| seq.0)
                .unwrap_or_default();

            let report_block = ReportBlock::builder(receiver.ssrc.0)
                .fraction_lost(fraction_lost)
                .cumulative_lost(receiver.stats.total_lost as u32)
                .extended_sequence_number(lower_32bits(last_sequence_number))
                .interarrival_jitter(receiver.stats.jitter as u32)
                .last_sender_report_timestamp(last_sr)
                .delay_since_last_sender_report_timestamp(delay);

            report_blocks.push(report_block);
        }

        if let Some(sender_state) = &self.sender {
            // advance the rtp timestamp to "now" so the SR mapping is exact
            let offset =
                (now - sender_state.ntp_timestamp).as_secs_f64() * self.clock_rate as f64;
            let rtp_timestamp = sender_state.rtp_timestamp.0 + offset as u64;

            let mut sr = SenderReport::builder(self.ssrc.0)
                .ntp_timestamp(now.to_fixed_u64())
                .rtp_timestamp(lower_32bits(rtp_timestamp))
                .packet_count(sender_state.sender_pkg_count)
                .octet_count(sender_state.sender_octet_count);

            for report_block in report_blocks {
                sr = sr.add_report_block(report_block);
            }

            Ok(sr)
        } else {
            let mut rr = ReceiverReport::builder(self.ssrc.0);

            for report_block in report_blocks {
                rr = rr.add_report_block(report_block);
            }

            Err(rr)
        }
    }

    fn generate_sdes_chunk(&self) -> Option<SdesChunkBuilder<'_>> {
        if self.source_description_items.is_empty() {
            return None;
        }

        let mut chunk = SdesChunk::builder(self.ssrc.0);

        for (tag, value) in &self.source_description_items {
            chunk = chunk.add_item(SdesItem::builder(*tag, value));
        }

        Some(chunk)
    }

    /// Generate an RTCP sender or receiver report compound packet.
    ///
    /// Resets the internal received & lost counters for every receiver.
    pub fn write_rtcp_report(&mut self, dst: &mut [u8]) -> Result<usize, RtcpWriteError> {
        let mut compound = match self.generate_rtcp_report() {
            Ok(sr) => CompoundBuilder::default().add_packet(sr),
            Err(rr) => CompoundBuilder::default().add_packet(rr),
        };

        if let Some(sdes_chunk) = self.generate_sdes_chunk() {
            compound = compound.add_packet(SdesBuilder::default().add_chunk(sdes_chunk));
        }

        compound.write_into(dst)
    }
}

fn map_instant_to_rtp_timestamp(
    reference_instant: Instant,
    reference_timestamp: ExtendedRtpTimestamp,
    clock_rate: u32,
    instant: Instant,
) -> ExtendedRtpTimestamp {
    let delta_in_rtp_timesteps = if instant >= reference_instant {
        ((instant - reference_instant).as_secs_f32() * clock_rate as f32) as i64
    } else {
        -(((reference_instant - instant).as_secs_f32() * clock_rate as f32) as i64)
    };

    ExtendedRtpTimestamp((reference_timestamp.0 as i64 + delta_in_rtp_timesteps).max(0) as u64)
}

fn lower_32bits(i: u64) -> u32 {
    (i & u64::from(u32::MAX)) as u32
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{RtpTimestamp, SequenceNumber};
    use bytes::Bytes;

    fn packet(ssrc: u32, seq: u16, timestamp: u32) -> RtpPacket {
        RtpPacket {
            pt: 0,
            sequence_number: SequenceNumber(seq),
            ssrc: Ssrc(ssrc),
            timestamp: RtpTimestamp(timestamp),
            payload: Bytes::from_static(&[0; 160]),
        }
    }

    #[test]
    fn sender_counters() {
        let mut session = RtpSession::new(Ssrc(0x1234), 8000);

        session.send_rtp(&packet(0x1234, 1, 160));
        session.send_rtp(&packet(0x1234, 2, 320));

        assert_eq!(session.sent_packets(), 2);
    }

    #[test]
    fn receive_and_pop() {
        let mut session = RtpSession::new(Ssrc(1), 8000);

        session.recv_rtp(packet(2, 1, 160));

        // zero-length jitter buffer releases immediately
        let popped = session.pop_rtp(Some(Duration::ZERO)).unwrap();

        assert_eq!(popped.sequence_number, SequenceNumber(1));
        assert_eq!(session.remote_ssrc().collect::<Vec<_>>(), vec![Ssrc(2)]);
    }

    #[test]
    fn sender_report_roundtrip() {
        let mut session = RtpSession::new(Ssrc(0xAABB), 8000);
        session.add_source_description_item(1, "alice@host".into());

        session.send_rtp(&packet(0xAABB, 1, 160));
        session.recv_rtp(packet(0xCCDD, 7, 160));

        let mut buffer = vec![0u8; 1024];
        let len = session.write_rtcp_report(&mut buffer).unwrap();

        let compound = rtcp_types::Compound::parse(&buffer[..len]).unwrap();
        let packets: Vec<_> = compound.collect::<Result<_, _>>().unwrap();

        let rtcp_types::Packet::Sr(sr) = &packets[0] else {
            panic!("expected a sender report");
        };

        assert_eq!(sr.ssrc(), 0xAABB);
        assert_eq!(sr.n_reports(), 1);
    }

    #[test]
    fn receiver_report_without_sending() {
        let mut session = RtpSession::new(Ssrc(0xAABB), 8000);

        session.recv_rtp(packet(0xCCDD, 7, 160));

        let mut buffer = vec![0u8; 1024];
        let len = session.write_rtcp_report(&mut buffer).unwrap();

        let compound = rtcp_types::Compound::parse(&buffer[..len]).unwrap();
        let packets: Vec<_> = compound.collect::<Result<_, _>>().unwrap();

        assert!(matches!(packets[0], rtcp_types::Packet::Rr(_)));
    }
}
