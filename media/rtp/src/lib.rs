#![deny(unsafe_code)]

//! RTP session bookkeeping on top of the `rtp-types` / `rtcp-types` wire
//! formats: sequence number and timestamp extension, a small reorder
//! buffer for the receive path and RTCP SR/RR generation.

use bytes::Bytes;
use rtp_types::RtpPacketBuilder;
use rtp_types::prelude::RtpPacketWriter;

mod ntp_timestamp;
mod session;

pub use ntp_timestamp::NtpTimestamp;
pub use session::RtpSession;

pub use rtcp_types;
pub use rtp_types;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ssrc(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceNumber(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExtendedSequenceNumber(pub u64);

impl ExtendedSequenceNumber {
    pub fn increase_one(&mut self) -> SequenceNumber {
        self.0 += 1;
        self.truncated()
    }

    pub fn truncated(&self) -> SequenceNumber {
        SequenceNumber(self.0 as u16)
    }

    pub fn rollover_count(&self) -> u64 {
        self.0 >> 16
    }

    pub fn guess_extended(&self, seq: SequenceNumber) -> ExtendedSequenceNumber {
        ExtendedSequenceNumber(wrapping_counter_to_u64_counter(
            self.0,
            u64::from(seq.0),
            u64::from(u16::MAX),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RtpTimestamp(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExtendedRtpTimestamp(pub u64);

impl ExtendedRtpTimestamp {
    pub fn truncated(&self) -> RtpTimestamp {
        RtpTimestamp(self.0 as u32)
    }

    pub fn guess_extended(&self, timestamp: RtpTimestamp) -> ExtendedRtpTimestamp {
        ExtendedRtpTimestamp(wrapping_counter_to_u64_counter(
            self.0,
            u64::from(timestamp.0),
            u64::from(u32::MAX),
        ))
    }
}

/// Project `got` (a value of a wrapping counter) into the u64 counter
/// domain, choosing the projection closest to `reference`.
fn wrapping_counter_to_u64_counter(reference: u64, got: u64, max: u64) -> u64 {
    let base = (reference & !max) | got;

    let below = base.wrapping_sub(1u64 << max.count_ones());
    let above = base.wrapping_add(1u64 << max.count_ones());

    let dist_base = reference.abs_diff(base);
    let dist_below = reference.abs_diff(below);
    let dist_above = reference.abs_diff(above);

    if dist_below < dist_base && dist_below <= dist_above {
        below
    } else if dist_above < dist_base && dist_above < dist_below {
        above
    } else {
        base
    }
}

/// A parsed or to-be-sent RTP packet
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub pt: u8,
    pub sequence_number: SequenceNumber,
    pub ssrc: Ssrc,
    pub timestamp: RtpTimestamp,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn write_vec(&self, vec: &mut Vec<u8>) {
        let builder = RtpPacketBuilder::<_, Vec<u8>>::new()
            .payload_type(self.pt)
            .sequence_number(self.sequence_number.0)
            .ssrc(self.ssrc.0)
            .timestamp(self.timestamp.0)
            .payload(&self.payload[..]);

        vec.reserve(builder.calculate_size().unwrap_or(0));

        let mut writer = RtpPacketWriterVec {
            output: vec,
            padding: None,
        };

        builder
            .write(&mut writer)
            .expect("vec writer cannot fail");
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(self.payload.len() + 12);
        self.write_vec(&mut vec);
        vec
    }

    pub fn parse(bytes: impl Into<Bytes>) -> Result<Self, rtp_types::RtpParseError> {
        let packet: Bytes = bytes.into();

        let parsed = rtp_types::RtpPacket::parse(&packet[..])?;

        Ok(Self {
            pt: parsed.payload_type(),
            sequence_number: SequenceNumber(parsed.sequence_number()),
            ssrc: Ssrc(parsed.ssrc()),
            timestamp: RtpTimestamp(parsed.timestamp()),
            payload: packet.slice_ref(parsed.payload()),
        })
    }
}

struct RtpPacketWriterVec<'a> {
    output: &'a mut Vec<u8>,
    padding: Option<u8>,
}

impl<'a> RtpPacketWriter for RtpPacketWriterVec<'a> {
    type Output = ();
    type Payload = &'a [u8];
    type Extension = Vec<u8>;

    fn reserve(&mut self, size: usize) {
        if self.output.len() < size {
            self.output.reserve(size - self.output.len());
        }
    }

    fn push(&mut self, data: &[u8]) {
        self.output.extend_from_slice(data)
    }

    fn push_extension(&mut self, extension_data: &Self::Extension) {
        self.push(extension_data)
    }

    fn push_payload(&mut self, data: &Self::Payload) {
        self.push(data)
    }

    fn padding(&mut self, size: u8) {
        self.padding = Some(size);
    }

    fn finish(&mut self) -> Self::Output {
        if let Some(padding) = self.padding.take() {
            self.output
                .resize(self.output.len() + padding as usize - 1, 0);
            self.output.push(padding);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn packet_roundtrip() {
        let packet = RtpPacket {
            pt: 0,
            sequence_number: SequenceNumber(4711),
            ssrc: Ssrc(0xDEADBEEF),
            timestamp: RtpTimestamp(160),
            payload: Bytes::from_static(&[1, 2, 3, 4]),
        };

        let bytes = packet.to_vec();
        let parsed = RtpPacket::parse(bytes).unwrap();

        assert_eq!(parsed.pt, 0);
        assert_eq!(parsed.sequence_number, SequenceNumber(4711));
        assert_eq!(parsed.ssrc, Ssrc(0xDEADBEEF));
        assert_eq!(parsed.timestamp, RtpTimestamp(160));
        assert_eq!(&parsed.payload[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn sequence_number_rollover() {
        let reference = ExtendedSequenceNumber(65535);

        assert_eq!(
            reference.guess_extended(SequenceNumber(65534)),
            ExtendedSequenceNumber(65534)
        );
        assert_eq!(
            reference.guess_extended(SequenceNumber(0)),
            ExtendedSequenceNumber(65536)
        );
        assert_eq!(
            reference.guess_extended(SequenceNumber(1)),
            ExtendedSequenceNumber(65537)
        );
    }

    #[test]
    fn timestamp_rollover() {
        let reference = ExtendedRtpTimestamp(u64::from(u32::MAX));

        assert_eq!(
            reference.guess_extended(RtpTimestamp(160)).0,
            u64::from(u32::MAX) + 161
        );
    }
}
