use crate::{ExtendedRtpTimestamp, ExtendedSequenceNumber, RtpPacket};
use std::collections::BTreeMap;

/// Small reorder buffer for received RTP packets.
///
/// Packets are kept sorted by their extended sequence number and released
/// once their timestamp falls below the caller provided threshold, so late
/// packets get a chance to slot in before playback.
#[derive(Default)]
pub(crate) struct JitterBuffer {
    entries: BTreeMap<u64, (ExtendedRtpTimestamp, RtpPacket)>,

    last_popped: Option<ExtendedSequenceNumber>,

    /// Packets received since the last RTCP report
    pub(crate) received: u64,
    /// Packets detected as lost since the last RTCP report
    pub(crate) lost: u64,
}

impl JitterBuffer {
    pub(crate) fn push(
        &mut self,
        timestamp: ExtendedRtpTimestamp,
        sequence_number: ExtendedSequenceNumber,
        packet: RtpPacket,
    ) {
        if let Some(last_popped) = self.last_popped
            && sequence_number <= last_popped
        {
            // too late, playback has moved past this packet
            return;
        }

        self.received += 1;

        // duplicates are absorbed by the map
        self.entries
            .entry(sequence_number.0)
            .or_insert((timestamp, packet));
    }

    /// Pop the earliest packet whose timestamp is at most `max_timestamp`
    pub(crate) fn pop(&mut self, max_timestamp: ExtendedRtpTimestamp) -> Option<RtpPacket> {
        let (&seq, (timestamp, _)) = self.entries.first_key_value()?;

        if *timestamp > max_timestamp {
            return None;
        }

        let (_, packet) = self.entries.remove(&seq).expect("entry exists");

        // any gap to the previously popped sequence number is loss
        if let Some(last_popped) = self.last_popped {
            self.lost += seq.saturating_sub(last_popped.0 + 1);
        }

        self.last_popped = Some(ExtendedSequenceNumber(seq));

        Some(packet)
    }

    pub(crate) fn timestamp_of_earliest_packet(&self) -> Option<ExtendedRtpTimestamp> {
        self.entries
            .first_key_value()
            .map(|(_, (timestamp, _))| *timestamp)
    }
}
