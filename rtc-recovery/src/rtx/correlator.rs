//! RTX Correlator - maps retransmissions back to the primary stream.

use super::RtxPacket;
use crate::error::Result;
use crate::stream_info::StreamInfo;
use bytes::Bytes;
use log::{debug, trace};

/// A retransmission matched to the primary packet it repairs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CorrelatedPacket {
    /// Sequence number of the repaired packet on the primary stream
    pub original_seq: u16,
    /// Sequence number the retransmission carried on the RTX stream
    pub rtx_seq: u16,
    pub timestamp: u32,
    pub marker: bool,
    pub payload: Bytes,
}

impl CorrelatedPacket {
    /// Rebuilds the primary packet for reinsertion ahead of the jitter
    /// buffer. RTX keeps the original timestamp and marker.
    pub fn into_original(self, ssrc: u32, payload_type: u8) -> rtp::Packet {
        rtp::Packet {
            header: rtp::Header {
                version: 2,
                marker: self.marker,
                payload_type,
                sequence_number: self.original_seq,
                timestamp: self.timestamp,
                ssrc,
                ..Default::default()
            },
            payload: self.payload,
        }
    }
}

/// Outcome of one packet on an RTX stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtxEvent {
    Retransmission(CorrelatedPacket),
    /// Bandwidth probe with no payload. Counted, never surfaced as media.
    PaddingProbe { rtx_seq: u16 },
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RtxStats {
    pub retransmissions: u64,
    pub padding_probes: u64,
    pub malformed: u64,
}

/// Decodes the RTX stream that belongs to one primary stream.
///
/// Exists only for streams whose negotiation paired the primary payload
/// type with an RTX payload type and announced an RTX SSRC.
#[derive(Debug, Clone)]
pub struct RtxCorrelator {
    ssrc: u32,
    payload_type: u8,
    primary_ssrc: u32,
    stats: RtxStats,
}

impl RtxCorrelator {
    pub fn new(info: &StreamInfo) -> Option<Self> {
        let rtx = info.associated_stream.as_ref()?;
        Some(Self {
            ssrc: rtx.ssrc,
            payload_type: rtx.payload_type,
            primary_ssrc: info.ssrc,
            stats: RtxStats::default(),
        })
    }

    /// SSRC of the RTX stream.
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn primary_ssrc(&self) -> u32 {
        self.primary_ssrc
    }

    pub fn stats(&self) -> RtxStats {
        self.stats
    }

    /// Counts a packet on the RTX SSRC that could not be decoded.
    pub fn malformed(&mut self) {
        self.stats.malformed += 1;
    }

    pub fn ingest(&mut self, pkt: RtxPacket) -> RtxEvent {
        if pkt.is_padding_probe() {
            self.stats.padding_probes += 1;
            trace!(
                "rtx ssrc={} seq={}: padding probe",
                self.ssrc, pkt.rtx_seq
            );
            return RtxEvent::PaddingProbe {
                rtx_seq: pkt.rtx_seq,
            };
        }

        self.stats.retransmissions += 1;
        trace!(
            "rtx ssrc={} seq={}: retransmission of {} on ssrc={}",
            self.ssrc, pkt.rtx_seq, pkt.original_seq, self.primary_ssrc
        );
        RtxEvent::Retransmission(CorrelatedPacket {
            original_seq: pkt.original_seq,
            rtx_seq: pkt.rtx_seq,
            payload: pkt.payload,
            ..Default::default()
        })
    }

    /// Decodes and correlates a packet received on the RTX SSRC. A
    /// malformed payload is counted and returned as an error for the caller
    /// to skip.
    pub fn ingest_rtp(&mut self, packet: &rtp::Packet) -> Result<RtxEvent> {
        let pkt = match RtxPacket::from_rtp(packet) {
            Ok(pkt) => pkt,
            Err(err) => {
                self.malformed();
                debug!(
                    "rtx ssrc={} seq={}: {}",
                    self.ssrc, packet.header.sequence_number, err
                );
                return Err(err);
            }
        };

        Ok(match self.ingest(pkt) {
            RtxEvent::Retransmission(mut correlated) => {
                correlated.timestamp = packet.header.timestamp;
                correlated.marker = packet.header.marker;
                RtxEvent::Retransmission(correlated)
            }
            probe => probe,
        })
    }
}
