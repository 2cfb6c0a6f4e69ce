//! RTX (RFC 4588) retransmission payload handling.
//!
//! A retransmission travels on its own SSRC with its own sequence numbers.
//! The sequence number of the packet being repaired (the OSN) is carried in
//! the first two payload bytes, big-endian, ahead of the original payload:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         RTP Header (RTX SSRC, RTX PT, RTX sequence number)    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |            OSN                |                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+                               |
//! |                  Original RTP Packet Payload                  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Senders also use the RTX stream for bandwidth probing: packets whose
//! payload is nothing but RTP padding. Those carry no OSN.

pub mod correlator;

pub use correlator::{CorrelatedPacket, RtxCorrelator, RtxEvent, RtxStats};

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the original sequence number prefix.
pub const OSN_LENGTH: usize = 2;

/// A packet received on an RTX stream.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RtxPacket {
    /// Sequence number of the primary packet being repaired. Zero for
    /// padding probes.
    pub original_seq: u16,
    /// Sequence number on the RTX stream itself.
    pub rtx_seq: u16,
    /// Original payload, without the OSN prefix. Empty for padding probes.
    pub payload: Bytes,
}

impl RtxPacket {
    /// Decodes an RTX payload. RTP padding must already be stripped, which
    /// [`rtp::Packet`] unmarshalling does.
    pub fn from_rtp(packet: &rtp::Packet) -> Result<Self> {
        let rtx_seq = packet.header.sequence_number;
        let mut payload = packet.payload.clone();

        match payload.len() {
            0 => Ok(RtxPacket {
                original_seq: 0,
                rtx_seq,
                payload,
            }),
            1 => Err(Error::ErrRtxPayloadTooShort),
            _ => {
                let original_seq = payload.get_u16();
                Ok(RtxPacket {
                    original_seq,
                    rtx_seq,
                    payload,
                })
            }
        }
    }

    pub fn is_padding_probe(&self) -> bool {
        self.payload.is_empty()
    }

    /// Wraps the packet for sending on the RTX stream described by
    /// `header` (SSRC, payload type, timestamp). The header's sequence
    /// number is replaced by `rtx_seq`.
    pub fn to_rtp(&self, mut header: rtp::Header) -> rtp::Packet {
        header.sequence_number = self.rtx_seq;

        let payload = if self.is_padding_probe() {
            Bytes::new()
        } else {
            let mut buf = BytesMut::with_capacity(OSN_LENGTH + self.payload.len());
            buf.put_u16(self.original_seq);
            buf.extend_from_slice(&self.payload);
            buf.freeze()
        };

        rtp::Packet { header, payload }
    }
}
