//! NACK (Negative Acknowledgement) scheduling.
//!
//! Two policies decide when a receiver asks the sender to retransmit:
//!
//! - [`NackPolicy::Interval`]: a forward jump in a video stream's sequence
//!   numbers is treated as suspected loss, and at most one Generic NACK per
//!   interval is sent naming the packet that exposed the gap.
//! - [`NackPolicy::Precise`]: a loss window tracks every gap, closed either
//!   by a late packet or by an RTX repair, and every interval tick one
//!   Generic NACK lists the gaps still open, compressed into [`NackPair`]s.
//!
//! Audio streams never produce NACKs under either policy.

pub(crate) mod loss_window;
pub(crate) mod precise;
pub mod scheduler;

use rtcp::transport_feedbacks::transport_layer_nack::{
    NackPair, TransportLayerNack, nack_pairs_from_sequence_numbers,
};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use scheduler::NackScheduler;

/// How lost packets are detected and requested.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NackPolicy {
    /// Rate-limited request for the packet that revealed a gap.
    #[default]
    Interval,
    /// Periodic request for every gap still open in the loss window.
    Precise,
}

impl fmt::Display for NackPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            NackPolicy::Interval => "interval",
            NackPolicy::Precise => "precise",
        };
        write!(f, "{s}")
    }
}

/// A decision to ask the remote sender for one packet again.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RecoveryRequest {
    /// SSRC of the media stream the packet belongs to
    pub ssrc: u32,
    pub lost_seq: u16,
}

impl RecoveryRequest {
    /// Generic NACK naming exactly `lost_seq`, with no further packets in
    /// the bitmap.
    pub fn to_nack(&self, sender_ssrc: u32) -> TransportLayerNack {
        TransportLayerNack {
            sender_ssrc,
            media_ssrc: self.ssrc,
            nacks: vec![NackPair::new(self.lost_seq)],
        }
    }
}

pub(crate) fn nack_from_sequence_numbers(
    sender_ssrc: u32,
    media_ssrc: u32,
    seqs: &[u16],
) -> TransportLayerNack {
    TransportLayerNack {
        sender_ssrc,
        media_ssrc,
        nacks: nack_pairs_from_sequence_numbers(seqs),
    }
}

/// Every sequence number a Generic NACK requests, in pair order.
pub fn nacked_sequence_numbers(nack: &TransportLayerNack) -> Vec<u16> {
    nack.nacks.iter().flat_map(|pair| pair.packet_list()).collect()
}
