use serde::{Deserialize, Serialize};

/// Per-stream loss recovery counters.
///
/// RTX counters are kept for every stream regardless of media kind; a
/// stream without a negotiated RTX association simply leaves them at zero.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStats {
    /// RTP packets accepted on the primary SSRC
    pub packets_received: u64,
    /// Packets at or behind the highest sequence number seen
    pub duplicate_packets: u64,
    /// Forward jumps of more than one sequence number on a video stream
    pub suspected_losses: u64,
    /// Generic NACK messages produced
    pub nacks_sent: u64,
    /// Sequence numbers listed across all NACK messages
    pub sequence_numbers_nacked: u64,
    pub retransmissions_received: u64,
    pub padding_probes_received: u64,
    /// Packets on either SSRC that could not be parsed
    pub malformed_packets: u64,
    /// Feedback messages dropped after exhausting their write retries
    pub feedback_failures: u64,
}
