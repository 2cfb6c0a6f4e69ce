//! Sequence Tracker - highest-seen sequence number under 16-bit wraparound.

use crate::codec::RtpCodecKind;

/// Half of the 16-bit sequence space.
pub const SEQUENCE_HALF_RANGE: u16 = 1 << 15;

/// Returns true when `seq` is ahead of `reference` under modulo-65536
/// ordering, i.e. `seq - reference` lies in `(0, 32768)`.
pub fn is_sequence_ahead(seq: u16, reference: u16) -> bool {
    let diff = seq.wrapping_sub(reference);
    diff > 0 && diff < SEQUENCE_HALF_RANGE
}

/// Result of observing one sequence number.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Observation {
    /// The packet moved the tracker forward.
    pub is_new: bool,
    /// The packet is new on a video stream and skipped at least one
    /// sequence number. Suspicion only: the gap may still be filled by
    /// reordered packets.
    pub is_video_loss_suspected: bool,
}

/// Per-stream record of the highest sequence number seen so far.
///
/// Only forward movement is recorded. A number that is equal to or behind
/// the last observed one (by wraparound distance) is a duplicate or a late
/// packet and leaves the tracker untouched.
#[derive(Debug, Clone)]
pub struct SequenceTracker {
    kind: RtpCodecKind,
    last_observed_seq: Option<u16>,
}

impl SequenceTracker {
    pub fn new(kind: RtpCodecKind) -> Self {
        Self {
            kind,
            last_observed_seq: None,
        }
    }

    pub fn last_observed_seq(&self) -> Option<u16> {
        self.last_observed_seq
    }

    pub fn observe(&mut self, seq: u16) -> Observation {
        let Some(last) = self.last_observed_seq else {
            self.last_observed_seq = Some(seq);
            return Observation {
                is_new: true,
                is_video_loss_suspected: false,
            };
        };

        if !is_sequence_ahead(seq, last) {
            return Observation::default();
        }

        self.last_observed_seq = Some(seq);
        Observation {
            is_new: true,
            is_video_loss_suspected: self.kind == RtpCodecKind::Video
                && seq.wrapping_sub(last) > 1,
        }
    }
}
