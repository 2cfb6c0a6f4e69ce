use super::loss_window::{Arrival, LossWindow};
use super::nack_from_sequence_numbers;
use crate::error::Result;
use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;

/// Per-stream state of the precise NACK policy.
pub(crate) struct PreciseNack {
    window: LossWindow,
    skip_last_n: u16,
    max_nacks_per_packet: u16,
}

impl PreciseNack {
    pub(crate) fn new(size: u16, skip_last_n: u16, max_nacks_per_packet: u16) -> Result<Self> {
        Ok(Self {
            window: LossWindow::new(size)?,
            skip_last_n,
            max_nacks_per_packet,
        })
    }

    pub(crate) fn receive(&mut self, seq: u16) -> Arrival {
        self.window.receive(seq)
    }

    /// Returns true if the retransmission of `osn` closed an outstanding gap.
    pub(crate) fn repair(&mut self, osn: u16) -> bool {
        self.window.repair(osn) == Arrival::Filled
    }

    /// Builds the NACK for this tick, if anything is still worth requesting.
    pub(crate) fn generate(&mut self, sender_ssrc: u32, media_ssrc: u32) -> Option<TransportLayerNack> {
        let due = self.window.due(self.skip_last_n, self.max_nacks_per_packet);
        if due.is_empty() {
            return None;
        }
        Some(nack_from_sequence_numbers(sender_ssrc, media_ssrc, &due))
    }
}
