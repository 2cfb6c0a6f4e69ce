//! Outstanding losses of one video stream under the precise policy.
//!
//! Sequence numbers are unwrapped into a 64-bit space against the highest
//! one seen, so the window never has to reason about wraparound once a
//! packet is placed. Only gaps are stored: each missing sequence number
//! maps to the number of times it has been requested.

use crate::error::{Error, Result};
use std::collections::BTreeMap;

const MIN_SIZE: u16 = 64;
const MAX_SIZE: u16 = 1 << 15;

/// Start of the unwrapped space, leaving one cycle below the first packet.
const FIRST_CYCLE: u64 = 1 << 16;

/// What a sequence number did to the window.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Arrival {
    /// The packet is the newest so far; any gap before it is now missing.
    Advanced,
    /// The packet closed a gap.
    Filled,
    /// Duplicate, or older than anything still tracked.
    Ignored,
}

pub(crate) struct LossWindow {
    size: u64,
    highest: Option<u64>,
    missing: BTreeMap<u64, u16>,
}

impl LossWindow {
    /// Valid sizes are powers of two from 64 to 32768.
    pub(crate) fn is_valid_size(size: u16) -> bool {
        size.is_power_of_two() && (MIN_SIZE..=MAX_SIZE).contains(&size)
    }

    pub(crate) fn new(size: u16) -> Result<Self> {
        if !Self::is_valid_size(size) {
            return Err(Error::ErrInvalidReceiveLogSize(size));
        }
        Ok(Self {
            size: u64::from(size),
            highest: None,
            missing: BTreeMap::new(),
        })
    }

    fn unwrap_seq(highest: u64, seq: u16) -> Option<u64> {
        let delta = seq.wrapping_sub(highest as u16) as i16;
        highest.checked_add_signed(i64::from(delta))
    }

    /// A packet arrived on the primary SSRC.
    pub(crate) fn receive(&mut self, seq: u16) -> Arrival {
        let Some(highest) = self.highest else {
            self.highest = Some(FIRST_CYCLE + u64::from(seq));
            return Arrival::Advanced;
        };
        let Some(ext) = Self::unwrap_seq(highest, seq) else {
            return Arrival::Ignored;
        };

        if ext > highest {
            // positions older than the window are not worth requesting
            let oldest = (ext + 1).saturating_sub(self.size);
            for lost in (highest + 1).max(oldest)..ext {
                self.missing.insert(lost, 0);
            }
            self.missing = self.missing.split_off(&oldest);
            self.highest = Some(ext);
            Arrival::Advanced
        } else {
            self.fill(ext)
        }
    }

    /// A retransmission for `osn` arrived on the RTX SSRC.
    ///
    /// Repairs only close gaps. A retransmission never moves the window,
    /// so an OSN at or ahead of the highest primary packet is ignored.
    pub(crate) fn repair(&mut self, osn: u16) -> Arrival {
        match self
            .highest
            .and_then(|highest| Self::unwrap_seq(highest, osn).filter(|&ext| ext < highest))
        {
            Some(ext) => self.fill(ext),
            None => Arrival::Ignored,
        }
    }

    fn fill(&mut self, ext: u64) -> Arrival {
        if self.missing.remove(&ext).is_some() {
            Arrival::Filled
        } else {
            Arrival::Ignored
        }
    }

    /// Missing sequence numbers to request on this tick, oldest first.
    ///
    /// The newest `skip_last_n` positions are left alone as they may only
    /// be reordered. Each returned number has its request count bumped;
    /// numbers already requested `max_requests` times are skipped
    /// (0 = unlimited) but stay tracked until filled or out of the window.
    pub(crate) fn due(&mut self, skip_last_n: u16, max_requests: u16) -> Vec<u16> {
        let Some(highest) = self.highest else {
            return vec![];
        };
        let until = highest.saturating_sub(u64::from(skip_last_n));

        let mut due = vec![];
        for (&ext, requests) in self.missing.range_mut(..=until) {
            if max_requests > 0 && *requests >= max_requests {
                continue;
            }
            *requests += 1;
            due.push(ext as u16);
        }
        due
    }
}
