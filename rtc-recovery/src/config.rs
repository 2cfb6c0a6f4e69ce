//! Loss recovery configuration.

use crate::error::{Error, Result};
use crate::nack::NackPolicy;
use crate::nack::loss_window::LossWindow;
use crate::nack::scheduler::DEFAULT_NACK_INTERVAL;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_RECEIVE_LOG_SIZE: u16 = 512;
pub const DEFAULT_FEEDBACK_RETRIES: u32 = 3;
pub const DEFAULT_FEEDBACK_CHANNEL_CAPACITY: usize = 64;

/// Settings shared by every stream of a [`RecoveryEngine`](crate::RecoveryEngine)
/// or a [`Session`](crate::session::Session).
///
/// Missing fields take their defaults when deserializing, so a partial
/// document such as `{"policy": "precise"}` is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub policy: NackPolicy,
    /// Minimum spacing between NACKs on one stream (interval policy), or
    /// the tick at which missing packets are requested (precise policy).
    pub nack_interval: Duration,
    /// How far back the precise policy tracks gaps, in sequence numbers.
    /// Power of 2, 64..=32768.
    pub receive_log_size: u16,
    /// Newest positions the precise policy leaves alone, as they may only
    /// be reordered.
    pub skip_last_n: u16,
    /// How often the precise policy requests one sequence number
    /// (0 = unlimited).
    pub max_nacks_per_packet: u16,
    /// Extra attempts after a failed feedback write before it is dropped.
    pub feedback_retries: u32,
    pub feedback_channel_capacity: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            policy: NackPolicy::Interval,
            nack_interval: DEFAULT_NACK_INTERVAL,
            receive_log_size: DEFAULT_RECEIVE_LOG_SIZE,
            skip_last_n: 0,
            max_nacks_per_packet: 0,
            feedback_retries: DEFAULT_FEEDBACK_RETRIES,
            feedback_channel_capacity: DEFAULT_FEEDBACK_CHANNEL_CAPACITY,
        }
    }
}

impl RecoveryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.nack_interval.is_zero() {
            return Err(Error::ErrZeroNackInterval);
        }
        if !LossWindow::is_valid_size(self.receive_log_size) {
            return Err(Error::ErrInvalidReceiveLogSize(self.receive_log_size));
        }
        if self.feedback_channel_capacity == 0 {
            return Err(Error::ErrZeroFeedbackCapacity);
        }
        Ok(())
    }
}
