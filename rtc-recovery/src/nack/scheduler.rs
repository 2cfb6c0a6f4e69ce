//! NACK Scheduler - rate limits retransmission requests per stream.

use super::RecoveryRequest;
use crate::codec::RtpCodecKind;
use std::time::{Duration, Instant};

/// Default minimum spacing between two requests on one stream.
pub const DEFAULT_NACK_INTERVAL: Duration = Duration::from_secs(1);

/// Decides whether a suspected loss is worth a retransmission request.
///
/// A scheduler belongs to exactly one stream. It emits at most one
/// [`RecoveryRequest`] per `interval`; the first eligible call after
/// creation always emits. Schedulers of audio streams never emit.
#[derive(Debug, Clone)]
pub struct NackScheduler {
    kind: RtpCodecKind,
    interval: Duration,
    last_feedback_time: Option<Instant>,
}

impl NackScheduler {
    pub fn new(kind: RtpCodecKind, interval: Duration) -> Self {
        Self {
            kind,
            interval,
            last_feedback_time: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// When the last request was emitted, if ever.
    pub fn last_feedback_time(&self) -> Option<Instant> {
        self.last_feedback_time
    }

    /// Returns a request for `seq` on `ssrc` if the stream is video and
    /// more than `interval` has passed since the previous request.
    pub fn maybe_request_retransmission(
        &mut self,
        now: Instant,
        ssrc: u32,
        seq: u16,
    ) -> Option<RecoveryRequest> {
        if self.kind != RtpCodecKind::Video {
            return None;
        }

        if let Some(last) = self.last_feedback_time
            && now.saturating_duration_since(last) <= self.interval
        {
            return None;
        }

        self.last_feedback_time = Some(now);
        Some(RecoveryRequest { ssrc, lost_seq: seq })
    }
}
