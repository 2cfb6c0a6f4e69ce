//! Keyframe request policy.
//!
//! Loss recovery repairs individual packets; a decoder that is already out
//! of sync needs a new keyframe instead. A [`KeyframeRequester`] decides when
//! to ask for one with a Picture Loss Indication (RFC 4585 §6.3.1). The
//! engine does not drive it; the embedding runtime polls it alongside the
//! media loop.

use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use std::time::{Duration, Instant};

pub const DEFAULT_PLI_INTERVAL: Duration = Duration::from_secs(3);

pub trait KeyframeRequester {
    /// Returns a PLI if one is due at `now`.
    fn poll_request(&mut self, now: Instant) -> Option<PictureLossIndication>;

    /// When the next request falls due, if it is scheduled.
    fn poll_timeout(&self) -> Option<Instant>;
}

/// Requests a keyframe at a fixed interval, starting with the first poll.
///
/// Periodic keyframes make a stream seekable and bound how long a decoder
/// stays broken after unrepaired loss, at the cost of bitrate.
#[derive(Debug, Clone)]
pub struct IntervalPli {
    sender_ssrc: u32,
    media_ssrc: u32,
    interval: Duration,
    next: Option<Instant>,
}

impl IntervalPli {
    pub fn new(sender_ssrc: u32, media_ssrc: u32) -> Self {
        Self::with_interval(sender_ssrc, media_ssrc, DEFAULT_PLI_INTERVAL)
    }

    pub fn with_interval(sender_ssrc: u32, media_ssrc: u32, interval: Duration) -> Self {
        Self {
            sender_ssrc,
            media_ssrc,
            interval,
            next: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl KeyframeRequester for IntervalPli {
    fn poll_request(&mut self, now: Instant) -> Option<PictureLossIndication> {
        if let Some(next) = self.next
            && now < next
        {
            return None;
        }

        self.next = Some(now + self.interval);
        Some(PictureLossIndication {
            sender_ssrc: self.sender_ssrc,
            media_ssrc: self.media_ssrc,
        })
    }

    fn poll_timeout(&self) -> Option<Instant> {
        self.next
    }
}
