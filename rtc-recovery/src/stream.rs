//! Per-stream recovery state.
//!
//! A bound remote stream is split in two halves that never share mutable
//! state: the [`PrimaryReceiver`] (sequence tracking and NACK decisions) and
//! an optional [`RtxCorrelator`]. The sans-IO engine keeps both in one
//! [`Stream`]; the session runtime moves each half into its own task.

use crate::codec::RtpCodecKind;
use crate::config::RecoveryConfig;
use crate::error::Result;
use crate::nack::precise::PreciseNack;
use crate::nack::{NackPolicy, NackScheduler, nacked_sequence_numbers};
use crate::rtx::{RtxCorrelator, RtxStats};
use crate::sequence::SequenceTracker;
use crate::stats::StreamStats;
use crate::stream_info::StreamInfo;
use log::{debug, trace};
use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use std::time::Instant;

pub(crate) struct PrimaryReceiver {
    ssrc: u32,
    sender_ssrc: u32,
    tracker: SequenceTracker,
    scheduler: NackScheduler,
    /// Present only for video streams under the precise policy.
    precise: Option<PreciseNack>,
    stats: StreamStats,
}

impl PrimaryReceiver {
    pub(crate) fn new(info: &StreamInfo, config: &RecoveryConfig, sender_ssrc: u32) -> Result<Self> {
        let precise = if config.policy == NackPolicy::Precise && info.kind == RtpCodecKind::Video {
            Some(PreciseNack::new(
                config.receive_log_size,
                config.skip_last_n,
                config.max_nacks_per_packet,
            )?)
        } else {
            None
        };

        Ok(Self {
            ssrc: info.ssrc,
            sender_ssrc,
            tracker: SequenceTracker::new(info.kind),
            scheduler: NackScheduler::new(info.kind, config.nack_interval),
            precise,
            stats: StreamStats::default(),
        })
    }

    pub(crate) fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub(crate) fn stats(&self) -> StreamStats {
        self.stats
    }

    pub(crate) fn is_precise(&self) -> bool {
        self.precise.is_some()
    }

    /// Accounts for one packet on the primary SSRC. Under the interval
    /// policy a suspected loss may produce a NACK immediately.
    pub(crate) fn receive(&mut self, now: Instant, seq: u16) -> Option<TransportLayerNack> {
        self.stats.packets_received += 1;

        let observation = self.tracker.observe(seq);
        if !observation.is_new {
            self.stats.duplicate_packets += 1;
            trace!("ssrc={} seq={}: duplicate or late", self.ssrc, seq);
        }

        if observation.is_video_loss_suspected {
            self.stats.suspected_losses += 1;
        }

        if let Some(precise) = self.precise.as_mut() {
            precise.receive(seq);
            return None;
        }

        if !observation.is_video_loss_suspected {
            return None;
        }

        let request = self
            .scheduler
            .maybe_request_retransmission(now, self.ssrc, seq)?;
        let nack = request.to_nack(self.sender_ssrc);
        self.count_nack(&nack);
        debug!("ssrc={}: requesting retransmission of {}", self.ssrc, seq);
        Some(nack)
    }

    /// A retransmission for `original_seq` arrived on the RTX stream.
    pub(crate) fn recovered(&mut self, original_seq: u16) {
        if let Some(precise) = self.precise.as_mut()
            && !precise.repair(original_seq)
        {
            trace!(
                "ssrc={} seq={}: retransmission of a packet not outstanding",
                self.ssrc, original_seq
            );
        }
    }

    pub(crate) fn malformed(&mut self) {
        self.stats.malformed_packets += 1;
    }

    /// Periodic tick of the precise policy.
    pub(crate) fn tick(&mut self) -> Option<TransportLayerNack> {
        let nack = self
            .precise
            .as_mut()?
            .generate(self.sender_ssrc, self.ssrc)?;
        self.count_nack(&nack);
        debug!(
            "ssrc={}: requesting retransmission of {:?}",
            self.ssrc,
            nacked_sequence_numbers(&nack)
        );
        Some(nack)
    }

    fn count_nack(&mut self, nack: &TransportLayerNack) {
        self.stats.nacks_sent += 1;
        self.stats.sequence_numbers_nacked += nacked_sequence_numbers(nack).len() as u64;
    }
}

/// Everything the engine keeps for one bound remote stream.
pub(crate) struct Stream {
    pub(crate) info: StreamInfo,
    pub(crate) primary: PrimaryReceiver,
    pub(crate) rtx: Option<RtxCorrelator>,
}

impl Stream {
    pub(crate) fn new(info: &StreamInfo, config: &RecoveryConfig, sender_ssrc: u32) -> Result<Self> {
        Ok(Self {
            info: info.clone(),
            primary: PrimaryReceiver::new(info, config, sender_ssrc)?,
            rtx: RtxCorrelator::new(info),
        })
    }

    pub(crate) fn stats(&self) -> StreamStats {
        merge_rtx_stats(
            self.primary.stats(),
            self.rtx.as_ref().map(|rtx| rtx.stats()).unwrap_or_default(),
        )
    }
}

/// Folds the counters of an RTX correlator into its primary stream's.
pub(crate) fn merge_rtx_stats(mut stats: StreamStats, rtx: RtxStats) -> StreamStats {
    stats.retransmissions_received = rtx.retransmissions;
    stats.padding_probes_received = rtx.padding_probes;
    stats.malformed_packets += rtx.malformed;
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn info(kind: RtpCodecKind) -> StreamInfo {
        StreamInfo {
            ssrc: 0x1111,
            kind,
            ..Default::default()
        }
    }

    #[test]
    fn test_primary_receiver_gap_sequence() -> Result<()> {
        let config = RecoveryConfig::default();
        let mut rx = PrimaryReceiver::new(&info(RtpCodecKind::Video), &config, 9)?;
        let t0 = Instant::now();

        assert!(rx.receive(t0, 1).is_none());
        assert!(rx.receive(t0 + Duration::from_millis(100), 2).is_none());
        let nack = rx
            .receive(t0 + Duration::from_millis(200), 4)
            .expect("gap before 4");
        assert_eq!(nack.sender_ssrc, 9);
        assert_eq!(nack.media_ssrc, 0x1111);
        assert_eq!(nacked_sequence_numbers(&nack), vec![4]);
        assert!(rx.receive(t0 + Duration::from_millis(300), 5).is_none());

        let stats = rx.stats();
        assert_eq!(stats.packets_received, 4);
        assert_eq!(stats.suspected_losses, 1);
        assert_eq!(stats.nacks_sent, 1);
        assert_eq!(stats.sequence_numbers_nacked, 1);

        Ok(())
    }

    #[test]
    fn test_primary_receiver_rate_limited_suspicion() -> Result<()> {
        let config = RecoveryConfig::default();
        let mut rx = PrimaryReceiver::new(&info(RtpCodecKind::Video), &config, 9)?;
        let t0 = Instant::now();

        rx.receive(t0, 1);
        assert!(rx.receive(t0, 3).is_some());
        // still inside the interval
        assert!(rx.receive(t0 + Duration::from_millis(500), 6).is_none());
        assert_eq!(rx.stats().suspected_losses, 2);
        assert_eq!(rx.stats().nacks_sent, 1);

        Ok(())
    }

    #[test]
    fn test_primary_receiver_audio_never_nacks() -> Result<()> {
        for policy in [NackPolicy::Interval, NackPolicy::Precise] {
            let config = RecoveryConfig {
                policy,
                ..Default::default()
            };
            let mut rx = PrimaryReceiver::new(&info(RtpCodecKind::Audio), &config, 9)?;
            assert!(!rx.is_precise());

            let t0 = Instant::now();
            for (i, seq) in [1u16, 5, 9, 20].into_iter().enumerate() {
                assert!(rx.receive(t0 + Duration::from_secs(2 * i as u64), seq).is_none());
            }
            assert!(rx.tick().is_none());
            assert_eq!(rx.stats().suspected_losses, 0);
        }
        Ok(())
    }

    #[test]
    fn test_primary_receiver_precise_policy() -> Result<()> {
        let config = RecoveryConfig {
            policy: NackPolicy::Precise,
            ..Default::default()
        };
        let mut rx = PrimaryReceiver::new(&info(RtpCodecKind::Video), &config, 9)?;
        let now = Instant::now();

        for seq in [1u16, 2, 4, 7] {
            assert!(rx.receive(now, seq).is_none());
        }
        let nack = rx.tick().expect("missing packets");
        assert_eq!(nacked_sequence_numbers(&nack), vec![3, 5, 6]);

        rx.recovered(3);
        rx.recovered(5);
        rx.receive(now, 6);
        assert!(rx.tick().is_none());

        let stats = rx.stats();
        assert_eq!(stats.duplicate_packets, 1);
        assert_eq!(stats.sequence_numbers_nacked, 3);

        Ok(())
    }

    #[test]
    fn test_primary_receiver_precise_counts_suspected_losses() -> Result<()> {
        let config = RecoveryConfig {
            policy: NackPolicy::Precise,
            ..Default::default()
        };
        let mut rx = PrimaryReceiver::new(&info(RtpCodecKind::Video), &config, 9)?;
        let now = Instant::now();

        for seq in [1u16, 2, 4, 5, 9] {
            assert!(rx.receive(now, seq).is_none());
        }
        // a late packet filling a gap is not a new suspicion
        rx.receive(now, 3);

        let stats = rx.stats();
        assert_eq!(stats.suspected_losses, 2);
        assert_eq!(stats.nacks_sent, 0);

        Ok(())
    }

    #[test]
    fn test_stream_gets_correlator_only_with_rtx() -> Result<()> {
        let config = RecoveryConfig::default();
        let mut video = info(RtpCodecKind::Video);
        assert!(Stream::new(&video, &config, 1)?.rtx.is_none());

        video.associated_stream = Some(crate::stream_info::AssociatedStreamInfo {
            ssrc: 0x2222,
            payload_type: 97,
        });
        let stream = Stream::new(&video, &config, 1)?;
        assert_eq!(stream.rtx.as_ref().map(|rtx| rtx.ssrc()), Some(0x2222));

        Ok(())
    }

    #[test]
    fn test_merge_rtx_stats() {
        let primary = StreamStats {
            packets_received: 10,
            malformed_packets: 1,
            ..Default::default()
        };
        let rtx = RtxStats {
            retransmissions: 3,
            padding_probes: 2,
            malformed: 1,
        };
        let merged = merge_rtx_stats(primary, rtx);
        assert_eq!(merged.packets_received, 10);
        assert_eq!(merged.retransmissions_received, 3);
        assert_eq!(merged.padding_probes_received, 2);
        assert_eq!(merged.malformed_packets, 2);
    }
}
