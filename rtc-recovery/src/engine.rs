//! Loss-Recovery Engine - sans-IO front end for all bound remote streams.

use crate::config::RecoveryConfig;
use crate::error::{Error, Result};
use crate::nack::NackPolicy;
use crate::rtx::{CorrelatedPacket, RtxEvent};
use crate::stats::StreamStats;
use crate::stream::Stream;
use crate::stream_info::StreamInfo;
use bytes::Bytes;
use log::{debug, trace};
use shared::marshal::Unmarshal;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// A message with the time it was received or produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedMessage<T> {
    pub now: Instant,
    pub message: T,
}

/// Raw datagram read from the media transport.
pub type TaggedBytes = TaggedMessage<Bytes>;
/// Packet handed on to the playout side.
pub type TaggedRecovered = TaggedMessage<Recovered>;
/// Feedback to be written towards the media sender.
pub type TaggedFeedback = TaggedMessage<Vec<Box<dyn rtcp::Packet>>>;

/// Parses one RTP datagram. Only version 2 is accepted.
pub(crate) fn unmarshal_rtp(raw: &Bytes) -> Result<rtp::Packet> {
    if let Some(&first) = raw.first()
        && first >> 6 != 2
    {
        return Err(Error::ErrUnsupportedRtpVersion(first >> 6));
    }
    let mut buf = raw.clone();
    Ok(rtp::Packet::unmarshal(&mut buf)?)
}

/// What the engine passes on for each accepted inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovered {
    /// A packet on a primary SSRC, passed through unchanged.
    Media(rtp::Packet),
    /// A retransmission correlated with the primary stream `ssrc`.
    Retransmission { ssrc: u32, packet: CorrelatedPacket },
    /// A padding-only packet on the RTX stream of `ssrc`. Informational;
    /// carries no media.
    PaddingProbe { ssrc: u32, rtx_seq: u16 },
}

impl Recovered {
    /// SSRC of the primary stream the packet belongs to.
    pub fn ssrc(&self) -> u32 {
        match self {
            Recovered::Media(packet) => packet.header.ssrc,
            Recovered::Retransmission { ssrc, .. } | Recovered::PaddingProbe { ssrc, .. } => *ssrc,
        }
    }
}

/// Builder for the [`RecoveryEngine`].
///
/// # Example
///
/// ```
/// use rtc_recovery::{NackPolicy, RecoveryEngineBuilder};
/// use std::time::Duration;
///
/// let engine = RecoveryEngineBuilder::new()
///     .with_policy(NackPolicy::Precise)
///     .with_interval(Duration::from_millis(100))
///     .with_receive_log_size(1024)
///     .build()
///     .unwrap();
/// assert_eq!(engine.config().receive_log_size, 1024);
/// ```
#[derive(Default)]
pub struct RecoveryEngineBuilder {
    config: RecoveryConfig,
    sender_ssrc: Option<u32>,
}

impl RecoveryEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every setting at once, e.g. with a deserialized config.
    pub fn with_config(mut self, config: RecoveryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_policy(mut self, policy: NackPolicy) -> Self {
        self.config.policy = policy;
        self
    }

    /// Set the NACK interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.config.nack_interval = interval;
        self
    }

    /// Set the loss window size used by the precise policy.
    ///
    /// Size must be a power of 2 between 64 and 32768 (inclusive).
    pub fn with_receive_log_size(mut self, size: u16) -> Self {
        self.config.receive_log_size = size;
        self
    }

    pub fn with_skip_last_n(mut self, skip_last_n: u16) -> Self {
        self.config.skip_last_n = skip_last_n;
        self
    }

    /// Set to 0 (default) for unlimited NACKs.
    pub fn with_max_nacks_per_packet(mut self, max: u16) -> Self {
        self.config.max_nacks_per_packet = max;
        self
    }

    /// SSRC placed in the sender field of generated feedback. Random when
    /// not set.
    pub fn with_sender_ssrc(mut self, ssrc: u32) -> Self {
        self.sender_ssrc = Some(ssrc);
        self
    }

    pub fn build(self) -> Result<RecoveryEngine> {
        self.config.validate()?;
        Ok(RecoveryEngine::new(
            self.config,
            self.sender_ssrc.unwrap_or_else(rand::random::<u32>),
        ))
    }
}

/// Sans-IO loss recovery for the remote streams of one session.
///
/// Feed raw RTP datagrams to [`handle_read`](sansio::Protocol::handle_read),
/// drain media with [`poll_read`](sansio::Protocol::poll_read) and NACKs with
/// [`poll_write`](sansio::Protocol::poll_write). Under
/// [`NackPolicy::Precise`] the caller also drives
/// [`handle_timeout`](sansio::Protocol::handle_timeout) at
/// [`poll_timeout`](sansio::Protocol::poll_timeout).
pub struct RecoveryEngine {
    config: RecoveryConfig,
    sender_ssrc: u32,

    /// Bound streams by primary SSRC
    streams: HashMap<u32, Stream>,
    /// RTX SSRC to primary SSRC
    rtx_index: HashMap<u32, u32>,

    /// Next precise policy tick
    eto: Instant,

    read_queue: VecDeque<TaggedRecovered>,
    write_queue: VecDeque<TaggedFeedback>,
}

impl RecoveryEngine {
    fn new(config: RecoveryConfig, sender_ssrc: u32) -> Self {
        Self {
            config,
            sender_ssrc,
            streams: HashMap::new(),
            rtx_index: HashMap::new(),
            eto: Instant::now(),
            read_queue: VecDeque::new(),
            write_queue: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn sender_ssrc(&self) -> u32 {
        self.sender_ssrc
    }

    /// Starts recovery for a remote stream. Binding an SSRC again replaces
    /// the previous stream and resets its state.
    ///
    /// Fails with [`Error::ErrRtxSsrcInUse`] if the RTX SSRC of `info`
    /// already belongs to another bound stream, or if `info.ssrc` is the
    /// RTX SSRC of one.
    pub fn bind_remote_stream(&mut self, info: &StreamInfo) -> Result<()> {
        if let Some(&owner) = self.rtx_index.get(&info.ssrc)
            && owner != info.ssrc
        {
            return Err(Error::ErrRtxSsrcInUse {
                rtx_ssrc: info.ssrc,
                ssrc: owner,
            });
        }
        if let Some(rtx_ssrc) = info.rtx_ssrc() {
            let owner = self.rtx_index.get(&rtx_ssrc).copied().or_else(|| {
                (rtx_ssrc != info.ssrc && self.streams.contains_key(&rtx_ssrc)).then_some(rtx_ssrc)
            });
            if let Some(owner) = owner
                && owner != info.ssrc
            {
                return Err(Error::ErrRtxSsrcInUse {
                    rtx_ssrc,
                    ssrc: owner,
                });
            }
        }

        let stream = Stream::new(info, &self.config, self.sender_ssrc)?;
        self.unbind_remote_stream(info.ssrc);

        if let Some(rtx) = stream.rtx.as_ref() {
            self.rtx_index.insert(rtx.ssrc(), info.ssrc);
        }
        debug!(
            "bind {} stream ssrc={} rtx={:?}",
            info.kind,
            info.ssrc,
            info.rtx_ssrc()
        );
        self.streams.insert(info.ssrc, stream);
        Ok(())
    }

    /// Stops recovery for a remote stream, returning its final counters.
    pub fn unbind_remote_stream(&mut self, ssrc: u32) -> Option<StreamStats> {
        let stream = self.streams.remove(&ssrc)?;
        if let Some(rtx) = stream.rtx.as_ref() {
            self.rtx_index.remove(&rtx.ssrc());
        }
        debug!("unbind stream ssrc={ssrc}");
        Some(stream.stats())
    }

    pub fn stats(&self, ssrc: u32) -> Result<StreamStats> {
        self.streams
            .get(&ssrc)
            .map(Stream::stats)
            .ok_or(Error::ErrStreamNotBound(ssrc))
    }

    pub fn stream_info(&self, ssrc: u32) -> Option<&StreamInfo> {
        self.streams.get(&ssrc).map(|s| &s.info)
    }

    fn handle_rtp(&mut self, now: Instant, packet: rtp::Packet) {
        let ssrc = packet.header.ssrc;

        if let Some(stream) = self.streams.get_mut(&ssrc) {
            if let Some(nack) = stream.primary.receive(now, packet.header.sequence_number) {
                self.write_queue.push_back(TaggedMessage {
                    now,
                    message: vec![Box::new(nack)],
                });
            }
            self.read_queue.push_back(TaggedMessage {
                now,
                message: Recovered::Media(packet),
            });
            return;
        }

        let Some(stream) = self
            .rtx_index
            .get(&ssrc)
            .and_then(|primary| self.streams.get_mut(primary))
        else {
            trace!("ignoring packet for unbound ssrc={ssrc}");
            return;
        };
        let Some(rtx) = stream.rtx.as_mut() else {
            return;
        };

        // malformed payloads are counted by the correlator
        let Ok(event) = rtx.ingest_rtp(&packet) else {
            return;
        };
        let primary_ssrc = stream.primary.ssrc();
        let message = match event {
            RtxEvent::Retransmission(correlated) => {
                stream.primary.recovered(correlated.original_seq);
                Recovered::Retransmission {
                    ssrc: primary_ssrc,
                    packet: correlated,
                }
            }
            RtxEvent::PaddingProbe { rtx_seq } => Recovered::PaddingProbe {
                ssrc: primary_ssrc,
                rtx_seq,
            },
        };
        self.read_queue.push_back(TaggedMessage { now, message });
    }

    /// Attributes an unparseable datagram to its stream, if the SSRC field
    /// can still be read.
    fn handle_malformed(&mut self, raw: &[u8], err: &Error) {
        let Some(ssrc) = peek_ssrc(raw) else {
            debug!("dropping malformed packet: {err}");
            return;
        };
        if let Some(stream) = self.streams.get_mut(&ssrc) {
            stream.primary.malformed();
        } else if let Some(rtx) = self
            .rtx_index
            .get(&ssrc)
            .and_then(|primary| self.streams.get_mut(primary))
            .and_then(|stream| stream.rtx.as_mut())
        {
            rtx.malformed();
        }
        debug!("dropping malformed packet on ssrc={ssrc}: {err}");
    }
}

fn peek_ssrc(raw: &[u8]) -> Option<u32> {
    let ssrc: [u8; 4] = raw.get(8..12)?.try_into().ok()?;
    Some(u32::from_be_bytes(ssrc))
}

impl sansio::Protocol<TaggedBytes, (), ()> for RecoveryEngine {
    type Rout = TaggedRecovered;
    type Wout = TaggedFeedback;
    type Eout = ();
    type Error = Error;
    type Time = Instant;

    fn handle_read(&mut self, msg: TaggedBytes) -> Result<()> {
        match unmarshal_rtp(&msg.message) {
            Ok(packet) => self.handle_rtp(msg.now, packet),
            Err(err) => self.handle_malformed(&msg.message, &err),
        }
        Ok(())
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        self.read_queue.pop_front()
    }

    fn handle_write(&mut self, _msg: ()) -> Result<()> {
        Ok(())
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        self.write_queue.pop_front()
    }

    fn handle_event(&mut self, _evt: ()) -> Result<()> {
        Ok(())
    }

    fn poll_event(&mut self) -> Option<Self::Eout> {
        None
    }

    fn handle_timeout(&mut self, now: Self::Time) -> Result<()> {
        if self.config.policy != NackPolicy::Precise || self.eto > now {
            return Ok(());
        }
        self.eto = now + self.config.nack_interval;

        for stream in self.streams.values_mut() {
            if let Some(nack) = stream.primary.tick() {
                self.write_queue.push_back(TaggedMessage {
                    now,
                    message: vec![Box::new(nack)],
                });
            }
        }
        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<Self::Time> {
        (self.config.policy == NackPolicy::Precise).then_some(self.eto)
    }

    fn close(&mut self) -> Result<()> {
        self.streams.clear();
        self.rtx_index.clear();
        self.read_queue.clear();
        self.write_queue.clear();
        Ok(())
    }
}
