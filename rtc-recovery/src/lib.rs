//! RTC Recovery - RTP loss recovery with NACK and RTX.
//!
//! This crate repairs packet loss on received RTP streams. It detects gaps in
//! sequence numbers, asks the sender to retransmit with RTCP Generic NACKs
//! (RFC 4585), and maps retransmissions arriving on an RTX stream (RFC 4588)
//! back to the packets they repair.
//!
//! # Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`SequenceTracker`] | Highest sequence number seen per stream, under 16-bit wraparound |
//! | [`NackScheduler`] | At most one retransmission request per stream per interval, video only |
//! | [`RtxCorrelator`] | Decodes the original sequence number (OSN) of RTX packets and detects padding probes |
//! | [`RecoveryEngine`] | Sans-IO [`sansio::Protocol`] front end over all bound streams |
//! | [`Session`] | Task-per-stream runtime on tokio with a single feedback writer |
//! | [`IntervalPli`] | Periodic keyframe requests (Picture Loss Indication) |
//!
//! # NACK policies
//!
//! | Policy | Behavior |
//! |--------|----------|
//! | [`NackPolicy::Interval`] | A forward jump of more than one sequence number is suspected loss; the packet that revealed it is requested, rate limited per stream |
//! | [`NackPolicy::Precise`] | A loss window tracks every missing sequence number until a late packet or an RTX repair fills it; each interval tick requests the open gaps in one NACK |
//!
//! Audio streams never produce NACKs.
//!
//! # Quick Start
//!
//! ```
//! use bytes::Bytes;
//! use rtc_recovery::shared::marshal::Marshal;
//! use rtc_recovery::{MediaEngine, RecoveryEngineBuilder, Recovered, TaggedMessage, rtp};
//! use sansio::Protocol;
//! use std::time::Instant;
//!
//! # fn main() -> rtc_recovery::Result<()> {
//! // VP8 on 96, RTX on 97 (apt=96), Opus on 111
//! let media = MediaEngine::with_default_codecs()?;
//!
//! let mut engine = RecoveryEngineBuilder::new().build()?;
//! engine.bind_remote_stream(&media.stream_info(0x1111, 96, Some(0x2222))?)?;
//!
//! for seq in [1u16, 2, 4] {
//!     let raw = rtp::Packet {
//!         header: rtp::Header {
//!             version: 2,
//!             payload_type: 96,
//!             sequence_number: seq,
//!             ssrc: 0x1111,
//!             ..Default::default()
//!         },
//!         payload: Bytes::from_static(b"frame"),
//!     }
//!     .marshal()?
//!     .freeze();
//!     engine.handle_read(TaggedMessage { now: Instant::now(), message: raw })?;
//! }
//!
//! // media is passed through unchanged
//! while let Some(out) = engine.poll_read() {
//!     assert!(matches!(out.message, Recovered::Media(_)));
//! }
//!
//! // the jump from 2 to 4 produced one NACK
//! let feedback = engine.poll_write().expect("nack");
//! assert_eq!(feedback.message.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! # Stream Binding
//!
//! Streams are described by a [`StreamInfo`], normally built from the
//! negotiated codecs with [`MediaEngine::stream_info`]. A stream gets an RTX
//! correlator only if an RTX codec names its payload type with `apt=N` and
//! the remote announced an RTX SSRC. Packets for unbound SSRCs are ignored.
//!
//! RTP and RTCP parsing comes from the `rtp`, `rtcp` and `shared` crates,
//! re-exported here so callers build packets against the same versions.

#![warn(rust_2018_idioms)]

pub use {rtcp, rtp, shared};

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod keyframe;
pub mod nack;
pub mod rtx;
pub mod sequence;
pub mod session;
pub(crate) mod stats;
pub(crate) mod stream;
pub(crate) mod stream_info;

pub use codec::{MediaEngine, PayloadType, RTCRtpCodec, RTCRtpCodecParameters, RtpCodecKind};
pub use config::RecoveryConfig;
pub use engine::{
    Recovered, RecoveryEngine, RecoveryEngineBuilder, TaggedBytes, TaggedFeedback, TaggedMessage,
    TaggedRecovered,
};
pub use error::{Error, Result};
pub use keyframe::{IntervalPli, KeyframeRequester};
pub use nack::{NackPolicy, NackScheduler, RecoveryRequest, nacked_sequence_numbers};
pub use rtx::{CorrelatedPacket, RtxCorrelator, RtxEvent, RtxPacket, RtxStats};
pub use sequence::{Observation, SequenceTracker};
pub use session::{FeedbackWriter, PacketSource, Session, StreamHandle};
pub use stats::StreamStats;
pub use stream_info::{AssociatedStreamInfo, StreamInfo};
