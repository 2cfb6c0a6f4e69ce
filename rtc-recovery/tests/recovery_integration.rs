//! Integration tests for the sans-IO recovery engine.
//!
//! These tests verify that the engine correctly:
//! - Requests retransmission of video packets after a sequence gap
//! - Never requests retransmission for audio
//! - Correlates RTX retransmissions and padding probes with the primary stream
//! - Serializes NACKs in the Generic NACK wire format
//! - Requests every missing packet under the precise policy

use bytes::Bytes;
use rtc_recovery::rtcp::{
    self,
    transport_feedbacks::transport_layer_nack::{NackPair, TransportLayerNack},
};
use rtc_recovery::shared::marshal::Marshal;
use rtc_recovery::{
    MediaEngine, NackPolicy, Recovered, RecoveryEngine, RecoveryEngineBuilder, StreamInfo,
    TaggedBytes, TaggedMessage, rtp,
};
use sansio::Protocol;
use std::time::{Duration, Instant};

// =============================================================================
// Helper Functions
// =============================================================================

const VIDEO_SSRC: u32 = 0x1111;
const RTX_SSRC: u32 = 0x2222;
const AUDIO_SSRC: u32 = 0x3333;
const SENDER_SSRC: u32 = 0xfeed;

fn rtp_bytes(ssrc: u32, payload_type: u8, seq: u16, payload: &[u8]) -> Bytes {
    rtp::Packet {
        header: rtp::Header {
            version: 2,
            payload_type,
            sequence_number: seq,
            timestamp: seq as u32 * 3000,
            ssrc,
            ..Default::default()
        },
        payload: Bytes::copy_from_slice(payload),
    }
    .marshal()
    .unwrap()
    .freeze()
}

/// RTX packet carrying `osn` ahead of `payload`.
fn rtx_bytes(rtx_seq: u16, osn: u16, payload: &[u8]) -> Bytes {
    let mut body = osn.to_be_bytes().to_vec();
    body.extend_from_slice(payload);
    rtp_bytes(RTX_SSRC, 97, rtx_seq, &body)
}

/// RTX packet with no payload, only RTP padding.
fn rtx_padding_bytes(rtx_seq: u16) -> Bytes {
    rtp::Packet {
        header: rtp::Header {
            version: 2,
            padding: true,
            payload_type: 97,
            sequence_number: rtx_seq,
            ssrc: RTX_SSRC,
            ..Default::default()
        },
        payload: Bytes::new(),
    }
    .marshal()
    .unwrap()
    .freeze()
}

fn at(now: Instant, message: Bytes) -> TaggedBytes {
    TaggedMessage { now, message }
}

fn media() -> MediaEngine {
    MediaEngine::with_default_codecs().unwrap()
}

fn video_info() -> StreamInfo {
    media().stream_info(VIDEO_SSRC, 96, Some(RTX_SSRC)).unwrap()
}

fn audio_info() -> StreamInfo {
    media().stream_info(AUDIO_SSRC, 111, None).unwrap()
}

fn engine(policy: NackPolicy, interval: Duration) -> RecoveryEngine {
    let mut engine = RecoveryEngineBuilder::new()
        .with_policy(policy)
        .with_interval(interval)
        .with_sender_ssrc(SENDER_SSRC)
        .build()
        .unwrap();
    engine.bind_remote_stream(&video_info()).unwrap();
    engine.bind_remote_stream(&audio_info()).unwrap();
    engine
}

fn drain_feedback(engine: &mut RecoveryEngine) -> Vec<Box<dyn rtcp::Packet>> {
    let mut out = vec![];
    while let Some(msg) = engine.poll_write() {
        out.extend(msg.message);
    }
    out
}

fn drain_recovered(engine: &mut RecoveryEngine) -> Vec<Recovered> {
    let mut out = vec![];
    while let Some(msg) = engine.poll_read() {
        out.push(msg.message);
    }
    out
}

fn as_nack(packet: &dyn rtcp::Packet) -> Option<&TransportLayerNack> {
    packet.as_any().downcast_ref::<TransportLayerNack>()
}

fn nacked_sequence_numbers(packets: &[Box<dyn rtcp::Packet>]) -> Vec<u16> {
    packets
        .iter()
        .filter_map(|p| as_nack(p.as_ref()))
        .flat_map(rtc_recovery::nacked_sequence_numbers)
        .collect()
}

// =============================================================================
// Interval policy
// =============================================================================

#[test]
fn test_gap_in_video_requests_exactly_once() {
    let mut engine = engine(NackPolicy::Interval, Duration::from_secs(1));
    let t0 = Instant::now();

    let arrivals = [(1u16, 0u64), (2, 100), (4, 200), (5, 300)];
    let mut nacks_at = vec![];
    for (seq, ms) in arrivals {
        engine
            .handle_read(at(
                t0 + Duration::from_millis(ms),
                rtp_bytes(VIDEO_SSRC, 96, seq, b"vp8"),
            ))
            .unwrap();
        while let Some(msg) = engine.poll_write() {
            nacks_at.push((msg.now, msg.message));
        }
    }

    assert_eq!(nacks_at.len(), 1, "exactly one NACK expected");
    let (when, packets) = &nacks_at[0];
    assert_eq!(*when, t0 + Duration::from_millis(200));
    assert_eq!(packets.len(), 1);
    assert_eq!(
        as_nack(packets[0].as_ref()),
        Some(&TransportLayerNack {
            sender_ssrc: SENDER_SSRC,
            media_ssrc: VIDEO_SSRC,
            nacks: vec![NackPair {
                packet_id: 4,
                lost_packets: 0,
            }],
        })
    );

    // every media packet was passed through
    let recovered = drain_recovered(&mut engine);
    assert_eq!(recovered.len(), 4);
    assert!(recovered.iter().all(|r| matches!(r, Recovered::Media(_))));

    let stats = engine.stats(VIDEO_SSRC).unwrap();
    assert_eq!(stats.packets_received, 4);
    assert_eq!(stats.suspected_losses, 1);
    assert_eq!(stats.nacks_sent, 1);
}

#[test]
fn test_nack_rate_limited_per_interval() {
    let interval = Duration::from_millis(500);
    let mut engine = engine(NackPolicy::Interval, interval);
    let t0 = Instant::now();

    // a gap on every packet
    let mut seq = 0u16;
    let mut emitted = vec![];
    for step in 0..=7u64 {
        let now = t0 + Duration::from_millis(step * 100);
        engine
            .handle_read(at(now, rtp_bytes(VIDEO_SSRC, 96, seq, b"x")))
            .unwrap();
        seq = seq.wrapping_add(2);
        if engine.poll_write().is_some() {
            emitted.push(step * 100);
        }
    }

    // first gap at 100ms, the next allowed only after more than 500ms
    assert_eq!(emitted, vec![100, 700]);
}

#[test]
fn test_audio_never_requests() {
    let mut engine = engine(NackPolicy::Interval, Duration::from_millis(10));
    let t0 = Instant::now();

    for (i, seq) in [1u16, 5, 50, 51, 1000].into_iter().enumerate() {
        engine
            .handle_read(at(
                t0 + Duration::from_secs(i as u64),
                rtp_bytes(AUDIO_SSRC, 111, seq, b"opus"),
            ))
            .unwrap();
    }

    assert!(drain_feedback(&mut engine).is_empty());
    let stats = engine.stats(AUDIO_SSRC).unwrap();
    assert_eq!(stats.packets_received, 5);
    assert_eq!(stats.suspected_losses, 0);
    assert_eq!(stats.nacks_sent, 0);
}

#[test]
fn test_wraparound_gap_is_detected() {
    let mut engine = engine(NackPolicy::Interval, Duration::from_secs(1));
    let now = Instant::now();

    for seq in [65534u16, 65535, 1] {
        engine
            .handle_read(at(now, rtp_bytes(VIDEO_SSRC, 96, seq, b"x")))
            .unwrap();
    }
    assert_eq!(nacked_sequence_numbers(&drain_feedback(&mut engine)), vec![1]);

    // a late packet from before the wrap is a duplicate, not a gap
    engine
        .handle_read(at(now, rtp_bytes(VIDEO_SSRC, 96, 0, b"x")))
        .unwrap();
    let stats = engine.stats(VIDEO_SSRC).unwrap();
    assert_eq!(stats.duplicate_packets, 1);
    assert_eq!(stats.suspected_losses, 1);
}

// =============================================================================
// RTX
// =============================================================================

#[test]
fn test_rtx_retransmission_then_padding_probe() {
    let mut engine = engine(NackPolicy::Interval, Duration::from_secs(1));
    let now = Instant::now();

    engine
        .handle_read(at(now, rtx_bytes(100, 4, b"X")))
        .unwrap();
    engine
        .handle_read(at(now, rtx_padding_bytes(101)))
        .unwrap();

    let recovered = drain_recovered(&mut engine);
    assert_eq!(recovered.len(), 2);

    let Recovered::Retransmission { ssrc, packet } = &recovered[0] else {
        panic!("expected retransmission, got {:?}", recovered[0]);
    };
    assert_eq!(*ssrc, VIDEO_SSRC);
    assert_eq!(packet.original_seq, 4);
    assert_eq!(packet.rtx_seq, 100);
    assert_eq!(packet.payload, Bytes::from_static(b"X"));

    assert_eq!(
        recovered[1],
        Recovered::PaddingProbe {
            ssrc: VIDEO_SSRC,
            rtx_seq: 101
        }
    );

    let stats = engine.stats(VIDEO_SSRC).unwrap();
    assert_eq!(stats.retransmissions_received, 1);
    assert_eq!(stats.padding_probes_received, 1);
    // neither counts as primary media
    assert_eq!(stats.packets_received, 0);
}

#[test]
fn test_rtx_rebuilds_original_packet() {
    let mut engine = engine(NackPolicy::Interval, Duration::from_secs(1));
    engine
        .handle_read(at(Instant::now(), rtx_bytes(7, 42, &[0xde, 0xad, 0xbe, 0xef])))
        .unwrap();

    let Some(Recovered::Retransmission { ssrc, packet }) =
        drain_recovered(&mut engine).into_iter().next()
    else {
        panic!("expected retransmission");
    };
    let info = engine.stream_info(ssrc).unwrap().clone();
    let original = packet.into_original(info.ssrc, info.payload_type);

    assert_eq!(original.header.ssrc, VIDEO_SSRC);
    assert_eq!(original.header.payload_type, 96);
    assert_eq!(original.header.sequence_number, 42);
    assert_eq!(original.header.timestamp, 7 * 3000);
    assert_eq!(&original.payload[..], &[0xde, 0xad, 0xbe, 0xef]);
}

#[test]
fn test_rtx_without_negotiation_is_ignored() {
    let mut engine = RecoveryEngineBuilder::new().build().unwrap();
    // video bound without an RTX ssrc
    engine
        .bind_remote_stream(&media().stream_info(VIDEO_SSRC, 96, None).unwrap())
        .unwrap();

    engine
        .handle_read(at(Instant::now(), rtx_bytes(100, 4, b"X")))
        .unwrap();

    assert!(drain_recovered(&mut engine).is_empty());
    assert_eq!(engine.stats(VIDEO_SSRC).unwrap().retransmissions_received, 0);
}

#[test]
fn test_unbind_removes_rtx_mapping() {
    let mut engine = engine(NackPolicy::Interval, Duration::from_secs(1));
    let stats = engine.unbind_remote_stream(VIDEO_SSRC).unwrap();
    assert_eq!(stats.packets_received, 0);

    engine
        .handle_read(at(Instant::now(), rtx_bytes(1, 1, b"X")))
        .unwrap();
    assert!(drain_recovered(&mut engine).is_empty());
    assert!(engine.stats(VIDEO_SSRC).is_err());
}

// =============================================================================
// Wire format
// =============================================================================

#[test]
fn test_nack_wire_format_parses_back() {
    let mut engine = engine(NackPolicy::Interval, Duration::from_secs(1));
    let now = Instant::now();
    for seq in [10u16, 13] {
        engine
            .handle_read(at(now, rtp_bytes(VIDEO_SSRC, 96, seq, b"x")))
            .unwrap();
    }

    let feedback = engine.poll_write().expect("nack");
    let raw = rtcp::packet::marshal(&feedback.message).unwrap().freeze();
    assert_eq!(raw.len(), 16);
    // v=2, FMT=1, RTPFB, length=3
    assert_eq!(&raw[..4], &[0x81, 0xcd, 0x00, 0x03]);

    let parsed = rtcp::packet::unmarshal(&mut raw.clone()).unwrap();
    assert_eq!(parsed, feedback.message);
    let nack = as_nack(parsed[0].as_ref()).expect("expected a generic NACK");
    assert_eq!(nack.nacks, vec![NackPair::new(13)]);
    assert_eq!(nack.nacks[0].lost_packets, 0);
}

// =============================================================================
// Precise policy
// =============================================================================

#[test]
fn test_precise_policy_requests_all_missing() {
    let interval = Duration::from_millis(100);
    let mut engine = engine(NackPolicy::Precise, interval);
    let t0 = Instant::now();

    for seq in [1u16, 2, 5, 6, 8] {
        engine
            .handle_read(at(t0, rtp_bytes(VIDEO_SSRC, 96, seq, b"x")))
            .unwrap();
    }
    // gaps are not requested on arrival
    assert!(drain_feedback(&mut engine).is_empty());

    let tick = engine.poll_timeout().expect("precise policy ticks");
    let t1 = tick.max(t0) + Duration::from_millis(1);
    engine.handle_timeout(t1).unwrap();
    let feedback = drain_feedback(&mut engine);
    assert_eq!(feedback.len(), 1);
    assert_eq!(nacked_sequence_numbers(&feedback), vec![3, 4, 7]);

    // retransmissions of 3 and 7 arrive, 4 is still missing
    engine.handle_read(at(t1, rtx_bytes(0, 3, b"x"))).unwrap();
    engine.handle_read(at(t1, rtx_bytes(1, 7, b"x"))).unwrap();

    // not due yet
    engine.handle_timeout(t1 + interval / 2).unwrap();
    assert!(drain_feedback(&mut engine).is_empty());

    engine.handle_timeout(t1 + interval).unwrap();
    assert_eq!(nacked_sequence_numbers(&drain_feedback(&mut engine)), vec![4]);

    // the late original fills the last gap
    engine
        .handle_read(at(t1, rtp_bytes(VIDEO_SSRC, 96, 4, b"x")))
        .unwrap();
    engine.handle_timeout(t1 + 2 * interval).unwrap();
    assert!(drain_feedback(&mut engine).is_empty());

    let stats = engine.stats(VIDEO_SSRC).unwrap();
    assert_eq!(stats.nacks_sent, 2);
    assert_eq!(stats.sequence_numbers_nacked, 4);
    assert_eq!(stats.retransmissions_received, 2);
}

#[test]
fn test_precise_policy_caps_requests_per_packet() {
    let interval = Duration::from_millis(100);
    let mut engine = RecoveryEngineBuilder::new()
        .with_policy(NackPolicy::Precise)
        .with_interval(interval)
        .with_max_nacks_per_packet(2)
        .build()
        .unwrap();
    engine.bind_remote_stream(&video_info()).unwrap();

    let t0 = Instant::now();
    engine
        .handle_read(at(t0, rtp_bytes(VIDEO_SSRC, 96, 1, b"x")))
        .unwrap();
    engine
        .handle_read(at(t0, rtp_bytes(VIDEO_SSRC, 96, 3, b"x")))
        .unwrap();

    let mut requests = 0;
    for i in 1..=5u32 {
        engine.handle_timeout(t0 + interval * i * 2).unwrap();
        requests += drain_feedback(&mut engine).len();
    }
    assert_eq!(requests, 2);
}

#[test]
fn test_precise_policy_ignores_audio() {
    let interval = Duration::from_millis(100);
    let mut engine = engine(NackPolicy::Precise, interval);
    let t0 = Instant::now();

    for seq in [1u16, 10, 20] {
        engine
            .handle_read(at(t0, rtp_bytes(AUDIO_SSRC, 111, seq, b"x")))
            .unwrap();
    }
    engine.handle_timeout(t0 + interval).unwrap();
    engine.handle_timeout(t0 + interval * 3).unwrap();
    assert!(drain_feedback(&mut engine).is_empty());
}

#[test]
fn test_malformed_packets_do_not_stop_processing() {
    let mut engine = engine(NackPolicy::Interval, Duration::from_secs(1));
    let now = Instant::now();

    let garbage = [
        Bytes::from_static(&[0x00]),
        Bytes::from_static(&[0x40, 0x60, 0, 1, 0, 0, 0, 0, 0, 0, 0x11, 0x11]),
        rtx_bytes(1, 0, b"").slice(..13),
    ];
    for raw in garbage {
        engine.handle_read(at(now, raw)).unwrap();
    }
    engine
        .handle_read(at(now, rtp_bytes(VIDEO_SSRC, 96, 1, b"ok")))
        .unwrap();

    assert_eq!(drain_recovered(&mut engine).len(), 1);
    let stats = engine.stats(VIDEO_SSRC).unwrap();
    assert_eq!(stats.packets_received, 1);
    assert_eq!(stats.malformed_packets, 2);
}
