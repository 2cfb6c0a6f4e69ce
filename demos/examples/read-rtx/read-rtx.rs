// SPDX-FileCopyrightText: 2023 The Pion community <https://pion.ly>
// SPDX-License-Identifier: MIT

//! read-rtx demonstrates receiver-side loss recovery with NACK and RTX.
//!
//! This example shows:
//! - How to describe remote streams from negotiated codecs (VP8 + RTX, Opus)
//! - How to run one recovery task per stream with [`Session`]
//! - How to drive the sans-IO [`RecoveryEngine`] directly (`--sansio`)
//! - Reading retransmissions and padding probes from the RTX stream
//! - Requesting keyframes periodically with [`IntervalPli`]
//!
//! A simulated sender drops packets at random and answers every NACK it
//! gets with an RTX retransmission. Every hundredth frame it also sends an
//! RTX padding probe.

use anyhow::Result;
use bytes::Bytes;
use clap::Parser;
use env_logger::Target;
use log::{debug, info};
use recovery::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use recovery::rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use recovery::rtx::RtxPacket;
use recovery::shared::marshal::Marshal;
use recovery::{
    FeedbackWriter, IntervalPli, KeyframeRequester, MediaEngine, NackPolicy, Recovered,
    RecoveryConfig, RecoveryEngineBuilder, Session, TaggedMessage, TaggedRecovered,
    nacked_sequence_numbers, rtcp, rtp,
};
use sansio::Protocol;
use std::collections::{HashMap, VecDeque};
use std::fs::OpenOptions;
use std::io::Write;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::channel;

const VIDEO_SSRC: u32 = 0x1234_5678;
const RTX_SSRC: u32 = 0x1234_5679;
const AUDIO_SSRC: u32 = 0x8765_4321;

const VP8_PAYLOAD_TYPE: u8 = 96;
const RTX_PAYLOAD_TYPE: u8 = 97;
const OPUS_PAYLOAD_TYPE: u8 = 111;

const FRAME_INTERVAL: Duration = Duration::from_millis(20);
const PROBE_EVERY: u32 = 100;
const HISTORY_SIZE: usize = 1024;

#[derive(Parser)]
#[command(name = "read-rtx")]
#[command(author = "Rusty Rain <y@liu.mx>")]
#[command(version = "0.1.0")]
#[command(about = "An example of reading RTX and sending NACKs")]
struct Cli {
    #[arg(short, long)]
    debug: bool,
    #[arg(short, long, default_value_t = format!("INFO"))]
    log_level: String,
    #[arg(short, long, default_value_t = format!(""))]
    output_log_file: String,
    /// Probability that the simulated sender drops a packet
    #[arg(long, default_value_t = 0.05)]
    loss: f64,
    /// Number of frames to send
    #[arg(short, long, default_value_t = 500)]
    frames: u32,
    /// NACK policy: interval or precise
    #[arg(short, long, default_value_t = format!("interval"))]
    policy: String,
    /// Drive the sans-IO engine in a simulated clock instead of tokio tasks
    #[arg(long)]
    sansio: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output_log_file = cli.output_log_file;
    let log_level = log::LevelFilter::from_str(&cli.log_level)?;

    if cli.debug {
        env_logger::Builder::new()
            .target(if !output_log_file.is_empty() {
                Target::Pipe(Box::new(
                    OpenOptions::new()
                        .create(true)
                        .write(true)
                        .truncate(true)
                        .open(output_log_file)?,
                ))
            } else {
                Target::Stdout
            })
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{}:{} [{}] {} - {}",
                    record.file().unwrap_or("unknown"),
                    record.line().unwrap_or(0),
                    record.level(),
                    chrono::Local::now().format("%H:%M:%S.%6f"),
                    record.args()
                )
            })
            .filter(None, log_level)
            .init();
    }

    let policy = match cli.policy.as_str() {
        "interval" => NackPolicy::Interval,
        "precise" => NackPolicy::Precise,
        other => anyhow::bail!("unknown NACK policy {other}, expected interval or precise"),
    };
    let config = RecoveryConfig {
        policy,
        ..Default::default()
    };
    let sender = LossySender::new(cli.loss);

    if cli.sansio {
        run_engine(config, sender, cli.frames)
    } else {
        run_session(config, sender, cli.frames).await
    }
}

/// Media sender on the far side of a lossy path. Keeps a history of sent
/// video packets to answer NACKs from.
struct LossySender {
    loss: f64,
    video_seq: u16,
    audio_seq: u16,
    rtx_seq: u16,
    history: HashMap<u16, Bytes>,
    order: VecDeque<u16>,
}

impl LossySender {
    fn new(loss: f64) -> Self {
        Self {
            loss,
            video_seq: rand::random(),
            audio_seq: rand::random(),
            rtx_seq: rand::random(),
            history: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn dropped(&self) -> bool {
        rand::random::<f64>() < self.loss
    }

    /// Returns the next VP8 packet, or `None` if the path lost it.
    fn next_video(&mut self) -> Result<Option<Bytes>> {
        let seq = self.video_seq;
        self.video_seq = self.video_seq.wrapping_add(1);

        let payload = Bytes::from(format!("vp8 frame {seq}"));
        self.history.insert(seq, payload.clone());
        self.order.push_back(seq);
        if self.order.len() > HISTORY_SIZE
            && let Some(oldest) = self.order.pop_front()
        {
            self.history.remove(&oldest);
        }

        let raw = media_packet(VIDEO_SSRC, VP8_PAYLOAD_TYPE, seq, payload)
            .marshal()?
            .freeze();
        if self.dropped() {
            debug!("path dropped video seq={seq}");
            return Ok(None);
        }
        Ok(Some(raw))
    }

    fn next_audio(&mut self) -> Result<Option<Bytes>> {
        let seq = self.audio_seq;
        self.audio_seq = self.audio_seq.wrapping_add(1);

        let raw = media_packet(AUDIO_SSRC, OPUS_PAYLOAD_TYPE, seq, Bytes::from_static(b"opus"))
            .marshal()?
            .freeze();
        if self.dropped() {
            debug!("path dropped audio seq={seq}");
            return Ok(None);
        }
        Ok(Some(raw))
    }

    fn next_rtx_seq(&mut self) -> u16 {
        let seq = self.rtx_seq;
        self.rtx_seq = self.rtx_seq.wrapping_add(1);
        seq
    }

    /// Wraps a remembered packet for the RTX stream.
    fn retransmit(&mut self, original_seq: u16) -> Result<Option<Bytes>> {
        let Some(payload) = self.history.get(&original_seq).cloned() else {
            debug!("seq={original_seq} fell out of the send history");
            return Ok(None);
        };
        let rtx = RtxPacket {
            original_seq,
            rtx_seq: self.next_rtx_seq(),
            payload,
        };
        Ok(Some(rtx.to_rtp(rtx_header()).marshal()?.freeze()))
    }

    fn padding_probe(&mut self) -> Result<Bytes> {
        let probe = RtxPacket {
            original_seq: 0,
            rtx_seq: self.next_rtx_seq(),
            payload: Bytes::new(),
        };
        // padding only: the P bit with an empty payload
        let mut packet = probe.to_rtp(rtx_header());
        packet.header.padding = true;
        Ok(packet.marshal()?.freeze())
    }
}

fn media_packet(ssrc: u32, payload_type: u8, sequence_number: u16, payload: Bytes) -> rtp::Packet {
    rtp::Packet {
        header: rtp::Header {
            version: 2,
            payload_type,
            sequence_number,
            timestamp: u32::from(sequence_number).wrapping_mul(3000),
            ssrc,
            ..Default::default()
        },
        payload,
    }
}

fn rtx_header() -> rtp::Header {
    rtp::Header {
        version: 2,
        payload_type: RTX_PAYLOAD_TYPE,
        ssrc: RTX_SSRC,
        ..Default::default()
    }
}

fn print_recovered(recovered: &Recovered) {
    match recovered {
        Recovered::Media(_) => {}
        Recovered::Retransmission { packet, .. } => {
            println!(
                "Got RTX Packet. osn: {} , rtx sn: {}",
                packet.original_seq, packet.rtx_seq
            );
        }
        Recovered::PaddingProbe { rtx_seq, .. } => {
            println!("Got RTX padding packets. rtx sn: {rtx_seq}");
        }
    }
}

async fn run_session(config: RecoveryConfig, mut sender: LossySender, frames: u32) -> Result<()> {
    let media = MediaEngine::with_default_codecs()?;
    let video = media.stream_info(VIDEO_SSRC, VP8_PAYLOAD_TYPE, Some(RTX_SSRC))?;
    let audio = media.stream_info(AUDIO_SSRC, OPUS_PAYLOAD_TYPE, None)?;

    let (feedback_tx, mut feedback_rx) = channel::<Bytes>(64);
    let mut pli_writer = feedback_tx.clone();
    let session = Session::new(config, feedback_tx)?;

    let (video_tx, video_rx) = channel::<Bytes>(64);
    let (rtx_tx, rtx_rx) = channel::<Bytes>(64);
    let (audio_tx, audio_rx) = channel::<Bytes>(64);
    let (playout_tx, mut playout_rx) = channel::<TaggedRecovered>(256);

    let video_handle =
        session.spawn_stream(&video, video_rx, Some(rtx_rx), Some(playout_tx.clone()))?;
    println!("Got Video track hasRTX: {}", video_handle.has_rtx());
    let audio_handle = session.spawn_stream(&audio, audio_rx, None, Some(playout_tx))?;
    println!("Got Audio track hasRTX: {}", audio_handle.has_rtx());

    let playout = tokio::spawn(async move {
        let mut media_packets = 0u64;
        while let Some(TaggedMessage { message, .. }) = playout_rx.recv().await {
            if let Recovered::Media(_) = message {
                media_packets += 1;
            }
            // you should use a jitter buffer here
            print_recovered(&message);
        }
        media_packets
    });

    let mut pli = IntervalPli::new(session.sender_ssrc(), VIDEO_SSRC);
    let mut ticker = tokio::time::interval(FRAME_INTERVAL);
    let mut frame = 0;
    while frame < frames {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(raw) = sender.next_video()? {
                    video_tx.send(raw).await?;
                }
                if let Some(raw) = sender.next_audio()? {
                    audio_tx.send(raw).await?;
                }
                if frame % PROBE_EVERY == PROBE_EVERY - 1 {
                    rtx_tx.send(sender.padding_probe()?).await?;
                }
                if let Some(request) = pli.poll_request(Instant::now()) {
                    pli_writer
                        .write_rtcp(&[Box::new(request) as Box<dyn rtcp::Packet>])
                        .await?;
                }
                frame += 1;
            }
            Some(raw) = feedback_rx.recv() => {
                for packet in rtcp::packet::unmarshal(&mut raw.clone())? {
                    if let Some(nack) = packet.as_any().downcast_ref::<TransportLayerNack>() {
                        for seq in nacked_sequence_numbers(nack) {
                            println!("Send Nack sequence:{seq}");
                            if let Some(raw) = sender.retransmit(seq)? {
                                rtx_tx.send(raw).await?;
                            }
                        }
                    } else if let Some(pli) = packet.as_any().downcast_ref::<PictureLossIndication>() {
                        info!("keyframe requested for ssrc={:x}", pli.media_ssrc);
                    }
                }
            }
        }
    }

    drop(pli_writer);
    drop(video_tx);
    drop(rtx_tx);
    drop(audio_tx);
    // keep the writer unblocked while the stream tasks wind down
    let drain = tokio::spawn(async move { while feedback_rx.recv().await.is_some() {} });

    session.shutdown().await?;
    drain.await?;
    let video_stats = video_handle.join().await?;
    let audio_stats = audio_handle.join().await?;
    let media_packets = playout.await?;

    println!("played out {media_packets} media packets");
    println!("video stats: {}", serde_json::to_string_pretty(&video_stats)?);
    println!("audio stats: {}", serde_json::to_string_pretty(&audio_stats)?);

    Ok(())
}

fn run_engine(config: RecoveryConfig, mut sender: LossySender, frames: u32) -> Result<()> {
    let media = MediaEngine::with_default_codecs()?;
    let video = media.stream_info(VIDEO_SSRC, VP8_PAYLOAD_TYPE, Some(RTX_SSRC))?;
    let audio = media.stream_info(AUDIO_SSRC, OPUS_PAYLOAD_TYPE, None)?;
    println!(
        "Got Video track hasRTX: {}",
        video.associated_stream.is_some()
    );
    println!(
        "Got Audio track hasRTX: {}",
        audio.associated_stream.is_some()
    );

    let mut engine = RecoveryEngineBuilder::new().with_config(config).build()?;
    engine.bind_remote_stream(&video)?;
    engine.bind_remote_stream(&audio)?;

    let mut pli = IntervalPli::new(engine.sender_ssrc(), VIDEO_SSRC);
    let start = Instant::now();
    for frame in 0..frames {
        let now = start + FRAME_INTERVAL * frame;

        let mut inbound: Vec<Bytes> = [sender.next_video()?, sender.next_audio()?]
            .into_iter()
            .flatten()
            .collect();
        if frame % PROBE_EVERY == PROBE_EVERY - 1 {
            inbound.push(sender.padding_probe()?);
        }
        for raw in inbound {
            engine.handle_read(TaggedMessage { now, message: raw })?;
        }

        if let Some(eto) = engine.poll_timeout()
            && eto <= now
        {
            engine.handle_timeout(now)?;
        }

        while let Some(feedback) = engine.poll_write() {
            for packet in feedback.message {
                let Some(nack) = packet.as_any().downcast_ref::<TransportLayerNack>() else {
                    continue;
                };
                for seq in nacked_sequence_numbers(nack) {
                    println!("Send Nack sequence:{seq}");
                    if let Some(raw) = sender.retransmit(seq)? {
                        engine.handle_read(TaggedMessage { now, message: raw })?;
                    }
                }
            }
        }

        while let Some(recovered) = engine.poll_read() {
            print_recovered(&recovered.message);
        }

        if let Some(request) = pli.poll_request(now) {
            info!("keyframe requested for ssrc={:x}", request.media_ssrc);
        }
    }

    println!(
        "video stats: {}",
        serde_json::to_string_pretty(&engine.stats(VIDEO_SSRC)?)?
    );
    println!(
        "audio stats: {}",
        serde_json::to_string_pretty(&engine.stats(AUDIO_SSRC)?)?
    );
    engine.close()?;

    Ok(())
}
