//! Task-per-stream runtime on tokio.
//!
//! Each bound remote stream runs as one task per role: a primary task that
//! tracks sequence numbers and decides on NACKs, and, when RTX was
//! negotiated, an RTX task that correlates retransmissions. The two tasks of
//! a stream share no mutable state; the RTX task tells the primary task
//! which sequence numbers it recovered over a channel.
//!
//! All feedback funnels through one bounded channel into a single writer
//! task that owns the [`FeedbackWriter`]. A failed write is retried a
//! bounded number of times, then dropped and counted against its stream. It
//! never stops a stream task.
//!
//! ```text
//!  PacketSource ──► primary task ──┐
//!                      ▲           ├──► writer task ──► FeedbackWriter
//!                      │ OSNs      │
//!  PacketSource ──► rtx task ──────┘ (no feedback)
//! ```

use crate::config::RecoveryConfig;
use crate::engine::{Recovered, TaggedMessage, TaggedRecovered, unmarshal_rtp};
use crate::error::{Error, Result};
use crate::rtx::{RtxCorrelator, RtxEvent, RtxStats};
use crate::stats::StreamStats;
use crate::stream::{PrimaryReceiver, merge_rtx_stats};
use crate::stream_info::StreamInfo;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error, warn};
use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Inbound datagrams of one stream role.
///
/// `read_packet` does not have to be cancel safe. A stream task keeps its
/// pending read alive while it serves NACK ticks and recovered sequence
/// numbers, and only drops it when the task ends.
#[async_trait]
pub trait PacketSource: Send {
    /// `None` ends the stream. `Some(Err(_))` is a transient failure; the
    /// stream keeps reading.
    async fn read_packet(&mut self) -> Option<Result<Bytes>>;
}

/// A read in flight that owns its source until it completes.
type PendingRead<S> = Pin<Box<dyn Future<Output = (S, Option<Result<Bytes>>)> + Send>>;

fn read_owned<S: PacketSource + 'static>(mut source: S) -> PendingRead<S> {
    Box::pin(async move {
        let read = source.read_packet().await;
        (source, read)
    })
}

#[async_trait]
impl PacketSource for mpsc::Receiver<Bytes> {
    async fn read_packet(&mut self) -> Option<Result<Bytes>> {
        self.recv().await.map(Ok)
    }
}

#[async_trait]
impl PacketSource for mpsc::Receiver<Result<Bytes>> {
    async fn read_packet(&mut self) -> Option<Result<Bytes>> {
        self.recv().await
    }
}

/// Outbound RTCP towards the media sender.
#[async_trait]
pub trait FeedbackWriter: Send {
    async fn write_rtcp(&mut self, pkts: &[Box<dyn rtcp::Packet>]) -> Result<usize>;
}

/// Writes each batch as one serialized compound RTCP packet.
#[async_trait]
impl FeedbackWriter for mpsc::Sender<Bytes> {
    async fn write_rtcp(&mut self, pkts: &[Box<dyn rtcp::Packet>]) -> Result<usize> {
        let raw = rtcp::packet::marshal(pkts)?.freeze();
        let n = raw.len();
        self.send(raw)
            .await
            .map_err(|_| Error::ErrFeedbackChannelClosed)?;
        Ok(n)
    }
}

struct FeedbackRequest {
    ssrc: u32,
    packets: Vec<Box<dyn rtcp::Packet>>,
    /// Failure counter of the requesting stream
    failures: Arc<AtomicU64>,
}

/// Runtime for the loss recovery of one media session.
///
/// Must be created inside a tokio runtime.
pub struct Session {
    config: RecoveryConfig,
    sender_ssrc: u32,
    feedback_tx: mpsc::Sender<FeedbackRequest>,
    writer: JoinHandle<()>,
}

impl Session {
    pub fn new<W>(config: RecoveryConfig, writer: W) -> Result<Self>
    where
        W: FeedbackWriter + 'static,
    {
        config.validate()?;

        let (feedback_tx, feedback_rx) = mpsc::channel(config.feedback_channel_capacity);
        let writer = tokio::spawn(run_writer(writer, feedback_rx, config.feedback_retries));

        Ok(Self {
            sender_ssrc: rand::random(),
            config,
            feedback_tx,
            writer,
        })
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// SSRC placed in the sender field of generated feedback.
    pub fn sender_ssrc(&self) -> u32 {
        self.sender_ssrc
    }

    /// Starts the tasks of one remote stream.
    ///
    /// `rtx` is only used when `info` carries an RTX association; an RTX
    /// source for a stream without one is dropped. Media and recovered
    /// packets go to `playout` if given, otherwise they are discarded once
    /// accounted for.
    pub fn spawn_stream<S>(
        &self,
        info: &StreamInfo,
        primary: S,
        rtx: Option<S>,
        playout: Option<mpsc::Sender<TaggedRecovered>>,
    ) -> Result<StreamHandle>
    where
        S: PacketSource + 'static,
    {
        let receiver = PrimaryReceiver::new(info, &self.config, self.sender_ssrc)?;
        let failures = Arc::new(AtomicU64::new(0));

        let (rtx, recovered_rx) = match (RtxCorrelator::new(info), rtx) {
            (Some(correlator), Some(source)) => {
                let (recovered_tx, recovered_rx) = mpsc::unbounded_channel();
                let handle = tokio::spawn(run_rtx(
                    source,
                    correlator,
                    recovered_tx,
                    playout.clone(),
                ));
                (Some(handle), Some(recovered_rx))
            }
            (None, Some(_)) => {
                warn!(
                    "ssrc={}: no RTX negotiated, ignoring RTX source",
                    info.ssrc
                );
                (None, None)
            }
            (Some(correlator), None) => {
                debug!(
                    "ssrc={}: RTX negotiated on ssrc={} but no source given",
                    info.ssrc,
                    correlator.ssrc()
                );
                (None, None)
            }
            (None, None) => (None, None),
        };

        debug!(
            "spawn {} stream ssrc={} rtx={}",
            info.kind,
            info.ssrc,
            rtx.is_some()
        );
        let primary = tokio::spawn(run_primary(
            primary,
            receiver,
            recovered_rx,
            self.feedback_tx.clone(),
            Arc::clone(&failures),
            playout,
            self.config.nack_interval,
        ));

        Ok(StreamHandle {
            ssrc: info.ssrc,
            primary,
            rtx,
            failures,
        })
    }

    /// Waits for the writer to drain. Returns once every stream task has
    /// ended, as each holds a feedback sender.
    pub async fn shutdown(self) -> Result<()> {
        drop(self.feedback_tx);
        self.writer
            .await
            .map_err(|err| Error::Other(err.to_string()))
    }
}

/// Handle to the tasks of one stream.
pub struct StreamHandle {
    ssrc: u32,
    primary: JoinHandle<StreamStats>,
    rtx: Option<JoinHandle<RtxStats>>,
    failures: Arc<AtomicU64>,
}

impl StreamHandle {
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn has_rtx(&self) -> bool {
        self.rtx.is_some()
    }

    /// Waits for both tasks to see end-of-stream and returns the final
    /// counters. Feedback still queued at the writer is not included; call
    /// [`Session::shutdown`] first for exact failure counts.
    pub async fn join(self) -> Result<StreamStats> {
        let primary = self
            .primary
            .await
            .map_err(|err| Error::Other(err.to_string()))?;
        let rtx = match self.rtx {
            Some(handle) => handle
                .await
                .map_err(|err| Error::Other(err.to_string()))?,
            None => RtxStats::default(),
        };

        let mut stats = merge_rtx_stats(primary, rtx);
        stats.feedback_failures = self.failures.load(Ordering::Relaxed);
        Ok(stats)
    }
}

async fn run_writer<W: FeedbackWriter>(
    mut writer: W,
    mut requests: mpsc::Receiver<FeedbackRequest>,
    retries: u32,
) {
    while let Some(request) = requests.recv().await {
        let mut attempt = 0;
        loop {
            match writer.write_rtcp(&request.packets).await {
                Ok(_) => break,
                Err(err) if attempt < retries => {
                    attempt += 1;
                    warn!(
                        "ssrc={}: feedback write failed: {}, retry {}/{}",
                        request.ssrc, err, attempt, retries
                    );
                }
                Err(err) => {
                    error!(
                        "ssrc={}: dropping feedback after {} attempts: {}",
                        request.ssrc,
                        attempt + 1,
                        err
                    );
                    request.failures.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            }
        }
    }
    debug!("feedback writer finished");
}

async fn run_primary<S: PacketSource + 'static>(
    source: S,
    mut receiver: PrimaryReceiver,
    mut recovered: Option<mpsc::UnboundedReceiver<u16>>,
    feedback: mpsc::Sender<FeedbackRequest>,
    failures: Arc<AtomicU64>,
    playout: Option<mpsc::Sender<TaggedRecovered>>,
    interval: Duration,
) -> StreamStats {
    let ssrc = receiver.ssrc();
    let precise = receiver.is_precise();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut pending = read_owned(source);
    loop {
        tokio::select! {
            (source, read) = &mut pending => {
                pending = read_owned(source);
                let raw = match read {
                    Some(Ok(raw)) => raw,
                    Some(Err(err)) => {
                        receiver.malformed();
                        debug!("ssrc={ssrc}: read failed: {err}");
                        continue;
                    }
                    None => break,
                };
                let packet = match unmarshal_rtp(&raw) {
                    Ok(packet) => packet,
                    Err(err) => {
                        receiver.malformed();
                        debug!("ssrc={ssrc}: dropping malformed packet: {err}");
                        continue;
                    }
                };

                let now = Instant::now().into_std();
                if let Some(nack) = receiver.receive(now, packet.header.sequence_number) {
                    send_feedback(&feedback, ssrc, nack, &failures).await;
                }
                if let Some(playout) = &playout {
                    // a closed playout only means nobody is listening
                    let _ = playout
                        .send(TaggedMessage { now, message: Recovered::Media(packet) })
                        .await;
                }
            }
            osn = next_recovered(&mut recovered), if recovered.is_some() => {
                match osn {
                    Some(osn) => receiver.recovered(osn),
                    None => recovered = None,
                }
            }
            _ = ticker.tick(), if precise => {
                if let Some(nack) = receiver.tick() {
                    send_feedback(&feedback, ssrc, nack, &failures).await;
                }
            }
        }
    }

    debug!("ssrc={ssrc}: primary stream ended");
    receiver.stats()
}

async fn next_recovered(recovered: &mut Option<mpsc::UnboundedReceiver<u16>>) -> Option<u16> {
    match recovered {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn send_feedback(
    feedback: &mpsc::Sender<FeedbackRequest>,
    ssrc: u32,
    nack: TransportLayerNack,
    failures: &Arc<AtomicU64>,
) {
    let request = FeedbackRequest {
        ssrc,
        packets: vec![Box::new(nack)],
        failures: Arc::clone(failures),
    };
    if feedback.send(request).await.is_err() {
        warn!("ssrc={ssrc}: feedback writer is gone, dropping NACK");
        failures.fetch_add(1, Ordering::Relaxed);
    }
}

async fn run_rtx<S: PacketSource>(
    mut source: S,
    mut correlator: RtxCorrelator,
    recovered: mpsc::UnboundedSender<u16>,
    playout: Option<mpsc::Sender<TaggedRecovered>>,
) -> RtxStats {
    let ssrc = correlator.ssrc();

    while let Some(read) = source.read_packet().await {
        let raw = match read {
            Ok(raw) => raw,
            Err(err) => {
                correlator.malformed();
                debug!("rtx ssrc={ssrc}: read failed: {err}");
                continue;
            }
        };
        let packet = match unmarshal_rtp(&raw) {
            Ok(packet) => packet,
            Err(err) => {
                correlator.malformed();
                debug!("rtx ssrc={ssrc}: dropping malformed packet: {err}");
                continue;
            }
        };
        // malformed payloads are counted by the correlator
        let Ok(event) = correlator.ingest_rtp(&packet) else {
            continue;
        };

        let message = match event {
            RtxEvent::Retransmission(correlated) => {
                // the primary task may already be gone
                let _ = recovered.send(correlated.original_seq);
                Recovered::Retransmission {
                    ssrc: correlator.primary_ssrc(),
                    packet: correlated,
                }
            }
            RtxEvent::PaddingProbe { rtx_seq } => Recovered::PaddingProbe {
                ssrc: correlator.primary_ssrc(),
                rtx_seq,
            },
        };
        if let Some(playout) = &playout {
            let _ = playout
                .send(TaggedMessage {
                    now: Instant::now().into_std(),
                    message,
                })
                .await;
        }
    }

    debug!("rtx ssrc={ssrc}: rtx stream ended");
    correlator.stats()
}
