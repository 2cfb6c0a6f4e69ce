use crate::codec::{PayloadType, RtpCodecKind};

/// Association between an auxiliary stream and its primary stream.
///
/// For loss recovery this is the RTX stream (RFC 4588) carrying
/// retransmissions of the primary stream's packets.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct AssociatedStreamInfo {
    /// SSRC of the associated auxiliary stream
    pub ssrc: u32,
    /// Payload type of the associated stream
    pub payload_type: PayloadType,
}

/// Stream context passed to [`RecoveryEngine::bind_remote_stream`](crate::RecoveryEngine::bind_remote_stream).
///
/// Describes one remote media stream as negotiated by the session layer,
/// normally produced by [`MediaEngine::stream_info`](crate::MediaEngine::stream_info).
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// Unique identifier for the stream
    pub id: String,
    /// Synchronization Source identifier (SSRC) of the stream
    pub ssrc: u32,
    /// Audio or video
    pub kind: RtpCodecKind,
    /// RTP payload type (e.g., 96 for VP8, 111 for Opus)
    pub payload_type: PayloadType,
    /// MIME type of the codec (e.g., "video/VP8", "audio/opus")
    pub mime_type: String,
    /// Clock rate in Hz (e.g., 90000 for video, 48000 for audio)
    pub clock_rate: u32,
    /// Number of audio channels (0 for video)
    pub channels: u16,
    /// Format-specific parameters from SDP (fmtp line)
    pub sdp_fmtp_line: String,
    /// RTX stream negotiated for this stream, if any
    pub associated_stream: Option<AssociatedStreamInfo>,
}

impl StreamInfo {
    pub fn is_video(&self) -> bool {
        self.kind == RtpCodecKind::Video
    }

    pub fn rtx_ssrc(&self) -> Option<u32> {
        self.associated_stream.as_ref().map(|rtx| rtx.ssrc)
    }
}
