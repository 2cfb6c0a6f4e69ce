//! Negotiated codec table.
//!
//! The embedding session layer registers the codecs it agreed on with the
//! remote peer. RTX codecs (`video/rtx`) name the primary payload type they
//! retransmit with an `apt=N` fmtp parameter (RFC 4588 §8.6); that association
//! decides which streams get an RTX correlator.

use crate::error::{Error, Result};
use crate::stream_info::{AssociatedStreamInfo, StreamInfo};
use std::collections::HashMap;
use std::fmt;

pub const MIME_TYPE_H264: &str = "video/H264";
pub const MIME_TYPE_VP8: &str = "video/VP8";
pub const MIME_TYPE_VP9: &str = "video/VP9";
pub const MIME_TYPE_AV1: &str = "video/AV1";
pub const MIME_TYPE_OPUS: &str = "audio/opus";
pub const MIME_TYPE_PCMU: &str = "audio/PCMU";
pub const MIME_TYPE_RTX: &str = "video/rtx";

const UNSPECIFIED_STR: &str = "Unspecified";

pub type PayloadType = u8;

/// Codec kind identifying the media type.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RtpCodecKind {
    /// Unspecified or unknown codec type
    #[default]
    Unspecified = 0,

    /// Audio codec
    Audio = 1,

    /// Video codec
    Video = 2,
}

impl From<&str> for RtpCodecKind {
    fn from(raw: &str) -> Self {
        match raw {
            "audio" => RtpCodecKind::Audio,
            "video" => RtpCodecKind::Video,
            _ => RtpCodecKind::Unspecified,
        }
    }
}

impl fmt::Display for RtpCodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            RtpCodecKind::Audio => "audio",
            RtpCodecKind::Video => "video",
            RtpCodecKind::Unspecified => UNSPECIFIED_STR,
        };
        write!(f, "{s}")
    }
}

/// RTP codec capability.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct RTCRtpCodec {
    /// MIME type of the codec (e.g., "video/VP8", "audio/opus")
    pub mime_type: String,
    /// Codec clock rate in Hz
    pub clock_rate: u32,
    /// Number of audio channels (0 for video codecs)
    pub channels: u16,
    /// Format-specific parameters as SDP fmtp line
    pub sdp_fmtp_line: String,
}

/// A codec bound to the payload type it was negotiated with.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct RTCRtpCodecParameters {
    pub rtp_codec: RTCRtpCodec,
    pub payload_type: PayloadType,
}

impl RTCRtpCodecParameters {
    pub fn is_rtx(&self) -> bool {
        matches!(
            self.rtp_codec.mime_type.split_once('/'),
            Some((_, subtype)) if subtype.eq_ignore_ascii_case("rtx")
        )
    }

    /// The primary payload type an RTX codec retransmits, from `apt=N`.
    pub fn associated_payload_type(&self) -> Result<Option<PayloadType>> {
        match parse_fmtp(&self.rtp_codec.sdp_fmtp_line).get("apt") {
            Some(apt) => apt
                .parse::<PayloadType>()
                .map(Some)
                .map_err(|_| Error::ErrInvalidAssociatedPayloadType(apt.clone())),
            None => Ok(None),
        }
    }
}

/// Splits an fmtp line like `apt=96;profile-id=0` into lowercase keys and values.
pub(crate) fn parse_fmtp(line: &str) -> HashMap<String, String> {
    line.split(';')
        .filter_map(|param| {
            let (key, value) = param.split_once('=')?;
            let key = key.trim().to_lowercase();
            if key.is_empty() {
                None
            } else {
                Some((key, value.trim().to_string()))
            }
        })
        .collect()
}

/// MediaEngine holds the codecs negotiated for the session.
#[derive(Default, Debug, Clone)]
pub struct MediaEngine {
    video_codecs: Vec<RTCRtpCodecParameters>,
    audio_codecs: Vec<RTCRtpCodecParameters>,
}

impl MediaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// VP8 on 96 with RTX on 97, Opus on 111.
    pub fn with_default_codecs() -> Result<Self> {
        let mut m = Self::new();
        m.register_codec(
            RTCRtpCodecParameters {
                rtp_codec: RTCRtpCodec {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: "".to_owned(),
                },
                payload_type: 96,
            },
            RtpCodecKind::Video,
        )?;
        m.register_codec(
            RTCRtpCodecParameters {
                rtp_codec: RTCRtpCodec {
                    mime_type: MIME_TYPE_RTX.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: "apt=96".to_owned(),
                },
                payload_type: 97,
            },
            RtpCodecKind::Video,
        )?;
        m.register_codec(
            RTCRtpCodecParameters {
                rtp_codec: RTCRtpCodec {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                },
                payload_type: 111,
            },
            RtpCodecKind::Audio,
        )?;
        Ok(m)
    }

    /// Adds a codec to the table. A codec registered again under the same
    /// payload type replaces the earlier entry.
    pub fn register_codec(
        &mut self,
        codec: RTCRtpCodecParameters,
        typ: RtpCodecKind,
    ) -> Result<()> {
        // reject a malformed association up front rather than at bind time
        codec.associated_payload_type()?;

        let codecs = match typ {
            RtpCodecKind::Audio => &mut self.audio_codecs,
            RtpCodecKind::Video => &mut self.video_codecs,
            RtpCodecKind::Unspecified => return Err(Error::Other("unknown codec kind".into())),
        };
        codecs.retain(|c| c.payload_type != codec.payload_type);
        codecs.push(codec);
        Ok(())
    }

    pub fn get_codec_by_payload(
        &self,
        payload_type: PayloadType,
    ) -> Result<(&RTCRtpCodecParameters, RtpCodecKind)> {
        if let Some(codec) = self
            .video_codecs
            .iter()
            .find(|c| c.payload_type == payload_type)
        {
            return Ok((codec, RtpCodecKind::Video));
        }
        if let Some(codec) = self
            .audio_codecs
            .iter()
            .find(|c| c.payload_type == payload_type)
        {
            return Ok((codec, RtpCodecKind::Audio));
        }
        Err(Error::ErrCodecNotFound(payload_type))
    }

    /// Finds the RTX payload type associated with a given payload type.
    pub fn find_rtx_payload_type(&self, needle: PayloadType) -> Option<PayloadType> {
        self.video_codecs
            .iter()
            .chain(self.audio_codecs.iter())
            .find(|c| c.is_rtx() && matches!(c.associated_payload_type(), Ok(Some(apt)) if apt == needle))
            .map(|c| c.payload_type)
    }

    /// Builds the description of a remote stream announced on `ssrc` with
    /// primary payload type `payload_type`. `rtx_ssrc` is the SSRC the
    /// remote declared for retransmissions, if any; it only takes effect when
    /// an RTX codec for the payload type was negotiated.
    pub fn stream_info(
        &self,
        ssrc: u32,
        payload_type: PayloadType,
        rtx_ssrc: Option<u32>,
    ) -> Result<StreamInfo> {
        let (codec, kind) = self.get_codec_by_payload(payload_type)?;

        let associated_stream = match (rtx_ssrc, self.find_rtx_payload_type(payload_type)) {
            (Some(ssrc), Some(payload_type)) => Some(AssociatedStreamInfo { ssrc, payload_type }),
            _ => None,
        };

        Ok(StreamInfo {
            id: format!("{kind}-{ssrc}"),
            ssrc,
            kind,
            payload_type,
            mime_type: codec.rtp_codec.mime_type.clone(),
            clock_rate: codec.rtp_codec.clock_rate,
            channels: codec.rtp_codec.channels,
            sdp_fmtp_line: codec.rtp_codec.sdp_fmtp_line.clone(),
            associated_stream,
        })
    }
}
