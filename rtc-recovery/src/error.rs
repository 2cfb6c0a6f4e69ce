use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    //RTP errors
    #[error("RTP version {0} is not supported")]
    ErrUnsupportedRtpVersion(u8),
    #[error("RTX payload too short to carry an original sequence number")]
    ErrRtxPayloadTooShort,

    //Negotiation errors
    #[error("no codec registered for payload type {0}")]
    ErrCodecNotFound(u8),
    #[error("invalid apt value '{0}' in fmtp line")]
    ErrInvalidAssociatedPayloadType(String),

    //Config errors
    #[error("receive log size {0} must be a power of 2 between 64 and 32768")]
    ErrInvalidReceiveLogSize(u16),
    #[error("nack interval must be greater than zero")]
    ErrZeroNackInterval,
    #[error("feedback channel capacity must be greater than zero")]
    ErrZeroFeedbackCapacity,

    //Runtime errors
    #[error("stream with ssrc {0} is not bound")]
    ErrStreamNotBound(u32),
    #[error("feedback channel closed")]
    ErrFeedbackChannelClosed,
    #[error("feedback write failed: {0}")]
    ErrFeedbackWrite(String),
    #[error("rtx ssrc {rtx_ssrc} is already in use by stream {ssrc}")]
    ErrRtxSsrcInUse { rtx_ssrc: u32, ssrc: u32 },

    #[error(transparent)]
    Shared(#[from] shared::error::Error),

    #[error("{0}")]
    Io(#[source] IoError),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub std::io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(IoError(e))
    }
}
