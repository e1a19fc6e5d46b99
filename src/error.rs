use thiserror::Error;

/// Everything that can go wrong while processing a segment or an application call. None of these
///  is a program-level fault: the receive path drops and counts, protocol aborts terminate only
///  the affected connection with an explicit Reset.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DccpError {
    #[error("malformed segment: {0}")]
    Malformed(&'static str),

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("sequence number {seq} outside of the loss window around {gsr}")]
    SequenceOutOfWindow { seq: u64, gsr: u64 },

    #[error("service code mismatch: expected {expected}, got {actual}")]
    ServiceCodeMismatch { expected: u32, actual: u32 },

    #[error("feature negotiation failed for feature {feature}")]
    FeatureNegotiationFailed { feature: u8 },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("connection cannot carry data in its current state")]
    NotConnected,

    #[error("transmit failed: {0}")]
    Transmit(#[from] TransmitError),
}

impl From<bytes::TryGetError> for DccpError {
    fn from(_: bytes::TryGetError) -> Self {
        DccpError::Malformed("truncated")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransmitError {
    #[error("outbound channel full")]
    Full,
    #[error("outbound channel closed")]
    Closed,
}
