use thiserror::Error;

/// An error decoding yEnc data.
///
/// Missing headers, malformed headers, and checksum mismatches all surface
/// as this one kind; the message carries the offending line or digest pair.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct DecodeError(pub String);

impl From<DecodeError> for gleaner_core::GrabError {
    fn from(err: DecodeError) -> Self {
        gleaner_core::GrabError::Decode(err.0)
    }
}
