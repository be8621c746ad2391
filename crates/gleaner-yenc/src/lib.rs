//! Streaming yEnc 1.3 decoding.
//!
//! The decoder is multipart aware but does not assemble parts or reason
//! about their relation to each other; that is the job of the NZB index
//! driving the download.

mod decode;
mod error;

pub use decode::{Decoder, Header, PartHeader, Trailer};
pub use error::DecodeError;
