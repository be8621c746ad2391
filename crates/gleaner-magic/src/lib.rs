//! File type detection for downloaded binaries.
//!
//! Two detection passes: a cheap regex classification of the NZB subject
//! line at job construction, and a magic-header sniff of the first decoded
//! bytes once the first segment starts flowing.

mod header;
mod sniffer;
mod subject;
mod types;

pub use header::header_type;
pub use sniffer::Sniffer;
pub use subject::{subject_filename, subject_type};
pub use types::{FileType, FileTyper};
