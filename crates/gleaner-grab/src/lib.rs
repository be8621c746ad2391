//! The download engine: multi-server grabbing strategy, per-segment and
//! per-file state machines, and the coordinator that moves segments from
//! an NZB to decoded files on disk.

mod file;
mod grabber;
mod metadata;
mod segment;
mod state;
mod strategy;

pub use file::File;
pub use grabber::{DiskFileCreator, Grabber, GrabberBuilder, SegmentFileCreator};
pub use metadata::Metadata;
pub use segment::Segment;
pub use state::{Fsm, State};
pub use strategy::{AggregatedResponse, Server, Strategy};
