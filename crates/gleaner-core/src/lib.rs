pub mod error;
pub mod hash;
pub mod sink;
pub mod task;

pub use error::GrabError;
pub use sink::{ArticleSink, SinkHandle};
pub use task::Supervisor;
