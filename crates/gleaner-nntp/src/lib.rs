//! NNTP client plumbing for multi-connection binary downloads.
//!
//! A [`Server`] owns a fixed pool of [`Session`]s fed from one bounded
//! request channel and fanning into one bounded response channel; the
//! channel capacities equal the session count, which is the only rate
//! control this layer provides.

mod conn;
mod server;
mod session;

pub use conn::{Dialer, NntpIo, TcpDialer, build_tls_config};
pub use server::{GrabRequest, GrabResponse, Server};
pub use session::Session;
pub use tokio_rustls::rustls::ClientConfig;
