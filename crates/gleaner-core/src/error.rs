use thiserror::Error;

/// Errors that flow through the grab pipeline.
///
/// Every variant is cloneable so the same terminal error can be recorded on
/// a segment, a supervisor, and a shutdown result without ownership games.
/// I/O failures are captured as strings for the same reason.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GrabError {
    /// Socket, TLS, or handshake failure while dialing or talking to a server.
    #[error("transport error: {0}")]
    Transport(String),

    /// Authentication was rejected by the server.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The NNTP stream could not be framed. Fatal to the session.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A response code we did not expect for the command we sent.
    #[error("unexpected response {code}: {message}")]
    UnexpectedResponse { code: u16, message: String },

    /// GROUP returned 411.
    #[error("no such group: {0}")]
    NoSuchGroup(String),

    /// BODY returned 430.
    #[error("no such article: {0}")]
    NoSuchArticle(String),

    /// yEnc decoding failed: missing or malformed header, or CRC mismatch.
    #[error("{0}")]
    Decode(String),

    /// The segment's output file could not be created or written.
    #[error("segment file error: {0}")]
    SegmentFile(String),

    /// The state machine refused a transition.
    #[error("invalid state transition")]
    InvalidTransition,

    /// The segment failed on every configured server.
    #[error("segment failed on all servers")]
    NoMoreServers,

    /// The segment failed on every group its file was posted to.
    #[error("segment failed on all groups")]
    NoMoreGroups,

    /// The component the caller talked to has shut down.
    #[error("shut down")]
    Shutdown,

    /// A job was constructed with unusable parameters.
    #[error("configuration error: {0}")]
    Config(String),

    /// A file was handed to a job that does not own it.
    #[error("asked to grab an unknown file")]
    UnknownFile,
}

impl GrabError {
    /// True if this error was recorded while decoding a segment.
    pub fn is_decode(&self) -> bool {
        matches!(self, GrabError::Decode(_))
    }

    /// True if this error is fatal to the NNTP session that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GrabError::Protocol(_))
    }
}

impl From<std::io::Error> for GrabError {
    fn from(err: std::io::Error) -> Self {
        GrabError::Transport(err.to_string())
    }
}
