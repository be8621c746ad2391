use thiserror::Error;

#[derive(Debug, Error)]
pub enum NzbError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("malformed NZB: {0}")]
    Malformed(String),
}
