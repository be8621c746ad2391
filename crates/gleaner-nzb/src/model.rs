use serde::{Deserialize, Serialize};

/// A segment of a file posted to Usenet: one article.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub bytes: u64,
    pub number: u32,
    /// Message-id without angle brackets.
    pub article_id: String,
}

/// A file posted to Usenet and represented in an NZB.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    pub poster: String,
    /// Post date in unix seconds.
    pub date: i64,
    pub subject: String,
    pub groups: Vec<String>,
    pub segments: Vec<Segment>,
}

/// An element of metadata in an NZB's `<head>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub kind: String,
    pub value: String,
}

/// An NZB index: an ordered list of files with optional metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Nzb {
    /// Basename of the file this NZB was read from, when known. Used for
    /// naming the job and its working files.
    pub filename: String,
    pub metadata: Vec<Metadata>,
    pub files: Vec<File>,
}
