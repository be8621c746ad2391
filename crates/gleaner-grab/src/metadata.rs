/// A piece of NZB `<head>` metadata attached to a job.
#[derive(Debug, Clone)]
pub struct Metadata {
    source: gleaner_nzb::Metadata,
}

impl Metadata {
    pub(crate) fn new(source: gleaner_nzb::Metadata) -> Self {
        Self { source }
    }

    pub fn kind(&self) -> &str {
        &self.source.kind
    }

    pub fn value(&self) -> &str {
        &self.source.value
    }
}
