use std::collections::HashSet;
use std::sync::{Mutex, RwLock, Weak};

use chrono::{DateTime, Utc};

use gleaner_core::{GrabError, SinkHandle};

use crate::file::File;
use crate::state::{Fsm, State, StateCell};
use crate::strategy;

/// Failover bookkeeping, only ever touched by the dispatcher or the
/// response handler; a segment is either queued or in flight, never both.
#[derive(Debug, Default)]
struct Failover {
    failed_servers: HashSet<String>,
    failed_groups: HashSet<String>,
    retries: u32,
}

/// One article-body download unit.
pub struct Segment {
    source: gleaner_nzb::Segment,
    file: Weak<File>,
    state: RwLock<StateCell>,
    sink: Mutex<Option<SinkHandle>>,
    failover: Mutex<Failover>,
}

impl Segment {
    pub(crate) fn new(source: gleaner_nzb::Segment, file: Weak<File>) -> Self {
        Self {
            source,
            file,
            state: RwLock::new(StateCell::default()),
            sink: Mutex::new(None),
            failover: Mutex::new(Failover::default()),
        }
    }

    /// Message-id, without angle brackets.
    pub fn id(&self) -> &str {
        &self.source.article_id
    }

    /// 1-based ordinal within the file.
    pub fn number(&self) -> u32 {
        self.source.number
    }

    pub fn bytes(&self) -> u64 {
        self.source.bytes
    }

    pub fn posted(&self) -> DateTime<Utc> {
        self.file
            .upgrade()
            .map(|f| f.posted())
            .unwrap_or_default()
    }

    pub fn groups(&self) -> Vec<String> {
        self.file.upgrade().map(|f| f.groups()).unwrap_or_default()
    }

    pub(crate) fn file(&self) -> Option<std::sync::Arc<File>> {
        self.file.upgrade()
    }

    /// On-disk name for this segment's decoded output, unique within the
    /// job's working directory.
    pub fn working_filename(&self) -> String {
        let hash = self
            .file
            .upgrade()
            .map(|f| f.hash().to_string())
            .unwrap_or_else(|| gleaner_core::hash::hash_str(&self.source.article_id));
        format!("{hash}.{:08}", self.source.number)
    }

    /// Remember the sink this segment's decoded bytes flow into so the
    /// response handler and the done transition can close it.
    pub fn write_to(&self, sink: SinkHandle) {
        *self.sink.lock().expect("sink lock") = Some(sink);
    }

    pub fn writing_to(&self) -> Option<SinkHandle> {
        self.sink.lock().expect("sink lock").clone()
    }

    pub async fn close_sink(&self) {
        if let Some(sink) = self.writing_to() {
            let _ = sink.close().await;
        }
    }

    pub fn fail_group(&self, group: &str) {
        let mut failover = self.failover.lock().expect("failover lock");
        failover.failed_groups.insert(group.to_string());
    }

    /// Mark a server permanently failed for this segment. Group failures
    /// and the retry budget are scoped to a server, so both reset.
    pub fn fail_server(&self, server: &str) {
        let mut failover = self.failover.lock().expect("failover lock");
        failover.failed_servers.insert(server.to_string());
        failover.failed_groups.clear();
        failover.retries = 0;
    }

    pub fn failed_servers(&self) -> HashSet<String> {
        self.failover
            .lock()
            .expect("failover lock")
            .failed_servers
            .clone()
    }

    /// First group this segment has not failed on.
    pub fn select_group(&self, groups: &[String]) -> Result<String, GrabError> {
        let failover = self.failover.lock().expect("failover lock");
        groups
            .iter()
            .find(|g| !failover.failed_groups.contains(*g))
            .cloned()
            .ok_or(GrabError::NoMoreGroups)
    }

    /// First server in strategy priority order this segment has not
    /// failed on.
    pub fn select_server(
        &self,
        servers: &[std::sync::Arc<strategy::Server>],
    ) -> Result<std::sync::Arc<strategy::Server>, GrabError> {
        let failover = self.failover.lock().expect("failover lock");
        servers
            .iter()
            .find(|s| !failover.failed_servers.contains(s.name()))
            .cloned()
            .ok_or(GrabError::NoMoreServers)
    }

    /// Consume one retry on the current server. False once the budget is
    /// spent.
    pub fn retry_server(&self, max: u32) -> bool {
        let mut failover = self.failover.lock().expect("failover lock");
        if failover.retries >= max {
            return false;
        }
        failover.retries += 1;
        true
    }

    pub(crate) fn pause_inner(&self) {
        {
            let state = self.state.read().expect("state lock");
            match state.state {
                State::Pending | State::Working => {}
                _ => return,
            }
        }
        let mut state = self.state.write().expect("state lock");
        match state.state {
            State::Pending => state.state = State::Paused,
            State::Working => state.state = State::Pausing,
            _ => {}
        }
    }

    pub(crate) fn resume_inner(&self) {
        {
            let state = self.state.read().expect("state lock");
            match state.state {
                State::Paused | State::Pausing => {}
                _ => return,
            }
        }
        self.state.write().expect("state lock").state = State::Pending;
    }
}

#[async_trait::async_trait]
impl Fsm for Segment {
    async fn working(&self) -> Result<(), GrabError> {
        {
            let state = self.state.read().expect("state lock");
            match state.state {
                State::Working => return Ok(()),
                State::Pending | State::Pausing => {}
                _ => return Err(GrabError::InvalidTransition),
            }
        }
        {
            let mut state = self.state.write().expect("state lock");
            if state.state == State::Pausing {
                // The dispatcher observed the pause request; park here.
                state.state = State::Paused;
                return Err(GrabError::InvalidTransition);
            }
            state.state = State::Working;
        }
        if let Some(file) = self.file.upgrade() {
            file.working().await?;
        }
        Ok(())
    }

    async fn pause(&self) {
        self.pause_inner();
    }

    async fn resume(&self) {
        self.resume_inner();
    }

    /// A segment transitions to Done exactly once, so its output sink is
    /// closed exactly once and its file counts it exactly once.
    async fn done(&self, err: Option<GrabError>) {
        let sink = {
            let mut state = self.state.write().expect("state lock");
            if state.state == State::Done {
                return;
            }
            state.state = State::Done;
            state.err = err;
            self.sink.lock().expect("sink lock").take()
        };
        if let Some(sink) = sink {
            let _ = sink.close().await;
        }
        if let Some(file) = self.file.upgrade() {
            file.segment_done().await;
        }
    }

    fn state(&self) -> State {
        self.state.read().expect("state lock").state
    }

    fn err(&self) -> Option<GrabError> {
        self.state.read().expect("state lock").err.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy;
    use gleaner_core::sink::BufferSink;
    use std::sync::Arc;

    fn test_file(segment_count: u32) -> Arc<File> {
        let source = gleaner_nzb::File {
            poster: "poster@example.com".into(),
            date: 1_700_000_000,
            subject: "a post with no recognizable name".into(),
            groups: vec!["alt.binaries.test".into(), "alt.binaries.misc".into()],
            segments: (1..=segment_count)
                .map(|n| gleaner_nzb::Segment {
                    bytes: 1000,
                    number: n,
                    article_id: format!("seg{n}@example"),
                })
                .collect(),
        };
        File::new(source, Weak::new(), &[])
    }

    fn strategy_server(name: &str) -> Arc<strategy::Server> {
        let nntp = Arc::new(gleaner_nntp::Server::new("news.fake", 119, 1));
        Arc::new(strategy::Server::new(name, nntp))
    }

    #[tokio::test]
    async fn working_bumps_parent_file() {
        let file = test_file(2);
        let segment = &file.segments()[0];

        segment.working().await.unwrap();
        assert_eq!(segment.state(), State::Working);
        assert_eq!(file.state(), State::Working);
    }

    #[tokio::test]
    async fn working_refuses_paused_segments() {
        let file = test_file(1);
        let segment = &file.segments()[0];

        segment.pause().await;
        assert_eq!(segment.state(), State::Paused);
        assert_eq!(
            segment.working().await.unwrap_err(),
            GrabError::InvalidTransition
        );
    }

    #[tokio::test]
    async fn pause_in_flight_parks_on_next_dispatch() {
        let file = test_file(1);
        let segment = &file.segments()[0];

        segment.working().await.unwrap();
        segment.pause().await;
        assert_eq!(segment.state(), State::Pausing);

        // The dispatcher's next working() observes the request and parks.
        assert!(segment.working().await.is_err());
        assert_eq!(segment.state(), State::Paused);

        segment.resume().await;
        assert_eq!(segment.state(), State::Pending);
    }

    #[tokio::test]
    async fn done_is_idempotent_and_closes_sink_once() {
        let file = test_file(2);
        let segment = &file.segments()[0];
        let buffer = BufferSink::new();
        segment.write_to(SinkHandle::new(Box::new(buffer.clone())));

        for _ in 0..3 {
            segment.done(Some(GrabError::NoMoreServers)).await;
        }

        assert_eq!(segment.state(), State::Done);
        assert_eq!(segment.err(), Some(GrabError::NoMoreServers));
        assert_eq!(buffer.close_count(), 1);
        // The parent counted exactly one completion out of two.
        assert_ne!(file.state(), State::Done);
    }

    #[tokio::test]
    async fn file_completes_when_every_segment_is_done() {
        let file = test_file(3);
        for segment in file.segments() {
            segment.done(None).await;
        }
        assert_eq!(file.state(), State::Done);
        assert!(file.err().is_none());
    }

    #[tokio::test]
    async fn select_server_skips_failed_servers() {
        let file = test_file(1);
        let segment = &file.segments()[0];
        let servers = vec![
            strategy_server("a"),
            strategy_server("b"),
            strategy_server("c"),
        ];

        assert_eq!(segment.select_server(&servers).unwrap().name(), "a");
        segment.fail_server("a");
        assert_eq!(segment.select_server(&servers).unwrap().name(), "b");
        segment.fail_server("b");
        segment.fail_server("c");
        assert_eq!(
            segment.select_server(&servers).unwrap_err(),
            GrabError::NoMoreServers
        );
    }

    #[tokio::test]
    async fn select_group_skips_failed_groups() {
        let file = test_file(1);
        let segment = &file.segments()[0];
        let groups = segment.groups();

        assert_eq!(segment.select_group(&groups).unwrap(), "alt.binaries.test");
        segment.fail_group("alt.binaries.test");
        assert_eq!(segment.select_group(&groups).unwrap(), "alt.binaries.misc");
        segment.fail_group("alt.binaries.misc");
        assert_eq!(
            segment.select_group(&groups).unwrap_err(),
            GrabError::NoMoreGroups
        );
    }

    #[tokio::test]
    async fn fail_server_resets_groups_and_retries() {
        let file = test_file(1);
        let segment = &file.segments()[0];

        segment.fail_group("alt.binaries.test");
        assert!(segment.retry_server(2));
        assert!(segment.retry_server(2));
        assert!(!segment.retry_server(2));

        segment.fail_server("a");

        // A fresh server gets a clean slate.
        assert_eq!(
            segment.select_group(&segment.groups()).unwrap(),
            "alt.binaries.test"
        );
        assert!(segment.retry_server(2));
    }

    #[tokio::test]
    async fn working_filename_is_hash_and_padded_ordinal() {
        let file = test_file(2);
        let segment = &file.segments()[1];
        assert_eq!(
            segment.working_filename(),
            format!("{}.00000002", file.hash())
        );
    }
}
