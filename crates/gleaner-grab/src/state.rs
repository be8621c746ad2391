use std::fmt;

use gleaner_core::GrabError;

/// Download lifecycle state shared by segments, files, and jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Pending,
    /// A pause was requested while the entity was in flight; it parks as
    /// Paused the next time the dispatcher looks at it.
    Pausing,
    Paused,
    Resuming,
    Working,
    Done,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Pending => "pending",
            State::Pausing => "pausing",
            State::Paused => "paused",
            State::Resuming => "resuming",
            State::Working => "working",
            State::Done => "done",
        };
        f.write_str(name)
    }
}

/// The uniform state machine surface of segments, files, and jobs.
///
/// `working` is the only transition that can be refused; pause and resume
/// are no-ops outside their source states, and `done` is idempotent.
#[async_trait::async_trait]
pub trait Fsm: Send + Sync {
    async fn working(&self) -> Result<(), GrabError>;
    async fn pause(&self);
    async fn resume(&self);
    async fn done(&self, err: Option<GrabError>);
    fn state(&self) -> State;
    fn err(&self) -> Option<GrabError>;
}

/// State plus the terminal error, guarded together.
#[derive(Debug, Default)]
pub(crate) struct StateCell {
    pub state: State,
    pub err: Option<GrabError>,
}
