use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::GrabError;

/// A supervised group of tasks with a shared terminal error.
///
/// Tasks spawned into the group select on [`Supervisor::dying`] every loop
/// iteration. The first task to return an error (or the first `kill` with
/// an error) records it and cancels the group; `wait` joins every task and
/// yields that first error. A supervisor cannot be restarted once killed;
/// components that reconnect create a fresh one.
pub struct Supervisor {
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    err: Arc<Mutex<Option<GrabError>>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            err: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawn a task into the group. An `Err` return kills the group.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = Result<(), GrabError>> + Send + 'static,
    {
        let token = self.token.clone();
        let err = Arc::clone(&self.err);
        let handle = tokio::spawn(async move {
            if let Err(e) = fut.await {
                record_first(&err, e);
                token.cancel();
            }
        });
        self.tasks.lock().expect("task list lock").push(handle);
    }

    /// Cancellation token shared by every task in the group.
    pub fn dying(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn alive(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// The group's terminal error, if it has one.
    pub fn err(&self) -> Option<GrabError> {
        self.err.lock().expect("err lock").clone()
    }

    /// Cancel the group, recording `err` if no task has failed yet.
    pub fn kill(&self, err: Option<GrabError>) {
        if let Some(e) = err {
            record_first(&self.err, e);
        }
        self.token.cancel();
    }

    /// Join every task in the group and return the terminal error.
    pub async fn wait(&self) -> Option<GrabError> {
        let handles: Vec<_> = self
            .tasks
            .lock()
            .expect("task list lock")
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.err()
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn record_first(slot: &Mutex<Option<GrabError>>, err: GrabError) {
    let mut slot = slot.lock().expect("err lock");
    if slot.is_none() {
        *slot = Some(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn kill_cancels_all_tasks() {
        let sup = Supervisor::new();
        for _ in 0..3 {
            let dying = sup.dying();
            sup.spawn(async move {
                dying.cancelled().await;
                Ok(())
            });
        }

        assert!(sup.alive());
        sup.kill(None);
        assert!(!sup.alive());
        assert_eq!(sup.wait().await, None);
    }

    #[tokio::test]
    async fn first_task_error_is_terminal() {
        let sup = Supervisor::new();
        sup.spawn(async { Err(GrabError::Protocol("boom".into())) });

        // A later kill with a different error must not overwrite it.
        tokio::time::sleep(Duration::from_millis(10)).await;
        sup.kill(Some(GrabError::Shutdown));

        assert_eq!(sup.wait().await, Some(GrabError::Protocol("boom".into())));
    }

    #[tokio::test]
    async fn task_error_kills_siblings() {
        let sup = Supervisor::new();
        let dying = sup.dying();
        sup.spawn(async move {
            dying.cancelled().await;
            Ok(())
        });
        sup.spawn(async { Err(GrabError::Protocol("bad frame".into())) });

        assert_eq!(
            sup.wait().await,
            Some(GrabError::Protocol("bad frame".into()))
        );
        assert!(!sup.alive());
    }

    #[tokio::test]
    async fn kill_error_is_reported_by_wait() {
        let sup = Supervisor::new();
        let dying = sup.dying();
        sup.spawn(async move {
            dying.cancelled().await;
            Ok(())
        });

        sup.kill(Some(GrabError::Shutdown));
        assert_eq!(sup.wait().await, Some(GrabError::Shutdown));
    }
}
