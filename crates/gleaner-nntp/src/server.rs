use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_rustls::rustls::ClientConfig;

use gleaner_core::{ArticleSink, GrabError, Supervisor};

use crate::conn::{Dialer, TcpDialer};
use crate::session::Session;

/// An article to download: group (may be empty when the server does not
/// require one), message-id without angle brackets, and the sink the body
/// streams into.
pub struct GrabRequest {
    pub group: String,
    pub id: String,
    pub sink: Box<dyn ArticleSink>,
}

/// The outcome of a [`GrabRequest`]. Per-article failures travel in
/// `error`; a fatal protocol failure never produces a response, it kills
/// the server instead.
#[derive(Debug)]
pub struct GrabResponse {
    pub group: String,
    pub id: String,
    pub bytes: u64,
    pub duration: Duration,
    pub error: Option<GrabError>,
}

/// An NNTP server with a fixed-size session pool.
///
/// All sessions pull from one bounded request channel and push into one
/// bounded response channel, both sized to the session count: a full
/// request channel blocks the dispatcher, which is the backpressure this
/// design wants. If any session dies with a protocol error the whole
/// server dies with it and every session is quit; the strategy layer
/// reconnects dead servers on a timer.
pub struct Server {
    hostname: String,
    port: u16,
    username: String,
    password: String,
    tls: Option<Arc<ClientConfig>>,
    max_sessions: usize,
    dialer: Arc<dyn Dialer>,
    sessions: Mutex<Vec<Arc<AsyncMutex<Session>>>>,
    req_tx: mpsc::Sender<GrabRequest>,
    req_rx: Arc<AsyncMutex<mpsc::Receiver<GrabRequest>>>,
    rsp_tx: mpsc::Sender<GrabResponse>,
    rsp_rx: Mutex<Option<mpsc::Receiver<GrabResponse>>>,
    supervisor: Mutex<Option<Arc<Supervisor>>>,
}

impl Server {
    pub fn new(hostname: impl Into<String>, port: u16, max_sessions: usize) -> Self {
        let max_sessions = max_sessions.max(1);
        let (req_tx, req_rx) = mpsc::channel(max_sessions);
        let (rsp_tx, rsp_rx) = mpsc::channel(max_sessions);
        Self {
            hostname: hostname.into(),
            port,
            username: String::new(),
            password: String::new(),
            tls: None,
            max_sessions,
            dialer: Arc::new(TcpDialer),
            sessions: Mutex::new(Vec::new()),
            req_tx,
            req_rx: Arc::new(AsyncMutex::new(req_rx)),
            rsp_tx,
            rsp_rx: Mutex::new(Some(rsp_rx)),
            supervisor: Mutex::new(None),
        }
    }

    pub fn with_tls(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    /// The server's address as a `host:port` string.
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Connect every session and start fulfilling grab requests. A no-op
    /// while the server is alive; any connect failure aborts the whole
    /// start.
    pub async fn handle_grabs(&self) -> Result<(), GrabError> {
        if self.alive() {
            return Ok(());
        }

        let mut sessions = Vec::with_capacity(self.max_sessions);
        for _ in 0..self.max_sessions {
            let mut session = Session::new();
            session
                .connect(self.dialer.as_ref(), &self.hostname, self.port, self.tls.clone())
                .await?;
            session.authenticate(&self.username, &self.password).await?;
            session.compress().await?;
            sessions.push(Arc::new(AsyncMutex::new(session)));
        }
        tracing::debug!(server = %self.address(), sessions = sessions.len(), "sessions connected");

        // A dead supervisor cannot be reused, so every (re)start gets a
        // fresh one.
        let supervisor = Arc::new(Supervisor::new());
        for session in &sessions {
            let session = Arc::clone(session);
            let dying = supervisor.dying();
            let req_rx = Arc::clone(&self.req_rx);
            let rsp_tx = self.rsp_tx.clone();
            let address = self.address();
            supervisor.spawn(async move {
                loop {
                    let request = tokio::select! {
                        _ = dying.cancelled() => return Ok(()),
                        request = async { req_rx.lock().await.recv().await } => {
                            match request {
                                Some(request) => request,
                                None => return Ok(()),
                            }
                        }
                    };

                    let mut sink = request.sink;
                    let started = Instant::now();
                    let result = {
                        let mut session = session.lock().await;
                        session
                            .write_article_body(&request.group, &request.id, sink.as_mut())
                            .await
                    };
                    let (bytes, error) = match result {
                        Ok(bytes) => (bytes, None),
                        Err(e) if e.is_fatal() => {
                            tracing::warn!(server = %address, id = %request.id, error = %e, "session died");
                            return Err(e);
                        }
                        Err(e) => {
                            tracing::debug!(server = %address, id = %request.id, error = %e, "grab failed");
                            (0, Some(e))
                        }
                    };

                    let response = GrabResponse {
                        group: request.group,
                        id: request.id,
                        bytes,
                        duration: started.elapsed(),
                        error,
                    };
                    tokio::select! {
                        _ = dying.cancelled() => return Ok(()),
                        sent = rsp_tx.send(response) => {
                            if sent.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
            });
        }

        *self.sessions.lock().expect("session list lock") = sessions;
        *self.supervisor.lock().expect("supervisor lock") = Some(supervisor);
        Ok(())
    }

    /// Submit a request. Blocks while all sessions are busy; that is the
    /// desired rate control.
    pub async fn grab(&self, request: GrabRequest) -> Result<(), GrabError> {
        self.req_tx
            .send(request)
            .await
            .map_err(|_| GrabError::Shutdown)
    }

    /// The receive side of the response channel. Yields `Some` exactly
    /// once; the strategy aggregator owns it from then on, across server
    /// restarts.
    pub fn grabbed(&self) -> Option<mpsc::Receiver<GrabResponse>> {
        self.rsp_rx.lock().expect("response receiver lock").take()
    }

    /// True while the server is handling requests.
    pub fn alive(&self) -> bool {
        self.supervisor
            .lock()
            .expect("supervisor lock")
            .as_ref()
            .is_some_and(|s| s.alive())
    }

    /// The error that killed the server, if it is dead.
    pub fn err(&self) -> Option<GrabError> {
        let supervisor = self.supervisor.lock().expect("supervisor lock").clone()?;
        if supervisor.alive() {
            return None;
        }
        supervisor.err()
    }

    /// Stop handling requests and quit every session.
    pub async fn shutdown(&self, err: Option<GrabError>) -> Option<GrabError> {
        let supervisor = self.supervisor.lock().expect("supervisor lock").clone();
        let Some(supervisor) = supervisor else {
            return None;
        };
        supervisor.kill(err);
        let terminal = supervisor.wait().await;

        let sessions: Vec<_> = self.sessions.lock().expect("session list lock").clone();
        for session in sessions {
            if let Err(e) = session.lock().await.quit().await {
                tracing::debug!(server = %self.address(), error = %e, "quit failed");
            }
        }
        terminal
    }
}
