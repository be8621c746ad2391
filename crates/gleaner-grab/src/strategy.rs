use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use gleaner_core::{GrabError, Supervisor};
use gleaner_nntp::{GrabRequest, GrabResponse, Server as NntpServer};

/// Smoothing factor for the exponentially weighted moving average of
/// download rates.
const RATE_DECAY: f64 = 0.5;

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.name)
            .field("retention", &self.retention)
            .field("must_be_in_group", &self.must_be_in_group)
            .finish_non_exhaustive()
    }
}

/// An NNTP server wrapped with grab-level policy: a display name, a
/// retention horizon, and whether articles must be requested from within
/// a group.
pub struct Server {
    inner: Arc<NntpServer>,
    name: String,
    retention: chrono::Duration,
    must_be_in_group: bool,
    rate: Mutex<f64>,
}

impl Server {
    pub fn new(name: impl Into<String>, inner: Arc<NntpServer>) -> Self {
        Self {
            inner,
            name: name.into(),
            retention: chrono::Duration::zero(),
            must_be_in_group: false,
            rate: Mutex::new(0.0),
        }
    }

    /// Articles older than this are assumed absent from the server. Zero
    /// means unlimited retention.
    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Some servers only serve BODY from within a selected group.
    pub fn with_group_required(mut self) -> Self {
        self.must_be_in_group = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retention(&self) -> chrono::Duration {
        self.retention
    }

    pub fn must_be_in_group(&self) -> bool {
        self.must_be_in_group
    }

    /// Smoothed download rate in bytes per second.
    pub fn rate(&self) -> f64 {
        *self.rate.lock().expect("rate lock")
    }

    pub fn alive(&self) -> bool {
        self.inner.alive()
    }

    pub fn err(&self) -> Option<GrabError> {
        self.inner.err()
    }

    pub async fn grab(&self, request: GrabRequest) -> Result<(), GrabError> {
        self.inner.grab(request).await
    }

    pub async fn handle_grabs(&self) -> Result<(), GrabError> {
        self.inner.handle_grabs().await
    }

    pub async fn shutdown(&self, err: Option<GrabError>) -> Option<GrabError> {
        self.inner.shutdown(err).await
    }

    fn take_responses(&self) -> Option<mpsc::Receiver<GrabResponse>> {
        self.inner.grabbed()
    }

    fn update_rate(&self, seconds: f64, bytes: u64) {
        let mut rate = self.rate.lock().expect("rate lock");
        *rate = ewma(*rate, seconds, bytes);
    }
}

fn ewma(rate: f64, seconds: f64, bytes: u64) -> f64 {
    let seconds = seconds.max(1e-6);
    (bytes as f64 / seconds) * RATE_DECAY + rate * (1.0 - RATE_DECAY)
}

/// Aggregate rate bookkeeping shared with the per-server forwarding
/// tasks.
struct RateMeter {
    rate: Mutex<f64>,
    total_bytes: AtomicU64,
    started: Instant,
}

impl RateMeter {
    fn update(&self, seconds: f64, bytes: u64) {
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
        let mut rate = self.rate.lock().expect("rate lock");
        *rate = ewma(*rate, seconds, bytes);
    }
}

/// A response from some server in the strategy, tagged with its origin so
/// failover bookkeeping can name the server that produced it.
pub struct AggregatedResponse {
    pub server: Arc<Server>,
    pub response: GrabResponse,
}

/// A priority-ordered group of servers behind a single aggregated
/// response channel. Position in the list is priority: the dispatcher
/// offers each segment to the first server that has not failed it.
pub struct Strategy {
    servers: Vec<Arc<Server>>,
    reconnect: Duration,
    meter: Arc<RateMeter>,
    agg_tx: mpsc::Sender<AggregatedResponse>,
    agg_rx: Mutex<Option<mpsc::Receiver<AggregatedResponse>>>,
    supervisor: Arc<Supervisor>,
    connected: AtomicBool,
}

impl Strategy {
    pub fn new(servers: Vec<Arc<Server>>) -> Self {
        // Aggregate capacity mirrors the sum of the servers' own response
        // channels; the aggregator never becomes the bottleneck.
        let capacity: usize = servers
            .iter()
            .map(|s| s.inner.max_sessions())
            .sum::<usize>()
            .max(1);
        let (agg_tx, agg_rx) = mpsc::channel(capacity);
        Self {
            servers,
            reconnect: Duration::from_secs(30),
            meter: Arc::new(RateMeter {
                rate: Mutex::new(0.0),
                total_bytes: AtomicU64::new(0),
                started: Instant::now(),
            }),
            agg_tx,
            agg_rx: Mutex::new(Some(agg_rx)),
            supervisor: Arc::new(Supervisor::new()),
            connected: AtomicBool::new(false),
        }
    }

    /// How often dead servers are given another chance to connect.
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect = interval;
        self
    }

    pub fn servers(&self) -> &[Arc<Server>] {
        &self.servers
    }

    /// Smoothed aggregate download rate in bytes per second.
    pub fn rate(&self) -> f64 {
        *self.meter.rate.lock().expect("rate lock")
    }

    /// Total bytes over wall-clock time since the strategy started.
    pub fn average_rate(&self) -> f64 {
        let elapsed = self.meter.started.elapsed().as_secs_f64().max(1e-6);
        self.meter.total_bytes.load(Ordering::Relaxed) as f64 / elapsed
    }

    /// Connect every server, start forwarding its responses into the
    /// aggregated channel, and keep reconnecting it while the strategy
    /// lives. Idempotent.
    pub async fn connect(&self) {
        if self.connected.swap(true, Ordering::SeqCst) {
            return;
        }

        for server in &self.servers {
            if let Err(e) = server.handle_grabs().await {
                tracing::warn!(server = server.name(), error = %e, "initial connect failed");
            }
            self.forward_responses(server);
            self.reconnect_if_disconnected(server);
        }
    }

    fn forward_responses(&self, server: &Arc<Server>) {
        let Some(mut responses) = server.take_responses() else {
            tracing::warn!(server = server.name(), "response channel already claimed");
            return;
        };
        let server = Arc::clone(server);
        let meter = Arc::clone(&self.meter);
        let agg_tx = self.agg_tx.clone();
        let dying = self.supervisor.dying();
        self.supervisor.spawn(async move {
            loop {
                let response = tokio::select! {
                    _ = dying.cancelled() => return Ok(()),
                    response = responses.recv() => match response {
                        Some(response) => response,
                        None => return Ok(()),
                    },
                };
                let seconds = response.duration.as_secs_f64();
                server.update_rate(seconds, response.bytes);
                meter.update(seconds, response.bytes);

                let tagged = AggregatedResponse {
                    server: Arc::clone(&server),
                    response,
                };
                tokio::select! {
                    _ = dying.cancelled() => return Ok(()),
                    sent = agg_tx.send(tagged) => {
                        if sent.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        });
    }

    fn reconnect_if_disconnected(&self, server: &Arc<Server>) {
        let server = Arc::clone(server);
        let dying = self.supervisor.dying();
        let reconnect = self.reconnect;
        self.supervisor.spawn(async move {
            let mut tick = tokio::time::interval(reconnect);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = dying.cancelled() => return Ok(()),
                    _ = tick.tick() => {
                        if let Err(e) = server.handle_grabs().await {
                            tracing::debug!(server = server.name(), error = %e, "reconnect failed");
                        }
                    }
                }
            }
        });
    }

    /// The aggregated response channel. Yields `Some` exactly once.
    pub fn grabbed(&self) -> Option<mpsc::Receiver<AggregatedResponse>> {
        self.agg_rx.lock().expect("aggregate receiver lock").take()
    }

    /// Shut down every server, then the aggregation tasks.
    pub async fn shutdown(&self, err: Option<GrabError>) -> Option<GrabError> {
        for server in &self.servers {
            if let Some(e) = server.shutdown(err.clone()).await
                && err.as_ref() != Some(&e)
            {
                tracing::debug!(server = server.name(), error = %e, "server shutdown");
            }
        }
        self.supervisor.kill(err);
        self.supervisor.wait().await
    }
}
