use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, Weak};

use chrono::Utc;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use gleaner_core::{ArticleSink, GrabError, SinkHandle, Supervisor};
use gleaner_magic::{FileTyper, Sniffer};
use gleaner_nntp::GrabRequest;
use gleaner_yenc::Decoder;

use crate::file::File;
use crate::metadata::Metadata;
use crate::segment::Segment;
use crate::state::{Fsm, State, StateCell};
use crate::strategy::{AggregatedResponse, Strategy};

/// Wraps a raw output sink in the decode chain: yEnc by default.
pub type DecoderFactory = Arc<dyn Fn(Box<dyn ArticleSink>) -> Box<dyn ArticleSink> + Send + Sync>;

/// Wraps a sink in a type sniffer for the first segment of a file.
pub type SnifferFactory =
    Arc<dyn Fn(Box<dyn ArticleSink>, Arc<dyn FileTyper>) -> Box<dyn ArticleSink> + Send + Sync>;

/// Creates (or truncates) the decoded output sink for a segment.
#[async_trait::async_trait]
pub trait SegmentFileCreator: Send + Sync {
    async fn create(&self, grabber: &Grabber, segment: &Segment) -> Result<SinkHandle, GrabError>;
}

/// The default creator: a file named for the segment in the job's working
/// directory.
pub struct DiskFileCreator;

#[async_trait::async_trait]
impl SegmentFileCreator for DiskFileCreator {
    async fn create(&self, grabber: &Grabber, segment: &Segment) -> Result<SinkHandle, GrabError> {
        let path = grabber.workdir().join(segment.working_filename());
        let file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| GrabError::SegmentFile(format!("{}: {e}", path.display())))?;
        Ok(SinkHandle::new(Box::new(FileSink { file: Some(file) })))
    }
}

struct FileSink {
    file: Option<tokio::fs::File>,
}

#[async_trait::async_trait]
impl ArticleSink for FileSink {
    async fn write(&mut self, buf: &[u8]) -> Result<(), GrabError> {
        match &mut self.file {
            Some(file) => file
                .write_all(buf)
                .await
                .map_err(|e| GrabError::SegmentFile(e.to_string())),
            None => Err(GrabError::SegmentFile("sink is closed".into())),
        }
    }

    async fn close(&mut self) -> Result<(), GrabError> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(|e| GrabError::SegmentFile(e.to_string()))?;
        }
        Ok(())
    }
}

/// Completion bookkeeping for the post-processable signal.
#[derive(Default)]
struct DoneSet {
    files: Vec<Arc<File>>,
    required: usize,
    signaled: bool,
}

impl DoneSet {
    fn is_post_processable(&self) -> bool {
        self.files.len() >= self.required
    }

    fn reset(&mut self) {
        self.files.clear();
        self.required = 0;
        self.signaled = false;
    }
}

impl std::fmt::Debug for Grabber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grabber")
            .field("name", &self.name)
            .field("hash", &self.hash)
            .finish_non_exhaustive()
    }
}

/// One NZB download: the file/segment tree, the enqueue pipeline, the
/// dispatcher, and the response handler.
pub struct Grabber {
    name: String,
    hash: String,
    workdir: PathBuf,
    meta: Vec<Metadata>,
    files: Vec<Arc<File>>,
    par2_files: Mutex<Vec<Arc<File>>>,
    done_files: Mutex<DoneSet>,
    strategy: Arc<Strategy>,
    state: RwLock<StateCell>,
    weak_self: Weak<Grabber>,
    max_retry: u32,
    decoder: DecoderFactory,
    sniffer: SnifferFactory,
    file_creator: Arc<dyn SegmentFileCreator>,
    pp_tx: mpsc::UnboundedSender<()>,
    q_in_tx: mpsc::Sender<Arc<Segment>>,
    q_in_rx: Mutex<Option<mpsc::Receiver<Arc<Segment>>>>,
    q_out_tx: mpsc::Sender<Arc<Segment>>,
    q_out_rx: Mutex<Option<mpsc::Receiver<Arc<Segment>>>>,
    grab_sup: Arc<Supervisor>,
    enqueue_sup: Arc<Supervisor>,
    total_segments: f64,
    failed_segments: Mutex<f64>,
}

pub struct GrabberBuilder {
    name: Option<String>,
    max_retry: u32,
    filters: Vec<Regex>,
    decoder: DecoderFactory,
    sniffer: SnifferFactory,
    file_creator: Arc<dyn SegmentFileCreator>,
    queue_depth: usize,
}

impl GrabberBuilder {
    /// Override the job name derived from the NZB filename.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// How many times a generic error retries on the same server before
    /// failing over.
    pub fn retry_on_error(mut self, max: u32) -> Self {
        self.max_retry = max;
        self
    }

    /// Files whose subject matches any filter start paused and not
    /// required.
    pub fn filter(mut self, filter: Regex) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn decoder(mut self, decoder: DecoderFactory) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn sniffer(mut self, sniffer: SnifferFactory) -> Self {
        self.sniffer = sniffer;
        self
    }

    pub fn segment_file_creator(mut self, creator: Arc<dyn SegmentFileCreator>) -> Self {
        self.file_creator = creator;
        self
    }

    /// Build the job from a parsed NZB. Returns the job and the receiver
    /// that fires once per completed required set.
    pub fn build(
        self,
        workdir: impl Into<PathBuf>,
        strategy: Arc<Strategy>,
        nzb: &gleaner_nzb::Nzb,
    ) -> Result<(Arc<Grabber>, mpsc::UnboundedReceiver<()>), GrabError> {
        let workdir = workdir.into();
        if workdir.as_os_str().is_empty() {
            return Err(GrabError::Config("a job needs a working directory".into()));
        }
        let name = self
            .name
            .or_else(|| {
                let stem = nzb.filename.trim_end_matches(".nzb");
                (!stem.is_empty()).then(|| stem.to_string())
            })
            .ok_or_else(|| GrabError::Config("a job needs a name".into()))?;

        let (pp_tx, pp_rx) = mpsc::unbounded_channel();
        let (q_in_tx, q_in_rx) = mpsc::channel(self.queue_depth);
        let (q_out_tx, q_out_rx) = mpsc::channel(self.queue_depth);

        let grabber = Arc::new_cyclic(|weak_self: &Weak<Grabber>| {
            let mut files = Vec::with_capacity(nzb.files.len());
            let mut par2_files = Vec::new();
            let mut required = 0usize;
            let mut total_segments = 0f64;
            for nf in &nzb.files {
                let file = File::new(nf.clone(), weak_self.clone(), &self.filters);
                total_segments += file.segments().len() as f64;
                if file.is_par2() {
                    par2_files.push(Arc::clone(&file));
                }
                if file.is_required() {
                    required += 1;
                }
                files.push(file);
            }
            par2_files.sort_by_key(|f| f.segments().len());

            let hash = gleaner_core::hash::hash_str(&name);
            Grabber {
                hash,
                name,
                workdir,
                meta: nzb.metadata.iter().cloned().map(Metadata::new).collect(),
                files,
                par2_files: Mutex::new(par2_files),
                done_files: Mutex::new(DoneSet {
                    files: Vec::new(),
                    required,
                    signaled: false,
                }),
                strategy,
                state: RwLock::new(StateCell::default()),
                weak_self: weak_self.clone(),
                max_retry: self.max_retry,
                decoder: self.decoder,
                sniffer: self.sniffer,
                file_creator: self.file_creator,
                pp_tx,
                q_in_tx,
                q_in_rx: Mutex::new(Some(q_in_rx)),
                q_out_tx,
                q_out_rx: Mutex::new(Some(q_out_rx)),
                grab_sup: Arc::new(Supervisor::new()),
                enqueue_sup: Arc::new(Supervisor::new()),
                total_segments,
                failed_segments: Mutex::new(0.0),
            }
        });

        // Resume the smallest par2 file so repair metadata is fetched
        // opportunistically alongside the payload.
        let smallest = grabber.par2_files.lock().expect("par2 lock").first().cloned();
        if let Some(smallest) = smallest {
            smallest.resume_sync();
        }

        Ok((grabber, pp_rx))
    }
}

impl Grabber {
    pub fn builder() -> GrabberBuilder {
        GrabberBuilder {
            name: None,
            max_retry: 3,
            filters: Vec::new(),
            decoder: Arc::new(|sink| Box::new(Decoder::new(sink))),
            sniffer: Arc::new(|sink, typer| Box::new(Sniffer::new(sink, typer))),
            file_creator: Arc::new(DiskFileCreator),
            queue_depth: 100,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// FNV-1a digest of the job name.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn strategy(&self) -> &Arc<Strategy> {
        &self.strategy
    }

    pub fn metadata(&self) -> &[Metadata] {
        &self.meta
    }

    pub fn files(&self) -> &[Arc<File>] {
        &self.files
    }

    pub fn par2_files(&self) -> Vec<Arc<File>> {
        self.par2_files.lock().expect("par2 lock").clone()
    }

    pub fn grabbed_files(&self) -> Vec<Arc<File>> {
        self.done_files.lock().expect("done lock").files.clone()
    }

    /// Percentage of segments that have not permanently failed.
    pub fn health(&self) -> f64 {
        if self.total_segments == 0.0 {
            return 100.0;
        }
        let failed = *self.failed_segments.lock().expect("failed lock");
        100.0 - (failed / self.total_segments * 100.0)
    }

    /// Register a file as par2, keeping the repair list sorted smallest
    /// first. Called at construction and again when the magic sniffer
    /// upgrades a file.
    pub(crate) fn file_is_par2(&self, file: Arc<File>) {
        let mut par2 = self.par2_files.lock().expect("par2 lock");
        if par2.iter().any(|f| Arc::ptr_eq(f, &file)) {
            return;
        }
        par2.push(file);
        par2.sort_by_key(|f| f.segments().len());
    }

    pub(crate) fn file_required(&self) {
        self.done_files.lock().expect("done lock").required += 1;
    }

    /// Count a finished file and fire the post-processable signal when
    /// the current required set is complete.
    pub(crate) fn file_done(&self, file: Arc<File>) {
        let signal = {
            let mut done = self.done_files.lock().expect("done lock");
            done.files.push(file);
            if done.is_post_processable() && !done.signaled {
                done.signaled = true;
                true
            } else {
                false
            }
        };
        if signal {
            let _ = self.pp_tx.send(());
        }
    }

    /// Start the strategy, the response handler, and the enqueue
    /// pipeline. Call once per job.
    pub async fn handle_grabs(&self) {
        self.strategy.connect().await;
        self.handle_responses();
        self.handle_enqueues();
    }

    /// Queue every segment of `file`, resuming it first if it was paused.
    /// Requesting new work after the job signaled post-processable starts
    /// a fresh required batch.
    pub async fn grab_file(&self, file: &Arc<File>) -> Result<(), GrabError> {
        if !file.belongs_to(&self.weak_self) {
            return Err(GrabError::UnknownFile);
        }

        {
            let mut done = self.done_files.lock().expect("done lock");
            if done.is_post_processable() {
                done.reset();
            }
        }

        match file.state() {
            State::Pending => {}
            State::Paused => file.resume().await,
            // Done and working files need no grab; a paused file reaches
            // here only through an explicit resume.
            _ => return Ok(()),
        }

        for segment in file.segments() {
            self.enqueue(Arc::clone(segment)).await;
        }
        Ok(())
    }

    /// Queue every pending file.
    pub async fn grab_all(&self) -> Result<(), GrabError> {
        for file in &self.files {
            if file.state() != State::Pending {
                continue;
            }
            self.grab_file(file).await?;
        }
        Ok(())
    }

    /// Shut the job down: stop producing work, then the servers, then the
    /// response handler. Returns the first terminal error.
    pub async fn shutdown(&self, err: Option<GrabError>) -> Option<GrabError> {
        self.enqueue_sup.kill(err);
        let enqueue_err = self.enqueue_sup.wait().await;
        let strategy_err = self.strategy.shutdown(enqueue_err).await;
        self.grab_sup.kill(strategy_err);
        let terminal = self.grab_sup.wait().await;
        self.done(terminal.clone()).await;
        terminal
    }

    fn segment_failed(&self) {
        *self.failed_segments.lock().expect("failed lock") += 1.0;
    }

    async fn enqueue(&self, segment: Arc<Segment>) {
        let dying = self.enqueue_sup.dying();
        tokio::select! {
            _ = dying.cancelled() => {}
            _ = self.q_in_tx.send(segment) => {}
        }
    }

    /// Classify a grab failure per the failover policy: bad bytes and
    /// missing articles burn the server, a missing group burns only the
    /// group, and anything else retries on the same server until the
    /// budget runs out.
    fn handle_error(&self, segment: &Segment, rsp: &AggregatedResponse, err: &GrabError) {
        match err {
            GrabError::Decode(_) => segment.fail_server(rsp.server.name()),
            GrabError::NoSuchArticle(_) => segment.fail_server(rsp.server.name()),
            GrabError::NoSuchGroup(_) => segment.fail_group(&rsp.response.group),
            _ => {
                if !segment.retry_server(self.max_retry) {
                    segment.fail_server(rsp.server.name());
                }
            }
        }
    }

    fn handle_responses(&self) {
        let Some(mut responses) = self.strategy.grabbed() else {
            tracing::warn!(job = %self.name, "aggregated responses already claimed");
            return;
        };

        let mut segment_index: HashMap<String, Arc<Segment>> = HashMap::new();
        for file in &self.files {
            for segment in file.segments() {
                segment_index.insert(segment.id().to_string(), Arc::clone(segment));
            }
        }

        let weak = self.weak_self.clone();
        let dying = self.grab_sup.dying();
        self.grab_sup.spawn(async move {
            loop {
                let rsp = tokio::select! {
                    _ = dying.cancelled() => return Ok(()),
                    rsp = responses.recv() => match rsp {
                        Some(rsp) => rsp,
                        None => return Ok(()),
                    },
                };
                let Some(grabber) = weak.upgrade() else {
                    return Ok(());
                };
                let Some(segment) = segment_index.get(&rsp.response.id) else {
                    tracing::warn!(id = %rsp.response.id, "response for unknown segment");
                    continue;
                };

                match &rsp.response.error {
                    Some(err) => {
                        grabber.handle_error(segment, &rsp, err);
                        segment.close_sink().await;
                        grabber.enqueue(Arc::clone(segment)).await;
                    }
                    None => segment.done(None).await,
                }
            }
        });
    }

    /// The two-task enqueue pipeline. The forwarding task buffers inflow
    /// and offers the head to the dispatch queue without ever blocking on
    /// it, so requeues from the dispatcher's own task cannot deadlock the
    /// pipeline.
    fn handle_enqueues(&self) {
        let Some(mut q_in_rx) = self.q_in_rx.lock().expect("q_in lock").take() else {
            tracing::warn!(job = %self.name, "enqueue pipeline already started");
            return;
        };
        let Some(mut q_out_rx) = self.q_out_rx.lock().expect("q_out lock").take() else {
            return;
        };

        let q_out_tx = self.q_out_tx.clone();
        let dying = self.enqueue_sup.dying();
        self.enqueue_sup.spawn(async move {
            let mut buffer: VecDeque<Arc<Segment>> = VecDeque::new();
            loop {
                if buffer.is_empty() {
                    tokio::select! {
                        _ = dying.cancelled() => return Ok(()),
                        segment = q_in_rx.recv() => match segment {
                            Some(segment) => buffer.push_back(segment),
                            None => return Ok(()),
                        },
                    }
                } else {
                    tokio::select! {
                        _ = dying.cancelled() => return Ok(()),
                        segment = q_in_rx.recv() => match segment {
                            Some(segment) => buffer.push_back(segment),
                            None => return Ok(()),
                        },
                        permit = q_out_tx.reserve() => match permit {
                            Ok(permit) => {
                                if let Some(segment) = buffer.pop_front() {
                                    permit.send(segment);
                                }
                            }
                            Err(_) => return Ok(()),
                        },
                    }
                }
            }
        });

        let weak = self.weak_self.clone();
        let dying = self.enqueue_sup.dying();
        self.enqueue_sup.spawn(async move {
            loop {
                let segment = tokio::select! {
                    _ = dying.cancelled() => return Ok(()),
                    segment = q_out_rx.recv() => match segment {
                        Some(segment) => segment,
                        None => return Ok(()),
                    },
                };
                let Some(grabber) = weak.upgrade() else {
                    return Ok(());
                };
                grabber.dispatch(segment).await;
            }
        });
    }

    /// Offer a segment to the first viable server. Local failures walk
    /// the failover ladder right here; wire failures come back through
    /// the response handler.
    async fn dispatch(&self, segment: Arc<Segment>) {
        // Only segments that may enter working state get dispatched.
        if segment.working().await.is_err() {
            return;
        }

        loop {
            // Create or truncate the decoded output.
            let sink = match self.file_creator.create(self, &segment).await {
                Ok(sink) => sink,
                Err(e) => {
                    segment.done(Some(e)).await;
                    self.segment_failed();
                    return;
                }
            };
            segment.write_to(sink.clone());

            let server = match segment.select_server(self.strategy.servers()) {
                Ok(server) => server,
                Err(e) => {
                    segment.done(Some(e)).await;
                    self.segment_failed();
                    return;
                }
            };

            // A disconnected server is no use until the strategy's
            // reconnect tick revives it.
            if !server.alive() {
                segment.fail_server(server.name());
                let _ = sink.close().await;
                continue;
            }

            if server.retention() > chrono::Duration::zero()
                && Utc::now() - segment.posted() > server.retention()
            {
                // The article has aged out of this server's retention.
                segment.fail_server(server.name());
                let _ = sink.close().await;
                continue;
            }

            let group = if server.must_be_in_group() {
                match segment.select_group(&segment.groups()) {
                    Ok(group) => group,
                    Err(_) => {
                        segment.fail_server(server.name());
                        let _ = sink.close().await;
                        continue;
                    }
                }
            } else {
                String::new()
            };

            // The first segment also feeds the magic sniffer, which may
            // upgrade the file's detected type from its leading bytes.
            let inner: Box<dyn ArticleSink> = Box::new(sink.clone());
            let wrapped = match (segment.number(), segment.file()) {
                (1, Some(file)) => {
                    let typer: Arc<dyn FileTyper> = file;
                    (self.decoder)((self.sniffer)(inner, typer))
                }
                _ => (self.decoder)(inner),
            };

            let request = GrabRequest {
                group,
                id: segment.id().to_string(),
                sink: wrapped,
            };
            if server.grab(request).await.is_err() {
                segment.fail_server(server.name());
                let _ = sink.close().await;
                continue;
            }
            return;
        }
    }
}

#[async_trait::async_trait]
impl Fsm for Grabber {
    async fn working(&self) -> Result<(), GrabError> {
        {
            let state = self.state.read().expect("state lock");
            match state.state {
                State::Working => return Ok(()),
                State::Pending => {}
                _ => return Err(GrabError::InvalidTransition),
            }
        }
        self.state.write().expect("state lock").state = State::Working;
        Ok(())
    }

    async fn pause(&self) {
        {
            let state = self.state.read().expect("state lock");
            match state.state {
                State::Pending | State::Working => {}
                _ => return,
            }
        }
        for file in &self.files {
            file.pause().await;
        }
        self.state.write().expect("state lock").state = State::Paused;
    }

    /// Resume every required file and re-dispatch the pending ones. Par2
    /// and filtered files stay paused until someone asks for them.
    async fn resume(&self) {
        {
            let state = self.state.read().expect("state lock");
            if state.state != State::Paused {
                return;
            }
        }
        for file in &self.files {
            if !file.is_required() {
                continue;
            }
            file.resume().await;
            if file.state() != State::Pending {
                continue;
            }
            let _ = self.grab_file(file).await;
        }
        self.state.write().expect("state lock").state = State::Pending;
    }

    async fn done(&self, err: Option<GrabError>) {
        let mut state = self.state.write().expect("state lock");
        state.state = State::Done;
        state.err = err;
    }

    fn state(&self) -> State {
        self.state.read().expect("state lock").state
    }

    fn err(&self) -> Option<GrabError> {
        self.state.read().expect("state lock").err.clone()
    }
}
