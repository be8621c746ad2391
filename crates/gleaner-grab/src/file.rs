use std::sync::{Arc, Mutex, RwLock, Weak};

use chrono::{DateTime, Utc};
use regex::Regex;

use gleaner_core::GrabError;
use gleaner_magic::{FileType, FileTyper};

use crate::grabber::Grabber;
use crate::segment::Segment;
use crate::state::{Fsm, State, StateCell};

#[derive(Debug)]
struct FileMeta {
    filename: String,
    filetype: FileType,
    required: bool,
    filtered: bool,
}

/// One logical file in the NZB, composed of segments.
pub struct File {
    source: gleaner_nzb::File,
    grabber: Weak<Grabber>,
    weak_self: Weak<File>,
    hash: String,
    segments: Vec<Arc<Segment>>,
    state: RwLock<StateCell>,
    done: Mutex<usize>,
    meta: Mutex<FileMeta>,
}

impl File {
    /// Build a file and its segment tree. Par2 files and subject-filter
    /// matches start paused and not required; the job constructor reads
    /// those flags back for its own bookkeeping.
    pub(crate) fn new(
        source: gleaner_nzb::File,
        grabber: Weak<Grabber>,
        filters: &[Regex],
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self: &Weak<File>| {
            let segments: Vec<Arc<Segment>> = source
                .segments
                .iter()
                .map(|ns| Arc::new(Segment::new(ns.clone(), weak_self.clone())))
                .collect();

            let filetype = gleaner_magic::subject_type(&source.subject);
            let mut meta = FileMeta {
                filename: gleaner_magic::subject_filename(&source.subject),
                filetype,
                required: true,
                filtered: false,
            };
            let mut state = State::Pending;

            if filetype == FileType::Par2 {
                meta.required = false;
                state = State::Paused;
            }
            for filter in filters {
                if filter.is_match(&source.subject) {
                    meta.filtered = true;
                    meta.required = false;
                    state = State::Paused;
                }
            }
            if state == State::Paused {
                for segment in &segments {
                    segment.pause_inner();
                }
            }

            let hash = gleaner_core::hash::hash_str(&source.subject);
            File {
                source,
                grabber,
                weak_self: weak_self.clone(),
                hash,
                segments,
                state: RwLock::new(StateCell {
                    state,
                    err: None,
                }),
                done: Mutex::new(0),
                meta: Mutex::new(meta),
            }
        })
    }

    pub fn subject(&self) -> &str {
        &self.source.subject
    }

    /// FNV-1a digest of the subject; the stable per-file key for working
    /// filenames.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn poster(&self) -> &str {
        &self.source.poster
    }

    pub fn posted(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.source.date, 0).unwrap_or_default()
    }

    pub fn groups(&self) -> Vec<String> {
        self.source.groups.clone()
    }

    pub fn segments(&self) -> &[Arc<Segment>] {
        &self.segments
    }

    pub fn filename(&self) -> String {
        self.meta.lock().expect("meta lock").filename.clone()
    }

    pub fn is_required(&self) -> bool {
        self.meta.lock().expect("meta lock").required
    }

    pub fn is_par2(&self) -> bool {
        self.meta.lock().expect("meta lock").filetype == FileType::Par2
    }

    pub fn is_filtered(&self) -> bool {
        self.meta.lock().expect("meta lock").filtered
    }

    pub(crate) fn belongs_to(&self, grabber: &Weak<Grabber>) -> bool {
        Weak::ptr_eq(&self.grabber, grabber)
    }

    /// Synchronous resume, shared by the async transition and the job
    /// constructor (which resumes the smallest par2 file before any task
    /// is running).
    pub(crate) fn resume_sync(&self) {
        {
            let state = self.state.read().expect("state lock");
            if state.state != State::Paused {
                return;
            }
        }
        self.state.write().expect("state lock").state = State::Resuming;
        for segment in &self.segments {
            segment.resume_inner();
        }
        self.state.write().expect("state lock").state = State::Pending;

        let newly_required = {
            let mut meta = self.meta.lock().expect("meta lock");
            if meta.required {
                false
            } else {
                meta.required = true;
                true
            }
        };
        if newly_required && let Some(grabber) = self.grabber.upgrade() {
            grabber.file_required();
        }
    }

    /// Count one finished segment; the file is Done once every segment
    /// has reported in, whatever order they arrived.
    pub(crate) async fn segment_done(&self) {
        let complete = {
            let mut done = self.done.lock().expect("done counter lock");
            *done += 1;
            *done >= self.segments.len()
        };
        if complete {
            self.done(None).await;
        }
    }
}

#[async_trait::async_trait]
impl Fsm for File {
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
        if let Some(grabber) = self.grabber.upgrade() {
            grabber.working().await?;
        }
        Ok(())
    }

    /// Pause cascades to every segment.
    async fn pause(&self) {
        {
            let state = self.state.read().expect("state lock");
            match state.state {
                State::Pending | State::Working => {}
                _ => return,
            }
        }
        self.state.write().expect("state lock").state = State::Pausing;
        for segment in &self.segments {
            segment.pause().await;
        }
        self.state.write().expect("state lock").state = State::Paused;
    }

    /// Resuming a file that was never required (par2, filtered) makes it
    /// required: someone explicitly asked for it now.
    async fn resume(&self) {
        self.resume_sync();
    }

    async fn done(&self, err: Option<GrabError>) {
        {
            let mut state = self.state.write().expect("state lock");
            state.state = State::Done;
            state.err = err;
        }
        if let Some(grabber) = self.grabber.upgrade()
            && let Some(me) = self.weak_self.upgrade()
        {
            grabber.file_done(me);
        }
    }

    fn state(&self) -> State {
        self.state.read().expect("state lock").state
    }

    fn err(&self) -> Option<GrabError> {
        self.state.read().expect("state lock").err.clone()
    }
}

impl FileTyper for File {
    fn file_type(&self) -> FileType {
        self.meta.lock().expect("meta lock").filetype
    }

    /// Upgrade the detected type, typically from the magic sniffer on the
    /// first segment. A file that turns out to be par2 joins the job's
    /// repair list.
    fn set_file_type(&self, t: FileType) {
        {
            let mut meta = self.meta.lock().expect("meta lock");
            if meta.filetype == t {
                return;
            }
            meta.filetype = t;
        }
        if t == FileType::Par2
            && let (Some(grabber), Some(me)) = (self.grabber.upgrade(), self.weak_self.upgrade())
        {
            grabber.file_is_par2(me);
        }
    }
}
