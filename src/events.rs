use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::types::RunStatus;

/// Queue of finished runs waiting to be reported, mirrored to a JSON file after every change
/// so a restart does not lose them.
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<Mutex<EventLog>>,
}

struct EventLog {
    path: PathBuf,
    events: VecDeque<RunStatus>,
}

impl EventLog {
    fn persist(&self) -> io::Result<()> {
        let data = serde_json::to_vec(&self.events)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &self.path)
    }
}

impl EventQueue {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let events = match fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => VecDeque::new(),
            Err(e) => return Err(e),
        };

        Ok(Self {
            inner: Arc::new(Mutex::new(EventLog { path, events })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, EventLog> {
        // the log stays consistent even if a holder panicked
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, status: RunStatus) -> io::Result<()> {
        let mut log = self.lock();
        log.events.push_back(status);
        let result = log.persist();
        metrics::gauge!("data_ready").set(1.0);
        result
    }

    /// Removes and returns the oldest event.
    pub fn pop(&self) -> io::Result<Option<RunStatus>> {
        let mut log = self.lock();
        let Some(status) = log.events.pop_front() else {
            return Ok(None);
        };

        if let Err(e) = log.persist() {
            log.events.push_front(status);
            return Err(e);
        }

        if log.events.is_empty() {
            metrics::gauge!("data_ready").set(0.0);
        }
        Ok(Some(status))
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    /// The "data ready" signal for the OBC.
    pub fn is_empty(&self) -> bool {
        self.lock().events.is_empty()
    }
}
