//! Handle for the background copy-GC thread.
//!
//! Candidate selection and data movement are supplied by the caller as a
//! pass closure; this handle only starts, stops and restarts the thread so
//! a bucket-array resize can quiesce it.

use bfs_error::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

type PassFn = Arc<dyn Fn() + Send + Sync>;

struct Running {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct CopyGcWorker {
    name: String,
    interval: Duration,
    pass: PassFn,
    passes: Arc<AtomicU64>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for CopyGcWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyGcWorker")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("passes", &self.passes())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl CopyGcWorker {
    pub fn new(name: impl Into<String>, interval: Duration, pass: PassFn) -> Self {
        Self {
            name: name.into(),
            interval,
            pass,
            passes: Arc::new(AtomicU64::new(0)),
            running: Mutex::new(None),
        }
    }

    /// Worker that does nothing per pass.
    #[must_use]
    pub fn idle(name: impl Into<String>) -> Self {
        Self::new(name, Duration::from_millis(100), Arc::new(|| {}))
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    #[must_use]
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Spawn the thread; no-op if already running.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let pass = Arc::clone(&self.pass);
        let passes = Arc::clone(&self.passes);
        let interval = self.interval;
        let handle = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                while !thread_stop.load(Ordering::Acquire) {
                    pass();
                    passes.fetch_add(1, Ordering::Relaxed);
                    std::thread::park_timeout(interval);
                }
            })?;
        *running = Some(Running { stop, handle });
        info!(target: "bfs::alloc", worker = %self.name, "copygc_start");
        Ok(())
    }

    /// Stop and join the thread. Returns whether it was running.
    pub fn stop(&self) -> bool {
        let Some(Running { stop, handle }) = self.running.lock().take() else {
            return false;
        };
        stop.store(true, Ordering::Release);
        handle.thread().unpark();
        if handle.join().is_err() {
            warn!(target: "bfs::alloc", worker = %self.name, "copygc_thread_panicked");
        }
        info!(target: "bfs::alloc", worker = %self.name, "copygc_stop");
        true
    }
}

impl Drop for CopyGcWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
