//! Background persistence of dirty queues and the orphan queue.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDecision {
    Flush,
    Shutdown,
}

#[derive(Debug, Default)]
struct SignalState {
    requested: bool,
    shutdown: bool,
}

/// Wakes the flush worker early, or stops it.
#[derive(Debug)]
pub struct FlushSignal {
    interval: Duration,
    state: Mutex<SignalState>,
    wakeup: Condvar,
}

impl FlushSignal {
    pub fn new(interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            interval,
            state: Mutex::new(SignalState::default()),
            wakeup: Condvar::new(),
        })
    }

    pub fn request_flush(&self) {
        self.state.lock().requested = true;
        self.wakeup.notify_all();
    }

    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.wakeup.notify_all();
    }

    /// Blocks until the interval elapsed, a flush was requested, or shutdown.
    pub fn wait_for_flush(&self) -> FlushDecision {
        let deadline = Instant::now() + self.interval;
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return FlushDecision::Shutdown;
            }
            if state.requested {
                state.requested = false;
                return FlushDecision::Flush;
            }
            if self.wakeup.wait_until(&mut state, deadline).timed_out() {
                return if state.shutdown {
                    FlushDecision::Shutdown
                } else {
                    FlushDecision::Flush
                };
            }
        }
    }
}

/// Owns the flush thread; dropping it runs a final flush and joins.
#[derive(Debug)]
pub struct FlushWorkerHandle {
    signal: Arc<FlushSignal>,
    join_handle: Option<JoinHandle<()>>,
}

impl FlushWorkerHandle {
    pub fn signal(&self) -> &Arc<FlushSignal> {
        &self.signal
    }

    pub fn stop(&mut self) {
        self.signal.shutdown();
        if let Some(handle) = self.join_handle.take() {
            if handle.join().is_err() {
                log::error!("indexing flush worker panicked");
            }
        }
    }
}

impl Drop for FlushWorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Runs `flush` every interval and once more on shutdown.
pub fn spawn_flush_worker<F>(interval: Duration, flush: F) -> FlushWorkerHandle
where
    F: Fn() + Send + 'static,
{
    let signal = FlushSignal::new(interval);
    let signal_for_thread = signal.clone();
    let join_handle = thread::Builder::new()
        .name("indexing-flush".to_string())
        .spawn(move || loop {
            match signal_for_thread.wait_for_flush() {
                FlushDecision::Flush => flush(),
                FlushDecision::Shutdown => {
                    flush();
                    break;
                }
            }
        });

    let join_handle = match join_handle {
        Ok(handle) => Some(handle),
        Err(error) => {
            log::error!("failed to spawn indexing flush worker: {}", error);
            None
        }
    };
    FlushWorkerHandle {
        signal,
        join_handle,
    }
}
