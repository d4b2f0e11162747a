use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use kiln_core::KilnError;

/// A dedicated thread that runs a closure on a fixed interval until stopped.
///
/// The sleep between ticks waits on a condvar, so `stop()` wakes the thread
/// immediately instead of waiting out the interval.
pub struct PeriodicWorker {
    name: String,
    stop: Arc<(Mutex<bool>, Condvar)>,
    thread: Option<JoinHandle<()>>,
}

impl PeriodicWorker {
    /// Spawn the worker. The first tick runs after one `interval`.
    pub fn spawn<F>(name: impl Into<String>, interval: Duration, mut tick: F) -> Result<Self, KilnError>
    where
        F: FnMut() + Send + 'static,
    {
        let name = name.into();
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let (lock, cvar) = &*signal;
                loop {
                    let guard = lock.lock().unwrap_or_else(|p| p.into_inner());
                    let (guard, _) = cvar
                        .wait_timeout_while(guard, interval, |stopped| !*stopped)
                        .unwrap_or_else(|p| p.into_inner());
                    if *guard {
                        break;
                    }
                    drop(guard);
                    tick();
                }
            })
            .map_err(|e| KilnError::Runtime(format!("failed to spawn {}: {}", name, e)))?;

        debug!(worker = %name, interval_ms = interval.as_millis() as u64, "periodic worker started");
        Ok(Self {
            name,
            stop,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal the thread and wait for it to exit. Idempotent.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        {
            let (lock, cvar) = &*self.stop;
            let mut stopped = lock.lock().unwrap_or_else(|p| p.into_inner());
            *stopped = true;
            cvar.notify_all();
        }
        if thread.thread().id() == std::thread::current().id() {
            // Stopped from inside its own tick; the loop exits on return.
            return;
        }
        if thread.join().is_err() {
            warn!(worker = %self.name, "periodic worker panicked");
        }
        debug!(worker = %self.name, "periodic worker stopped");
    }
}

impl Drop for PeriodicWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
