use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};

/// A task running on its own thread, either once or on a fixed interval.
/// Runs never overlap: the next tick is scheduled only after the previous
/// run returns.
pub struct Task {
    name: String,
    /// `None` for one-shot tasks, which cannot be stopped early.
    stop: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Task {
    /// Runs `work` immediately, then again every `interval` until cancelled.
    pub fn every<F>(name: &str, interval: Duration, mut work: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(format!("sync-{name}"))
            .spawn(move || loop {
                work();
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        tracing::debug!("{} timer stopped", thread_name);
                        break;
                    }
                }
            })
            .with_context(|| format!("spawn {name} timer"))?;

        Ok(Self {
            name: name.to_string(),
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Runs `work` once. Cancelling waits for it to return.
    pub fn once<F>(name: &str, work: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(format!("sync-{name}"))
            .spawn(work)
            .with_context(|| format!("spawn {name} task"))?;

        Ok(Self {
            name: name.to_string(),
            stop: None,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }

    /// Stops future ticks and waits for an in-progress run to return.
    pub fn cancel(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("{} task panicked", self.name);
            }
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.cancel();
    }
}
