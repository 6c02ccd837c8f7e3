//! Background tasks that run on a fixed interval
//!
//! Used for the idle-iterator sweep and for scheduled database updates. The
//! worker thread waits on a `crossbeam-channel` ticker and a stop channel, so
//! stopping never has to wait out the rest of an interval.

use crossbeam_channel::{bounded, select, tick, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

/// Handle to a running periodic task
///
/// Stopping is idempotent and also happens on drop.
pub struct PeriodicTask {
    name: String,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawn a named thread calling `task` every `interval`
    ///
    /// The first call happens one interval after spawning.
    pub fn spawn<F>(name: &str, interval: Duration, mut task: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticker = tick(interval);
        let thread_name = name.to_string();

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                debug!(task = %thread_name, ?interval, "periodic task started");
                loop {
                    select! {
                        recv(ticker) -> _ => task(),
                        // A message or a dropped sender both mean stop
                        recv(stop_rx) -> _ => break,
                    }
                }
                debug!(task = %thread_name, "periodic task stopped");
            })?;

        Ok(Self {
            name: name.to_string(),
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Name given at spawn time
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True until [`stop`](Self::stop) has been called
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Signal the thread and wait for it to finish
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_runs_and_stops() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let mut task = PeriodicTask::spawn("test-tick", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) < 2 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(count.load(Ordering::SeqCst) >= 2);

        task.stop();
        assert!(!task.is_running());
        let after = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), after);

        // Second stop is a no-op
        task.stop();
        assert_eq!(task.name(), "test-tick");
    }

    #[test]
    fn test_stop_does_not_wait_for_interval() {
        let mut task = PeriodicTask::spawn("slow", Duration::from_secs(3600), || {}).unwrap();
        let start = std::time::Instant::now();
        task.stop();
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
