//! Background worker
//!
//! Long-lived thread with a stop signal and a heartbeat; each tick drains one
//! unit of work. Flusher, checkpointer and GC all run on this loop.

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub struct Worker {
    name: String,
    stop: Sender<()>,
    heartbeat: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(
        name: impl Into<String>,
        interval: Duration,
        mut tick: impl FnMut() + Send + 'static,
    ) -> Worker {
        let name = name.into();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let heartbeat = Arc::new(AtomicU64::new(0));
        let beat = heartbeat.clone();
        let thread_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        tick();
                        beat.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .expect("spawn worker thread");
        Worker { name, stop: stop_tx, heartbeat, handle: Some(handle) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ticks completed so far.
    pub fn heartbeat(&self) -> u64 {
        self.heartbeat.load(Ordering::Relaxed)
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_ticks_and_stops() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let worker = Worker::spawn("test", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(60));
        assert!(worker.heartbeat() > 0);
        worker.stop();
        let after = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), after);
    }
}
