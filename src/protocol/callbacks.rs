//! Callback dispatch pools.
//!
//! Two fixed-size worker pools dispatch container-originated callbacks:
//! a 2-thread "general" pool (feed data, control requests, debug,
//! subscription, recent-data) and a 1-thread "CRUD" pool (create/update/
//! delete/list callbacks and CRUD request completions), so that a
//! creation callback is always observed by user code before the matching
//! request's completion is signalled and before any other CRUD event for
//! the same resource, per spec.md §4.D.8. A callback registered as CRUD
//! may opt out of serialization and run on the general pool instead.
//!
//! Grounded on `ThreadPool.py`: a bounded queue of `(func, args)` jobs
//! drained by N named worker threads, each polling a stop flag with a
//! short timeout so pool shutdown is prompt; exceptions raised by a
//! callback are caught and logged, never propagated to the container's
//! own threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send + 'static>;

const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A fixed-size pool of named worker threads draining a shared job queue.
pub struct CallbackPool {
    sender: mpsc::Sender<Job>,
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl CallbackPool {
    /// Spawns `num_workers` threads named `"{name_prefix}-{n}"`.
    #[must_use]
    pub fn start(num_workers: usize, name_prefix: &str) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(std::sync::Mutex::new(receiver));
        let stop = Arc::new(AtomicBool::new(false));

        let handles = (0..num_workers.max(1))
            .map(|i| {
                let receiver = Arc::clone(&receiver);
                let stop = Arc::clone(&stop);
                std::thread::Builder::new()
                    .name(format!("{name_prefix}-{i}"))
                    .spawn(move || loop {
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }
                        let job = {
                            let rx = receiver.lock().expect("callback pool receiver mutex poisoned");
                            rx.recv_timeout(WORKER_POLL_INTERVAL)
                        };
                        match job {
                            Ok(job) => job(),
                            Err(RecvTimeoutError::Timeout) => continue,
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    })
                    .expect("failed to spawn callback pool worker")
            })
            .collect();

        Self {
            sender,
            stop,
            handles,
        }
    }

    /// Submits a job. Panics inside `job` are not caught by this pool —
    /// callers are expected to wrap any fallible callback body so that a
    /// single misbehaving callback logs and continues rather than
    /// poisoning the worker thread.
    pub fn submit(&self, job: Job) {
        let _ = self.sender.send(job);
    }

    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

/// Wraps a user callback so a panic is caught, logged, and never
/// propagated — mirroring `ThreadPool.py`'s bare `except:` around each
/// dispatched call.
pub fn guarded<F: FnOnce() + std::panic::UnwindSafe + Send + 'static>(name: &'static str, f: F) -> Job {
    Box::new(move || {
        if let Err(_panic) = std::panic::catch_unwind(f) {
            log::warn!("callback '{name}' panicked; continuing");
        }
    })
}

/// The two dispatch pools a protocol client owns: general (2 workers) and
/// CRUD (1 worker, serializing creation-before-completion ordering).
pub struct CallbackPools {
    pub general: CallbackPool,
    pub crud: CallbackPool,
}

impl CallbackPools {
    #[must_use]
    pub fn start() -> Self {
        Self {
            general: CallbackPool::start(2, "cb-general"),
            crud: CallbackPool::start(1, "cb-crud"),
        }
    }

    pub fn shutdown(self) {
        self.general.shutdown();
        self.crud.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn test_jobs_run_and_pool_shuts_down() {
        let pool = CallbackPool::start(2, "test-pool");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        // give workers a moment to drain
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        pool.shutdown();
    }

    #[test]
    fn test_crud_pool_serializes_order() {
        let pool = CallbackPool::start(1, "test-crud");
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = Arc::clone(&order);
            pool.submit(Box::new(move || {
                order.lock().unwrap().push(i);
            }));
        }
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        pool.shutdown();
    }

    #[test]
    fn test_guarded_callback_panic_does_not_kill_worker() {
        let pool = CallbackPool::start(1, "test-guarded");
        pool.submit(guarded("boom", || panic!("boom")));
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        pool.submit(guarded("after", move || ran2.store(true, Ordering::SeqCst)));
        std::thread::sleep(Duration::from_millis(300));
        assert!(ran.load(Ordering::SeqCst));
        pool.shutdown();
    }
}
