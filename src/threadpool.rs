//! Fixed worker pools pinned to core subsets, returning a handle per task

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;
use std::time::Duration;

use flume::{Receiver, Sender, TryRecvError};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker counts and core assignment of the two global pools
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadsConfig {
    pub big_threads: usize,
    pub little_threads: usize,
    /// Cores for the big pool; workers are assigned round-robin
    pub big_cores: Vec<usize>,
    pub little_cores: Vec<usize>,
    /// Pin workers to cores at all
    pub pin: bool,
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        Self {
            big_threads: 4,
            little_threads: 2,
            big_cores: vec![2, 3, 4, 5],
            little_cores: vec![0, 1],
            pin: false,
        }
    }
}

static BIG: Lazy<ThreadPool> = Lazy::new(|| {
    let cfg = crate::CONFIG.load().threads.clone();
    let cores = if cfg.pin { cfg.big_cores } else { Vec::new() };
    ThreadPool::new("big", cfg.big_threads, &cores)
});

static LITTLE: Lazy<ThreadPool> = Lazy::new(|| {
    let cfg = crate::CONFIG.load().threads.clone();
    let cores = if cfg.pin { cfg.little_cores } else { Vec::new() };
    ThreadPool::new("little", cfg.little_threads, &cores)
});

/// Pool for compute-heavy tasks
pub fn big() -> &'static ThreadPool {
    &BIG
}

/// Pool for light background tasks
pub fn little() -> &'static ThreadPool {
    &LITTLE
}

pub struct ThreadPool {
    name: String,
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Starts `threads` workers. When `cores` is not empty, worker `i` is
    /// pinned to `cores[i % cores.len()]` if that core exists.
    pub fn new(name: &str, threads: usize, cores: &[usize]) -> Self {
        let (tx, rx) = flume::unbounded::<Job>();
        let available = core_affinity::get_core_ids().unwrap_or_default();

        let workers = (0..threads.max(1))
            .filter_map(|i| {
                let rx = rx.clone();
                let core = cores
                    .get(i % cores.len().max(1))
                    .and_then(|&c| available.iter().copied().find(|id| id.id == c));
                std::thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || {
                        if let Some(core) = core {
                            if !core_affinity::set_for_current(core) {
                                warn!("Failed to pin worker to core {}", core.id);
                            }
                        }
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .map_err(|e| warn!("Failed to spawn {name} worker {i}: {e}"))
                    .ok()
            })
            .collect::<Vec<_>>();

        debug!("Thread pool {name} started with {} workers", workers.len());
        Self {
            name: name.to_string(),
            tx: Some(tx),
            workers,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues `f` and returns a handle to its result. A panic inside `f` is
    /// reported as an error on the handle.
    pub fn execute<F, T>(&self, f: F) -> TaskHandle<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (res_tx, res_rx) = flume::bounded(1);
        let job: Job = Box::new(move || {
            let res = catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|p| {
                let msg = p
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| p.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                Err(Error::backend(format!("task panicked: {msg}")))
            });
            let _ = res_tx.send(res);
        });
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.send(job) {
                // Workers are gone: run inline so the handle still resolves
                (e.into_inner())();
            }
        }
        TaskHandle { rx: res_rx }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.tx.take();
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}

/// Result of a task running on a [`ThreadPool`]
pub struct TaskHandle<T> {
    rx: Receiver<Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task finishes.
    pub fn wait(self) -> Result<T> {
        self.rx.recv().unwrap_or_else(|_| Err(lost()))
    }

    /// Returns the result if the task finished within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(r) => Some(r),
            Err(flume::RecvTimeoutError::Timeout) => None,
            Err(flume::RecvTimeoutError::Disconnected) => Some(Err(lost())),
        }
    }

    /// Returns the result if the task already finished.
    pub fn try_get(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(r) => Some(r),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(lost())),
        }
    }

    pub async fn join_async(self) -> Result<T> {
        self.rx.recv_async().await.unwrap_or_else(|_| Err(lost()))
    }
}

fn lost() -> Error {
    Error::backend("task was dropped before completion")
}

/// Waits for every task and returns all results, or every error combined.
pub fn join_all<T>(handles: Vec<TaskHandle<T>>) -> Result<Vec<T>> {
    let mut values = Vec::with_capacity(handles.len());
    let mut errors = Vec::new();
    for h in handles {
        match h.wait() {
            Ok(v) => values.push(v),
            Err(e) => errors.push(e),
        }
    }
    match Error::combine(errors) {
        Some(e) => Err(e),
        None => Ok(values),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_tasks_and_returns_results() {
        let pool = ThreadPool::new("test", 2, &[]);
        let handles: Vec<_> = (0..8).map(|i| pool.execute(move || Ok(i * 2))).collect();
        let mut out = join_all(handles).unwrap();
        out.sort();
        assert_eq!(out, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn join_all_reports_every_error() {
        let pool = ThreadPool::new("test", 2, &[]);
        let handles = vec![
            pool.execute(|| Ok(1)),
            pool.execute(|| Err(Error::format("first"))),
            pool.execute(|| Err(Error::format("second"))),
        ];
        let err = join_all(handles).unwrap_err();
        let Error::Multiple(errs) = err else {
            panic!("expected combined error");
        };
        assert_eq!(errs.len(), 2);
    }

    #[test]
    fn panics_become_errors() {
        let pool = ThreadPool::new("test", 1, &[]);
        let h = pool.execute::<_, ()>(|| panic!("boom"));
        let err = h.wait().unwrap_err();
        assert!(err.to_string().contains("boom"));
        // The worker survives the panic
        assert_eq!(pool.execute(|| Ok(5)).wait().unwrap(), 5);
    }

    #[test]
    fn try_get_polls() {
        let pool = ThreadPool::new("test", 1, &[]);
        let gate = Arc::new(AtomicUsize::new(0));
        let g = gate.clone();
        let h = pool.execute(move || {
            while g.load(Ordering::Acquire) == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        });
        assert!(h.try_get().is_none());
        gate.store(1, Ordering::Release);
        assert!(h.wait_timeout(Duration::from_secs(5)).unwrap().is_ok());
    }
}
