//! Fixed pool of frame buffers shuttled between a producer and the application

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;
use tracing::{debug, warn};

use super::buffer::VideoBuf;
use crate::error::{Error, Result};

const DRAIN_RETRIES: usize = 100;
const DRAIN_SLEEP: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    /// Checked out to the application
    App,
    /// Queued to the producer, waiting to be filled
    Queued,
    /// Being filled (or displayed) by the producer
    Device,
    /// Filled, waiting for the application to dequeue it
    Done,
}

struct State {
    owner: Vec<Owner>,
    incoming: HeapRb<usize>,
    done: HeapRb<usize>,
    nqueued: usize,
    aborted: bool,
}

#[derive(Default)]
struct Stats {
    filled: AtomicUsize,
    dropped: AtomicUsize,
}

/// Snapshot of pool activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub filled: usize,
    pub dropped: usize,
    pub queued: usize,
}

/// A pool of `size` buffers. Each buffer is at any time either owned by the
/// application or queued to the producer, never both. All buffers start out
/// owned by the application.
pub struct VideoBuffers {
    name: String,
    bufs: Vec<Arc<VideoBuf>>,
    state: Mutex<State>,
    cond: Condvar,
    stats: CachePadded<Stats>,
}

impl VideoBuffers {
    /// Allocates `count` buffers of `len` bytes. With `shared` set, buffers
    /// are memory-mapped and export a file descriptor.
    pub fn new(name: impl Into<String>, count: usize, len: usize, shared: bool) -> Result<Self> {
        let name = name.into();
        if count == 0 {
            return Err(Error::format(format!("{name}: cannot create an empty buffer pool")));
        }
        let bufs = (0..count)
            .map(|_| {
                if shared {
                    VideoBuf::shared(len).map(Arc::new)
                } else {
                    Ok(Arc::new(VideoBuf::heap(len)))
                }
            })
            .collect::<Result<Vec<_>>>()?;
        debug!("{name}: allocated {count} buffers of {len} bytes");

        Ok(Self {
            name,
            bufs,
            state: Mutex::new(State {
                owner: vec![Owner::App; count],
                incoming: HeapRb::new(count),
                done: HeapRb::new(count),
                nqueued: 0,
                aborted: false,
            }),
            cond: Condvar::new(),
            stats: CachePadded::new(Stats::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.bufs.len()
    }

    /// Number of buffers currently not owned by the application
    pub fn nqueued(&self) -> usize {
        self.lock().nqueued
    }

    pub fn get(&self, index: usize) -> Result<Arc<VideoBuf>> {
        self.bufs
            .get(index)
            .cloned()
            .ok_or_else(|| self.invalid(index))
    }

    /// Returns buffer `index` to the producer queue.
    pub fn qbuf(&self, index: usize) -> Result<()> {
        if index >= self.size() {
            return Err(self.invalid(index));
        }
        let mut st = self.lock();
        if st.nqueued == self.size() || st.owner[index] != Owner::App {
            return Err(Error::AlreadyQueued {
                name: self.name.clone(),
                index,
                size: self.size(),
            });
        }
        if st.incoming.try_push(index).is_err() {
            return Err(Error::AlreadyQueued {
                name: self.name.clone(),
                index,
                size: self.size(),
            });
        }
        st.owner[index] = Owner::Queued;
        st.nqueued += 1;
        drop(st);
        self.cond.notify_all();
        Ok(())
    }

    /// Queues every buffer the application currently holds.
    pub fn qbufall(&self) -> Result<()> {
        let held: Vec<usize> = {
            let st = self.lock();
            (0..self.size()).filter(|&i| st.owner[i] == Owner::App).collect()
        };
        for index in held {
            self.qbuf(index)?;
        }
        Ok(())
    }

    /// Producer side: takes the oldest queued buffer, if any.
    pub fn take_queued(&self) -> Option<usize> {
        let mut st = self.lock();
        let index = st.incoming.try_pop()?;
        st.owner[index] = Owner::Device;
        Some(index)
    }

    /// Producer side: marks a taken buffer as done so the application can
    /// dequeue it.
    pub fn complete(&self, index: usize, bytes_used: usize) -> Result<()> {
        let buf = self.get(index)?;
        buf.set_bytes_used(bytes_used);
        let mut st = self.lock();
        if st.owner[index] != Owner::Device {
            return Err(Error::format(format!(
                "{}: buffer {index} completed while not owned by the device",
                self.name
            )));
        }
        // done has room for every buffer of the pool
        let _ = st.done.try_push(index);
        st.owner[index] = Owner::Done;
        drop(st);
        self.stats.filled.fetch_add(1, Ordering::Relaxed);
        self.cond.notify_all();
        Ok(())
    }

    /// Producer side: fills the next queued buffer with `fill`, which returns
    /// the number of bytes written. Returns `None` when no buffer is queued,
    /// in which case the frame is counted as dropped.
    pub fn fill_next<F>(&self, fill: F) -> Result<Option<usize>>
    where
        F: FnOnce(&VideoBuf) -> Result<usize>,
    {
        let Some(index) = self.take_queued() else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("frames_dropped", "pool" => self.name.clone()).increment(1);
            return Ok(None);
        };
        match fill(&self.bufs[index]) {
            Ok(used) => {
                self.complete(index, used)?;
                Ok(Some(index))
            }
            Err(e) => {
                self.requeue(index);
                Err(e)
            }
        }
    }

    /// Counts a frame the producer discarded without touching the pool.
    pub fn note_dropped(&self) {
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("frames_dropped", "pool" => self.name.clone()).increment(1);
    }

    fn requeue(&self, index: usize) {
        let mut st = self.lock();
        let _ = st.incoming.try_push(index);
        st.owner[index] = Owner::Queued;
        drop(st);
        self.cond.notify_all();
    }

    /// Blocks until a buffer is done and returns its index.
    pub fn dqbuf(&self) -> Result<usize> {
        let mut st = self.lock();
        loop {
            if let Some(index) = self.pop_done(&mut st)? {
                return Ok(index);
            }
            st = self.cond.wait(st).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Like [`dqbuf`](Self::dqbuf) but gives up after `timeout`.
    pub fn dqbuf_timeout(&self, timeout: Duration) -> Result<Option<usize>> {
        let deadline = Instant::now() + timeout;
        let mut st = self.lock();
        loop {
            if let Some(index) = self.pop_done(&mut st)? {
                return Ok(Some(index));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            st = self
                .cond
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    fn pop_done(&self, st: &mut MutexGuard<'_, State>) -> Result<Option<usize>> {
        if st.aborted {
            return Err(Error::Aborted);
        }
        if st.nqueued == 0 {
            return Err(Error::NotQueued(self.name.clone()));
        }
        let Some(index) = st.done.try_pop() else {
            return Ok(None);
        };
        st.owner[index] = Owner::App;
        st.nqueued -= 1;
        Ok(Some(index))
    }

    /// Reclaims every buffer from the producer. Buffers still held by the
    /// producer after a short series of retries are logged and left alone.
    pub fn dqbufall(&self) {
        for attempt in 0..DRAIN_RETRIES {
            let busy = {
                let mut st = self.lock();
                while let Some(index) = st.done.try_pop() {
                    st.owner[index] = Owner::App;
                    st.nqueued -= 1;
                }
                while let Some(index) = st.incoming.try_pop() {
                    st.owner[index] = Owner::App;
                    st.nqueued -= 1;
                }
                st.nqueued
            };
            if busy == 0 {
                return;
            }
            if attempt + 1 < DRAIN_RETRIES {
                std::thread::sleep(DRAIN_SLEEP);
            }
        }
        warn!(
            "{}: {} buffers still held by the producer after draining",
            self.name,
            self.nqueued()
        );
    }

    /// Wakes every waiter with [`Error::Aborted`] until [`resume`](Self::resume).
    pub fn abort(&self) {
        self.lock().aborted = true;
        self.cond.notify_all();
    }

    pub fn resume(&self) {
        self.lock().aborted = false;
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            filled: self.stats.filled.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            queued: self.nqueued(),
        }
    }

    fn invalid(&self, index: usize) -> Error {
        Error::InvalidIndex {
            name: self.name.clone(),
            index,
            size: self.size(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for VideoBuffers {
    fn drop(&mut self) {
        let st = self.lock();
        if st.nqueued > 0 {
            debug!("{}: {} buffers still queued on release", self.name, st.nqueued);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> VideoBuffers {
        VideoBuffers::new("test", n, 8, false).unwrap()
    }

    #[test]
    fn queue_dequeue_cycle() {
        let p = pool(2);
        assert_eq!(p.nqueued(), 0);
        p.qbufall().unwrap();
        assert_eq!(p.nqueued(), 2);

        let idx = p
            .fill_next(|buf| {
                buf.write()[0] = 42;
                Ok(1)
            })
            .unwrap()
            .unwrap();
        assert_eq!(p.dqbuf().unwrap(), idx);
        assert_eq!(p.get(idx).unwrap().read()[0], 42);
        assert_eq!(p.get(idx).unwrap().bytes_used(), 1);
        assert_eq!(p.nqueued(), 1);
    }

    #[test]
    fn double_queue_is_rejected() {
        let p = pool(2);
        p.qbuf(0).unwrap();
        assert!(matches!(p.qbuf(0), Err(Error::AlreadyQueued { index: 0, .. })));
        p.qbuf(1).unwrap();
        assert!(matches!(p.qbuf(1), Err(Error::AlreadyQueued { .. })));
        assert!(matches!(p.qbuf(5), Err(Error::InvalidIndex { .. })));
    }

    #[test]
    fn dqbuf_without_queued_buffers_fails() {
        let p = pool(1);
        assert!(matches!(p.dqbuf(), Err(Error::NotQueued(_))));
    }

    #[test]
    fn overrun_drops_frames() {
        let p = pool(1);
        p.qbuf(0).unwrap();
        assert_eq!(p.fill_next(|_| Ok(0)).unwrap(), Some(0));
        assert_eq!(p.fill_next(|_| Ok(0)).unwrap(), None);
        let stats = p.stats();
        assert_eq!(stats.filled, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn failed_fill_requeues() {
        let p = pool(1);
        p.qbuf(0).unwrap();
        assert!(p.fill_next(|_| Err(Error::NotReady)).is_err());
        assert_eq!(p.fill_next(|_| Ok(3)).unwrap(), Some(0));
    }

    #[test]
    fn abort_unblocks_dqbuf() {
        let p = Arc::new(pool(1));
        p.qbuf(0).unwrap();
        let waiter = {
            let p = p.clone();
            std::thread::spawn(move || p.dqbuf())
        };
        std::thread::sleep(Duration::from_millis(20));
        p.abort();
        assert!(matches!(waiter.join().unwrap(), Err(Error::Aborted)));
        p.resume();
        assert_eq!(p.dqbuf_timeout(Duration::from_millis(5)).unwrap(), None);
    }

    #[test]
    fn dqbufall_reclaims_idle_buffers() {
        let p = pool(3);
        p.qbufall().unwrap();
        p.fill_next(|_| Ok(0)).unwrap();
        p.dqbufall();
        assert_eq!(p.nqueued(), 0);
        p.qbufall().unwrap();
        assert_eq!(p.nqueued(), 3);
    }
}
