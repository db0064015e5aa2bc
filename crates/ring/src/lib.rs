//! A generic, fixed-capacity, single-writer/many-reader event ring with lap
//! detection.
//!
//! One writer appends; any number of readers hold an independent read
//! cursor. Writes never block on readers — a reader that falls more than
//! `capacity` entries behind is "lapped" and receives [`RingError::SlowReader`]
//! on its next read rather than stale or missing data.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One entry in the ring, tagged with its writer-assigned sequence number.
#[derive(Debug, Clone)]
pub struct Entry<T> {
    pub seq: u64,
    pub value: T,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingError {
    /// The reader fell more than `capacity` entries behind; `missed` is how
    /// many entries were skipped. The reader's cursor is left unchanged —
    /// callers decide whether to rewind or jump to the current head.
    SlowReader { missed: u64 },
    /// The ring has been closed and all buffered entries have been drained.
    BufferClosed,
    /// The caller's cancellation token fired before an entry arrived.
    Cancelled,
}

struct Inner<T> {
    capacity: usize,
    buf: VecDeque<Entry<T>>,
    /// seq of the oldest entry still in `buf`, or the next seq to be
    /// assigned if `buf` is empty and nothing has ever been dropped.
    base_seq: u64,
    next_seq: u64,
    closed: bool,
}

/// A bounded ring shared by one writer and any number of readers.
pub struct Ring<T> {
    state: Mutex<Inner<T>>,
    cond: Condvar,
}

impl<T: Clone> Ring<T> {
    pub fn new(capacity: usize) -> Arc<Self> {
        assert!(capacity > 0, "ring capacity must be positive");
        Arc::new(Self {
            state: Mutex::new(Inner {
                capacity,
                buf: VecDeque::with_capacity(capacity),
                base_seq: 0,
                next_seq: 0,
                closed: false,
            }),
            cond: Condvar::new(),
        })
    }

    /// Appends `value`, assigning it the next sequence number. Non-blocking:
    /// if the ring is at capacity the oldest entry is evicted.
    pub fn write(&self, value: T) -> u64 {
        self.write_with(|_seq| value)
    }

    /// Like [`Self::write`], but `build` receives the sequence number that
    /// will be assigned before constructing the value — lets callers whose
    /// `T` carries its own `seq` field stamp it correctly in the same atomic
    /// step, relying on the single-writer invariant.
    pub fn write_with(&self, build: impl FnOnce(u64) -> T) -> u64 {
        let mut inner = self.state.lock().expect("ring mutex poisoned");
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let value = build(seq);
        if inner.buf.len() == inner.capacity {
            inner.buf.pop_front();
            inner.base_seq += 1;
        }
        inner.buf.push_back(Entry { seq, value });
        self.cond.notify_all();
        seq
    }

    /// Closes the ring. Buffered entries are still delivered to readers;
    /// once drained, readers receive [`RingError::BufferClosed`].
    pub fn close(&self) {
        let mut inner = self.state.lock().expect("ring mutex poisoned");
        inner.closed = true;
        self.cond.notify_all();
    }

    /// Sequence number of the most recent write, or `None` if nothing has
    /// been written yet.
    pub fn head_seq(&self) -> Option<u64> {
        let inner = self.state.lock().expect("ring mutex poisoned");
        if inner.next_seq == 0 { None } else { Some(inner.next_seq - 1) }
    }

    /// Creates a reader positioned just after `last_seq` (or at the current
    /// head if `None`).
    pub fn reader(self: &Arc<Self>, last_seq: Option<u64>) -> RingReader<T> {
        let start = last_seq.unwrap_or_else(|| self.state.lock().expect("ring mutex poisoned").next_seq.wrapping_sub(1));
        RingReader { ring: Arc::clone(self), last_seq: start }
    }

    fn read_next(&self, last_seq: u64) -> Result<Entry<T>, RingError> {
        let mut inner = self.state.lock().expect("ring mutex poisoned");
        loop {
            let want = last_seq.wrapping_add(1);
            if let Some(front) = inner.buf.front() {
                if front.seq > want {
                    // Lapped: the entry we wanted has already been evicted.
                    let missed = front.seq - want;
                    return Err(RingError::SlowReader { missed });
                }
                let offset = (want - front.seq) as usize;
                if let Some(entry) = inner.buf.get(offset) {
                    return Ok(entry.clone());
                }
            }
            if inner.closed {
                return Err(RingError::BufferClosed);
            }
            inner = self.cond.wait(inner).expect("ring mutex poisoned");
        }
    }

    fn read_next_timeout(&self, last_seq: u64, timeout: Duration) -> Result<Entry<T>, RingError> {
        let mut inner = self.state.lock().expect("ring mutex poisoned");
        loop {
            let want = last_seq.wrapping_add(1);
            if let Some(front) = inner.buf.front() {
                if front.seq > want {
                    let missed = front.seq - want;
                    return Err(RingError::SlowReader { missed });
                }
                let offset = (want - front.seq) as usize;
                if let Some(entry) = inner.buf.get(offset) {
                    return Ok(entry.clone());
                }
            }
            if inner.closed {
                return Err(RingError::BufferClosed);
            }
            let (guard, result) = self.cond.wait_timeout(inner, timeout).expect("ring mutex poisoned");
            inner = guard;
            if result.timed_out() {
                return Err(RingError::Cancelled);
            }
        }
    }

    /// Rewinds to the newest buffered entry for which `pred` returns `true`,
    /// returning its seq. Used to resume a watch at a client-supplied
    /// resource version.
    pub fn rewind(&self, pred: impl Fn(&T) -> bool) -> Option<u64> {
        let inner = self.state.lock().expect("ring mutex poisoned");
        inner.buf.iter().rev().find(|e| pred(&e.value)).map(|e| e.seq)
    }
}

/// A positional reader over a [`Ring`]. Each reader has its own cursor and
/// advances independently of every other reader.
pub struct RingReader<T> {
    ring: Arc<Ring<T>>,
    last_seq: u64,
}

impl<T: Clone> RingReader<T> {
    /// Blocks until the next entry is available, the ring closes and drains,
    /// or `token` is cancelled. On `SlowReader`, the cursor is left
    /// unadvanced; the caller decides whether to call [`Self::jump_to_head`].
    pub fn read(&mut self, token: &CancellationToken) -> Result<T, RingError> {
        const POLL: Duration = Duration::from_millis(100);
        loop {
            if token.is_cancelled() {
                return Err(RingError::Cancelled);
            }
            match self.ring.read_next_timeout(self.last_seq, POLL) {
                Ok(entry) => {
                    self.last_seq = entry.seq;
                    return Ok(entry.value);
                }
                Err(RingError::Cancelled) => continue, // poll timeout, not real cancellation
                Err(other) => return Err(other),
            }
        }
    }

    /// Blocking read with no cancellation support, for contexts (tests,
    /// synchronous callers) that never need to interrupt a wait.
    pub fn read_blocking(&mut self) -> Result<T, RingError> {
        let entry = self.ring.read_next(self.last_seq)?;
        self.last_seq = entry.seq;
        Ok(entry.value)
    }

    pub fn rewind(&mut self, pred: impl Fn(&T) -> bool) -> bool {
        if let Some(seq) = self.ring.rewind(pred) {
            self.last_seq = seq;
            true
        } else {
            false
        }
    }

    pub fn jump_to_head(&mut self) {
        self.last_seq = self.ring.head_seq().unwrap_or(self.last_seq);
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }
}
