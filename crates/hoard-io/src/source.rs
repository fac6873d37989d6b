//! Origin reads and their completion plumbing.
//!
//! A [`RemoteSource`] performs asynchronous positioned reads; each call is
//! handed a [`ReadCompletion`] and must deliver it exactly once, from any
//! thread. Completions come in two shapes: a single-shot block completion
//! that forwards into the owning engine, and one slice of an aggregate
//! direct read collected by a [`DirectWaiter`].

use std::sync::{Arc, Weak};

use hoard_error::Result;
use hoard_types::BlockIndex;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// Outcome of one origin read: the requested bytes, or an errno.
pub type ReadResult = std::result::Result<Vec<u8>, i32>;

/// Receiver of block fetch completions (implemented by the file engine).
pub trait ResponseSink: Send + Sync {
    fn block_response(&self, index: BlockIndex, result: ReadResult);
}

/// Single-shot completion for one cached-block fetch.
pub struct BlockCompletion {
    sink: Weak<dyn ResponseSink>,
    index: BlockIndex,
}

/// Completion token handed to [`RemoteSource::read_at`].
pub enum ReadCompletion {
    /// Forward to the owning engine's response handler.
    Block(BlockCompletion),
    /// Fill slot `slot` of an aggregate direct read.
    Direct { waiter: Arc<DirectWaiter>, slot: usize },
}

impl ReadCompletion {
    #[must_use]
    pub fn for_block(sink: Weak<dyn ResponseSink>, index: BlockIndex) -> Self {
        Self::Block(BlockCompletion { sink, index })
    }

    /// Deliver the read outcome. Consumes the completion; a source must
    /// call this exactly once per issued read.
    pub fn deliver(self, result: ReadResult) {
        match self {
            Self::Block(completion) => {
                // The engine outlives its blocks by construction; a dead
                // sink means the delivery raced file teardown and the
                // response has nowhere to go.
                if let Some(sink) = completion.sink.upgrade() {
                    sink.block_response(completion.index, result);
                } else {
                    trace!(event = "block_completion_dropped", index = completion.index.0);
                }
            }
            Self::Direct { waiter, slot } => waiter.deliver(slot, result),
        }
    }
}

/// Asynchronous positioned reads from the origin server.
///
/// `read_at` initiates the transfer and returns; the completion is
/// delivered later (possibly before `read_at` returns, for synchronous
/// implementations). `Ok(bytes)` carries exactly `len` bytes.
pub trait RemoteSource: Send + Sync {
    fn read_at(&self, offset: u64, len: usize, completion: ReadCompletion) -> Result<()>;
}

#[derive(Debug)]
struct DirectState {
    remaining: usize,
    /// First non-zero errno wins.
    errno: i32,
    chunks: Vec<Option<Vec<u8>>>,
}

/// Aggregates `n` direct-read completions behind a condition variable.
///
/// Origin completions hold their own `Arc` to the waiter, so a reader that
/// abandons the wait (error on another path) leaves late deliveries with a
/// valid target.
#[derive(Debug)]
pub struct DirectWaiter {
    state: Mutex<DirectState>,
    cond: Condvar,
}

impl DirectWaiter {
    #[must_use]
    pub fn new(n: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DirectState {
                remaining: n,
                errno: 0,
                chunks: (0..n).map(|_| None).collect(),
            }),
            cond: Condvar::new(),
        })
    }

    fn deliver(&self, slot: usize, result: ReadResult) {
        let mut state = self.state.lock();
        debug_assert!(state.remaining > 0);
        state.remaining = state.remaining.saturating_sub(1);
        match result {
            Ok(bytes) => {
                if slot < state.chunks.len() {
                    state.chunks[slot] = Some(bytes);
                }
            }
            Err(errno) => {
                if state.errno == 0 {
                    state.errno = if errno > 0 { errno } else { libc::EIO };
                }
            }
        }
        if state.remaining == 0 {
            self.cond.notify_all();
        }
    }

    /// Block until every completion has arrived. Returns the chunks in
    /// slot order on success, or the first errno on failure.
    pub fn wait(&self) -> std::result::Result<Vec<Vec<u8>>, i32> {
        let mut state = self.state.lock();
        while state.remaining > 0 {
            self.cond.wait(&mut state);
        }
        if state.errno != 0 {
            return Err(state.errno);
        }
        Ok(state
            .chunks
            .iter_mut()
            .map(|chunk| chunk.take().unwrap_or_default())
            .collect())
    }
}

// ── In-memory origin for tests ──────────────────────────────────────────────

#[derive(Default)]
struct MemSourceState {
    /// Read start offsets that fail, with errno.
    fail_offsets: std::collections::HashMap<u64, i32>,
    /// Every (offset, len) issued, in order.
    fetch_log: Vec<(u64, usize)>,
    /// Completions parked by `hold`, delivered on `release_held`.
    held: Vec<(ReadCompletion, ReadResult)>,
    hold: bool,
}

/// In-memory [`RemoteSource`] backed by a byte vector.
///
/// Delivers completions synchronously by default; `hold()` parks them so a
/// test can interleave deliveries with reader threads. Reads can be failed
/// per starting offset.
pub struct MemRemoteSource {
    content: Vec<u8>,
    state: Mutex<MemSourceState>,
}

impl MemRemoteSource {
    #[must_use]
    pub fn new(content: Vec<u8>) -> Self {
        Self {
            content,
            state: Mutex::new(MemSourceState::default()),
        }
    }

    /// Fail reads starting at `offset` with `errno`.
    pub fn fail_at(&self, offset: u64, errno: i32) {
        self.state.lock().fail_offsets.insert(offset, errno);
    }

    /// Park completions instead of delivering synchronously.
    pub fn hold(&self) {
        self.state.lock().hold = true;
    }

    /// Deliver all parked completions and resume synchronous delivery.
    pub fn release_held(&self) {
        let held = {
            let mut state = self.state.lock();
            state.hold = false;
            std::mem::take(&mut state.held)
        };
        for (completion, result) in held {
            completion.deliver(result);
        }
    }

    #[must_use]
    pub fn fetch_log(&self) -> Vec<(u64, usize)> {
        self.state.lock().fetch_log.clone()
    }

    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.state.lock().fetch_log.len()
    }
}

impl RemoteSource for MemRemoteSource {
    fn read_at(&self, offset: u64, len: usize, completion: ReadCompletion) -> Result<()> {
        let result = {
            let mut state = self.state.lock();
            state.fetch_log.push((offset, len));
            if let Some(&errno) = state.fail_offsets.get(&offset) {
                Err(errno)
            } else {
                let start = usize::try_from(offset).unwrap_or(usize::MAX);
                let end = start.saturating_add(len);
                if end > self.content.len() {
                    Err(libc::EINVAL)
                } else {
                    Ok(self.content[start..end].to_vec())
                }
            }
        };

        let mut state = self.state.lock();
        if state.hold {
            state.held.push((completion, result));
            return Ok(());
        }
        drop(state);
        completion.deliver(result);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        calls: AtomicUsize,
        last: Mutex<Option<(BlockIndex, ReadResult)>>,
    }

    impl ResponseSink for CountingSink {
        fn block_response(&self, index: BlockIndex, result: ReadResult) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock() = Some((index, result));
        }
    }

    #[test]
    fn block_completion_forwards_to_sink() {
        let sink = Arc::new(CountingSink {
            calls: AtomicUsize::new(0),
            last: Mutex::new(None),
        });
        let sink_dyn: Arc<dyn ResponseSink> = sink.clone();
        let completion = ReadCompletion::for_block(Arc::downgrade(&sink_dyn), BlockIndex(3));
        completion.deliver(Ok(vec![1, 2, 3]));

        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        let last = sink.last.lock().take().unwrap();
        assert_eq!(last.0, BlockIndex(3));
        assert_eq!(last.1.unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn block_completion_tolerates_dead_sink() {
        let sink = Arc::new(CountingSink {
            calls: AtomicUsize::new(0),
            last: Mutex::new(None),
        });
        let sink_dyn: Arc<dyn ResponseSink> = sink.clone();
        let weak = Arc::downgrade(&sink_dyn);
        drop(sink_dyn);
        drop(sink);
        ReadCompletion::for_block(weak, BlockIndex(0)).deliver(Ok(Vec::new()));
    }

    #[test]
    fn direct_waiter_aggregates_in_slot_order() {
        let waiter = DirectWaiter::new(3);
        waiter.deliver(2, Ok(vec![2]));
        waiter.deliver(0, Ok(vec![0]));
        waiter.deliver(1, Ok(vec![1]));
        let chunks = waiter.wait().unwrap();
        assert_eq!(chunks, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn direct_waiter_first_error_wins() {
        let waiter = DirectWaiter::new(3);
        waiter.deliver(0, Ok(vec![0]));
        waiter.deliver(1, Err(libc::EPIPE));
        waiter.deliver(2, Err(libc::ENOENT));
        assert_eq!(waiter.wait().unwrap_err(), libc::EPIPE);
    }

    #[test]
    fn direct_waiter_wakes_cross_thread() {
        let waiter = DirectWaiter::new(1);
        let waiter2 = Arc::clone(&waiter);
        let join = std::thread::spawn(move || waiter2.wait());
        std::thread::sleep(std::time::Duration::from_millis(20));
        waiter.deliver(0, Ok(vec![9]));
        assert_eq!(join.join().unwrap().unwrap(), vec![vec![9]]);
    }

    #[test]
    fn mem_source_serves_and_fails_ranges() {
        let source = MemRemoteSource::new((0_u8..=255).collect());
        source.fail_at(8, libc::ECONNRESET);

        let waiter = DirectWaiter::new(2);
        source
            .read_at(0, 4, ReadCompletion::Direct { waiter: Arc::clone(&waiter), slot: 0 })
            .unwrap();
        source
            .read_at(4, 4, ReadCompletion::Direct { waiter: Arc::clone(&waiter), slot: 1 })
            .unwrap();
        assert_eq!(waiter.wait().unwrap(), vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7]]);

        let failing = DirectWaiter::new(1);
        source
            .read_at(8, 4, ReadCompletion::Direct { waiter: Arc::clone(&failing), slot: 0 })
            .unwrap();
        assert_eq!(failing.wait().unwrap_err(), libc::ECONNRESET);
        assert_eq!(source.fetch_log(), vec![(0, 4), (4, 4), (8, 4)]);
    }

    #[test]
    fn mem_source_hold_defers_delivery() {
        let source = MemRemoteSource::new(vec![7; 64]);
        source.hold();
        let waiter = DirectWaiter::new(1);
        source
            .read_at(0, 8, ReadCompletion::Direct { waiter: Arc::clone(&waiter), slot: 0 })
            .unwrap();
        assert_eq!(waiter.state.lock().remaining, 1);
        source.release_held();
        assert_eq!(waiter.wait().unwrap(), vec![vec![7; 8]]);
    }
}
