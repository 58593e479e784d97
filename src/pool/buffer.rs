//! Buffer pools.
//!
//! Two interchangeable strategies behind one trait: a fixed-size cache that
//! only recycles default-size buffers, and a growing cache that enlarges
//! whatever it has to fit the request (geometric below 4 MiB, 4 MiB steps
//! above, see [`crate::codec::buffer::grown_capacity`]).

use crate::codec::buffer::grown_capacity;
use crate::codec::ByteBuffer;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// A cache of reusable binary buffers, safe for concurrent callers.
pub trait BufferPool: Send + Sync {
    /// A cleared buffer with capacity >= `size`.
    fn get(&self, size: usize) -> ByteBuffer;

    /// Return a buffer. Never shrinks it.
    fn release(&self, buf: ByteBuffer);

    /// Scoped acquisition: the buffer returns to the pool on drop.
    fn lease(&self, size: usize) -> BufferLease<'_>
    where
        Self: Sized,
    {
        BufferLease {
            buf: Some(self.get(size)),
            pool: self,
        }
    }

    /// Buffers allocated (or enlarged) so far. Observable for tests.
    fn allocations(&self) -> usize;
}

/// Buffer leased from a pool, released back on drop.
pub struct BufferLease<'a> {
    buf: Option<ByteBuffer>,
    pool: &'a dyn BufferPool,
}

impl std::ops::Deref for BufferLease<'_> {
    type Target = ByteBuffer;

    fn deref(&self) -> &ByteBuffer {
        self.buf.as_ref().expect("lease taken")
    }
}

impl std::ops::DerefMut for BufferLease<'_> {
    fn deref_mut(&mut self) -> &mut ByteBuffer {
        self.buf.as_mut().expect("lease taken")
    }
}

impl Drop for BufferLease<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

// =============================================================================
// Fixed-size strategy
// =============================================================================

/// Unbounded queue of default-size buffers; any other size bypasses the
/// cache entirely.
pub struct FixedBufferPool {
    default_size: usize,
    idle: Mutex<VecDeque<ByteBuffer>>,
    allocations: AtomicUsize,
}

impl FixedBufferPool {
    pub fn new(default_size: usize) -> Self {
        assert!(default_size > 0, "default buffer size must be positive");
        Self {
            default_size,
            idle: Mutex::new(VecDeque::new()),
            allocations: AtomicUsize::new(0),
        }
    }

    pub fn default_size(&self) -> usize {
        self.default_size
    }
}

impl BufferPool for FixedBufferPool {
    fn get(&self, size: usize) -> ByteBuffer {
        if size == self.default_size {
            if let Some(mut buf) = self.idle.lock().expect("pool lock").pop_front() {
                buf.clear();
                return buf;
            }
        }
        self.allocations.fetch_add(1, Ordering::Relaxed);
        ByteBuffer::with_capacity(size)
    }

    fn release(&self, buf: ByteBuffer) {
        if buf.capacity() == self.default_size {
            self.idle.lock().expect("pool lock").push_back(buf);
        }
    }

    fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Growing strategy
// =============================================================================

/// Variable-size cache: a pooled buffer too small for the request is grown
/// in place (content preserved) instead of discarded.
pub struct GrowingBufferPool {
    idle: Mutex<Vec<ByteBuffer>>,
    allocations: AtomicUsize,
}

impl GrowingBufferPool {
    pub fn new() -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            allocations: AtomicUsize::new(0),
        }
    }
}

impl Default for GrowingBufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool for GrowingBufferPool {
    fn get(&self, size: usize) -> ByteBuffer {
        let pooled = {
            let mut idle = self.idle.lock().expect("pool lock");
            // Best fit: the smallest pooled buffer already large enough,
            // else the largest one, which then grows.
            let best = idle
                .iter()
                .enumerate()
                .filter(|(_, b)| b.capacity() >= size)
                .min_by_key(|(_, b)| b.capacity())
                .or_else(|| idle.iter().enumerate().max_by_key(|(_, b)| b.capacity()))
                .map(|(i, _)| i);
            best.map(|i| idle.swap_remove(i))
        };

        match pooled {
            Some(mut buf) => {
                buf.clear();
                if buf.capacity() < size {
                    self.allocations.fetch_add(1, Ordering::Relaxed);
                    buf.ensure_capacity(size);
                }
                buf
            }
            None => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                ByteBuffer::with_capacity(grown_capacity(size))
            }
        }
    }

    fn release(&self, buf: ByteBuffer) {
        self.idle.lock().expect("pool lock").push(buf);
    }

    fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }
}
