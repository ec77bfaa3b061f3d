//! Arena-backed undo storage.
//!
//! An [`UndoBuffer`] is the append-only, per-transaction log of undo entries. Its
//! memory comes in fixed-capacity chunks from a shared [`UndoAllocator`]; a chunk is
//! never grown past its capacity, so an entry never moves once appended and can be
//! addressed by an [`UndoPtr`] (chunk index, offset) for the whole life of the buffer.
//! Chunks go back to the allocator only as a whole: when the buffer is truncated
//! past a chunk boundary, released, or dropped.
//!
//! Version chains link across buffers with [`UndoLink`], a weak handle to the
//! owning buffer plus a pointer. Once the owning buffer is freed by cleanup, the
//! link simply stops resolving, which terminates the chain.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::error::UndoError;

/// Address of an entry inside an [`UndoBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UndoPtr {
    chunk: u32,
    offset: u32,
}

impl UndoPtr {
    pub fn chunk(&self) -> usize {
        self.chunk as usize
    }

    pub fn offset(&self) -> usize {
        self.offset as usize
    }
}

/// Position in a buffer to truncate back to, see [`UndoBuffer::mark`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UndoMark(usize);

impl UndoMark {
    pub fn len(&self) -> usize {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone)]
pub struct UndoAllocatorConfig {
    /// Number of entries per chunk.
    pub chunk_capacity: usize,
    /// Upper bound on chunks handed out and not yet returned. `None` is unbounded.
    pub max_chunks: Option<usize>,
    /// How many returned chunks are kept for reuse.
    pub max_free_chunks: usize,
}

impl Default for UndoAllocatorConfig {
    fn default() -> Self {
        Self {
            chunk_capacity: 256,
            max_chunks: None,
            max_free_chunks: 64,
        }
    }
}

/// Chunk provider shared by all undo buffers of one database.
pub struct UndoAllocator<T> {
    config: UndoAllocatorConfig,
    free: Mutex<Vec<Vec<T>>>,
    live: AtomicUsize,
}

impl<T> UndoAllocator<T> {
    pub fn new(mut config: UndoAllocatorConfig) -> Self {
        config.chunk_capacity = config.chunk_capacity.max(1);
        Self {
            config,
            free: Mutex::new(Vec::new()),
            live: AtomicUsize::new(0),
        }
    }

    pub fn chunk_capacity(&self) -> usize {
        self.config.chunk_capacity
    }

    /// Chunks currently owned by some buffer.
    pub fn live_chunks(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Chunks parked on the free list.
    pub fn free_chunks(&self) -> usize {
        self.free.lock().len()
    }

    fn allocate(&self) -> Result<Vec<T>, UndoError> {
        let limit = self.config.max_chunks;
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| match limit {
                Some(limit) if live >= limit => None,
                _ => Some(live + 1),
            })
            .map_err(|live| UndoError::ResourceExhausted {
                live,
                limit: limit.unwrap_or(usize::MAX),
            })?;

        if let Some(chunk) = self.free.lock().pop() {
            return Ok(chunk);
        }
        Ok(Vec::with_capacity(self.config.chunk_capacity))
    }

    fn release(&self, mut chunk: Vec<T>) {
        chunk.clear();
        self.live.fetch_sub(1, Ordering::AcqRel);
        let mut free = self.free.lock();
        if free.len() < self.config.max_free_chunks {
            free.push(chunk);
        }
    }
}

impl<T> fmt::Debug for UndoAllocator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UndoAllocator")
            .field("config", &self.config)
            .field("live", &self.live_chunks())
            .field("free", &self.free_chunks())
            .finish()
    }
}

/// Ordered, append-only sequence of undo entries owned by one transaction.
pub struct UndoBuffer<T> {
    allocator: Arc<UndoAllocator<T>>,
    chunks: Vec<Vec<T>>,
    len: usize,
}

/// An undo buffer shared between its owning transaction and the version chains
/// that point into it.
pub type SharedUndoBuffer<T> = Arc<RwLock<UndoBuffer<T>>>;

impl<T> UndoBuffer<T> {
    pub fn new(allocator: Arc<UndoAllocator<T>>) -> Self {
        Self {
            allocator,
            chunks: Vec::new(),
            len: 0,
        }
    }

    pub fn new_shared(allocator: Arc<UndoAllocator<T>>) -> SharedUndoBuffer<T> {
        Arc::new(RwLock::new(Self::new(allocator)))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of chunks this buffer holds.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Append an entry at the tail. Prior entries are never relocated.
    pub fn append(&mut self, entry: T) -> Result<UndoPtr, UndoError> {
        let capacity = self.allocator.chunk_capacity();
        let needs_chunk = self
            .chunks
            .last()
            .is_none_or(|chunk| chunk.len() == capacity);
        if needs_chunk {
            let chunk = self.allocator.allocate()?;
            self.chunks.push(chunk);
        }
        let chunk_idx = self.chunks.len() - 1;
        let chunk = &mut self.chunks[chunk_idx];
        let ptr = UndoPtr {
            chunk: chunk_idx as u32,
            offset: chunk.len() as u32,
        };
        chunk.push(entry);
        self.len += 1;
        Ok(ptr)
    }

    pub fn get(&self, ptr: UndoPtr) -> Option<&T> {
        self.chunks.get(ptr.chunk())?.get(ptr.offset())
    }

    /// Entries in append order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + '_ {
        self.chunks.iter().flat_map(|chunk| chunk.iter())
    }

    /// Entries in reverse append order.
    pub fn iter_rev(&self) -> impl Iterator<Item = &T> + '_ {
        self.iter().rev()
    }

    /// Entries in append order together with their addresses.
    pub fn iter_with_ptr(&self) -> impl Iterator<Item = (UndoPtr, &T)> + '_ {
        self.chunks.iter().enumerate().flat_map(|(chunk_idx, chunk)| {
            chunk.iter().enumerate().map(move |(offset, entry)| {
                (
                    UndoPtr {
                        chunk: chunk_idx as u32,
                        offset: offset as u32,
                    },
                    entry,
                )
            })
        })
    }

    /// Current tail position.
    pub fn mark(&self) -> UndoMark {
        UndoMark(self.len)
    }

    /// Entries appended after `mark`, in append order.
    pub fn iter_since(&self, mark: UndoMark) -> impl Iterator<Item = &T> + '_ {
        self.iter().skip(mark.0)
    }

    /// Drop every entry appended after `mark`. Chunks left empty go back to the
    /// allocator; a partially used chunk is kept.
    pub fn truncate(&mut self, mark: UndoMark) {
        if mark.0 >= self.len {
            return;
        }
        let capacity = self.allocator.chunk_capacity();
        let keep_chunks = mark.0.div_ceil(capacity);
        for chunk in self.chunks.drain(keep_chunks..) {
            self.allocator.release(chunk);
        }
        if let Some(last) = self.chunks.last_mut() {
            let keep_in_last = mark.0 - (keep_chunks - 1) * capacity;
            last.truncate(keep_in_last);
        }
        self.len = mark.0;
    }

    /// Return every chunk to the allocator.
    pub fn release(&mut self) {
        for chunk in self.chunks.drain(..) {
            self.allocator.release(chunk);
        }
        self.len = 0;
    }
}

impl<T> Drop for UndoBuffer<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T> fmt::Debug for UndoBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UndoBuffer")
            .field("len", &self.len)
            .field("chunks", &self.chunks.len())
            .finish()
    }
}

/// Link from a version (or a newer undo entry) to an undo entry living in some
/// transaction's buffer.
pub struct UndoLink<T> {
    buffer: Weak<RwLock<UndoBuffer<T>>>,
    ptr: UndoPtr,
}

impl<T> UndoLink<T> {
    pub fn new(buffer: &SharedUndoBuffer<T>, ptr: UndoPtr) -> Self {
        Self {
            buffer: Arc::downgrade(buffer),
            ptr,
        }
    }

    pub fn ptr(&self) -> UndoPtr {
        self.ptr
    }

    /// Run `f` against the linked entry, or return `None` if the owning buffer was
    /// freed or truncated past the entry.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let buffer = self.buffer.upgrade()?;
        let guard = buffer.read();
        guard.get(self.ptr).map(f)
    }

    /// Whether the link points into `buffer`.
    pub fn points_into(&self, buffer: &SharedUndoBuffer<T>) -> bool {
        std::ptr::eq(self.buffer.as_ptr(), Arc::as_ptr(buffer))
    }

    pub fn is_dangling(&self) -> bool {
        self.buffer.strong_count() == 0
    }
}

impl<T> Clone for UndoLink<T> {
    fn clone(&self) -> Self {
        Self {
            buffer: self.buffer.clone(),
            ptr: self.ptr,
        }
    }
}

impl<T> fmt::Debug for UndoLink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UndoLink")
            .field("ptr", &self.ptr)
            .field("dangling", &self.is_dangling())
            .finish()
    }
}
