//! Pooled bump allocator for bucket storage.
//!
//! Index construction performs a very large number of small allocations that
//! all live exactly as long as the table that owns them. The arena serves them
//! from large blocks by advancing a cursor and frees everything at once.
//!
//! Allocations are addressed by [`Span`] handles (block number, offset,
//! length) instead of references, so releasing the pool never leaves a
//! dangling pointer behind: a stale span simply stops resolving.

use crate::error::{LshError, Result};

/// Minimum number of bytes requested from the system for one block.
pub const MIN_BLOCK_BYTES: usize = 8192;

/// Allocation granularity in bytes. Every request is rounded up to a multiple.
pub const WORD_BYTES: usize = std::mem::size_of::<usize>();

/// Handle to a contiguous run of elements inside a [`PooledArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "persistence",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Span {
    block: u32,
    offset: u32,
    len: u32,
}

impl Span {
    /// A span that resolves to an empty slice in every arena.
    pub const EMPTY: Span = Span {
        block: 0,
        offset: 0,
        len: 0,
    };

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for Span {
    fn default() -> Self {
        Span::EMPTY
    }
}

/// Typed bump allocator handing out [`Span`]s.
///
/// Blocks are chained newest-last; only the newest block is ever bumped.
#[derive(Debug)]
#[cfg_attr(
    feature = "persistence",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct PooledArena<T> {
    blocks: Vec<Vec<T>>,
    /// Elements still free in the newest block.
    remaining: usize,
    min_block_bytes: usize,
    used_memory: usize,
    wasted_memory: usize,
    reserved_memory: usize,
}

impl<T: Copy + Default> Default for PooledArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + Default> PooledArena<T> {
    pub fn new() -> Self {
        Self::with_block_size(MIN_BLOCK_BYTES)
    }

    /// Create a pool whose blocks are at least `min_block_bytes` large.
    pub fn with_block_size(min_block_bytes: usize) -> Self {
        Self {
            blocks: Vec::new(),
            remaining: 0,
            min_block_bytes: min_block_bytes.max(WORD_BYTES),
            used_memory: 0,
            wasted_memory: 0,
            reserved_memory: 0,
        }
    }

    fn elem_bytes() -> usize {
        std::mem::size_of::<T>().max(1)
    }

    /// Number of elements making up one alignment quantum.
    fn quantum() -> usize {
        (WORD_BYTES / Self::elem_bytes()).max(1)
    }

    /// Reserve `count` default-initialised elements.
    pub fn allocate(&mut self, count: usize) -> Result<Span> {
        if count == 0 {
            return Ok(Span::EMPTY);
        }
        if count > u32::MAX as usize {
            return Err(LshError::Allocation {
                bytes: count.saturating_mul(Self::elem_bytes()),
            });
        }

        let quantum = Self::quantum();
        let rounded = count.div_ceil(quantum) * quantum;

        if rounded > self.remaining {
            self.wasted_memory += self.remaining * Self::elem_bytes();

            let block_len = rounded.max(self.min_block_bytes / Self::elem_bytes());
            let mut block: Vec<T> = Vec::new();
            if block.try_reserve_exact(block_len).is_err() {
                let bytes = block_len * Self::elem_bytes();
                tracing::warn!(bytes, "bucket arena block allocation failed");
                return Err(LshError::Allocation { bytes });
            }
            self.reserved_memory += block_len * Self::elem_bytes();
            self.blocks.push(block);
            self.remaining = block_len;
        }

        let block_idx = self.blocks.len() - 1;
        let block = &mut self.blocks[block_idx];
        let offset = block.len();
        block.resize(offset + rounded, T::default());

        self.remaining -= rounded;
        self.used_memory += rounded * Self::elem_bytes();

        Ok(Span {
            block: block_idx as u32,
            offset: offset as u32,
            len: count as u32,
        })
    }

    /// Copy `values` into freshly allocated space.
    pub fn alloc_slice(&mut self, values: &[T]) -> Result<Span> {
        let span = self.allocate(values.len())?;
        self.get_mut(span).copy_from_slice(values);
        Ok(span)
    }

    /// Move the contents of `span` into a new span of `new_len` elements.
    ///
    /// The old space is not reclaimed until [`release_all`].
    ///
    /// [`release_all`]: PooledArena::release_all
    pub fn grow(&mut self, span: Span, new_len: usize) -> Result<Span> {
        let grown = self.allocate(new_len.max(span.len()))?;
        if span.is_empty() {
            return Ok(grown);
        }

        let src = span.offset as usize..span.offset as usize + span.len();
        let dst = grown.offset as usize;
        let (src_block, dst_block) = (span.block as usize, grown.block as usize);
        if src_block == dst_block {
            self.blocks[dst_block].copy_within(src, dst);
        } else {
            // New space always comes from the newest block.
            let (older, newest) = self.blocks.split_at_mut(dst_block);
            newest[0][dst..dst + span.len()].copy_from_slice(&older[src_block][src]);
        }
        Ok(grown)
    }

    /// Resolve a span. Panics if the span does not belong to this arena.
    pub fn get(&self, span: Span) -> &[T] {
        if span.is_empty() {
            return &[];
        }
        let start = span.offset as usize;
        &self.blocks[span.block as usize][start..start + span.len()]
    }

    /// Resolve a span, returning `None` when it is stale.
    pub fn try_get(&self, span: Span) -> Option<&[T]> {
        if span.is_empty() {
            return Some(&[]);
        }
        let start = span.offset as usize;
        self.blocks
            .get(span.block as usize)
            .and_then(|block| block.get(start..start + span.len()))
    }

    pub fn get_mut(&mut self, span: Span) -> &mut [T] {
        if span.is_empty() {
            return &mut [];
        }
        let start = span.offset as usize;
        &mut self.blocks[span.block as usize][start..start + span.len()]
    }

    /// Free every block, newest first, and reset the accounting.
    pub fn release_all(&mut self) {
        while let Some(block) = self.blocks.pop() {
            drop(block);
        }
        self.remaining = 0;
        self.used_memory = 0;
        self.wasted_memory = 0;
        self.reserved_memory = 0;
    }

    /// Bytes handed out, including alignment padding.
    pub fn used_memory(&self) -> usize {
        self.used_memory
    }

    /// Bytes abandoned at the tail of blocks when a new block was started.
    pub fn wasted_memory(&self) -> usize {
        self.wasted_memory
    }

    /// Bytes obtained from the system allocator.
    pub fn reserved_memory(&self) -> usize {
        self.reserved_memory
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_resolve() {
        let mut arena: PooledArena<u32> = PooledArena::new();
        let a = arena.alloc_slice(&[1, 2, 3]).unwrap();
        let b = arena.alloc_slice(&[4, 5]).unwrap();
        assert_eq!(arena.get(a), &[1, 2, 3]);
        assert_eq!(arena.get(b), &[4, 5]);
        assert_eq!(arena.block_count(), 1);
    }

    #[test]
    fn test_requests_round_up_to_word() {
        let mut arena: PooledArena<u32> = PooledArena::new();
        arena.allocate(3).unwrap();
        // 3 * 4 bytes rounds up to the next multiple of the word size.
        assert_eq!(arena.used_memory() % WORD_BYTES, 0);
        assert!(arena.used_memory() >= 12);
    }

    #[test]
    fn test_new_block_records_waste() {
        let mut arena: PooledArena<u64> = PooledArena::with_block_size(64);
        arena.allocate(6).unwrap(); // 48 of 64 bytes
        arena.allocate(4).unwrap(); // does not fit, 16 bytes wasted
        assert_eq!(arena.block_count(), 2);
        assert_eq!(arena.wasted_memory(), 16);
        assert_eq!(arena.used_memory(), 80);
    }

    #[test]
    fn test_oversized_request_gets_its_own_block() {
        let mut arena: PooledArena<u8> = PooledArena::with_block_size(16);
        let span = arena.allocate(100).unwrap();
        assert_eq!(arena.get(span).len(), 100);
        assert!(arena.reserved_memory() >= 100);
    }

    #[test]
    fn test_release_all_resets_accounting() {
        let mut arena: PooledArena<u32> = PooledArena::with_block_size(32);
        for _ in 0..50 {
            arena.allocate(5).unwrap();
        }
        assert!(arena.used_memory() + arena.wasted_memory() <= arena.reserved_memory());
        let span = arena.allocate(1).unwrap();
        arena.release_all();
        assert_eq!(arena.used_memory(), 0);
        assert_eq!(arena.wasted_memory(), 0);
        assert_eq!(arena.block_count(), 0);
        assert!(arena.try_get(span).is_none());
    }

    #[test]
    fn test_grow_preserves_contents_across_blocks() {
        let mut arena: PooledArena<u32> = PooledArena::with_block_size(16);
        let span = arena.alloc_slice(&[7, 8, 9]).unwrap();
        let grown = arena.grow(span, 10).unwrap();
        assert_eq!(grown.len(), 10);
        assert_eq!(&arena.get(grown)[..3], &[7, 8, 9]);
        assert!(arena.block_count() >= 2);

        let again = arena.grow(grown, 11).unwrap();
        assert_eq!(&arena.get(again)[..3], &[7, 8, 9]);
    }

    #[test]
    fn test_empty_span() {
        let mut arena: PooledArena<u32> = PooledArena::new();
        let span = arena.allocate(0).unwrap();
        assert!(span.is_empty());
        assert!(arena.get(span).is_empty());
        assert_eq!(arena.used_memory(), 0);
    }
}
