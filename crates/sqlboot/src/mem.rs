//! Pluggable general-heap strategy.
//!
//! Heap blocks are plain `Vec<u8>` values whose length is the usable size of
//! the block. A strategy reports failure by returning `None` from
//! [`MemMethods::malloc`] or by handing the untouched block back in the `Err`
//! arm of [`MemMethods::realloc`]; nothing is freed on a failed resize.

use sqlboot_error::Result;

/// Heap allocator interface installed through `ConfigOp::Malloc`.
pub trait MemMethods: Send + Sync {
    /// Allocate `n` zero-filled bytes, or `None` when out of memory.
    fn malloc(&self, n: usize) -> Option<Vec<u8>>;

    /// Resize `block` to `n` bytes. On failure the original block is
    /// returned unchanged.
    fn realloc(&self, block: Vec<u8>, n: usize) -> std::result::Result<Vec<u8>, Vec<u8>>;

    fn free(&self, block: Vec<u8>) {
        drop(block);
    }

    /// Usable size of a block previously returned by this strategy.
    fn size(&self, block: &[u8]) -> usize {
        block.len()
    }

    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn shutdown(&self) {}
}

/// Built-in strategy over the global Rust allocator, using fallible
/// reservation so exhaustion surfaces as `None` instead of an abort.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMem;

impl MemMethods for SystemMem {
    fn malloc(&self, n: usize) -> Option<Vec<u8>> {
        let mut block = Vec::new();
        block.try_reserve_exact(n).ok()?;
        block.resize(n, 0);
        Some(block)
    }

    fn realloc(&self, mut block: Vec<u8>, n: usize) -> std::result::Result<Vec<u8>, Vec<u8>> {
        if n > block.len() {
            if block.try_reserve_exact(n - block.len()).is_err() {
                return Err(block);
            }
            block.resize(n, 0);
        } else {
            block.truncate(n);
            block.shrink_to_fit();
        }
        Ok(block)
    }
}
