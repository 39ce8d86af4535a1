//! Grow-only scratch memory
//!
//! Each source handle owns one [`ScratchBuffer`] and reuses it for every
//! decode and DSP pass. The buffer only ever grows, so a steady stream of
//! same-sized buffers allocates once.

use crate::error::Result;
use tracing::debug;

/// Reusable block of sample memory that never shrinks while alive
#[derive(Debug, Default)]
pub struct ScratchBuffer {
    data: Vec<f32>,
    grow_count: usize,
}

impl ScratchBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples currently available without growing
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of times the buffer had to grow
    pub fn grow_count(&self) -> usize {
        self.grow_count
    }

    /// Borrow `len` samples, growing the buffer if needed
    ///
    /// Contents are whatever the previous user left behind.
    ///
    /// # Errors
    /// Returns `Error::NativeAllocation` if the memory cannot be reserved
    pub fn get(&mut self, len: usize) -> Result<&mut [f32]> {
        self.ensure(len)?;
        Ok(&mut self.data[..len])
    }

    /// Borrow two disjoint regions of `first` and `second` samples
    pub fn split(&mut self, first: usize, second: usize) -> Result<(&mut [f32], &mut [f32])> {
        let total = first
            .checked_add(second)
            .ok_or_else(|| crate::Error::NativeAllocation("scratch size overflow".to_string()))?;
        self.ensure(total)?;
        let (a, rest) = self.data[..total].split_at_mut(first);
        Ok((a, rest))
    }

    /// Free the memory; only called when the owning handle is destroyed
    pub fn release(&mut self) {
        self.data = Vec::new();
    }

    fn ensure(&mut self, len: usize) -> Result<()> {
        if self.data.len() >= len {
            return Ok(());
        }
        let additional = len - self.data.len();
        self.data.try_reserve_exact(additional)?;
        self.data.resize(len, 0.0);
        self.grow_count += 1;
        debug!("Scratch buffer grown to {} samples", len);
        Ok(())
    }
}

/// Allocate a zeroed sample vector whose ownership moves to the consumer
///
/// # Errors
/// Returns `Error::NativeAllocation` if the memory cannot be reserved
pub fn allocate_samples(len: usize) -> Result<Vec<f32>> {
    let mut samples = Vec::new();
    samples.try_reserve_exact(len)?;
    samples.resize(len, 0.0);
    Ok(samples)
}
