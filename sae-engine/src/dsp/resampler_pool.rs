//! Keyed pool of resampler instances
//!
//! Instances live in an arena of integer slots. A checked-out instance moves
//! into a [`ResamplerLease`] that remembers its slot number; releasing the
//! lease moves the instance back into the same slot and onto its key's free
//! list. Nothing outside the pool ever holds a reference into the arena, and
//! a lease is not `Clone`, so two handles can never share an instance.
//!
//! A lease that is dropped instead of released is lost to the pool. The next
//! acquisition for that key has to allocate, which feeds the leak heuristic:
//! once a key's allocation count exceeds the threshold a warning is logged.

use super::resampler::{Resampler, ResamplerKey};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use tracing::{debug, warn};

/// Arena slot number of one pooled instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResamplerSlot(usize);

impl ResamplerSlot {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Exclusive use of one pooled resampler until released
pub struct ResamplerLease {
    slot: ResamplerSlot,
    resampler: Resampler,
}

impl ResamplerLease {
    /// Identity of the pooled instance
    pub fn slot(&self) -> ResamplerSlot {
        self.slot
    }
}

impl Deref for ResamplerLease {
    type Target = Resampler;

    fn deref(&self) -> &Resampler {
        &self.resampler
    }
}

impl DerefMut for ResamplerLease {
    fn deref_mut(&mut self) -> &mut Resampler {
        &mut self.resampler
    }
}

struct Slot {
    key: ResamplerKey,
    /// `None` while checked out
    resampler: Option<Resampler>,
}

#[derive(Default)]
struct PoolEntry {
    free: Vec<ResamplerSlot>,
    allocation_count: usize,
}

/// Per-key pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub allocation_count: usize,
    pub free: usize,
    pub checked_out: usize,
}

/// Keyed resampler pool backed by an integer-slot arena
pub struct ResamplerPool {
    slots: Vec<Slot>,
    entries: HashMap<ResamplerKey, PoolEntry>,
    leak_threshold: usize,
    leak_warnings: usize,
}

impl ResamplerPool {
    /// Create an empty pool that warns once a key allocates more than `leak_threshold` instances
    pub fn new(leak_threshold: usize) -> Self {
        Self {
            slots: Vec::new(),
            entries: HashMap::new(),
            leak_threshold,
            leak_warnings: 0,
        }
    }

    /// Check out a reset instance for `key`, allocating one if none is free
    ///
    /// # Arguments
    /// - `key`: Channel count, rates and quality the instance must match
    /// - `chunk_frames`: Input frames per processed chunk
    pub fn acquire(&mut self, key: ResamplerKey, chunk_frames: usize) -> Result<ResamplerLease> {
        let entry = self.entries.entry(key).or_default();

        if let Some(slot) = entry.free.pop() {
            let resampler = self
                .slots
                .get_mut(slot.0)
                .and_then(|s| s.resampler.take())
                .ok_or_else(|| {
                    Error::Internal(format!("free list slot {} holds no resampler", slot.0))
                })?;
            let mut lease = ResamplerLease { slot, resampler };
            if let Err(e) = lease.prepare(chunk_frames) {
                self.put_back(lease);
                return Err(e);
            }
            debug!("Reused resampler slot {} for {}", slot.0, key);
            return Ok(lease);
        }

        let resampler = Resampler::new(key, chunk_frames)?;
        entry.allocation_count += 1;
        if entry.allocation_count > self.leak_threshold {
            self.leak_warnings += 1;
            warn!(
                "Possible resampler leak: {} instances allocated for {}",
                entry.allocation_count, key
            );
        }

        let slot = ResamplerSlot(self.slots.len());
        self.slots.push(Slot {
            key,
            resampler: None,
        });
        debug!("Allocated resampler slot {} for {}", slot.0, key);
        Ok(ResamplerLease { slot, resampler })
    }

    /// Return a leased instance to its key's free list
    pub fn release(&mut self, lease: ResamplerLease) {
        debug!("Released resampler slot {}", lease.slot.0);
        self.put_back(lease);
    }

    fn put_back(&mut self, lease: ResamplerLease) {
        let ResamplerLease { slot, resampler } = lease;
        let Some(arena_slot) = self.slots.get_mut(slot.0) else {
            warn!("Dropping resampler with unknown slot {}", slot.0);
            return;
        };
        arena_slot.resampler = Some(resampler);
        self.entries
            .entry(arena_slot.key)
            .or_default()
            .free
            .push(slot);
    }

    /// Statistics for one key
    pub fn stats(&self, key: &ResamplerKey) -> PoolStats {
        let Some(entry) = self.entries.get(key) else {
            return PoolStats::default();
        };
        let total = self.slots.iter().filter(|s| s.key == *key).count();
        PoolStats {
            allocation_count: entry.allocation_count,
            free: entry.free.len(),
            checked_out: total - entry.free.len(),
        }
    }

    /// Number of leak warnings emitted so far
    pub fn leak_warnings(&self) -> usize {
        self.leak_warnings
    }
}
