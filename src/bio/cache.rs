// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The buffer cache: a direct-mapped table from (device, offset)
//! to resident buffers, plus the high-level read/write entry
//! points built on it.
//!
//! The table is deliberately simple.  A colliding insert evicts
//! the previous occupant on the spot; there is no LRU, no
//! chaining and no rehash.  Each occupied slot holds one strong
//! reference, so a buffer stays alive while it is resident even
//! after all of its users have put their references.

use std::sync::{Arc, LazyLock};

use log::debug;
use static_assertions::const_assert;

use crate::dev::Dev;
use crate::hash::{oat_hash_final, oat_hash_step};
use crate::result::Result;

use super::{Bio, Mode};

const CACHE_ORDER: usize = 10;
const CACHE_SIZE: usize = 1 << CACHE_ORDER;
const CACHE_MASK: u32 = (CACHE_SIZE - 1) as u32;

const_assert!(CACHE_SIZE.is_power_of_two());

fn cache_index(dev: Dev, offset: u64) -> usize {
    let mut iv = 0;
    iv = oat_hash_step(iv, dev as u32);
    iv = oat_hash_step(iv, offset as u32);
    iv = oat_hash_step(iv, (offset >> 32) as u32);
    (oat_hash_final(iv) & CACHE_MASK) as usize
}

/// A direct-mapped buffer cache.
pub struct BioCache {
    slots: parking_lot::Mutex<Box<[Option<Arc<Bio>>]>>,
}

impl BioCache {
    pub fn new() -> BioCache {
        BioCache { slots: parking_lot::Mutex::new(vec![None; CACHE_SIZE].into_boxed_slice()) }
    }

    /// Returns a fresh reference to the resident buffer matching
    /// (dev, offset) whose payload covers `count` bytes, if any.
    pub fn lookup(&self, dev: Dev, offset: u64, count: usize) -> Option<Arc<Bio>> {
        let slots = self.slots.lock();
        let o = slots[cache_index(dev, offset)].as_ref()?;
        (o.dev() == dev && o.offset() == offset && o.count() >= count)
            .then(|| Arc::clone(o))
    }

    /// Publishes a buffer, replacing whatever occupied its slot.
    /// The evicted reference is dropped only after the cache lock
    /// is released, so a possible destructor runs outside the
    /// critical section.
    pub fn push(&self, o: Arc<Bio>) {
        let i = cache_index(o.dev(), o.offset());
        let old = {
            let mut slots = self.slots.lock();
            slots[i].replace(o)
        };
        if let Some(old) = old {
            debug!("bio: evict dev {} offset {:#x}", old.dev(), old.offset());
            drop(old);
        }
    }

    /// Returns a buffer for (dev, offset, count): a cache hit
    /// hands out another reference, a miss allocates a buffer,
    /// starts a background load when `mode` includes read intent,
    /// and publishes it.  A failed initial submit destroys the
    /// buffer before it is ever published.
    pub fn get(&self, dev: Dev, offset: u64, count: usize, mode: Mode) -> Result<Arc<Bio>> {
        if let Some(o) = self.lookup(dev, offset, count) {
            return Ok(o);
        }
        let o = Arc::new(Bio::new(dev, offset, count));
        if mode.contains(Mode::R) {
            o.load_async()?;
        }
        self.push(Arc::clone(&o));
        Ok(o)
    }

    /// Returns a loaded buffer with the lock held shared.  The
    /// caller ends the access with [`Bio::read_end`].
    pub fn read(&self, dev: Dev, offset: u64, count: usize) -> Result<Arc<Bio>> {
        let o = self.get(dev, offset, count, Mode::R)?;
        o.read_begin()?;
        Ok(o)
    }

    /// Returns a buffer with the lock held exclusive.  With
    /// `modify` the current contents are loaded first; without it
    /// the payload is treated as write-only.  The caller ends the
    /// access with [`Bio::write_end`].
    pub fn write(&self, dev: Dev, offset: u64, count: usize, modify: bool) -> Result<Arc<Bio>> {
        let mode = if modify { Mode::RW } else { Mode::W };
        let o = self.get(dev, offset, count, mode)?;
        o.write_begin(modify)?;
        Ok(o)
    }

    /// Starts a background load of (dev, offset, count) and drops
    /// the reference; the buffer stays resident in the cache.
    pub fn read_ahead(&self, dev: Dev, offset: u64, count: usize) {
        let Ok(o) = self.get(dev, offset, count, Mode::R) else {
            return;
        };
        o.prefetch();
    }

    /// The cached counterpart of the simplified device pull:
    /// reads (dev, offset, count) through the cache and hands
    /// back a private copy of the payload.  The backing buffer
    /// stays resident for later pulls of the same range.
    pub fn block_get(&self, dev: Dev, offset: u64, count: usize) -> Result<Box<[u8]>> {
        let o = self.read(dev, offset, count)?;
        // Safety: read holds the lock shared on success; the
        // resident payload covers at least `count` bytes.
        let data = unsafe { o.data() }[..count].to_vec().into_boxed_slice();
        unsafe { o.read_end() };
        Ok(data)
    }
}

impl Default for BioCache {
    fn default() -> BioCache {
        BioCache::new()
    }
}

/// The process-wide default cache.
pub fn default_cache() -> &'static BioCache {
    static CACHE: LazyLock<BioCache> = LazyLock::new(BioCache::new);
    &CACHE
}
