// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Block device I/O buffers.
//!
//! A [`Bio`] pins an in-memory copy of a contiguous byte range
//! of a block device.  Its identity (device, offset, count) is
//! fixed at creation; the payload carries `READY`/`DIRTY` state
//! and is guarded by a shared/exclusive lock while users look at
//! it.  Disk transfers run through a per-buffer asynchronous
//! control block: every submit may fail without blocking, every
//! join blocks until the transfer completes.
//!
//! Buffers are handed out as `Arc<Bio>`: cloning the `Arc` is
//! the `ref` operation, dropping it is `put`.  A fresh buffer
//! starts with two references, one for the creator and one for
//! the cache slot it is published to.  The destructor runs on
//! the last put; it joins any in-flight transfer, writes back a
//! dirty payload, and frees the buffer.

use core::ptr::{self, NonNull};
use core::slice;
use core::sync::atomic::{AtomicU8, Ordering};

use bitflags::bitflags;
use log::warn;
use parking_lot::lock_api::RawRwLock as _;
use parking_lot::{Mutex, RawRwLock};

use crate::dev::{Aio, Dev};
use crate::result::{Error, Result};

bitflags! {
    /// Buffer payload state.  `DIRTY` implies `READY`.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct State: u8 {
        /// Actual device data available in-core.
        const READY = 1 << 0;
        /// Data modified in-core, not yet written back.
        const DIRTY = 1 << 1;
    }
}

bitflags! {
    /// Access intent passed to [`BioCache::get`].
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Mode: u8 {
        const R = 1 << 0;
        const W = 1 << 1;
        const RW = Self::R.bits() | Self::W.bits();
    }
}

/// A pinned, reference-counted block buffer.
pub struct Bio {
    dev: Dev,
    offset: u64,
    count: usize,
    data: NonNull<u8>,
    state: AtomicU8,
    lock: RawRwLock,
    cb: Mutex<Aio>,
}

// Safety: the payload behind `data` is exclusively owned by the
// buffer and only touched under the lock/control-block protocol
// below; everything else is atomic or internally synchronized.
unsafe impl Send for Bio {}
unsafe impl Sync for Bio {}

impl Bio {
    /// Creates an unpublished buffer with a zeroed payload.
    pub(crate) fn new(dev: Dev, offset: u64, count: usize) -> Bio {
        let data = Box::into_raw(vec![0u8; count].into_boxed_slice());
        // Safety: a Box allocation is never null.
        let data = unsafe { NonNull::new_unchecked(data.cast::<u8>()) };
        Bio {
            dev,
            offset,
            count,
            data,
            state: AtomicU8::new(0),
            lock: RawRwLock::INIT,
            cb: Mutex::new(Aio::new()),
        }
    }

    pub fn dev(&self) -> Dev {
        self.dev
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The resident payload size in bytes.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn state(&self) -> State {
        State::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    /// Returns the payload.
    ///
    /// # Safety
    /// The caller must hold the buffer lock (either mode) and no
    /// transfer may be in flight that writes the payload.
    pub unsafe fn data(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.data.as_ptr(), self.count) }
    }

    /// Returns the payload for modification.
    ///
    /// # Safety
    /// The caller must hold the buffer lock in exclusive mode and
    /// no transfer may be in flight.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.data.as_ptr(), self.count) }
    }

    fn load_emit(&self, cb: &mut Aio) -> Result<()> {
        // Safety: the payload outlives the control block, which
        // joins the transfer before the payload is touched again.
        unsafe { cb.submit_read(self.dev, self.data.as_ptr(), self.count, self.offset) }
    }

    fn save_emit(&self, cb: &mut Aio) -> Result<()> {
        // Safety: as for load_emit; writes only read the payload.
        unsafe {
            cb.submit_write(self.dev, self.data.as_ptr().cast_const(), self.count, self.offset)
        }
    }

    fn join_full(cb: &mut Aio, count: usize) -> Result<()> {
        if cb.join()? != count {
            return Err(Error::IoFault);
        }
        Ok(())
    }

    /// Ensures the payload reflects the device contents:
    /// succeeds immediately once `READY`, otherwise submits a
    /// read, joins it and marks the buffer `READY`.
    pub fn load(&self) -> Result<()> {
        if self.state().contains(State::READY) {
            return Ok(());
        }
        let mut cb = self.cb.lock();
        self.load_emit(&mut cb)?;
        Self::join_full(&mut cb, self.count)?;
        drop(cb);
        self.state.fetch_or(State::READY.bits(), Ordering::Release);
        Ok(())
    }

    /// Writes a dirty payload back: succeeds immediately when not
    /// `DIRTY`, otherwise submits a write, joins it and clears
    /// `DIRTY`.
    pub fn save(&self) -> Result<()> {
        if !self.state().contains(State::DIRTY) {
            return Ok(());
        }
        let mut cb = self.cb.lock();
        self.save_emit(&mut cb)?;
        Self::join_full(&mut cb, self.count)?;
        drop(cb);
        self.state.fetch_and(!State::DIRTY.bits(), Ordering::Release);
        Ok(())
    }

    /// Submits a read unless the buffer is already `READY`; does
    /// not wait for completion and does not change state.
    pub fn load_async(&self) -> Result<()> {
        if self.state().contains(State::READY) {
            return Ok(());
        }
        self.load_emit(&mut self.cb.lock())
    }

    /// Submits a write when the buffer is `DIRTY`; does not wait
    /// for completion and does not change state.
    pub fn save_async(&self) -> Result<()> {
        if !self.state().contains(State::DIRTY) {
            return Ok(());
        }
        self.save_emit(&mut self.cb.lock())
    }

    /// Takes the lock shared and ensures the payload is loaded.
    /// The lock is released again on failure.
    pub fn read_begin(&self) -> Result<()> {
        self.lock.lock_shared();
        match self.load() {
            Ok(()) => Ok(()),
            Err(e) => {
                // Safety: taken shared just above.
                unsafe { self.lock.unlock_shared() };
                Err(e)
            }
        }
    }

    /// Releases the lock after [`Bio::read_begin`].
    ///
    /// # Safety
    /// The calling thread must hold the lock in shared mode.
    pub unsafe fn read_end(&self) {
        unsafe { self.lock.unlock_shared() };
    }

    /// Takes the lock exclusive; for read-modify-write access the
    /// payload is loaded first.  The lock is released again on
    /// failure.  Any in-flight transfer is joined so the caller
    /// may overwrite the payload.
    pub fn write_begin(&self, modify: bool) -> Result<()> {
        self.lock.lock_exclusive();
        self.cb.lock().sync();
        if !modify {
            return Ok(());
        }
        match self.load() {
            Ok(()) => Ok(()),
            Err(e) => {
                // Safety: taken exclusive just above.
                unsafe { self.lock.unlock_exclusive() };
                Err(e)
            }
        }
    }

    /// Releases the lock after [`Bio::write_begin`].  With
    /// `dirty` set the buffer becomes `READY | DIRTY` before an
    /// asynchronous write-back is submitted, so lookups observe
    /// the new contents immediately.
    ///
    /// # Safety
    /// The calling thread must hold the lock in exclusive mode.
    pub unsafe fn write_end(&self, dirty: bool) -> Result<()> {
        let mut result = Ok(());
        if dirty {
            self.state
                .fetch_or((State::READY | State::DIRTY).bits(), Ordering::Release);
            result = self.save_emit(&mut self.cb.lock());
        }
        unsafe { self.lock.unlock_exclusive() };
        result
    }

    /// Takes the lock exclusive, writes back a dirty payload and
    /// releases the lock.
    pub fn sync(&self) -> Result<()> {
        self.lock.lock_exclusive();
        let result = self.save();
        // Safety: taken exclusive just above.
        unsafe { self.lock.unlock_exclusive() };
        result
    }

    /// Kicks off a background load while the lock is briefly held
    /// shared; completion is left for a later [`Bio::load`].
    pub(crate) fn prefetch(&self) {
        self.lock.lock_shared();
        let _ = self.load_async();
        // Safety: taken shared just above.
        unsafe { self.lock.unlock_shared() };
    }
}

impl Drop for Bio {
    fn drop(&mut self) {
        self.cb.get_mut().sync();
        if self.state().contains(State::DIRTY) {
            // TODO: save asynchronously and free the buffer from
            // the completion path instead.
            if self.save().is_err() {
                warn!(
                    "bio: dropping failed writeback, dev {} offset {:#x}",
                    self.dev, self.offset
                );
            }
        }
        let data = ptr::slice_from_raw_parts_mut(self.data.as_ptr(), self.count);
        // Safety: created by Box::into_raw in Bio::new and not
        // freed elsewhere; the control block was joined above.
        drop(unsafe { Box::from_raw(data) });
    }
}

mod cache;

pub use cache::{BioCache, default_cache};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    fn scratch(content: &[u8]) -> std::fs::File {
        let mut f = tempfile::tempfile().expect("tempfile");
        f.write_all(content).expect("fill");
        f
    }

    #[test]
    fn fresh_buffer_is_empty_state() {
        let o = Bio::new(-1, 0x1000, 32);
        assert_eq!(o.state(), State::empty());
        assert_eq!(o.dev(), -1);
        assert_eq!(o.offset(), 0x1000);
        assert_eq!(o.count(), 32);
    }

    #[test]
    fn load_marks_ready_and_is_idempotent() {
        let f = scratch(b"immutable contents");
        let o = Bio::new(f.as_raw_fd(), 10, 8);
        o.load().expect("load");
        assert!(o.state().contains(State::READY));
        assert_eq!(unsafe { o.data() }, b"contents");

        // A later load must not touch the device again.
        dev::pwrite(f.as_raw_fd(), b"clobber!", 10).expect("pwrite");
        o.load().expect("reload");
        assert_eq!(unsafe { o.data() }, b"contents");
    }

    #[test]
    fn load_fails_on_short_device() {
        let f = scratch(b"tiny");
        let o = Bio::new(f.as_raw_fd(), 0, 64);
        assert_eq!(o.load(), Err(Error::IoFault));
        assert!(!o.state().contains(State::READY));
    }

    #[test]
    fn save_without_dirty_is_a_no_op() {
        let f = scratch(b"untouched");
        let o = Bio::new(f.as_raw_fd(), 0, 4);
        o.save().expect("save");
        let back = dev::block_get(f.as_raw_fd(), 0, 9, true).expect("pull");
        assert_eq!(&back[..], b"untouched");
    }

    #[test]
    fn save_clears_dirty_and_writes_back() {
        let f = scratch(&[0u8; 16]);
        let o = Bio::new(f.as_raw_fd(), 4, 4);
        o.write_begin(false).expect("begin");
        unsafe { o.data_mut() }.copy_from_slice(b"mark");
        o.state.fetch_or((State::READY | State::DIRTY).bits(), Ordering::Release);
        // Safety: write_begin took the lock exclusive.
        unsafe { o.write_end(false).expect("end") };
        o.save().expect("save");
        assert!(!o.state().contains(State::DIRTY));
        assert!(o.state().contains(State::READY));
        let back = dev::block_get(f.as_raw_fd(), 4, 4, true).expect("pull");
        assert_eq!(&back[..], b"mark");
        // Saving again must be free.
        o.save().expect("save again");
    }

    #[test]
    fn read_begin_failure_releases_the_lock() {
        let f = scratch(b"x");
        let o = Bio::new(f.as_raw_fd(), 0, 128);
        assert_eq!(o.read_begin(), Err(Error::IoFault));
        // The lock must be free again for a writer.
        o.write_begin(false).expect("begin");
        unsafe { o.write_end(false).expect("end") };
    }

    #[test]
    fn write_end_dirty_publishes_then_writes() {
        let f = scratch(&[0u8; 32]);
        let o = Bio::new(f.as_raw_fd(), 8, 5);
        o.write_begin(false).expect("begin");
        unsafe { o.data_mut() }.copy_from_slice(b"beans");
        unsafe { o.write_end(true).expect("end") };
        assert!(o.state().contains(State::READY | State::DIRTY));
        o.sync().expect("sync");
        assert!(!o.state().contains(State::DIRTY));
        let back = dev::block_get(f.as_raw_fd(), 8, 5, true).expect("pull");
        assert_eq!(&back[..], b"beans");
    }

    #[test]
    fn dirty_buffer_is_flushed_by_the_destructor() {
        let f = scratch(&[0u8; 16]);
        {
            let o = Bio::new(f.as_raw_fd(), 0, 7);
            o.write_begin(false).expect("begin");
            unsafe { o.data_mut() }.copy_from_slice(b"goodbye");
            unsafe { o.write_end(true).expect("end") };
        }
        let back = dev::block_get(f.as_raw_fd(), 0, 7, true).expect("pull");
        assert_eq!(&back[..], b"goodbye");
    }

    #[test]
    fn prefetch_leaves_state_alone() {
        let f = scratch(b"look ahead");
        let o = Bio::new(f.as_raw_fd(), 0, 4);
        o.prefetch();
        assert!(!o.state().contains(State::READY));
        o.load().expect("load");
        assert_eq!(unsafe { o.data() }, b"look");
    }
}
