// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Positional block-device I/O.
//!
//! A device is identified by an opaque integer handle (a raw
//! file descriptor).  The handle is opened and eventually closed
//! by the caller; nothing in this crate takes ownership of it.
//!
//! Two modes are offered: a synchronous pull/push pair, and an
//! asynchronous submit/join pair driven through a per-target
//! [`Aio`] control block.

use std::thread::{self, JoinHandle};

use crate::result::{Error, Result};

/// An opaque block-device handle.
pub type Dev = libc::c_int;

/// Positional read.  Returns the number of bytes transferred,
/// which may be short.
pub fn pread(dev: Dev, buf: &mut [u8], offset: u64) -> Result<usize> {
    let n = unsafe {
        libc::pread(dev, buf.as_mut_ptr().cast(), buf.len(), offset as libc::off_t)
    };
    if n < 0 {
        return Err(Error::DevRead);
    }
    Ok(n as usize)
}

/// Positional write.  Returns the number of bytes transferred,
/// which may be short.
pub fn pwrite(dev: Dev, buf: &[u8], offset: u64) -> Result<usize> {
    let n = unsafe {
        libc::pwrite(dev, buf.as_ptr().cast(), buf.len(), offset as libc::off_t)
    };
    if n < 0 {
        return Err(Error::DevWrite);
    }
    Ok(n as usize)
}

/// Allocates a block of `count` bytes and, when `pull` is set,
/// fills it from (dev, offset).  A short or failed transfer
/// releases the allocation and fails; no partial result escapes.
pub fn block_get(dev: Dev, offset: u64, count: usize, pull: bool) -> Result<Box<[u8]>> {
    let mut data = vec![0u8; count].into_boxed_slice();
    if pull && pread(dev, &mut data, offset)? != count {
        return Err(Error::DevRead);
    }
    Ok(data)
}

/// A raw payload pointer that travels to the transfer thread.
struct SendPtr(*mut u8);

// Safety: the submitter guarantees the target outlives the
// transfer and that nothing else touches it until the join.
unsafe impl Send for SendPtr {}

/// An asynchronous I/O control block.  Tracks the most recently
/// submitted transfer; at most one is in flight at a time, and
/// submitting joins any leftover operation first.
#[derive(Default)]
pub struct Aio {
    pending: Option<JoinHandle<isize>>,
}

impl Aio {
    pub const fn new() -> Aio {
        Aio { pending: None }
    }

    /// Submits a positional read of `count` bytes into `data`.
    ///
    /// # Safety
    /// `data` must point to at least `count` writable bytes that
    /// stay valid, and are not otherwise accessed, until the
    /// operation is joined.
    pub unsafe fn submit_read(
        &mut self,
        dev: Dev,
        data: *mut u8,
        count: usize,
        offset: u64,
    ) -> Result<()> {
        let ptr = SendPtr(data);
        self.submit(move || {
            let ptr = ptr;
            let SendPtr(p) = ptr;
            unsafe { libc::pread(dev, p.cast(), count, offset as libc::off_t) }
        })
    }

    /// Submits a positional write of `count` bytes from `data`.
    ///
    /// # Safety
    /// `data` must point to at least `count` bytes that stay
    /// valid, and are not mutated, until the operation is joined.
    pub unsafe fn submit_write(
        &mut self,
        dev: Dev,
        data: *const u8,
        count: usize,
        offset: u64,
    ) -> Result<()> {
        let ptr = SendPtr(data.cast_mut());
        self.submit(move || {
            let ptr = ptr;
            let SendPtr(p) = ptr;
            unsafe { libc::pwrite(dev, p.cast_const().cast(), count, offset as libc::off_t) }
        })
    }

    fn submit<F>(&mut self, op: F) -> Result<()>
    where
        F: FnOnce() -> isize + Send + 'static,
    {
        self.sync();
        let op = thread::Builder::new()
            .name("aio".into())
            .spawn(op)
            .map_err(|_| Error::IoSubmit)?;
        self.pending = Some(op);
        Ok(())
    }

    /// Blocks until the submitted transfer completes and yields
    /// the number of bytes moved.
    pub fn join(&mut self) -> Result<usize> {
        let op = self.pending.take().ok_or(Error::IoJoin)?;
        match op.join() {
            Ok(n) if n >= 0 => Ok(n as usize),
            _ => Err(Error::IoFault),
        }
    }

    /// Joins any in-flight transfer and discards its result.
    pub fn sync(&mut self) {
        if let Some(op) = self.pending.take() {
            let _ = op.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    fn scratch(content: &[u8]) -> std::fs::File {
        let mut f = tempfile::tempfile().expect("tempfile");
        f.write_all(content).expect("fill");
        f
    }

    #[test]
    fn pull_reads_the_requested_range() {
        let f = scratch(b"0123456789abcdef");
        let b = block_get(f.as_raw_fd(), 4, 8, true).expect("pull");
        assert_eq!(&b[..], b"456789ab");
    }

    #[test]
    fn pull_fails_short() {
        let f = scratch(b"0123");
        assert_eq!(block_get(f.as_raw_fd(), 0, 16, true), Err(Error::DevRead));
    }

    #[test]
    fn no_pull_allocates_zeroed() {
        let f = scratch(b"0123456789");
        let b = block_get(f.as_raw_fd(), 0, 4, false).expect("alloc");
        assert_eq!(&b[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn push_then_pull_round_trips() {
        let f = scratch(&[0u8; 32]);
        let dev = f.as_raw_fd();
        assert_eq!(pwrite(dev, b"marten", 8), Ok(6));
        let b = block_get(dev, 8, 6, true).expect("pull");
        assert_eq!(&b[..], b"marten");
    }

    #[test]
    fn aio_read_join_counts_bytes() {
        let f = scratch(b"async block io");
        let dev = f.as_raw_fd();
        let mut buf = [0u8; 5];
        let mut cb = Aio::new();
        unsafe {
            cb.submit_read(dev, buf.as_mut_ptr(), buf.len(), 6).expect("submit");
        }
        assert_eq!(cb.join(), Ok(5));
        assert_eq!(&buf, b"block");
    }

    #[test]
    fn aio_write_join_counts_bytes() {
        let f = scratch(&[0u8; 16]);
        let dev = f.as_raw_fd();
        let buf = *b"dirty";
        let mut cb = Aio::new();
        unsafe {
            cb.submit_write(dev, buf.as_ptr(), buf.len(), 2).expect("submit");
        }
        assert_eq!(cb.join(), Ok(5));
        let back = block_get(dev, 2, 5, true).expect("pull");
        assert_eq!(&back[..], b"dirty");
    }

    #[test]
    fn join_without_submit_fails() {
        let mut cb = Aio::new();
        assert_eq!(cb.join(), Err(Error::IoJoin));
    }

    #[test]
    fn resubmit_joins_the_leftover_op() {
        let f = scratch(b"first second");
        let dev = f.as_raw_fd();
        let mut buf = [0u8; 6];
        let mut cb = Aio::new();
        unsafe {
            cb.submit_read(dev, buf.as_mut_ptr(), 5, 0).expect("submit");
            cb.submit_read(dev, buf.as_mut_ptr(), 6, 6).expect("resubmit");
        }
        assert_eq!(cb.join(), Ok(6));
        assert_eq!(&buf, b"second");
    }
}
