// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Read-only foundations of a UFS1 (4.4BSD/FreeBSD) file system
//! reader, backed by a block-device I/O cache: positional and
//! asynchronous device transfers ([`dev`]), reference-counted
//! block buffers behind a direct-mapped cache ([`bio`]), and
//! bit-exact readers for the on-disk super block, cylinder
//! group, inode and directory structures ([`ufs`]).  Every block
//! the readers pull goes through a [`bio::BioCache`]: an
//! explicit one handed to [`ufs::Fs::with_cache`], or the
//! process default used by [`ufs::Fs::new`].

#![forbid(unsafe_op_in_unsafe_fn)]

pub mod bio;
pub mod dev;
pub mod hash;
pub mod result;
pub mod ufs;
