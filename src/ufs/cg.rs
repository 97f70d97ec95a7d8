// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cylinder groups.
//!
//! Each group owns a slice of the volume: a spare super block
//! copy, the group descriptor, an inode region and data
//! fragments, in that order.  The descriptor carries two bitmaps
//! located by byte offsets into the raw group image: the used
//! inode map and the free fragment map.

use bit_field::BitField;

use crate::result::{Error, Result};

use super::inode::{DInode, INODE_SIZE};
use super::{Cs, Fs, MAX_FRAG, decode};

/// Magic number identifying a cylinder group. Eric's birthday.
pub const CG_MAGIC: i32 = 0x00090255;

/// Size of the fixed part of the on-disk group descriptor; the
/// maps follow it inside the `cgsize`-byte image.
pub const CYL_GROUP_SIZE: usize = 168;

/// The on-disk cylinder group descriptor, format version 2.
///
/// Introduced in BSD 4.3-Tahoe, which moved the magic field and
/// lifted the 32-cylinder limit; FreeBSD 2.0.5 added cluster
/// maps and FreeBSD 5.0 dropped the per-cylinder totals.
#[derive(Clone, Debug, bincode::Decode, bincode::Encode)]
pub struct CylGroup {
    pub link: i32,               // Not used
    pub magic: i32,              // Eric's birthday
    pub time: u32,               // Time last written
    pub cgx: u32,                // Index of this cylinder group
    pub ncyl: i16,               // Number of cylinders in this group
    pub ipg: i16,                // Number of inodes in this group
    pub fpg: i32,                // Number of data fragments in this group
    pub cs: Cs,                  // Group summary information
    pub rotor: i32,              // Position of last used block
    pub frotor: i32,             // Position of last used fragment
    pub irotor: i32,             // Position of last used inode
    pub frsum: [i32; MAX_FRAG],  // Counts of available fragments
    pub btotoff: u32,            // Block totals per cylinder
    pub boff: u32,               // Free block positions
    pub iusedoff: u32,           // Used inode map
    pub freeoff: u32,            // Free block map
    pub nextfreeoff: u32,        // Next available space
    pub clustersumoff: u32,      // Counts of available clusters
    pub clusteroff: u32,         // Free cluster map
    pub nclusterblks: u32,       // Number of clusters
    pub sparecon: [i32; 13],     // Reserved for future use
}

/// A loaded, validated cylinder group: the raw image plus the
/// checked offsets of the maps within it.
pub struct Cg<'a> {
    fs: &'a Fs<'a>,
    data: Box<[u8]>,
    start: i64,
    cgx: u32,
    ipg: u32,
    fpg: u32,
    imap_pos: u32,
    fmap_pos: u32,
    emap_pos: u32,
    stat: Cs,
}

impl std::fmt::Debug for Cg<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cg")
            .field("start", &self.start)
            .field("cgx", &self.cgx)
            .field("ipg", &self.ipg)
            .field("fpg", &self.fpg)
            .field("imap_pos", &self.imap_pos)
            .field("fmap_pos", &self.fmap_pos)
            .field("emap_pos", &self.emap_pos)
            .field("stat", &self.stat)
            .finish()
    }
}

impl<'a> Cg<'a> {
    /// Loads group `cgx` through the buffer cache and validates
    /// its descriptor against the file system geometry.
    pub fn new(fs: &'a Fs<'a>, cgx: u32) -> Result<Cg<'a>> {
        let pos = (fs.cg_cblkno(cgx) as u64) << fs.fshift();
        let data = fs
            .pull(pos, fs.cgsize() as usize)
            .map_err(|_| Error::CgRead)?;
        let c: CylGroup = decode(&data[..CYL_GROUP_SIZE])?;

        if c.magic != CG_MAGIC {
            return Err(Error::CgMagic);
        }

        let o = Cg {
            fs,
            start: fs.cg_start(cgx),
            cgx: c.cgx,
            ipg: c.ipg as u32,
            fpg: c.fpg as u32,
            imap_pos: c.iusedoff,
            fmap_pos: c.freeoff,
            emap_pos: c.nextfreeoff,
            stat: c.cs,
            data,
        };

        if o.cgx != cgx || o.ipg != fs.ipg() || o.fpg > fs.fpg() {
            return Err(Error::CgConfig);
        }

        // The maps must lie inside the image, in order, and be
        // large enough for the advertised inode and fragment
        // counts.
        if o.emap_pos > fs.cgsize()
            || o.fmap_pos >= o.emap_pos
            || o.imap_pos >= o.fmap_pos
            || (o.fmap_pos - o.imap_pos) < o.ipg.div_ceil(8)
            || (o.emap_pos - o.fmap_pos) < o.fpg.div_ceil(8)
        {
            return Err(Error::CgLayout);
        }

        Ok(o)
    }

    pub fn cgx(&self) -> u32 {
        self.cgx
    }

    pub fn ipg(&self) -> u32 {
        self.ipg
    }

    pub fn fpg(&self) -> u32 {
        self.fpg
    }

    /// The first fragment of this group.
    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn stat(&self) -> &Cs {
        &self.stat
    }

    /// The used inode map: one bit per inode in this group.
    pub fn imap(&self) -> &[u8] {
        let pos = self.imap_pos as usize;
        &self.data[pos..pos + self.ipg.div_ceil(8) as usize]
    }

    /// The free fragment map: one bit per fragment in this group.
    pub fn fmap(&self) -> &[u8] {
        let pos = self.fmap_pos as usize;
        &self.data[pos..pos + self.fpg.div_ceil(8) as usize]
    }

    /// Whether the group-local inode `i` is allocated.
    pub fn is_inode_used(&self, i: u32) -> bool {
        self.imap()[(i / 8) as usize].get_bit((i % 8) as usize)
    }

    /// The volume-wide inode number of the group-local index `i`.
    pub fn ino(&self, i: u32) -> u32 {
        self.fs.ipg() * self.cgx + i
    }

    /// Fetches the 128-byte on-disk record of the group-local
    /// inode `n`.
    pub fn inode(&self, n: u32) -> Result<DInode> {
        let base = self.fs.cg_iblkno(self.cgx) as u64;
        let pos = (base << self.fs.fshift()) + n as u64 * INODE_SIZE as u64;
        let raw = self.fs.pull(pos, INODE_SIZE)?;
        decode(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample<'a>(fs: &'a Fs<'a>) -> Cg<'a> {
        // A hand-built group image: inode map at 168 with inodes
        // 2 and 9 set, fragment map at 172.
        let mut data = vec![0u8; 4096];
        data[168] = 0b0000_0100;
        data[169] = 0b0000_0010;
        data[172] = 0xff;
        Cg {
            fs,
            data: data.into_boxed_slice(),
            start: 0,
            cgx: 0,
            ipg: 32,
            fpg: 1024,
            imap_pos: 168,
            fmap_pos: 172,
            emap_pos: 300,
            stat: Cs { ndir: 1, nbfree: 2, nifree: 3, nffree: 4 },
        }
    }

    #[test]
    fn imap_bits_locate_used_inodes() {
        let fs = Fs::fake(-1, 12, 9);
        let cg = sample(&fs);
        assert_eq!(cg.imap().len(), 4);
        assert!(cg.is_inode_used(2));
        assert!(cg.is_inode_used(9));
        for i in [0, 1, 3, 8, 10, 31] {
            assert!(!cg.is_inode_used(i));
        }
    }

    #[test]
    fn fmap_covers_the_fragment_count() {
        let fs = Fs::fake(-1, 12, 9);
        let cg = sample(&fs);
        assert_eq!(cg.fmap().len(), 128);
        assert_eq!(cg.fmap()[0], 0xff);
    }

    #[test]
    fn group_local_inode_numbering() {
        let fs = Fs::fake(-1, 12, 9);
        let mut cg = sample(&fs);
        assert_eq!(cg.ino(0), 0);
        assert_eq!(cg.ino(5), 5);
        cg.cgx = 3;
        assert_eq!(cg.ino(5), 3 * 32 + 5);
    }
}
