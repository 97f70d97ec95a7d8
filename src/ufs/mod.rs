// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! This is an implementation of the read paths of the UNIX File
//! System v1 ("UFS1"), in the on-disk format introduced by 4.4BSD
//! and still used by FreeBSD.  This is suitable for extracting
//! files from disk images, programmatically examining the
//! directory hierarchy, and so forth.
//!
//! UFS was designed to maximize performance on spinning magnetic
//! media (disks) when 3600 RPM was considered fast.  Much of the
//! design is consequently focused on locality within the device:
//! the volume is split into cylinder groups, each carrying its
//! own copy of the super block, its own inode region and its own
//! allocation bitmaps, so that related data lands under the same
//! head position.  Storage units fall into two categories:
//! "blocks", relatively large power-of-two multiples of the
//! device sector size that facilitate rapid transfer, and
//! "fragments", equal-sized portions of a block used for the
//! tails of short files.  All on-disk addresses here are in
//! fragments.
//!
//! References:
//!
//! [McKus84] Marshall K McKusick, William N Joy, Samuel J
//! Leffler, and Robert S Fabry. 1984. ``A Fast FileSystem for
//! Unix''.  ACM Transactions on Computer Systems 2, 3 (Aug.
//! 1984), 181-197. https://doi.org/10.1145/989.990

use core::fmt::{self, Write};

use bitstruct::bitstruct;

use crate::bio::{BioCache, default_cache};
use crate::dev::Dev;
use crate::result::{Error, Result};

/// Offset of the first super block, in bytes.  The 8 KiB below
/// it are reserved for the boot block.
pub const SUPER_BLOCK_OFFSET: u64 = 8192;

/// Size of the on-disk super block record, in bytes.
pub const SUPER_BLOCK_SIZE: usize = 1376;

/// Magic number identifying a UFS1 file system. Kirk's birthday?
pub const MAGIC: i32 = 0x00011954;

/// Maximum mount point length.
pub const MAX_MOUNT_LEN: usize = 468;

/// Maximum number of fragments per block.
pub const MAX_FRAG: usize = 8;

/// Size of the embedded data area in the inode, which doubles as
/// the longest symbolic-link target stored in the inode itself.
pub const EMBEDDED_SIZE: usize = 60;

/// File type codes as stored in directory entries, and as found
/// in the top four bits of the inode mode word.  First defined
/// in 4.4BSD; FreeBSD, illumos, Linux, NetBSD and OpenBSD all
/// agree on the values.
pub const DT_UNKNOWN: u8 = 0;
pub const DT_FIFO: u8 = 1;
pub const DT_CHR: u8 = 2;
pub const DT_DIR: u8 = 4;
pub const DT_BLK: u8 = 6;
pub const DT_REG: u8 = 8;
pub const DT_LNK: u8 = 10;
pub const DT_SOCK: u8 = 12;
pub const DT_WHT: u8 = 14;

/// Decodes one little-endian on-disk record from the front of a
/// raw byte image.
pub(crate) fn decode<T: bincode::Decode<()>>(raw: &[u8]) -> Result<T> {
    match bincode::decode_from_slice(raw, bincode::config::legacy()) {
        Ok((v, _)) => Ok(v),
        Err(_) => Err(Error::Decode),
    }
}

/// Per-cylinder group usage summary.  The super block carries
/// the totals over all groups.
#[derive(Clone, Copy, Debug, bincode::Decode, bincode::Encode)]
pub struct Cs {
    pub ndir: i32,   // number of directories
    pub nbfree: i32, // number of free blocks
    pub nifree: i32, // number of free inodes
    pub nffree: i32, // number of free fragments
}

/// The on-disk super block, format version 2.
///
/// Introduced in BSD 4.1b; 4.3BSD-Tahoe reworked the rotational
/// tables, FreeBSD 5.0 deprecated them.  Most fields are hints
/// that can be recomputed from the core geometry, or relics of
/// rotational-media tuning that no longer matter; validation
/// below checks the hints against the core fields instead of
/// trusting them.
#[derive(Clone, Debug, bincode::Decode, bincode::Encode)]
pub struct SuperBlock {
    pub link: i32,                  // Linked list of filesystems
    pub rlink: i32,                 // Linked list of super blocks
    pub sblkno: i32,                // Addr of super-block in filesys
    pub cblkno: i32,                // Offset of cyl-group in filesys
    pub iblkno: i32,                // Offset of inode-blocks in filesys
    pub dblkno: i32,                // Offset of first data after CG
    pub cgoffset: i32,              // Cylinder group offset in cylinder
    pub cgmask: i32,                // Used to calc mod ntrak
    pub time: u32,                  // Last time written
    pub size: i32,                  // Number of blocks in filesys
    pub dsize: i32,                 // Number of data blocks in filesys
    pub ncg: u32,                   // Number of cylinder groups
    pub bsize: i32,                 // Size of "basic" blocks in filesys
    pub fsize: i32,                 // Size of "fragment" blocks in filesys
    pub frag: i32,                  // Number of fragments in a block
    pub minfree: i32,               // Minimum percentage of free blocks
    pub rotdelay: i32,              // MS until optimal for next block
    pub rps: i32,                   // Disk revolutions per second
    pub bmask: i32,                 // `blkoff`: block offsets
    pub fmask: i32,                 // `fragoff`: fragment offsets
    pub bshift: i32,                // `lblkno`: logical block number
    pub fshift: i32,                // `numfrags`: number of fragments
    pub maxcontig: i32,             // Max number of contiguous blocks
    pub maxbpg: i32,                // Max number of blocks per cyl group
    pub fragshift: i32,             // Block to fragment shift
    pub fsbtodb: i32,               // FS block <-> dev block shift constant
    pub sbsize: i32,                // Actual size of super block
    pub csmask: i32,                // Summary block offset
    pub csshift: i32,               // Summary block number
    pub nindir: i32,                // Value of NINDIR
    pub inopb: u32,                 // Value of INOPB
    pub nspf: i32,                  // Value of NSPF
    pub optim: i32,                 // Optimization preference (space or time)
    pub npsect: i32,                // Sectors per track, including spares
    pub interleave: i32,            // Hardware sector interleave
    pub trackskew: i32,             // Sector 0 skew, per track
    pub id: [i32; 2],               // Unique filesystem id
    pub csaddr: i32,                // Block addr of cyl grp summary area
    pub cssize: i32,                // Size of cyl grp summary area
    pub cgsize: i32,                // Cylinder group size
    pub ntrak: i32,                 // Tracks per cylinder
    pub nsect: i32,                 // Sectors per track
    pub spc: i32,                   // Sectors per cylinder
    pub ncyl: i32,                  // Cylinders in filesystem
    pub cpg: i32,                   // Cylinders per group
    pub ipg: u32,                   // Inodes per group
    pub fpg: i32,                   // Fragments per group
    pub cstotal: Cs,                // Cylinder summary information
    pub fmod: i8,                   // Super block modified flag
    pub clean: i8,                  // Filesystem is clean flag
    pub ronly: i8,                  // Mounted read-only flag
    pub flags: i8,                  // State flags
    pub fsmnt: [u8; MAX_MOUNT_LEN], // Name mounted on
    pub volname: [u8; 32],          // Volume name
    pub swuid: u64,                 // System-wide unique id
    pub pad: i32,
    pub cgrotor: i32,               // Last CG searched
    pub ocsp: [i32; 32],            // Old in-core summary buffers
    pub cpc: i32,                   // Cyl per cycle in postbl
    pub opostbl: [[i16; 16]; 8],    // Old rotation block list head
    pub sparecon: [i32; 50],        // Reserved for future constants
    pub contigsumsize: i32,         // Size of cluster summary array
    pub maxembedded: i32,           // Max size of embedded symlink
    pub inodefmt: i32,              // Format of on-disk inodes
    pub maxfilesize: u64,           // Maximum representable file size
    pub qbmask: i64,                // ~bmask for 64-bit arithmetic
    pub qfmask: i64,                // ~fmask for 64-bit arithmetic
    pub state: i32,                 // File system state time stamp
    pub postblformat: i32,          // Format of positional layout tables
    pub nrpos: i32,                 // Number of rotational positions
    pub postbloff: i32,             // Short rotation block list head
    pub rotbloff: i32,              // Blocks for each rotation
    pub magic: i32,                 // Kirk's birthday
}

/// The validated, in-memory file system descriptor: the subset
/// of the super block needed to navigate the volume, with every
/// derived field cross-checked against the core geometry.
///
/// Fragment addresses returned by the `cg_*` methods are
/// absolute; shifting left by `fshift` turns them into byte
/// offsets on the device.  Every block the readers pull, from
/// the super block itself down to directory fragments, goes
/// through the buffer cache the descriptor was created with.
pub struct Fs<'c> {
    dev: Dev,
    cache: &'c BioCache,
    sblkno: u32,
    cblkno: u32,
    iblkno: u32,
    dblkno: u32,
    cgoffset: i32,
    cgmask: i32,
    ncg: u32,
    bshift: u32,
    fshift: u32,
    inopb: u32,
    cgsize: u32,
    ipg: u32,
    fpg: u32,
    stat: Cs,
}

impl std::fmt::Debug for Fs<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fs")
            .field("dev", &self.dev)
            .field("sblkno", &self.sblkno)
            .field("cblkno", &self.cblkno)
            .field("iblkno", &self.iblkno)
            .field("dblkno", &self.dblkno)
            .field("cgoffset", &self.cgoffset)
            .field("cgmask", &self.cgmask)
            .field("ncg", &self.ncg)
            .field("bshift", &self.bshift)
            .field("fshift", &self.fshift)
            .field("inopb", &self.inopb)
            .field("cgsize", &self.cgsize)
            .field("ipg", &self.ipg)
            .field("fpg", &self.fpg)
            .field("stat", &self.stat)
            .finish()
    }
}

impl Fs<'static> {
    /// Loads and validates the super block of the file system on
    /// `dev`, reading through the process-default buffer cache.
    /// The device handle stays owned by the caller; it is not
    /// closed when the descriptor is dropped.
    pub fn new(dev: Dev) -> Result<Fs<'static>> {
        Fs::with_cache(dev, default_cache())
    }
}

impl<'c> Fs<'c> {
    /// As [`Fs::new`], but reading through the given cache.
    pub fn with_cache(dev: Dev, cache: &'c BioCache) -> Result<Fs<'c>> {
        let raw = cache
            .block_get(dev, SUPER_BLOCK_OFFSET, SUPER_BLOCK_SIZE)
            .map_err(|_| Error::SbRead)?;
        let s: SuperBlock = decode(&raw)?;

        if s.magic != MAGIC {
            return Err(Error::SbMagic);
        }

        let o = Fs {
            dev,
            cache,
            sblkno: s.sblkno as u32,
            cblkno: s.cblkno as u32,
            iblkno: s.iblkno as u32,
            dblkno: s.dblkno as u32,
            cgoffset: s.cgoffset,
            cgmask: s.cgmask,
            ncg: s.ncg,
            bshift: s.bshift as u32,
            fshift: s.fshift as u32,
            inopb: s.inopb,
            cgsize: s.cgsize as u32,
            ipg: s.ipg,
            fpg: s.fpg as u32,
            stat: s.cstotal,
        };

        // Region order within a cylinder group, and the CG
        // descriptor must fit between cblkno and iblkno.
        let cg_room = ((o.iblkno.wrapping_sub(o.cblkno)) as u64)
            .checked_shl(o.fshift)
            .unwrap_or(0);
        if o.sblkno >= o.cblkno
            || o.cblkno >= o.iblkno
            || o.iblkno >= o.dblkno
            || o.dblkno >= o.fpg
            || o.cgsize < cg::CYL_GROUP_SIZE as u32
            || o.cgsize as u64 > cg_room
        {
            return Err(Error::SbLayout);
        }

        // The shift hints must agree with the core parameters.
        if s.bshift < 12
            || 1i64.checked_shl(o.bshift) != Some(s.bsize as i64)
            || s.fshift < 9
            || 1i64.checked_shl(o.fshift) != Some(s.fsize as i64)
            || s.fragshift != s.bshift - s.fshift
            || s.fragshift < 0
            || s.fragshift > 3
            || s.fsbtodb != s.fshift - 9
            || s.frag != 1 << s.fragshift
            || s.bmask as i64 != !0i64 << o.bshift
            || s.fmask as i64 != !0i64 << o.fshift
            || o.inopb != (s.bsize / inode::INODE_SIZE as i32) as u32
        {
            return Err(Error::SbConfig);
        }

        if s.maxembedded != EMBEDDED_SIZE as i32 || s.inodefmt != 2 {
            return Err(Error::SbInodeFormat);
        }

        Ok(o)
    }

    pub fn dev(&self) -> Dev {
        self.dev
    }

    /// Reads `count` bytes at the device byte offset `offset`
    /// through the buffer cache.
    pub(crate) fn pull(&self, offset: u64, count: usize) -> Result<Box<[u8]>> {
        self.cache.block_get(self.dev, offset, count)
    }

    pub fn ncg(&self) -> u32 {
        self.ncg
    }

    pub fn ipg(&self) -> u32 {
        self.ipg
    }

    pub fn fpg(&self) -> u32 {
        self.fpg
    }

    pub fn bshift(&self) -> u32 {
        self.bshift
    }

    pub fn fshift(&self) -> u32 {
        self.fshift
    }

    pub fn inopb(&self) -> u32 {
        self.inopb
    }

    pub fn cgsize(&self) -> u32 {
        self.cgsize
    }

    /// The block size in bytes.
    pub fn bsize(&self) -> u32 {
        1 << self.bshift
    }

    /// The fragment size in bytes.
    pub fn fsize(&self) -> u32 {
        1 << self.fshift
    }

    /// The usage summary over the whole file system, as recorded
    /// at the last write.
    pub fn stat(&self) -> &Cs {
        &self.stat
    }

    /// Returns the first fragment of the given cylinder group.
    /// The `cgoffset`/`cgmask` term historically staggered the
    /// group starts across cylinders so that the super block
    /// copies "spiraled down into the pack" [McKus84].
    pub fn cg_start(&self, cgx: u32) -> i64 {
        self.fpg as i64 * cgx as i64
            + self.cgoffset as i64 * ((cgx & !(self.cgmask as u32)) as i64)
    }

    /// The fragment of the super block copy in the given group.
    pub fn cg_sblkno(&self, cgx: u32) -> i64 {
        self.cg_start(cgx) + self.sblkno as i64
    }

    /// The fragment of the group descriptor in the given group.
    pub fn cg_cblkno(&self, cgx: u32) -> i64 {
        self.cg_start(cgx) + self.cblkno as i64
    }

    /// The first inode fragment of the given group.
    pub fn cg_iblkno(&self, cgx: u32) -> i64 {
        self.cg_start(cgx) + self.iblkno as i64
    }

    /// The first data fragment of the given group.
    pub fn cg_dblkno(&self, cgx: u32) -> i64 {
        self.cg_start(cgx) + self.dblkno as i64
    }
}

#[cfg(test)]
impl Fs<'static> {
    /// A descriptor with fixed small geometry and a private
    /// buffer cache, for exercising code that does not go
    /// through super block validation.
    pub(crate) fn fake(dev: Dev, bshift: u32, fshift: u32) -> Fs<'static> {
        Fs {
            dev,
            cache: Box::leak(Box::new(BioCache::new())),
            sblkno: 16,
            cblkno: 24,
            iblkno: 32,
            dblkno: 40,
            cgoffset: 0,
            cgmask: !0,
            ncg: 1,
            bshift,
            fshift,
            inopb: (1 << bshift) / inode::INODE_SIZE as u32,
            cgsize: 4096,
            ipg: 32,
            fpg: 1024,
            stat: Cs { ndir: 0, nbfree: 0, nifree: 0, nffree: 0 },
        }
    }
}

/// The file type carried in an inode mode word or a directory
/// entry.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum FileType {
    Unused,
    Fifo,
    Char,
    Dir,
    Block,
    Regular,
    SymLink,
    Sock,
    Whiteout,
}

impl FileType {
    /// Maps a directory-entry type code; unrecognized codes fall
    /// back to `Unused`.
    pub fn from_dt(raw: u8) -> FileType {
        match raw {
            DT_FIFO => FileType::Fifo,
            DT_CHR => FileType::Char,
            DT_DIR => FileType::Dir,
            DT_BLK => FileType::Block,
            DT_REG => FileType::Regular,
            DT_LNK => FileType::SymLink,
            DT_SOCK => FileType::Sock,
            DT_WHT => FileType::Whiteout,
            _ => FileType::Unused,
        }
    }

    pub fn dt(self) -> u8 {
        match self {
            FileType::Unused => DT_UNKNOWN,
            FileType::Fifo => DT_FIFO,
            FileType::Char => DT_CHR,
            FileType::Dir => DT_DIR,
            FileType::Block => DT_BLK,
            FileType::Regular => DT_REG,
            FileType::SymLink => DT_LNK,
            FileType::Sock => DT_SOCK,
            FileType::Whiteout => DT_WHT,
        }
    }

    /// Returns a single character that represents the file type,
    /// such as 'd' for directories, or '-' for regular files.
    /// These are mostly the characters one would see in the
    /// output of `ls -l`.
    pub fn as_char(self) -> char {
        match self {
            FileType::Unused => '0',
            FileType::Fifo => 'f',
            FileType::Char => 'c',
            FileType::Dir => 'd',
            FileType::Block => 'b',
            FileType::Regular => '-',
            FileType::SymLink => 'l',
            FileType::Sock => 's',
            FileType::Whiteout => 'w',
        }
    }
}

bitstruct! {
    /// The parsed representation of the mode field from an
    /// inode.  Note that each permission bit is broken out into
    /// a separate field.
    #[derive(Clone, Copy)]
    pub struct Mode(u16) {
        ox: bool = 0;
        ow: bool = 1;
        or: bool = 2;
        gx: bool = 3;
        gw: bool = 4;
        gr: bool = 5;
        ux: bool = 6;
        uw: bool = 7;
        ur: bool = 8;
        sticky: bool = 9;
        sgid: bool = 10;
        suid: bool = 11;
        typ: FileType = 12..=15;
    }
}

impl Mode {
    /// Wraps a raw on-disk mode word.
    pub fn new(raw: u16) -> Mode {
        Mode(raw)
    }
}

impl bitstruct::FromRaw<u8, FileType> for Mode {
    fn from_raw(raw: u8) -> FileType {
        FileType::from_dt(raw)
    }
}

impl bitstruct::IntoRaw<u8, FileType> for Mode {
    fn into_raw(bits: FileType) -> u8 {
        bits.dt()
    }
}

// The "Debug" output for a mode is meant to closely resemble
// the first field in the output of `ls -l`.
impl fmt::Debug for Mode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        fn alt(b: bool, t: char, f: char) -> char {
            if b { t } else { f }
        }
        f.write_char(self.typ().as_char())?;
        f.write_char(alt(self.ur(), 'r', '-'))?;
        f.write_char(alt(self.uw(), 'w', '-'))?;
        if !self.suid() {
            f.write_char(alt(self.ux(), 'x', '-'))?;
        } else {
            f.write_char(alt(self.ux(), 's', 'S'))?;
        }

        f.write_char(alt(self.gr(), 'r', '-'))?;
        f.write_char(alt(self.gw(), 'w', '-'))?;
        if !self.sgid() {
            f.write_char(alt(self.gx(), 'x', '-'))?;
        } else {
            f.write_char(alt(self.gx(), 's', 'S'))?;
        }

        f.write_char(alt(self.or(), 'r', '-'))?;
        f.write_char(alt(self.ow(), 'w', '-'))?;
        if !self.sticky() {
            f.write_char(alt(self.ox(), 'x', '-'))?;
        } else {
            f.write_char(alt(self.ox(), 't', 'T'))?;
        }
        Ok(())
    }
}

pub mod cg;
pub mod dir;
pub mod inode;

pub use cg::{Cg, CylGroup};
pub use dir::{Directory, Dirent};
pub use inode::{DInode, major, makedev, minor};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_renders_in_ls_style() {
        assert_eq!(format!("{:?}", Mode(0o100644)), "-rw-r--r--");
        assert_eq!(format!("{:?}", Mode(0o040755)), "drwxr-xr-x");
        assert_eq!(format!("{:?}", Mode(0o104755)), "-rwsr-xr-x");
        assert_eq!(format!("{:?}", Mode(0o041777)), "drwxrwxrwt");
        assert_eq!(format!("{:?}", Mode(0o020620)), "crw--w----");
        assert_eq!(format!("{:?}", Mode(0o120777)), "lrwxrwxrwx");
    }

    #[test]
    fn setid_without_exec_capitalizes() {
        assert_eq!(format!("{:?}", Mode(0o104644)), "-rwSr--r--");
        assert_eq!(format!("{:?}", Mode(0o041666)), "drw-rw-rwT");
    }

    #[test]
    fn type_char_table() {
        let map = [
            (DT_UNKNOWN, '0'),
            (DT_FIFO, 'f'),
            (DT_CHR, 'c'),
            (DT_DIR, 'd'),
            (DT_BLK, 'b'),
            (DT_REG, '-'),
            (DT_LNK, 'l'),
            (DT_SOCK, 's'),
            (DT_WHT, 'w'),
        ];
        for (dt, ch) in map {
            assert_eq!(FileType::from_dt(dt).as_char(), ch);
            assert_eq!(FileType::from_dt(dt).dt(), dt);
        }
        assert_eq!(FileType::from_dt(3), FileType::Unused);
        assert_eq!(FileType::from_dt(255), FileType::Unused);
    }
}
