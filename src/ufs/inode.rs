// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-disk inodes and the block map.
//!
//! The 128-byte inode overlays 60 bytes between three readings:
//! the direct/indirect block pointer arrays, the device number
//! of a character or block special file, and the embedded target
//! of a short symbolic link.  Which reading applies follows from
//! the file type in the mode word.

use static_assertions::const_assert_eq;

use crate::result::Result;

use super::{EMBEDDED_SIZE, FileType, Fs, Mode};

/// Size of the on-disk inode record, in bytes.
pub const INODE_SIZE: usize = 128;

/// Number of direct block addresses in the inode.
pub const NDADDR: usize = 12;

/// Number of indirect block addresses in the inode.
/// Note that each entry represents another level of indirection,
/// so that the first is singly-indirect, the second is
/// doubly-indirect, and the third is triply-indirect.
pub const NIADDR: usize = 3;

/// The Root Inode Number
///
/// Inode numbers are origin 1; 0 is the "unused" indicator.
/// The first inode (1) historically held bad blocks.  Thus, the
/// root is at 2.
pub const ROOT_INODE: u32 = 2;

const_assert_eq!(EMBEDDED_SIZE, (NDADDR + NIADDR) * core::mem::size_of::<i32>());

/// The storage-resident version of an inode, format version 2.
///
/// Introduced in 4.4BSD, recognized by `inodefmt = 2` together
/// with `maxembedded = 60` in the super block.  The user and
/// group identifiers moved to the tail to become 32 bits wide;
/// FreeBSD later reused the old id slots for the soft-update
/// journal free list and the NFSv4 mode revision.
#[derive(Clone, Debug, bincode::Decode, bincode::Encode)]
pub struct DInode {
    pub mode: u16,                 // File type and permissions
    pub nlink: u16,                // File name count
    pub freelink: u32,             // SUJ: next unlinked inode
    pub size: u64,                 // File size in bytes
    pub atime: u32,                // Last access time
    pub atime_ns: u32,
    pub mtime: u32,                // Last modified time
    pub mtime_ns: u32,
    pub ctime: u32,                // Last inode change time
    pub ctime_ns: u32,
    data: [u8; EMBEDDED_SIZE],     // Block pointers, rdev or link target
    pub flags: u32,                // Status flags
    pub blocks: u32,               // Allocated 512-byte sectors
    pub generation: u32,           // NFS: generation number
    pub uid: u32,
    pub gid: u32,
    pub modrev: u64,               // NFSv4: mode revision
}

impl DInode {
    /// The parsed mode word.
    pub fn mode(&self) -> Mode {
        Mode::new(self.mode)
    }

    pub fn file_type(&self) -> FileType {
        self.mode().typ()
    }

    /// The `i`th direct block pointer, as a fragment number.
    pub fn db(&self, i: usize) -> i32 {
        assert!(i < NDADDR);
        let at = i * 4;
        i32::from_le_bytes([
            self.data[at],
            self.data[at + 1],
            self.data[at + 2],
            self.data[at + 3],
        ])
    }

    /// The indirect block pointer for indirection `level`: 0 is
    /// singly-, 1 doubly-, 2 triply-indirect.
    pub fn ib(&self, level: usize) -> i32 {
        assert!(level < NIADDR);
        let at = NDADDR * 4 + level * 4;
        i32::from_le_bytes([
            self.data[at],
            self.data[at + 1],
            self.data[at + 2],
            self.data[at + 3],
        ])
    }

    /// The packed device number of a character or block special
    /// file.
    pub fn rdev(&self) -> u32 {
        u32::from_le_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
    }

    /// The embedded data area; for a symbolic link shorter than
    /// [`EMBEDDED_SIZE`] this holds the NUL-terminated target.
    pub fn content(&self) -> &[u8; EMBEDDED_SIZE] {
        &self.data
    }

    /// Translates the logical block index `i` of this file into
    /// the physical fragment number of that block, chasing the
    /// single-, double- and triple-indirect trees as needed.
    /// Holes at any level come back as 0, as does an index
    /// beyond the triple-indirect span.
    pub fn block(&self, fs: &Fs, i: u64) -> Result<i32> {
        if self.size == 0 {
            return Ok(0);
        }
        if i < NDADDR as u64 {
            return Ok(self.db(i as usize));
        }

        // Each indirect block holds `1 << order` 4-byte pointers.
        let order = fs.bshift() - 2;
        let mut i = i - NDADDR as u64;
        let mut depth = 0;
        let mut span = 1u64 << order;
        while depth < NIADDR {
            if i < span {
                break;
            }
            i -= span;
            span = span.checked_shl(order).unwrap_or(u64::MAX);
            depth += 1;
        }
        if depth == NIADDR {
            return Ok(0);
        }

        let mask = (1u64 << order) - 1;
        let mut frag = self.ib(depth);
        for level in (0..=depth).rev() {
            if frag <= 0 {
                return Ok(0);
            }
            let at = ((i >> (order * level as u32)) & mask) as usize;
            frag = block_map(fs, frag, order, at)?;
        }
        Ok(frag)
    }
}

/// Pulls the pointer at index `at` of the indirect block located
/// at fragment `frag`.  The block comes through the buffer
/// cache, so walking adjacent logical blocks does not re-read it
/// from the device.
fn block_map(fs: &Fs, frag: i32, order: u32, at: usize) -> Result<i32> {
    let pos = (frag as u64) << fs.fshift();
    let raw = fs.pull(pos, 4 << order)?;
    let at = at * 4;
    Ok(i32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]))
}

/// Extracts the major number of a packed device number.
pub fn major(rdev: u32) -> u32 {
    (rdev >> 8) & 0xff
}

/// Extracts the minor number of a packed device number.
pub fn minor(rdev: u32) -> u32 {
    (rdev & 0xff) | ((rdev >> 8) & 0xffff00)
}

/// Packs a device number.
pub fn makedev(major: u32, minor: u32) -> u32 {
    (major << 8) | (minor & 0xff) | ((minor & 0xffff00) << 8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev;
    use crate::ufs::decode;
    use std::os::fd::AsRawFd;

    fn dinode(mode: u16, size: u64, db: &[i32], ib: &[i32; NIADDR]) -> DInode {
        let mut raw = [0u8; INODE_SIZE];
        raw[0..2].copy_from_slice(&mode.to_le_bytes());
        raw[8..16].copy_from_slice(&size.to_le_bytes());
        for (i, b) in db.iter().enumerate() {
            raw[40 + 4 * i..44 + 4 * i].copy_from_slice(&b.to_le_bytes());
        }
        for (l, b) in ib.iter().enumerate() {
            raw[88 + 4 * l..92 + 4 * l].copy_from_slice(&b.to_le_bytes());
        }
        decode(&raw).expect("inode record")
    }

    #[test]
    fn overlay_accessors_agree_with_the_layout() {
        let o = dinode(0o100644, 42, &[7, 8, 9], &[100, 200, 300]);
        assert_eq!(o.mode, 0o100644);
        assert_eq!(o.size, 42);
        assert_eq!(o.db(0), 7);
        assert_eq!(o.db(2), 9);
        assert_eq!(o.db(3), 0);
        assert_eq!(o.ib(0), 100);
        assert_eq!(o.ib(2), 300);
        assert_eq!(o.rdev(), 7); // shares the first pointer slot
        assert_eq!(o.file_type(), FileType::Regular);
    }

    #[test]
    fn device_number_packing_round_trips() {
        for (maj, min) in [(0, 0), (5, 1), (0xab, 0xcdef12)] {
            let rdev = makedev(maj, min);
            assert_eq!(major(rdev), maj);
            assert_eq!(minor(rdev), min);
        }
        assert_eq!(makedev(5, 1), 0x501);
    }

    #[test]
    fn empty_file_maps_everything_to_zero() {
        let fs = Fs::fake(-1, 12, 9);
        let o = dinode(0o100644, 0, &[123; NDADDR], &[456, 789, 1011]);
        for i in [0, 5, 12, 1 << 40] {
            assert_eq!(o.block(&fs, i), Ok(0));
        }
    }

    #[test]
    fn direct_blocks_come_straight_from_the_inode() {
        let fs = Fs::fake(-1, 12, 9);
        let o = dinode(0o100644, 3 << 12, &[100, 101, 102], &[0; NIADDR]);
        assert_eq!(o.block(&fs, 0), Ok(100));
        assert_eq!(o.block(&fs, 1), Ok(101));
        assert_eq!(o.block(&fs, 2), Ok(102));
        assert_eq!(o.block(&fs, 3), Ok(0));
    }

    #[test]
    fn single_indirect_hole_short_circuits() {
        let fs = Fs::fake(-1, 12, 9);
        let o = dinode(0o100644, 64 << 12, &[1; NDADDR], &[0, 0, 0]);
        assert_eq!(o.block(&fs, 12), Ok(0));
    }

    #[test]
    fn beyond_triple_indirect_is_zero() {
        let fs = Fs::fake(-1, 12, 9);
        let o = dinode(0o100644, u64::MAX, &[1; NDADDR], &[2, 3, 4]);
        let count = 1u64 << 10;
        let out = NDADDR as u64 + count + count * count + count * count * count;
        assert_eq!(o.block(&fs, out), Ok(0));
        assert_eq!(o.block(&fs, u64::MAX), Ok(0));
    }

    #[test]
    fn single_indirect_walks_the_pointer_block() {
        let f = tempfile::tempfile().expect("tempfile");
        f.set_len(200 * 512 + 4096).expect("extend");
        let dev = f.as_raw_fd();
        // The indirect block lives at fragment 200; its first
        // entries point at fragments 300 and 301.
        dev::pwrite(dev, &300i32.to_le_bytes(), 200 * 512).expect("pwrite");
        dev::pwrite(dev, &301i32.to_le_bytes(), 200 * 512 + 4).expect("pwrite");

        let fs = Fs::fake(dev, 12, 9);
        let o = dinode(0o100644, 16 << 12, &[1; NDADDR], &[200, 0, 0]);
        assert_eq!(o.block(&fs, 12), Ok(300));
        assert_eq!(o.block(&fs, 13), Ok(301));
        assert_eq!(o.block(&fs, 14), Ok(0));
    }

    #[test]
    fn double_indirect_walks_two_levels() {
        let f = tempfile::tempfile().expect("tempfile");
        f.set_len(500 * 512 + 4096).expect("extend");
        let dev = f.as_raw_fd();
        // First level at fragment 400 points at 500; the second
        // level's sixth entry points at 77.
        dev::pwrite(dev, &500i32.to_le_bytes(), 400 * 512).expect("pwrite");
        dev::pwrite(dev, &77i32.to_le_bytes(), 500 * 512 + 5 * 4).expect("pwrite");

        let fs = Fs::fake(dev, 12, 9);
        let o = dinode(0o100644, 1 << 30, &[1; NDADDR], &[0, 400, 0]);
        let i = NDADDR as u64 + 1024 + 5;
        assert_eq!(o.block(&fs, i), Ok(77));
    }

    #[test]
    fn failed_pointer_pull_is_an_error() {
        let f = tempfile::tempfile().expect("tempfile");
        let dev = f.as_raw_fd();
        let fs = Fs::fake(dev, 12, 9);
        let o = dinode(0o100644, 16 << 12, &[1; NDADDR], &[999, 0, 0]);
        assert!(o.block(&fs, 12).is_err());
    }

    #[test]
    fn embedded_symlink_content() {
        let mut raw = [0u8; INODE_SIZE];
        raw[0..2].copy_from_slice(&0o120777u16.to_le_bytes());
        raw[8..16].copy_from_slice(&11u64.to_le_bytes());
        raw[40..51].copy_from_slice(b"/etc/passwd");
        let o: DInode = decode(&raw).expect("inode record");
        assert_eq!(o.file_type(), FileType::SymLink);
        assert_eq!(&o.content()[..11], b"/etc/passwd");
        assert_eq!(o.content()[11], 0);
    }
}
