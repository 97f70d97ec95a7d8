// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `ufs1-test`: dumps the structure of a UFS1 image.
//!
//! Walks the super block, every cylinder group and every
//! allocated inode, decoding directory payloads along the way.
//! All output goes to stderr; the exit code is 0 only when the
//! whole enumeration succeeded.

use std::env;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::process::ExitCode;

use ufs1::ufs::{self, Cg, Cs, DInode, Directory, FileType, Fs};

fn show_stat(cs: &Cs) {
    eprintln!("I:     directories = {}", cs.ndir);
    eprintln!("I:     free blocks = {}", cs.nbfree);
    eprintln!("I:     free inodes = {}", cs.nifree);
    eprintln!("I:     free frags  = {}", cs.nffree);
}

fn show_sb(fs: &Fs) {
    eprintln!("N: Valid UFS1 super block found");
    eprintln!("I:     block size  = {}", fs.bsize());
    eprintln!("I:     frag size   = {}", fs.fsize());
    show_stat(fs.stat());
}

/// Renders the tail of an inode line: the embedded target of a
/// short symlink, the device numbers of a special file, or the
/// populated direct block list.
fn show_blocks(fs: &Fs, o: &DInode) {
    if matches!(o.file_type(), FileType::Char | FileType::Block) {
        let rdev = o.rdev();
        eprint!(" dev {}/{}", ufs::major(rdev), ufs::minor(rdev));
        return;
    }

    if o.size == 0 {
        return;
    }

    if o.file_type() == FileType::SymLink
        && o.size < ufs::EMBEDDED_SIZE as u64
        && o.content()[o.size as usize] == 0
    {
        let target = &o.content()[..o.size as usize];
        eprint!(" -> {}", String::from_utf8_lossy(target));
        return;
    }

    let count = usize::min(
        ufs::inode::NDADDR,
        o.size.div_ceil(fs.bsize() as u64) as usize,
    );
    eprint!(" at {}", o.db(0));
    for i in 1..count {
        eprint!(", {}", o.db(i));
    }
}

fn show_dir(fs: &Fs, o: &DInode) {
    let dir = Directory::new(fs, o);
    for entry in dir.iter() {
        if entry.ino != 0 && entry.namlen > 0 {
            eprintln!(
                "I:          {:2}: {}",
                entry.ino,
                String::from_utf8_lossy(entry.name())
            );
        }
    }
}

fn show_inode(fs: &Fs, cg: &Cg<'_>, n: u32, o: &DInode) {
    eprint!("I:     {:2}: {:?}", cg.ino(n), o.mode());
    eprint!(
        " {:3} {:4} {:4} {:8}, {:3} sectors",
        o.nlink, o.uid, o.gid, o.size, o.blocks
    );
    show_blocks(fs, o);
    eprintln!();

    if o.file_type() == FileType::Dir {
        show_dir(fs, o);
    }
}

fn show_cg(fs: &Fs, cg: &Cg<'_>) -> bool {
    let mut ok = true;

    eprintln!("N: Valid UFS1 cylinder group {} found", cg.cgx());
    show_stat(cg.stat());

    eprintln!("I: List of i-nodes:");
    for n in 0..cg.ipg() {
        if !cg.is_inode_used(n) {
            continue;
        }
        match cg.inode(n) {
            Ok(o) => show_inode(fs, cg, n, &o),
            Err(_) => {
                eprintln!("E: Cannot read inode {}", cg.ino(n));
                ok = false;
            }
        }
    }

    ok
}

fn show_fs(fs: &Fs) -> bool {
    let mut ok = true;

    show_sb(fs);

    for cgx in 0..fs.ncg() {
        match Cg::new(fs, cgx) {
            Ok(cg) => ok &= show_cg(fs, &cg),
            Err(e) => {
                eprintln!("E: Cannot find valid UFS1 cylinder group {cgx} ({e})");
                ok = false;
            }
        }
    }

    ok
}

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<_> = env::args_os().collect();
    if args.len() != 2 {
        eprintln!("usage:\n\tufs1-test <ufs1-image>");
        return ExitCode::FAILURE;
    }

    let image = match File::open(&args[1]) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("{}: {e}", args[1].to_string_lossy());
            return ExitCode::FAILURE;
        }
    };

    let fs = match Fs::new(image.as_raw_fd()) {
        Ok(fs) => fs,
        Err(e) => {
            eprintln!("E: Cannot find valid UFS1 super block ({e})");
            return ExitCode::FAILURE;
        }
    };

    if show_fs(&fs) { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}
