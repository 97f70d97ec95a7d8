// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::fmt;

/// Various errors
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd)]
pub enum Error {
    DevRead,
    DevWrite,
    IoSubmit,
    IoJoin,
    IoFault,
    Decode,
    SbRead,
    SbMagic,
    SbLayout,
    SbConfig,
    SbInodeFormat,
    CgRead,
    CgMagic,
    CgConfig,
    CgLayout,
}

impl Error {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DevRead => "Short or failed device read",
            Self::DevWrite => "Short or failed device write",
            Self::IoSubmit => "Cannot submit I/O request",
            Self::IoJoin => "No I/O request in flight",
            Self::IoFault => "I/O transfer failed",
            Self::Decode => "Truncated on-disk record",
            Self::SbRead => "Cannot read super block",
            Self::SbMagic => "Cannot find valid super block magic",
            Self::SbLayout => "Invalid file system layout",
            Self::SbConfig => "Invalid file system configuration",
            Self::SbInodeFormat => "Unknown i-node format",
            Self::CgRead => "Cannot read cylinder group",
            Self::CgMagic => "Cannot find valid cylinder group magic",
            Self::CgConfig => "Invalid cylinder group configuration",
            Self::CgLayout => "Invalid cylinder group layout",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> core::result::Result<(), fmt::Error> {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for Error {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> core::result::Result<(), fmt::Error> {
        write!(f, "{}", self.as_str())
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;
