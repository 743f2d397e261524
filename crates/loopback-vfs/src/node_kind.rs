// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::Path;

use nix::sys::stat::{Mode, SFlag};

use crate::{Error, Result};

#[cfg(test)]
#[path = "./node_kind_test.rs"]
mod node_kind_test;

/// The kinds of special files that can be requested through mknod
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Fifo { perm: Mode },
    CharDevice { perm: Mode, major: u64, minor: u64 },
    BlockDevice { perm: Mode, major: u64, minor: u64 },
    /// Sockets are recognized, but cannot be created
    Socket,
}

impl NodeKind {
    /// Decode the node requested by a mknod `mode` under the given parent.
    ///
    /// Devices take their major and minor numbers from the parent
    /// directory's own device metadata.
    pub fn from_request(mode: u32, parent: &Path) -> Result<Self> {
        let perm = host_mode(mode);
        let kind = SFlag::from_bits_truncate(mode as libc::mode_t & SFlag::S_IFMT.bits());
        if kind == SFlag::S_IFIFO {
            Ok(Self::Fifo { perm })
        } else if kind == SFlag::S_IFCHR || kind == SFlag::S_IFBLK {
            let stat = nix::sys::stat::stat(parent)
                .map_err(|errno| Error::io(parent, std::io::Error::from(errno)))?;
            let major = nix::sys::stat::major(stat.st_rdev);
            let minor = nix::sys::stat::minor(stat.st_rdev);
            if kind == SFlag::S_IFCHR {
                Ok(Self::CharDevice { perm, major, minor })
            } else {
                Ok(Self::BlockDevice { perm, major, minor })
            }
        } else if kind == SFlag::S_IFSOCK {
            Ok(Self::Socket)
        } else {
            Err(Error::Unsupported("mknod of this file type"))
        }
    }

    /// Create this node at the given path in the backing store.
    pub fn create(&self, path: &Path) -> Result<()> {
        let result = match *self {
            Self::Fifo { perm } => nix::unistd::mkfifo(path, perm),
            Self::CharDevice { perm, major, minor } => nix::sys::stat::mknod(
                path,
                SFlag::S_IFCHR,
                perm,
                nix::sys::stat::makedev(major, minor),
            ),
            Self::BlockDevice { perm, major, minor } => nix::sys::stat::mknod(
                path,
                SFlag::S_IFBLK,
                perm,
                nix::sys::stat::makedev(major, minor),
            ),
            Self::Socket => return Err(Error::Unsupported("mknod of a socket")),
        };
        result.map_err(|errno| Error::host("mknod", path, std::io::Error::from(errno)))
    }
}

/// Pack the permission bits of a mode into what the host's node creation
/// calls expect, keeping the set-user-ID, set-group-ID and sticky bits.
pub fn host_mode(mode: u32) -> Mode {
    let mode = mode as libc::mode_t;
    let mut perm = Mode::from_bits_truncate(mode & 0o777);
    if mode & libc::S_ISUID != 0 {
        perm |= Mode::S_ISUID;
    }
    if mode & libc::S_ISGID != 0 {
        perm |= Mode::S_ISGID;
    }
    if mode & libc::S_ISVTX != 0 {
        perm |= Mode::S_ISVTX;
    }
    perm
}
