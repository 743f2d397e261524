// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::fs::Metadata;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{FileAttr, FileType};

#[cfg(test)]
#[path = "./attr_test.rs"]
mod attr_test;

// reported when the host gives no preferred block size
const BLOCK_SIZE: u32 = 512;

/// Fetch the attributes of a backing path for the given inode.
///
/// Symlinks are followed, but a dangling link still reports
/// the attributes of the link itself.
pub fn attributes_of(ino: u64, path: &Path) -> std::io::Result<FileAttr> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => std::fs::symlink_metadata(path)?,
        Err(err) => return Err(err),
    };
    Ok(attr_from_metadata(ino, &metadata))
}

/// Convert host metadata into the attribute record used by the kernel.
pub fn attr_from_metadata(ino: u64, metadata: &Metadata) -> FileAttr {
    let now = SystemTime::now();
    let mtime = metadata.modified().unwrap_or(now);
    let blksize = match metadata.blksize() {
        0 => BLOCK_SIZE,
        size => u32::try_from(size).unwrap_or(BLOCK_SIZE),
    };
    FileAttr {
        ino,
        size: metadata.len(),
        blocks: metadata.blocks(),
        atime: metadata.accessed().unwrap_or(mtime),
        mtime,
        ctime: system_time(metadata.ctime(), metadata.ctime_nsec()).unwrap_or(now),
        // not every host records a creation time, and there is
        // no better answer than now when it is missing
        crtime: metadata.created().unwrap_or(now),
        kind: file_type(metadata.file_type()),
        perm: (metadata.mode() & 0o7777) as u16,
        nlink: u32::try_from(metadata.nlink()).unwrap_or(u32::MAX).max(1),
        uid: metadata.uid(),
        gid: metadata.gid(),
        rdev: metadata.rdev() as u32,
        blksize,
        flags: 0,
    }
}

/// Classify a host file type into its kernel protocol counterpart.
pub fn file_type(kind: std::fs::FileType) -> FileType {
    if kind.is_dir() {
        FileType::Directory
    } else if kind.is_symlink() {
        FileType::Symlink
    } else if kind.is_fifo() {
        FileType::NamedPipe
    } else if kind.is_char_device() {
        FileType::CharDevice
    } else if kind.is_block_device() {
        FileType::BlockDevice
    } else if kind.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

fn system_time(secs: i64, nsecs: i64) -> Option<SystemTime> {
    let nsecs = Duration::from_nanos(u64::try_from(nsecs).ok()?);
    if secs >= 0 {
        UNIX_EPOCH.checked_add(Duration::from_secs(secs as u64) + nsecs)
    } else {
        UNIX_EPOCH
            .checked_sub(Duration::from_secs(secs.unsigned_abs()))?
            .checked_add(nsecs)
    }
}
