// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::ffi::OsStr;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use fuser::FileAttr;

use crate::attr::attributes_of;
use crate::dir::{fill, list_children, slice_from, DirectorySink};
use crate::node_kind::NodeKind;
use crate::table::InodeTable;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./bridge_test.rs"]
mod bridge_test;

/// Capacity and usage figures for the backing filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub block_size: u32,
    pub name_max: u32,
    pub fragment_size: u32,
}

/// Serves each filesystem operation against the backing directory.
///
/// Every operation translates inode numbers into backing paths through
/// the shared [`InodeTable`], performs the host call and reports failures
/// as an [`Error`] whose errno is what the kernel should see.
#[derive(Debug)]
pub struct Bridge {
    table: InodeTable,
    read_only: bool,
}

impl Bridge {
    /// Mirror the given source directory.
    pub fn new(source: impl Into<PathBuf>, read_only: bool) -> Self {
        Self {
            table: InodeTable::new(source),
            read_only,
        }
    }

    pub fn table(&self) -> &InodeTable {
        &self.table
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Resolve a name in a directory, counting it as a kernel lookup.
    pub fn lookup(&self, parent: u64, name: &OsStr) -> Result<FileAttr> {
        let node = self.table.resolve_or_allocate(parent, name, true)?;
        let path = node.path();
        match attributes_of(node.ino(), &path) {
            Ok(attr) => Ok(attr),
            Err(err) => {
                // the kernel never forgets a lookup that failed
                self.table.forget(node.ino(), 1);
                Err(Error::io(path.as_path(), err))
            }
        }
    }

    pub fn forget(&self, ino: u64, nlookup: u64) {
        self.table.forget(ino, nlookup);
    }

    pub fn getattr(&self, ino: u64) -> Result<FileAttr> {
        let node = self.table.require(ino)?;
        let path = node.path();
        attributes_of(ino, &path).map_err(|err| Error::io(path.as_path(), err))
    }

    /// Directories can always be opened, there is no access check.
    pub fn opendir(&self, ino: u64) -> Result<()> {
        self.table.require(ino).map(|_| ())
    }

    /// List a directory from `offset` into the sink, returning how
    /// many entries were written.
    pub fn readdir<S>(&self, ino: u64, offset: i64, sink: &mut S) -> Result<usize>
    where
        S: DirectorySink + ?Sized,
    {
        let node = self.table.require(ino)?;
        let entries = list_children(&self.table, &node)?;
        let remaining = slice_from(&entries, offset)?;
        let written = fill(remaining, sink);
        tracing::trace!(
            "readdir {node} @{offset} = {written}/{}",
            remaining.len()
        );
        Ok(written)
    }

    /// Files can always be opened for reading, there is no access check.
    pub fn open(&self, ino: u64, flags: i32) -> Result<()> {
        self.table.require(ino)?;
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            self.ensure_writable()?;
        }
        Ok(())
    }

    /// Read up to `size` bytes of a file starting at `offset`.
    ///
    /// Reading at the very end of the file gives no data, but
    /// starting beyond it is an error.
    pub fn read(&self, ino: u64, offset: i64, size: u32) -> Result<Vec<u8>> {
        let node = self.table.require(ino)?;
        let path = node.path();
        let file =
            std::fs::File::open(path.as_path()).map_err(|err| Error::io(path.as_path(), err))?;
        let len = file
            .metadata()
            .map_err(|err| Error::io(path.as_path(), err))?
            .len();

        let start = match u64::try_from(offset) {
            Ok(start) if start <= len => start,
            _ => {
                return Err(Error::OffsetOutOfRange {
                    offset: offset as u64,
                    len,
                })
            }
        };

        let wanted = (len - start).min(size as u64) as usize;
        let mut buf = vec![0; wanted];
        let mut consumed = 0;
        while consumed < wanted {
            let count = file
                .read_at(&mut buf[consumed..], start + consumed as u64)
                .map_err(|err| Error::io(path.as_path(), err))?;
            if count == 0 {
                // the file was truncated while we were reading it
                break;
            }
            consumed += count;
        }
        buf.truncate(consumed);
        tracing::trace!("read {node} @{offset} = {consumed}/{size}");
        Ok(buf)
    }

    /// Move an entry in the backing store, carrying its inodes along.
    pub fn rename(
        &self,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
        flags: u32,
    ) -> Result<()> {
        if flags != 0 {
            // exchange and no-replace are not offered
            return Err(Error::Unsupported("rename with flags"));
        }
        self.ensure_writable()?;
        let from = self.table.child_path(parent, name)?;
        let to = self.table.child_path(new_parent, new_name)?;
        std::fs::rename(&from, &to).map_err(|err| Error::host("rename", &from, err))?;
        match std::fs::symlink_metadata(&from) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.table.rename(&from, &to);
            }
            // the host does nothing when both names are links to the
            // same file, and both entries keep their inodes
            _ => {
                tracing::debug!("{} still exists after rename", from.display());
                return Ok(());
            }
        }
        tracing::debug!("renamed {} to {}", from.display(), to.display());
        Ok(())
    }

    /// Remove a non-directory entry, evicting its inode.
    pub fn unlink(&self, parent: u64, name: &OsStr) -> Result<()> {
        self.ensure_writable()?;
        let node = self.table.resolve_or_allocate(parent, name, false)?;
        let path = node.path();
        std::fs::remove_file(path.as_path())
            .map_err(|err| Error::host("unlink", path.as_path(), err))?;
        self.table.remove(node.ino());
        tracing::debug!("unlinked {node}");
        Ok(())
    }

    /// Create a named pipe or device node, counting the new entry
    /// as a kernel lookup.
    pub fn mknod(&self, parent: u64, name: &OsStr, mode: u32) -> Result<FileAttr> {
        self.ensure_writable()?;
        let path = self.table.child_path(parent, name)?;
        let parent_path = self.table.require(parent)?.path();
        let kind = NodeKind::from_request(mode, &parent_path)?;
        kind.create(&path)?;
        tracing::debug!("created {kind:?} at {}", path.display());
        self.lookup(parent, name)
    }

    /// Capacity of the filesystem holding the backing directory.
    pub fn statfs(&self) -> Result<FsStats> {
        let root = self.table.root().path();
        let stats = nix::sys::statvfs::statvfs(root.as_path()).map_err(|errno| {
            Error::host("statfs", root.as_path(), std::io::Error::from(errno))
        })?;
        Ok(FsStats {
            blocks: stats.blocks() as u64,
            blocks_free: stats.blocks_free() as u64,
            blocks_available: stats.blocks_available() as u64,
            files: stats.files() as u64,
            files_free: stats.files_free() as u64,
            block_size: stats.block_size() as u32,
            name_max: stats.name_max() as u32,
            fragment_size: stats.fragment_size() as u32,
        })
    }
}
