// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::ffi::OsString;

use fuser::FileType;

use crate::attr::file_type;
use crate::table::{InodeTable, Node};
use crate::{Error, Result};

#[cfg(test)]
#[path = "./dir_test.rs"]
mod dir_test;

/// One child of a directory, as reported to the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    /// The offset that resumes the listing right after this entry
    pub offset: i64,
    pub ino: u64,
    pub name: OsString,
    pub kind: FileType,
}

/// A destination for directory entries with limited room.
pub trait DirectorySink {
    /// Add an entry, returning true if there was no room left for it.
    fn push(&mut self, entry: &ListingEntry) -> bool;
}

impl DirectorySink for fuser::ReplyDirectory {
    fn push(&mut self, entry: &ListingEntry) -> bool {
        self.add(entry.ino, entry.offset, entry.kind, &entry.name)
    }
}

/// List the children of a directory node, resolving each through the table.
///
/// Children are sorted by name so that offsets stay meaningful between
/// calls as long as the directory does not change in the meantime. Inodes
/// handed out here are not counted as kernel lookups.
pub fn list_children(table: &InodeTable, node: &Node) -> Result<Vec<ListingEntry>> {
    let path = node.path();
    let read_dir =
        std::fs::read_dir(path.as_path()).map_err(|err| Error::io(path.as_path(), err))?;

    let mut children = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|err| Error::io(path.as_path(), err))?;
        let kind = entry
            .file_type()
            .map_err(|err| Error::io(entry.path(), err))?;
        children.push((entry.file_name(), file_type(kind)));
    }
    children.sort_by(|a, b| a.0.cmp(&b.0));

    let mut entries = Vec::with_capacity(children.len());
    for (name, kind) in children {
        let child = match table.resolve_or_allocate(node.ino(), &name, false) {
            Ok(child) => child,
            // removed since the directory was read
            Err(Error::NoEntry { .. }) => continue,
            Err(err) => return Err(err),
        };
        entries.push(ListingEntry {
            offset: entries.len() as i64 + 1,
            ino: child.ino(),
            name,
            kind,
        });
    }
    Ok(entries)
}

/// The remainder of a listing starting at a zero-based offset.
///
/// An offset equal to the length gives an empty slice, anything past
/// that is an error.
pub fn slice_from(entries: &[ListingEntry], offset: i64) -> Result<&[ListingEntry]> {
    let len = entries.len() as u64;
    match usize::try_from(offset) {
        Ok(start) if start <= entries.len() => Ok(&entries[start..]),
        _ => Err(Error::OffsetOutOfRange {
            offset: offset as u64,
            len,
        }),
    }
}

/// Write entries into the sink until it is full, returning how many fit.
pub fn fill<S: DirectorySink + ?Sized>(entries: &[ListingEntry], sink: &mut S) -> usize {
    let mut written = 0;
    for entry in entries {
        if sink.push(entry) {
            break;
        }
        written += 1;
    }
    written
}
