// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::{Error, Result};

#[cfg(test)]
#[path = "./table_test.rs"]
mod table_test;

/// The inode number that the kernel uses for the root of the mount
pub const ROOT_INODE: u64 = fuser::FUSE_ROOT_ID;

/// One live mapping from an inode number to a path in the backing store
#[derive(Debug)]
pub struct Node {
    ino: u64,
    path: ArcSwap<PathBuf>,
    /// outstanding lookups that the kernel has not yet forgotten
    lookups: AtomicU64,
}

impl Node {
    fn new(ino: u64, path: PathBuf, lookups: u64) -> Self {
        Self {
            ino,
            path: ArcSwap::from_pointee(path),
            lookups: AtomicU64::new(lookups),
        }
    }

    /// The inode number of this node, which never changes
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// The current location of this node in the backing store
    pub fn path(&self) -> Arc<PathBuf> {
        self.path.load_full()
    }

    /// The number of lookups that are still held by the kernel
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Acquire)
    }

    fn acquire(&self) {
        self.lookups.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop `count` lookups, returning how many remain
    fn release(&self, count: u64) -> u64 {
        loop {
            let current = self.lookups.load(Ordering::Acquire);
            let remaining = current.saturating_sub(count);
            if self
                .lookups
                .compare_exchange_weak(current, remaining, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break remaining;
            }
        }
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.ino, self.path.load().display())
    }
}

/// Allocates inode numbers and maps them to and from backing paths.
///
/// Two indexes are kept in sync: inode to node, and path to inode. Every
/// change to the nodes of a path is made while holding that path's entry
/// in the path index, which is what makes concurrent first lookups of the
/// same name converge on a single inode. The path index is always locked
/// before the inode index, never the other way around.
#[derive(Debug)]
pub struct InodeTable {
    root: Arc<Node>,
    next_inode: AtomicU64,
    inodes: DashMap<u64, Arc<Node>>,
    paths: DashMap<PathBuf, u64>,
}

impl InodeTable {
    /// Create a table whose root inode maps to the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        // the root never goes away, so it starts with a lookup
        // that is never forgotten
        let node = Arc::new(Node::new(ROOT_INODE, root.clone(), 1));
        let table = Self {
            root: Arc::clone(&node),
            next_inode: AtomicU64::new(ROOT_INODE + 1),
            inodes: Default::default(),
            paths: Default::default(),
        };
        table.inodes.insert(ROOT_INODE, node);
        table.paths.insert(root, ROOT_INODE);
        table
    }

    /// The root node of the mount.
    pub fn root(&self) -> Arc<Node> {
        Arc::clone(&self.root)
    }

    /// The number of live nodes, including the root.
    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    /// True if only the root is present.
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    fn allocate_inode(&self) -> u64 {
        self.next_inode.fetch_add(1, Ordering::Relaxed)
    }

    fn allocate(&self, path: PathBuf, lookups: u64) -> Arc<Node> {
        let node = Arc::new(Node::new(self.allocate_inode(), path, lookups));
        self.inodes.insert(node.ino, Arc::clone(&node));
        tracing::trace!("allocated {node}");
        node
    }

    /// Find the node for an inode number, if it is still known.
    pub fn get(&self, ino: u64) -> Option<Arc<Node>> {
        self.inodes.get(&ino).map(|n| Arc::clone(n.value()))
    }

    /// Find the node for an inode number or fail with [`Error::UnknownInode`].
    pub fn require(&self, ino: u64) -> Result<Arc<Node>> {
        self.get(ino).ok_or(Error::UnknownInode(ino))
    }

    /// Resolve a name within a known parent directory.
    ///
    /// The entry must exist in the backing directory. If it was seen
    /// before, the existing node is returned, otherwise a new inode is
    /// allocated. When `counted` is set, the result is going back to the
    /// kernel as a new reference and the node's lookup count is bumped.
    pub fn resolve_or_allocate(
        &self,
        parent: u64,
        name: &OsStr,
        counted: bool,
    ) -> Result<Arc<Node>> {
        let path = self.child_path(parent, name)?;
        match std::fs::symlink_metadata(&path) {
            Ok(_) => (),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NoEntry {
                    parent: path.parent().map(Path::to_path_buf).unwrap_or_default(),
                    name: name.to_owned(),
                })
            }
            Err(err) => return Err(Error::io(path, err)),
        }
        Ok(self.load_or_store(path, counted))
    }

    /// The backing path for a name within a known parent directory.
    ///
    /// Names must be a single normal path component, so that nothing
    /// can be addressed outside of the parent.
    pub fn child_path(&self, parent: u64, name: &OsStr) -> Result<PathBuf> {
        let parent = self.require(parent)?;
        let parent_path = parent.path();
        if !is_single_component(name) {
            return Err(Error::NoEntry {
                parent: parent_path.to_path_buf(),
                name: name.to_owned(),
            });
        }
        Ok(parent_path.join(name))
    }

    fn load_or_store(&self, path: PathBuf, counted: bool) -> Arc<Node> {
        let initial = if counted { 1 } else { 0 };
        match self.paths.entry(path) {
            Entry::Occupied(mut entry) => {
                if let Some(node) = self.get(*entry.get()) {
                    if counted {
                        node.acquire();
                    }
                    return node;
                }
                // the index outlived its node, which can only happen
                // when a forget raced with a rename
                let node = self.allocate(entry.key().clone(), initial);
                entry.insert(node.ino);
                node
            }
            Entry::Vacant(entry) => {
                let node = self.allocate(entry.key().clone(), initial);
                entry.insert(node.ino);
                node
            }
        }
    }

    /// Release lookups held by the kernel, evicting the node once none remain.
    ///
    /// Unknown inodes and the root are ignored.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INODE {
            return;
        }
        loop {
            let Some(node) = self.get(ino) else {
                return;
            };
            let path = node.path();
            let entry = self.paths.entry(path.to_path_buf());
            if node.path() != path {
                // moved by a rename while we waited for the lock
                continue;
            }
            if node.release(nlookup) > 0 {
                return;
            }
            if let Entry::Occupied(entry) = entry {
                if *entry.get() == ino {
                    entry.remove();
                }
            }
            self.inodes.remove(&ino);
            tracing::trace!("forgot {node}");
            return;
        }
    }

    /// Evict a node regardless of its lookup count.
    pub fn remove(&self, ino: u64) -> Option<Arc<Node>> {
        if ino == ROOT_INODE {
            return None;
        }
        let (_, node) = self.inodes.remove(&ino)?;
        self.paths.remove_if(node.path().as_path(), |_, i| *i == ino);
        Some(node)
    }

    /// Follow a rename in the backing store.
    ///
    /// The node at `from` and every node below it are moved under `to`,
    /// keeping their inode numbers. Anything previously registered at or
    /// below `to` has been replaced and is evicted.
    pub fn rename(&self, from: &Path, to: &Path) {
        if from == to {
            return;
        }
        for (_, ino) in self.collect_below(to) {
            self.remove(ino);
        }

        for (old, ino) in self.collect_below(from) {
            let Ok(rest) = old.strip_prefix(from) else {
                continue;
            };
            let new = if rest.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(rest)
            };

            let Entry::Occupied(entry) = self.paths.entry(old) else {
                continue;
            };
            if *entry.get() != ino {
                continue;
            }
            if let Some(node) = self.get(ino) {
                node.path.store(Arc::new(new.clone()));
            }
            entry.remove();
            match self.paths.entry(new) {
                Entry::Occupied(mut entry) => {
                    // allocated by a lookup that raced with this rename
                    let replaced = entry.insert(ino);
                    if replaced != ino {
                        self.inodes.remove(&replaced);
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(ino);
                }
            }
        }
    }

    fn collect_below(&self, base: &Path) -> Vec<(PathBuf, u64)> {
        self.paths
            .iter()
            .filter(|e| e.key().starts_with(base))
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }
}

/// True if the name refers to exactly one normal entry of a directory
fn is_single_component(name: &OsStr) -> bool {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(first)), None) => first == name,
        _ => false,
    }
}
