// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::consts::*;
use fuser::{
    MountOption,
    ReplyAttr,
    ReplyCreate,
    ReplyData,
    ReplyDirectory,
    ReplyEmpty,
    ReplyEntry,
    ReplyOpen,
    ReplyWrite,
    ReplyXattr,
    Request,
    TimeOrNow,
};

use crate::bridge::Bridge;
use crate::{Error, OsError};

/// Options to configure the FUSE filesystem and
/// its behavior at runtime
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// The directory whose contents are mirrored
    pub source: PathBuf,
    /// How long the kernel may cache entries and attributes
    pub ttl: Duration,
    /// Refuse all changes to the backing directory
    pub read_only: bool,
    /// Mount options to be used when setting up
    pub mount_options: HashSet<MountOption>,
}

/// Extract the ok value from a result, or reply with an error in FUSE
macro_rules! unwrap {
    ($reply:ident, $op:expr) => {{
        match $op {
            Ok(r) => r,
            Err(err) => err!($reply, err),
        }
    }};
}

/// Reply with an error to FUSE and return
macro_rules! err {
    ($reply:ident, $err:expr) => {{
        let err: Error = $err;
        if err.is_expected() {
            tracing::trace!("{err}");
        } else {
            tracing::error!("{err:?}");
        }
        let errno = err.os_error().unwrap_or(libc::EIO);
        $reply.error(errno);
        return;
    }};
}

/// Reply that an operation is not offered by this filesystem
macro_rules! not_supported {
    ($reply:ident, $op:literal) => {{
        tracing::trace!("{} = ENOSYS", $op);
        $reply.error(libc::ENOSYS);
    }};
}

/// Represents a connected FUSE session.
///
/// This implements the [`fuser::Filesystem`] trait, receives all
/// requests and hands each one to its own blocking worker on the
/// tokio runtime, where it is served by the [`Bridge`].
pub struct Session {
    fs: Arc<Bridge>,
    ttl: Duration,
    runtime: tokio::runtime::Handle,
}

impl Session {
    /// Construct a new session which mirrors the configured source
    /// directory, scheduling requests onto the given runtime.
    pub fn new(opts: &MountConfig, runtime: tokio::runtime::Handle) -> crate::Result<Self> {
        let source = validate_source(&opts.source)?;
        tracing::debug!("Mirroring {}", source.display());
        Ok(Self {
            fs: Arc::new(Bridge::new(source, opts.read_only)),
            ttl: opts.ttl,
            runtime,
        })
    }

    fn spawn<F>(&self, op: F)
    where
        F: FnOnce(&Bridge) + Send + 'static,
    {
        let fs = Arc::clone(&self.fs);
        self.runtime.spawn_blocking(move || op(&fs));
    }
}

/// Canonicalize the source directory, which must exist
fn validate_source(source: &Path) -> crate::Result<PathBuf> {
    let source = source
        .canonicalize()
        .map_err(|err| Error::InvalidPath(source.to_owned(), err))?;
    if !source.is_dir() {
        return Err(Error::InvalidPath(
            source,
            std::io::Error::from_raw_os_error(libc::ENOTDIR),
        ));
    }
    Ok(source)
}

// these functions mirror the actual fuse ones and
// so we don't have much control over the shape
#[allow(clippy::too_many_arguments)]
impl fuser::Filesystem for Session {
    fn init(
        &mut self,
        _req: &Request<'_>,
        config: &mut fuser::KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        let desired = [("FUSE_ASYNC_READ", FUSE_ASYNC_READ)];
        let all_desired = desired.iter().fold(0, |prev, (_, i)| prev | i);
        if let Err(unsupported) = config.add_capabilities(all_desired) {
            let rejected = desired
                .iter()
                .filter_map(|d| (d.1 & unsupported != 0).then_some(d.0));
            for name in rejected {
                tracing::warn!("FUSE feature rejected: {name}");
            }
            if let Err(unsupported) = config.add_capabilities(all_desired & !unsupported) {
                tracing::warn!("FUSE features still rejected: {unsupported:#x}");
            }
        }
        tracing::info!("Filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("Filesystem destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name.to_owned();
        let ttl = self.ttl;
        self.spawn(move |fs| {
            let attr = unwrap!(reply, fs.lookup(parent, &name));
            reply.entry(&ttl, &attr, 0);
        });
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        // no host I/O involved, so there is no need for a worker
        self.fs.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let ttl = self.ttl;
        self.spawn(move |fs| {
            let attr = unwrap!(reply, fs.getattr(ino));
            reply.attr(&ttl, &attr);
        });
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        not_supported!(reply, "setattr");
    }

    fn readlink(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyData) {
        not_supported!(reply, "readlink");
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let name = name.to_owned();
        let ttl = self.ttl;
        self.spawn(move |fs| {
            let attr = unwrap!(reply, fs.mknod(parent, &name, mode));
            reply.entry(&ttl, &attr, 0);
        });
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        not_supported!(reply, "mkdir");
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_owned();
        self.spawn(move |fs| {
            unwrap!(reply, fs.unlink(parent, &name));
            reply.ok();
        });
    }

    fn rmdir(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        not_supported!(reply, "rmdir");
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _link_name: &OsStr,
        _target: &Path,
        reply: ReplyEntry,
    ) {
        not_supported!(reply, "symlink");
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let name = name.to_owned();
        let newname = newname.to_owned();
        self.spawn(move |fs| {
            unwrap!(reply, fs.rename(parent, &name, newparent, &newname, flags));
            reply.ok();
        });
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        not_supported!(reply, "link");
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        self.spawn(move |fs| {
            unwrap!(reply, fs.open(ino, flags));
            tracing::trace!("open {ino}");
            reply.opened(0, 0);
        });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        self.spawn(move |fs| {
            let data = unwrap!(reply, fs.read(ino, offset, size));
            reply.data(&data);
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        not_supported!(reply, "write");
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        not_supported!(reply, "flush");
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        // no handles are allocated on open
        reply.ok();
    }

    fn fsync(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        not_supported!(reply, "fsync");
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        self.spawn(move |fs| {
            unwrap!(reply, fs.opendir(ino));
            tracing::trace!("opendir {ino}");
            reply.opened(0, 0);
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        self.spawn(move |fs| {
            unwrap!(reply, fs.readdir(ino, offset, &mut reply));
            reply.ok();
        });
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn fsyncdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        not_supported!(reply, "fsyncdir");
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        self.spawn(move |fs| {
            let stats = unwrap!(reply, fs.statfs());
            reply.statfs(
                stats.blocks,
                stats.blocks_free,
                stats.blocks_available,
                stats.files,
                stats.files_free,
                stats.block_size,
                stats.name_max,
                stats.fragment_size,
            );
        });
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        not_supported!(reply, "setxattr");
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _size: u32,
        reply: ReplyXattr,
    ) {
        not_supported!(reply, "getxattr");
    }

    fn listxattr(&mut self, _req: &Request<'_>, _ino: u64, _size: u32, reply: ReplyXattr) {
        not_supported!(reply, "listxattr");
    }

    fn removexattr(&mut self, _req: &Request<'_>, _ino: u64, _name: &OsStr, reply: ReplyEmpty) {
        not_supported!(reply, "removexattr");
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        not_supported!(reply, "create");
    }

    fn fallocate(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _length: i64,
        _mode: i32,
        reply: ReplyEmpty,
    ) {
        not_supported!(reply, "fallocate");
    }
}
