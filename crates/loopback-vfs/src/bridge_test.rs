// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::ffi::OsStr;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};

use fuser::FileType;
use rstest::rstest;

use super::Bridge;
use crate::dir::{DirectorySink, ListingEntry};
use crate::fixtures::*;
use crate::{OsError, ROOT_INODE};

impl DirectorySink for Vec<ListingEntry> {
    fn push(&mut self, entry: &ListingEntry) -> bool {
        Vec::push(self, entry.clone());
        false
    }
}

fn lookup_ino(fs: &Bridge, parent: u64, name: &str) -> u64 {
    fs.lookup(parent, OsStr::new(name)).unwrap().ino
}

#[rstest]
fn test_lookup_and_getattr(tmpdir: tempfile::TempDir) {
    init_logging();
    write_file(tmpdir.path(), "dir/file.txt", b"hello");
    let fs = Bridge::new(tmpdir.path(), false);

    let dir = fs.lookup(ROOT_INODE, OsStr::new("dir")).unwrap();
    assert_eq!(dir.kind, FileType::Directory);
    let file = fs.lookup(dir.ino, OsStr::new("file.txt")).unwrap();
    assert_eq!(file.kind, FileType::RegularFile);
    assert_eq!(file.size, 5);

    let attr = fs.getattr(file.ino).unwrap();
    assert_eq!(attr.ino, file.ino);
    assert_eq!(attr.size, 5);

    let root = fs.getattr(ROOT_INODE).unwrap();
    assert_eq!(root.ino, ROOT_INODE);
    assert_eq!(root.kind, FileType::Directory);
}

#[rstest]
fn test_lookup_missing(tmpdir: tempfile::TempDir) {
    let fs = Bridge::new(tmpdir.path(), false);
    let err = fs.lookup(ROOT_INODE, OsStr::new("missing")).unwrap_err();
    assert_eq!(err.os_error(), Some(libc::ENOENT));
    assert!(err.is_expected());
}

#[rstest]
fn test_getattr_unknown_inode(tmpdir: tempfile::TempDir) {
    let fs = Bridge::new(tmpdir.path(), false);
    let err = fs.getattr(424242).unwrap_err();
    assert_eq!(err.os_error(), Some(libc::ENOENT));
}

#[rstest]
fn test_lookup_counts_and_forget(tmpdir: tempfile::TempDir) {
    write_file(tmpdir.path(), "file.txt", b"");
    let fs = Bridge::new(tmpdir.path(), false);

    let ino = lookup_ino(&fs, ROOT_INODE, "file.txt");
    assert_eq!(lookup_ino(&fs, ROOT_INODE, "file.txt"), ino);
    assert_eq!(fs.table().require(ino).unwrap().lookups(), 2);

    fs.forget(ino, 2);
    assert!(fs.getattr(ino).is_err(), "forgotten inode is unknown");
}

#[rstest]
fn test_readdir(tmpdir: tempfile::TempDir) {
    write_file(tmpdir.path(), "b.txt", b"");
    write_file(tmpdir.path(), "a.txt", b"");
    let fs = Bridge::new(tmpdir.path(), false);

    fs.opendir(ROOT_INODE).unwrap();
    let mut entries: Vec<ListingEntry> = Vec::new();
    let written = fs.readdir(ROOT_INODE, 0, &mut entries).unwrap();
    assert_eq!(written, 2);
    let names: Vec<_> = entries.iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, vec!["a.txt", "b.txt"]);

    // entries listed are the same nodes that lookup finds
    assert_eq!(lookup_ino(&fs, ROOT_INODE, "a.txt"), entries[0].ino);

    let mut rest: Vec<ListingEntry> = Vec::new();
    fs.readdir(ROOT_INODE, 1, &mut rest).unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].name, "b.txt");

    let mut none: Vec<ListingEntry> = Vec::new();
    assert_eq!(fs.readdir(ROOT_INODE, 2, &mut none).unwrap(), 0);

    let err = fs.readdir(ROOT_INODE, 3, &mut none).unwrap_err();
    assert_eq!(err.os_error(), Some(libc::EIO));
}

#[rstest]
fn test_readdir_not_a_directory(tmpdir: tempfile::TempDir) {
    write_file(tmpdir.path(), "file.txt", b"");
    let fs = Bridge::new(tmpdir.path(), false);
    let ino = lookup_ino(&fs, ROOT_INODE, "file.txt");
    let mut entries: Vec<ListingEntry> = Vec::new();
    assert!(fs.readdir(ino, 0, &mut entries).is_err());
}

#[rstest]
#[case(0, 100, b"0123456789".as_slice())]
#[case(0, 4, b"0123".as_slice())]
#[case(6, 100, b"6789".as_slice())]
#[case(10, 100, b"".as_slice())]
#[case(3, 0, b"".as_slice())]
fn test_read(
    tmpdir: tempfile::TempDir,
    #[case] offset: i64,
    #[case] size: u32,
    #[case] expected: &[u8],
) {
    write_file(tmpdir.path(), "digits", b"0123456789");
    let fs = Bridge::new(tmpdir.path(), false);
    let ino = lookup_ino(&fs, ROOT_INODE, "digits");
    fs.open(ino, libc::O_RDONLY).unwrap();

    let data = fs.read(ino, offset, size).unwrap();
    assert_eq!(data, expected);
}

#[rstest]
#[case(11)]
#[case(-1)]
fn test_read_past_end(tmpdir: tempfile::TempDir, #[case] offset: i64) {
    write_file(tmpdir.path(), "digits", b"0123456789");
    let fs = Bridge::new(tmpdir.path(), false);
    let ino = lookup_ino(&fs, ROOT_INODE, "digits");

    let err = fs.read(ino, offset, 10).unwrap_err();
    assert_eq!(err.os_error(), Some(libc::EIO));
}

#[rstest]
fn test_rename_keeps_inodes(tmpdir: tempfile::TempDir) {
    write_file(tmpdir.path(), "src/inner.txt", b"contents");
    std::fs::create_dir(tmpdir.path().join("dest")).unwrap();
    let fs = Bridge::new(tmpdir.path(), false);

    let src = lookup_ino(&fs, ROOT_INODE, "src");
    let inner = lookup_ino(&fs, src, "inner.txt");
    let dest = lookup_ino(&fs, ROOT_INODE, "dest");

    fs.rename(ROOT_INODE, OsStr::new("src"), dest, OsStr::new("moved"), 0)
        .unwrap();

    assert!(!tmpdir.path().join("src").exists());
    assert!(tmpdir.path().join("dest/moved/inner.txt").exists());
    assert_eq!(lookup_ino(&fs, dest, "moved"), src);
    assert_eq!(fs.read(inner, 0, 100).unwrap(), b"contents");
    assert!(fs.lookup(ROOT_INODE, OsStr::new("src")).is_err());
}

#[rstest]
fn test_rename_missing_source(tmpdir: tempfile::TempDir) {
    let fs = Bridge::new(tmpdir.path(), false);
    let err = fs
        .rename(ROOT_INODE, OsStr::new("nope"), ROOT_INODE, OsStr::new("other"), 0)
        .unwrap_err();
    assert_eq!(err.os_error(), Some(libc::ENOENT));
}

#[rstest]
fn test_rename_unknown_parent(tmpdir: tempfile::TempDir) {
    write_file(tmpdir.path(), "a", b"");
    let fs = Bridge::new(tmpdir.path(), false);
    let err = fs
        .rename(9999, OsStr::new("a"), ROOT_INODE, OsStr::new("b"), 0)
        .unwrap_err();
    assert_eq!(err.os_error(), Some(libc::ENOENT));
    let err = fs
        .rename(ROOT_INODE, OsStr::new("a"), 9999, OsStr::new("b"), 0)
        .unwrap_err();
    assert_eq!(err.os_error(), Some(libc::ENOENT));
    assert!(tmpdir.path().join("a").exists());
}

#[rstest]
fn test_rename_between_hard_links(tmpdir: tempfile::TempDir) {
    write_file(tmpdir.path(), "a", b"shared");
    std::fs::hard_link(tmpdir.path().join("a"), tmpdir.path().join("b")).unwrap();
    let fs = Bridge::new(tmpdir.path(), false);
    let a = lookup_ino(&fs, ROOT_INODE, "a");
    let b = lookup_ino(&fs, ROOT_INODE, "b");

    fs.rename(ROOT_INODE, OsStr::new("a"), ROOT_INODE, OsStr::new("b"), 0)
        .unwrap();

    // renaming onto another link of the same file leaves both in place
    assert!(tmpdir.path().join("a").exists());
    assert!(tmpdir.path().join("b").exists());
    assert!(fs.getattr(a).is_ok());
    assert!(fs.getattr(b).is_ok());
    assert_eq!(lookup_ino(&fs, ROOT_INODE, "a"), a);
    assert_eq!(lookup_ino(&fs, ROOT_INODE, "b"), b);
    let node = fs.table().require(a).unwrap();
    assert_eq!(node.path().as_path(), tmpdir.path().join("a"));
}

#[rstest]
fn test_rename_with_flags(tmpdir: tempfile::TempDir) {
    write_file(tmpdir.path(), "a", b"");
    let fs = Bridge::new(tmpdir.path(), false);
    let err = fs
        .rename(
            ROOT_INODE,
            OsStr::new("a"),
            ROOT_INODE,
            OsStr::new("b"),
            libc::RENAME_NOREPLACE,
        )
        .unwrap_err();
    assert_eq!(err.os_error(), Some(libc::ENOSYS));
    assert!(tmpdir.path().join("a").exists());
}

#[rstest]
fn test_unlink(tmpdir: tempfile::TempDir) {
    write_file(tmpdir.path(), "file.txt", b"data");
    let fs = Bridge::new(tmpdir.path(), false);
    let ino = lookup_ino(&fs, ROOT_INODE, "file.txt");

    fs.unlink(ROOT_INODE, OsStr::new("file.txt")).unwrap();
    assert!(!tmpdir.path().join("file.txt").exists());
    let err = fs.getattr(ino).unwrap_err();
    assert_eq!(err.os_error(), Some(libc::ENOENT));
    let err = fs.lookup(ROOT_INODE, OsStr::new("file.txt")).unwrap_err();
    assert_eq!(err.os_error(), Some(libc::ENOENT));
}

#[rstest]
fn test_unlink_missing(tmpdir: tempfile::TempDir) {
    let fs = Bridge::new(tmpdir.path(), false);
    let err = fs.unlink(ROOT_INODE, OsStr::new("missing")).unwrap_err();
    assert_eq!(err.os_error(), Some(libc::ENOENT));
    let err = fs.unlink(9999, OsStr::new("missing")).unwrap_err();
    assert_eq!(err.os_error(), Some(libc::ENOENT));
}

#[rstest]
fn test_unlink_directory_fails(tmpdir: tempfile::TempDir) {
    std::fs::create_dir(tmpdir.path().join("dir")).unwrap();
    let fs = Bridge::new(tmpdir.path(), false);
    let err = fs.unlink(ROOT_INODE, OsStr::new("dir")).unwrap_err();
    let errno = err.os_error().unwrap();
    assert!(errno == libc::EISDIR || errno == libc::EPERM, "got {errno}");
    assert!(tmpdir.path().join("dir").is_dir());
}

#[rstest]
fn test_mknod_fifo(tmpdir: tempfile::TempDir) {
    let fs = Bridge::new(tmpdir.path(), false);
    let mode = libc::S_IFIFO as u32 | 0o640;

    let attr = fs.mknod(ROOT_INODE, OsStr::new("pipe"), mode).unwrap();
    assert_eq!(attr.kind, FileType::NamedPipe);
    assert_eq!(fs.table().require(attr.ino).unwrap().lookups(), 1);

    let meta = std::fs::symlink_metadata(tmpdir.path().join("pipe")).unwrap();
    assert!(meta.file_type().is_fifo());
    let perm = meta.permissions().mode() & 0o777;
    assert_eq!(perm & !0o640, 0, "no bits beyond the requested ones");
    assert_eq!(perm & 0o600, 0o600);
}

#[rstest]
fn test_mknod_socket_is_unsupported(tmpdir: tempfile::TempDir) {
    let fs = Bridge::new(tmpdir.path(), false);
    let mode = libc::S_IFSOCK as u32 | 0o644;
    let err = fs.mknod(ROOT_INODE, OsStr::new("sock"), mode).unwrap_err();
    assert_eq!(err.os_error(), Some(libc::ENOSYS));
    assert!(!tmpdir.path().join("sock").exists());
}

#[rstest]
fn test_read_only_refuses_changes(tmpdir: tempfile::TempDir) {
    write_file(tmpdir.path(), "file.txt", b"data");
    let fs = Bridge::new(tmpdir.path(), true);
    let ino = lookup_ino(&fs, ROOT_INODE, "file.txt");

    fs.open(ino, libc::O_RDONLY).unwrap();
    let err = fs.open(ino, libc::O_RDWR).unwrap_err();
    assert_eq!(err.os_error(), Some(libc::EROFS));

    let err = fs.unlink(ROOT_INODE, OsStr::new("file.txt")).unwrap_err();
    assert_eq!(err.os_error(), Some(libc::EROFS));
    let err = fs
        .rename(ROOT_INODE, OsStr::new("file.txt"), ROOT_INODE, OsStr::new("x"), 0)
        .unwrap_err();
    assert_eq!(err.os_error(), Some(libc::EROFS));
    let err = fs
        .mknod(ROOT_INODE, OsStr::new("pipe"), libc::S_IFIFO as u32 | 0o644)
        .unwrap_err();
    assert_eq!(err.os_error(), Some(libc::EROFS));
    assert!(tmpdir.path().join("file.txt").exists());
}

#[rstest]
fn test_statfs(tmpdir: tempfile::TempDir) {
    let fs = Bridge::new(tmpdir.path(), false);
    let stats = fs.statfs().unwrap();
    assert!(stats.block_size > 0);
    assert!(stats.blocks >= stats.blocks_free);
}
