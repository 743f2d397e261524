// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::os::unix::fs::{FileTypeExt, PermissionsExt};

use nix::sys::stat::Mode;
use rstest::rstest;

use super::{host_mode, NodeKind};
use crate::fixtures::*;
use crate::{Error, OsError};

#[rstest]
#[case(0o644, 0o644)]
#[case(0o100755, 0o755)]
#[case(0o4755, 0o4755)]
#[case(0o2755, 0o2755)]
#[case(0o1777, 0o1777)]
#[case(0o7777, 0o7777)]
fn test_host_mode(#[case] mode: u32, #[case] expected: u32) {
    assert_eq!(host_mode(mode).bits() as u32, expected);
}

#[rstest]
fn test_decode_fifo(tmpdir: tempfile::TempDir) {
    let kind = NodeKind::from_request(libc::S_IFIFO as u32 | 0o640, tmpdir.path()).unwrap();
    assert_eq!(
        kind,
        NodeKind::Fifo {
            perm: Mode::from_bits_truncate(0o640)
        }
    );
}

#[rstest]
fn test_decode_socket(tmpdir: tempfile::TempDir) {
    let kind = NodeKind::from_request(libc::S_IFSOCK as u32 | 0o644, tmpdir.path()).unwrap();
    assert_eq!(kind, NodeKind::Socket);
    let err = kind.create(&tmpdir.path().join("sock")).unwrap_err();
    assert_eq!(err.os_error(), Some(libc::ENOSYS));
}

#[rstest]
fn test_decode_device_uses_parent(tmpdir: tempfile::TempDir) {
    let parent = nix::sys::stat::stat(tmpdir.path()).unwrap();
    let kind = NodeKind::from_request(libc::S_IFCHR as u32 | 0o600, tmpdir.path()).unwrap();
    assert_eq!(
        kind,
        NodeKind::CharDevice {
            perm: Mode::from_bits_truncate(0o600),
            major: nix::sys::stat::major(parent.st_rdev),
            minor: nix::sys::stat::minor(parent.st_rdev),
        }
    );
}

#[rstest]
fn test_decode_unsupported_type(tmpdir: tempfile::TempDir) {
    let res = NodeKind::from_request(libc::S_IFDIR as u32 | 0o755, tmpdir.path());
    assert!(matches!(res, Err(Error::Unsupported(_))), "got {res:?}");
}

#[rstest]
fn test_create_fifo(tmpdir: tempfile::TempDir) {
    let path = tmpdir.path().join("pipe");
    let kind = NodeKind::Fifo {
        perm: Mode::from_bits_truncate(0o600),
    };
    kind.create(&path).unwrap();

    let meta = std::fs::symlink_metadata(&path).unwrap();
    assert!(meta.file_type().is_fifo());
    assert_eq!(meta.permissions().mode() & 0o777, 0o600);
}

#[rstest]
fn test_create_existing_fails(tmpdir: tempfile::TempDir) {
    let path = tmpdir.path().join("pipe");
    write_file(tmpdir.path(), "pipe", b"");
    let kind = NodeKind::Fifo {
        perm: Mode::from_bits_truncate(0o600),
    };
    let err = kind.create(&path).unwrap_err();
    assert_eq!(err.os_error(), Some(libc::EEXIST));
}
