// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! A FUSE filesystem that mirrors an existing directory.
//!
//! Inode numbers are handed out lazily as the kernel discovers entries
//! and are kept stable for as long as the kernel holds a reference to
//! them, following entries through renames in the backing directory.

pub mod attr;
mod bridge;
pub mod config;
pub mod dir;
mod error;
mod fuse;
pub mod node_kind;
pub mod table;

#[cfg(test)]
mod fixtures;

pub use bridge::{Bridge, FsStats};
pub use config::{get_config, load_config, Config};
pub use dir::{DirectorySink, ListingEntry};
pub use error::{Error, OsError, Result};
pub use fuse::{MountConfig, Session};
pub use node_kind::NodeKind;
pub use table::{InodeTable, Node, ROOT_INODE};
