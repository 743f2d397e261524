// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Common macros and argument structures for the loopbackfs command line

mod args;

pub use args::{configure_logging, Logging};

#[doc(hidden)]
pub mod __private {
    // Public re-exports for macros
    pub use libc;
    pub use loopback_vfs;
}
