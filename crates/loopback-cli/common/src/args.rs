// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use tracing_subscriber::prelude::*;

#[cfg(test)]
#[path = "./args_test.rs"]
mod args_test;

const LOOPBACKFS_LOG: &str = "LOOPBACKFS_LOG";

/// Command line flags for configuring logging output
#[derive(Debug, Clone, clap::Args)]
pub struct Logging {
    /// Make output more verbose, can be specified more than once
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Also log the raw FUSE protocol traffic exchanged with the kernel
    #[clap(long, global = true)]
    pub debug: bool,
}

impl Logging {
    pub fn configure(&self) {
        configure_logging(self.verbose as usize, self.debug)
    }
}

/// Install a global tracing subscriber that writes to stderr.
///
/// The filter is derived from the verbosity, or taken from `LOOPBACKFS_LOG`
/// when no verbosity was requested, and is always extended by `RUST_LOG`.
pub fn configure_logging(verbosity: usize, debug_protocol: bool) {
    let config = log_filter(
        verbosity,
        std::env::var(LOOPBACKFS_LOG).ok(),
        std::env::var("RUST_LOG").ok(),
        debug_protocol,
    );
    let env_filter = tracing_subscriber::filter::EnvFilter::from(config);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .without_time()
        .with_target(verbosity > 2)
        .with_writer(std::io::stderr);

    let sub = tracing_subscriber::registry().with(fmt_layer.with_filter(env_filter));
    if let Err(err) = tracing::subscriber::set_global_default(sub) {
        eprintln!("Failed to initialize logging: {err}");
    }
}

fn log_filter(
    verbosity: usize,
    existing: Option<String>,
    overrides: Option<String>,
    debug_protocol: bool,
) -> String {
    let mut config = match verbosity {
        0 => existing.unwrap_or_else(|| "loopback=info,warn".to_string()),
        1 => "loopback=debug,info".to_string(),
        2 => "loopback=trace,info".to_string(),
        3 => "loopback=trace,debug".to_string(),
        _ => "trace".to_string(),
    };
    if debug_protocol {
        config.push_str(",fuser=debug");
    }
    if let Some(overrides) = overrides {
        config.push(',');
        config.push_str(&overrides);
    }
    config
}

/// Log any error from a command and turn the result into an exit code
#[macro_export]
macro_rules! handle_result {
    ($result:ident) => {{
        match $result {
            Err(err) => {
                let root = err.root_cause();
                if let Some(io_err) = root.downcast_ref::<std::io::Error>() {
                    match io_err.raw_os_error() {
                        Some($crate::__private::libc::EPERM)
                        | Some($crate::__private::libc::EACCES) => {
                            tracing::error!(
                                "{err:#}, check that fusermount is installed and that \
                                 'user_allow_other' is enabled in /etc/fuse.conf when \
                                 using allow_other"
                            );
                        }
                        _ => tracing::error!("{err:#}"),
                    }
                } else if let Some(fs_err) =
                    root.downcast_ref::<$crate::__private::loopback_vfs::Error>()
                {
                    use $crate::__private::loopback_vfs::OsError;
                    match fs_err.os_error() {
                        Some(errno) => tracing::error!(
                            "{err:#} ({})",
                            std::io::Error::from_raw_os_error(errno)
                        ),
                        None => tracing::error!("{err:#}"),
                    }
                } else {
                    tracing::error!("{err:#}");
                }
                1
            }
            Ok(code) => code,
        }
    }};
}
