// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use fuser::MountOption;
use loopback_cli_common as cli;
use loopback_vfs::{MountConfig, Session};
use tokio::signal::unix::{signal, SignalKind};

#[cfg(test)]
#[path = "./cmd_mount_test.rs"]
mod cmd_mount_test;

fn main() {
    // because this function exits right away it does not
    // properly handle destruction of data, so we put the actual
    // logic into a separate function/scope
    std::process::exit(main2())
}
fn main2() -> i32 {
    let opt = CmdMount::parse();
    opt.logging.configure();

    let config = match loopback_vfs::get_config() {
        Err(err) => {
            tracing::error!(err = ?err, "failed to load config");
            return 1;
        }
        Ok(config) => config,
    };
    let result = opt.run(&config);

    cli::handle_result!(result)
}

/// Mirror a directory through a FUSE mount
#[derive(Debug, Parser)]
#[clap(name = "loopback-mount")]
pub struct CmdMount {
    #[clap(flatten)]
    logging: cli::Logging,

    /// Mount in read only mode, refusing any change to the source
    #[clap(long)]
    read_only: bool,

    /// Additional options for the mount in the form opt1,opt2=value
    ///
    /// Any of the standard fuse mount options are accepted, for example
    /// allow_other, auto_unmount, fsname=name or subtype=name. These take
    /// precedence over the values from the configuration file.
    #[clap(long, short, value_delimiter = ',')]
    options: Vec<String>,

    /// The directory whose contents should be mirrored
    #[clap(long)]
    source: Option<PathBuf>,

    /// The location where to mount the mirror
    #[clap(long)]
    mount_point: Option<PathBuf>,
}

impl CmdMount {
    pub fn run(&self, config: &loopback_vfs::Config) -> Result<i32> {
        let mountpoint = self.mount_point()?;
        let opts = self.mount_config(config)?;
        tracing::debug!("FUSE Config: {opts:#?}");

        if !nix::unistd::geteuid().is_root() {
            // unprivileged callers must have write access to the directory that
            // they are trying to mount over.
            nix::unistd::access(&mountpoint, nix::unistd::AccessFlags::W_OK)
                .context("Must have write access to mountpoint")?;
        }

        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("Failed to establish runtime")?;

        let fs = Session::new(&opts, rt.handle().clone()).context("Invalid source directory")?;

        tracing::debug!("Establishing fuse session...");
        let mount_opts = opts.mount_options.iter().cloned().collect::<Vec<_>>();
        let mut session = fuser::Session::new(fs, &mountpoint, &mount_opts)
            .context("Failed to create a FUSE session")?;
        let mut unmounter = session.unmount_callable();

        let result: Result<std::io::Result<()>> = rt.block_on(async move {
            let mut interrupt =
                signal(SignalKind::interrupt()).context("interrupt signal handler")?;
            let mut quit = signal(SignalKind::quit()).context("quit signal handler")?;
            let mut terminate =
                signal(SignalKind::terminate()).context("terminate signal handler")?;

            tracing::info!(
                "Mirroring {} at {}",
                opts.source.display(),
                mountpoint.display()
            );
            // the session loop blocks on the fuse device, so it gets
            // its own blocking task while requests go to the runtime
            let fut = tokio::task::spawn_blocking(move || session.run());
            let signalled = tokio::select! {
                res = fut => {
                    tracing::info!("Filesystem shutting down");
                    return res.context("FUSE session failed");
                }
                _ = terminate.recv() => "Terminate",
                _ = interrupt.recv() => "Interrupt",
                _ = quit.recv() => "Quit",
            };
            // we explicitly catch any signal related to interruption
            // and will act by unmounting the filesystem early
            if let Err(err) = unmounter.unmount() {
                tracing::warn!("Failed to unmount {}: {err}", mountpoint.display());
            }
            Err(anyhow!("{signalled} signal received, filesystem shutting down"))
        });

        // requests that are still being served when the session ends
        // should not hold the process open indefinitely
        rt.shutdown_timeout(std::time::Duration::from_secs(2));
        result??;
        Ok(0)
    }

    fn mount_point(&self) -> Result<PathBuf> {
        let Some(mount_point) = &self.mount_point else {
            bail!("You must set --mount-point");
        };
        let mount_point = mount_point
            .canonicalize()
            .with_context(|| format!("Invalid mount point {}", mount_point.display()))?;
        if !mount_point.is_dir() {
            bail!("Mount point must be a directory: {}", mount_point.display());
        }
        Ok(mount_point)
    }

    /// Combine the configuration file with the command line flags
    fn mount_config(&self, config: &loopback_vfs::Config) -> Result<MountConfig> {
        let Some(source) = &self.source else {
            bail!("You must set --source");
        };
        let mut opts = MountConfig {
            source: source.clone(),
            ttl: config.ttl(),
            read_only: self.read_only,
            mount_options: config.mount_options().into_iter().collect(),
        };

        for option in parse_options_from_args(&self.options) {
            match option {
                MountOption::CUSTOM(opt) => {
                    bail!("Unsupported mount option, or missing value: {opt}")
                }
                MountOption::FSName(_) => {
                    opts.mount_options
                        .retain(|o| !matches!(o, MountOption::FSName(_)));
                    opts.mount_options.insert(option);
                }
                MountOption::RO => opts.read_only = true,
                _ => {
                    opts.mount_options.insert(option);
                }
            }
        }

        if opts.read_only {
            if opts.mount_options.contains(&MountOption::RW) {
                bail!("The rw option cannot be combined with a read only mount");
            }
            opts.mount_options.insert(MountOption::RO);
        }
        Ok(opts)
    }
}

/// Copies from the private [`fuser::MountOption::from_str`]
fn parse_options_from_args(args: &[String]) -> Vec<MountOption> {
    args.iter()
        .map(|s| match s.as_str() {
            "auto_unmount" => MountOption::AutoUnmount,
            "allow_other" => MountOption::AllowOther,
            "allow_root" => MountOption::AllowRoot,
            "default_permissions" => MountOption::DefaultPermissions,
            "dev" => MountOption::Dev,
            "nodev" => MountOption::NoDev,
            "suid" => MountOption::Suid,
            "nosuid" => MountOption::NoSuid,
            "ro" => MountOption::RO,
            "rw" => MountOption::RW,
            "exec" => MountOption::Exec,
            "noexec" => MountOption::NoExec,
            "atime" => MountOption::Atime,
            "noatime" => MountOption::NoAtime,
            "dirsync" => MountOption::DirSync,
            "sync" => MountOption::Sync,
            "async" => MountOption::Async,
            x if x.starts_with("fsname=") => MountOption::FSName(x[7..].into()),
            x if x.starts_with("subtype=") => MountOption::Subtype(x[8..].into()),
            x => MountOption::CUSTOM(x.into()),
        })
        .collect()
}
