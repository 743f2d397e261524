// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::sync::{Arc, RwLock};
use std::time::Duration;

use fuser::MountOption;
use once_cell::sync::OnceCell;
use serde::Deserialize;

use crate::Result;

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

static CONFIG: OnceCell<RwLock<Arc<Config>>> = OnceCell::new();

/// The prefix of environment variables that override configuration values
pub const ENV_PREFIX: &str = "LOOPBACKFS_";

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Filesystem {
    /// How long the kernel may cache entries and attributes, in seconds
    pub attr_ttl_secs: u64,
}

impl Default for Filesystem {
    fn default() -> Self {
        Self { attr_ttl_secs: 1 }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Mount {
    /// The filesystem name shown in the mount table
    pub fsname: String,
    /// Allow users other than the one mounting to access the files
    pub allow_other: bool,
    /// Ask the kernel to unmount automatically when the process exits
    pub auto_unmount: bool,
}

impl Default for Mount {
    fn default() -> Self {
        Self {
            fsname: "loopbackfs".to_string(),
            allow_other: false,
            auto_unmount: false,
        }
    }
}

/// Configuration values for loopbackfs.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    // These sub-types should only have one level of values within
    // them, otherwise they cannot be addressed with environment variables.
    pub filesystem: Filesystem,
    pub mount: Mount,
}

impl Config {
    /// Load a config from a string in the given format, with no other sources
    pub fn load_string<S: AsRef<str>>(conf: S, format: config::FileFormat) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(conf.as_ref(), format))
            .build()?;
        Ok(Config::deserialize(config)?)
    }

    /// The time that the kernel may cache entries and attributes
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.filesystem.attr_ttl_secs)
    }

    /// The mount options implied by this configuration
    pub fn mount_options(&self) -> Vec<MountOption> {
        let mut opts = vec![MountOption::FSName(self.mount.fsname.clone())];
        if self.mount.allow_other {
            opts.push(MountOption::AllowOther);
        }
        if self.mount.auto_unmount {
            opts.push(MountOption::AutoUnmount);
        }
        opts
    }
}

/// Get the current config, fetching it from disk if needed.
pub fn get_config() -> Result<Arc<Config>> {
    let config = CONFIG.get_or_try_init(|| -> Result<RwLock<Arc<Config>>> {
        Ok(RwLock::new(Arc::new(load_config()?)))
    })?;
    let lock = config
        .read()
        .map_err(|err| crate::Error::LockPoisonedRead(err.to_string()))?;
    Ok(Arc::clone(&*lock))
}

/// Load the configuration from disk, even if it has already been loaded.
///
/// This includes the default, system and user configurations (if they
/// exist), followed by any overrides from the environment.
pub fn load_config() -> Result<Config> {
    use config::{Config as RawConfig, File};

    let mut config_builder = RawConfig::builder()
        // the system config can be in any supported format: toml, yaml, json, ini, etc
        .add_source(File::with_name("/etc/loopbackfs").required(false));

    if let Some(user_config) = dirs::config_dir() {
        let user_config = user_config.join("loopbackfs").join("loopbackfs");
        config_builder = config_builder
            .add_source(File::with_name(&format!("{}", user_config.display())).required(false));
    }

    for (key, value) in env_overrides(std::env::vars()) {
        config_builder = config_builder.set_override(key, value)?;
    }

    let config = config_builder.build()?;
    Ok(Config::deserialize(config)?)
}

/// Turn `LOOPBACKFS_SECTION_NAME=value` variables into `section.name` keys
fn env_overrides<I>(vars: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut overrides = Vec::new();
    for (var, value) in vars {
        let Some(tail) = var.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let Some((section, name)) = tail.split_once('_') else {
            // a value with no section is not a configuration
            // value, and can be skipped (eg: LOOPBACKFS_LOG)
            continue;
        };
        let key = format!("{}.{}", section.to_lowercase(), name.to_lowercase());
        overrides.push((key, value));
    }
    overrides
}
