//! Service configuration loaded via `ortho-config`.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::block_sizes::SizeFixBounds;
use crate::executor::SshConfig;
use crate::operations::OperationSettings;
use crate::placement::BrickLimits;

/// Default store directory.
pub const DEFAULT_DB_PATH: &str = "brickwork.db";

/// Which executor the service talks to storage hosts through.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecutorKind {
    /// Run commands on management hosts over SSH.
    Ssh,
    /// Record calls in memory without touching any host.
    Mock,
}

impl ExecutorKind {
    /// Parses a configured executor name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim() {
            "ssh" => Some(Self::Ssh),
            "mock" => Some(Self::Mock),
            _ => None,
        }
    }
}

/// Service settings layered from defaults, configuration files and
/// environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "BRICKWORK",
    discovery(
        app_name = "brickwork",
        env_var = "BRICKWORK_CONFIG_PATH",
        config_file_name = "brickwork.toml",
        dotfile_name = ".brickwork.toml",
        project_file_name = "brickwork.toml"
    )
)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "configuration struct with user-facing toggle settings that are naturally expressed as booleans"
)]
pub struct ServiceConfig {
    /// Directory holding the LMDB store.
    #[ortho_config(default = DEFAULT_DB_PATH.to_owned())]
    pub db_path: String,
    /// Executor kind: `ssh` or `mock`.
    #[ortho_config(default = "ssh".to_owned())]
    pub executor: String,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Remote user to connect as.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// Remote SSH port.
    #[ortho_config(default = 22)]
    pub ssh_port: u16,
    /// Private key for remote authentication. When unset, SSH falls back to
    /// its default key locations. Validation rejects blank values.
    pub ssh_identity_file: Option<String>,
    /// Prefix remote commands with `sudo`.
    #[ortho_config(default = false)]
    pub ssh_use_sudo: bool,
    /// Gluster CLI on the management hosts.
    #[ortho_config(default = "gluster".to_owned())]
    pub gluster_bin: String,
    /// Gluster block CLI on the management hosts.
    #[ortho_config(default = "gluster-block".to_owned())]
    pub gluster_block_bin: String,
    /// Operations allowed to run at once, cleanups included.
    #[ortho_config(default = 8)]
    pub max_inflight_operations: usize,
    /// Skip the periodic cleaner.
    #[ortho_config(default = false)]
    pub background_cleaner_disabled: bool,
    /// Delay before the first cleaner sweep, in seconds.
    #[ortho_config(default = 60)]
    pub background_cleaner_start_secs: u64,
    /// Interval between cleaner sweeps, in seconds.
    #[ortho_config(default = 3600)]
    pub background_cleaner_interval_secs: u64,
    /// Age after which an untracked operation is presumed abandoned, in
    /// seconds.
    #[ortho_config(default = 60)]
    pub stale_operation_age_secs: u64,
    /// Create a block-hosting volume when no existing one fits.
    #[ortho_config(default = false)]
    pub auto_create_block_hosting_volume: bool,
    /// Size of automatically created block-hosting volumes in GiB.
    #[ortho_config(default = 1100)]
    pub block_hosting_volume_size: u64,
    /// Comma-separated gluster options for new block-hosting volumes.
    #[ortho_config(default = "group gluster-block".to_owned())]
    pub block_hosting_volume_options: String,
    /// Largest brick in GiB.
    #[ortho_config(default = 4096)]
    pub brick_max_size_gib: u64,
    /// Smallest brick in GiB.
    #[ortho_config(default = 1)]
    pub brick_min_size_gib: u64,
    /// Most bricks a volume may have.
    #[ortho_config(default = 32)]
    pub brick_max_num: usize,
    /// Extra attempts granted to volume creation after a retryable failure.
    #[ortho_config(default = 4)]
    pub create_volume_max_retries: u32,
    /// Largest automatic increase of a block-hosting free size, in GiB.
    #[ortho_config(default = 16)]
    pub size_fix_max_increase_gib: u64,
    /// Largest automatic decrease of a block-hosting free size, in GiB.
    #[ortho_config(default = 16)]
    pub size_fix_max_decrease_gib: u64,
    /// Default `tracing` filter when `RUST_LOG` is unset.
    #[ortho_config(default = "info".to_owned())]
    pub log_filter: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_owned(),
            executor: String::from("ssh"),
            ssh_bin: String::from("ssh"),
            ssh_user: String::from("root"),
            ssh_port: 22,
            ssh_identity_file: None,
            ssh_use_sudo: false,
            gluster_bin: String::from("gluster"),
            gluster_block_bin: String::from("gluster-block"),
            max_inflight_operations: 8,
            background_cleaner_disabled: false,
            background_cleaner_start_secs: 60,
            background_cleaner_interval_secs: 3600,
            stale_operation_age_secs: 60,
            auto_create_block_hosting_volume: false,
            block_hosting_volume_size: 1100,
            block_hosting_volume_options: String::from("group gluster-block"),
            brick_max_size_gib: 4096,
            brick_min_size_gib: 1,
            brick_max_num: 32,
            create_volume_max_retries: 4,
            size_fix_max_increase_gib: 16,
            size_fix_max_decrease_gib: 16,
            log_filter: String::from("info"),
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// A field holds a value the service cannot use.
    #[error("invalid configuration field {field}: {reason}")]
    InvalidField {
        /// Field name as written in `brickwork.toml`.
        field: &'static str,
        /// What is wrong and how to fix it.
        reason: String,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

fn invalid(field: &'static str, problem: &str) -> ConfigError {
    ConfigError::InvalidField {
        field,
        reason: format!(
            "{problem}; set BRICKWORK_{} or {field} in brickwork.toml",
            field.to_ascii_uppercase()
        ),
    }
}

fn require_value(value: &str, field: &'static str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(invalid(field, "value must not be empty"));
    }
    Ok(())
}

fn require_optional_value(value: Option<&str>, field: &'static str) -> Result<(), ConfigError> {
    value.map_or(Ok(()), |set| require_value(set, field))
}

impl ServiceConfig {
    /// Loads configuration using the default argument iterator.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration without parsing CLI arguments. Values still merge
    /// defaults, configuration files and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("brickwork")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks the loaded values for ones the service cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_value(&self.db_path, "db_path")?;
        self.executor_kind()?;
        require_value(&self.ssh_bin, "ssh_bin")?;
        require_value(&self.ssh_user, "ssh_user")?;
        require_optional_value(self.ssh_identity_file.as_deref(), "ssh_identity_file")?;
        require_value(&self.gluster_bin, "gluster_bin")?;
        require_value(&self.gluster_block_bin, "gluster_block_bin")?;
        require_value(&self.log_filter, "log_filter")?;
        if self.max_inflight_operations == 0 {
            return Err(invalid("max_inflight_operations", "must be at least 1"));
        }
        if self.background_cleaner_interval_secs == 0 {
            return Err(invalid(
                "background_cleaner_interval_secs",
                "must be at least 1",
            ));
        }
        if self.brick_min_size_gib == 0 {
            return Err(invalid("brick_min_size_gib", "must be at least 1"));
        }
        if self.brick_min_size_gib > self.brick_max_size_gib {
            return Err(invalid(
                "brick_min_size_gib",
                "must not exceed brick_max_size_gib",
            ));
        }
        if self.brick_max_num == 0 {
            return Err(invalid("brick_max_num", "must be at least 1"));
        }
        if self.auto_create_block_hosting_volume && self.block_hosting_volume_size == 0 {
            return Err(invalid(
                "block_hosting_volume_size",
                "must be positive when auto-creating block-hosting volumes",
            ));
        }
        Ok(())
    }

    /// The configured executor kind.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] for an unknown name.
    pub fn executor_kind(&self) -> Result<ExecutorKind, ConfigError> {
        ExecutorKind::from_name(&self.executor)
            .ok_or_else(|| invalid("executor", "expected `ssh` or `mock`"))
    }

    /// Store directory.
    #[must_use]
    pub fn db_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.db_path)
    }

    /// Settings handed to every operation.
    #[must_use]
    pub fn operation_settings(&self) -> OperationSettings {
        OperationSettings {
            limits: BrickLimits {
                max_size_gib: self.brick_max_size_gib,
                min_size_gib: self.brick_min_size_gib,
                max_bricks: self.brick_max_num,
            },
            create_volume_max_retries: self.create_volume_max_retries,
            auto_create_block_hosting_volume: self.auto_create_block_hosting_volume,
            block_hosting_volume_size: self.block_hosting_volume_size,
            block_hosting_volume_options: self
                .block_hosting_volume_options
                .split(',')
                .map(str::trim)
                .filter(|option| !option.is_empty())
                .map(ToOwned::to_owned)
                .collect(),
        }
    }

    /// Connection settings for the SSH executor.
    #[must_use]
    pub fn ssh_config(&self) -> SshConfig {
        SshConfig {
            ssh_bin: self.ssh_bin.clone(),
            user: self.ssh_user.clone(),
            port: self.ssh_port,
            identity_file: self.ssh_identity_file.clone(),
            use_sudo: self.ssh_use_sudo,
            gluster_bin: self.gluster_bin.clone(),
            gluster_block_bin: self.gluster_block_bin.clone(),
        }
    }

    /// Bounds for the block-hosting size fix.
    #[must_use]
    pub const fn size_fix_bounds(&self) -> SizeFixBounds {
        SizeFixBounds {
            max_increase: self.size_fix_max_increase_gib,
            max_decrease: self.size_fix_max_decrease_gib,
        }
    }

    /// Delay before the first cleaner sweep.
    #[must_use]
    pub const fn cleaner_start_delay(&self) -> Duration {
        Duration::from_secs(self.background_cleaner_start_secs)
    }

    /// Interval between cleaner sweeps.
    #[must_use]
    pub const fn cleaner_interval(&self) -> Duration {
        Duration::from_secs(self.background_cleaner_interval_secs)
    }

    /// Age after which untracked operations are marked stale.
    #[must_use]
    pub const fn stale_age(&self) -> Duration {
        Duration::from_secs(self.stale_operation_age_secs)
    }
}
