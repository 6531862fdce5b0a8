//! Executor that drives `gluster`, `gluster-block` and LVM over SSH.

use std::ffi::OsString;
use std::sync::Arc;

use serde::Deserialize;
use shell_escape::unix::escape;

use super::{
    BlockVolumeRequest, BrickAddress, BrickRequest, CloneRequest, ExecFuture, Executor,
    ExecutorError, ReplaceBrickRequest, VolumeModify, VolumeReport, VolumeRequest,
};
use crate::command::{ProcessOutput, ProcessRunner, SystemRunner};
use crate::entities::{BlockConnection, Durability};

/// Connection and binary settings for [`SshExecutor`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshConfig {
    /// SSH client binary.
    pub ssh_bin: String,
    /// Remote user.
    pub user: String,
    /// Remote SSH port.
    pub port: u16,
    /// Private key passed with `-i`.
    pub identity_file: Option<String>,
    /// Prefix remote commands with `sudo`.
    pub use_sudo: bool,
    /// Gluster CLI on the remote host.
    pub gluster_bin: String,
    /// Gluster block CLI on the remote host.
    pub gluster_block_bin: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            user: String::from("root"),
            port: 22,
            identity_file: None,
            use_sudo: false,
            gluster_bin: String::from("gluster"),
            gluster_block_bin: String::from("gluster-block"),
        }
    }
}

/// Runs storage commands on remote hosts through an SSH client.
#[derive(Clone, Debug)]
pub struct SshExecutor<R: ProcessRunner> {
    config: Arc<SshConfig>,
    runner: R,
}

impl SshExecutor<SystemRunner> {
    /// Convenience constructor that wires the real process runner.
    #[must_use]
    pub fn with_process_runner(config: SshConfig) -> Self {
        Self::new(config, SystemRunner)
    }
}

fn shell(words: &[&str]) -> String {
    words
        .iter()
        .map(|word| escape((*word).into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn mentions_missing(text: &str) -> bool {
    ["does not exist", "doesn't exist", "failed to find"]
        .iter()
        .any(|needle| text.contains(needle))
}

/// Maps a finished remote command onto the executor's error vocabulary.
fn classify(host: &str, target: &str, output: ProcessOutput) -> Result<String, ExecutorError> {
    if output.succeeded() {
        return Ok(output.stdout);
    }
    let text = format!("{}\n{}", output.stderr, output.stdout).to_lowercase();
    if output.connection_failed() {
        return Err(ExecutorError::Unreachable {
            host: host.to_owned(),
            message: output.stderr.trim().to_owned(),
        });
    }
    if mentions_missing(&text) {
        return Err(ExecutorError::NotFound {
            target: target.to_owned(),
        });
    }
    if text.contains("already exists") {
        return Err(ExecutorError::AlreadyExists {
            target: target.to_owned(),
        });
    }
    Err(ExecutorError::Command {
        host: host.to_owned(),
        message: format!("exit {}: {}", output.exit_label(), output.diagnostic()),
    })
}

fn parse_volume_info(host: &str, name: &str, stdout: &str) -> Result<VolumeReport, ExecutorError> {
    let mut found_name = None;
    let mut bricks = Vec::new();
    for line in stdout.lines().map(str::trim) {
        let Some((key, value)) = line.split_once(": ") else {
            continue;
        };
        if key == "Volume Name" {
            found_name = Some(value.trim().to_owned());
            continue;
        }
        let is_brick_line = key
            .strip_prefix("Brick")
            .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()));
        if !is_brick_line {
            continue;
        }
        let (brick_host, path) =
            value
                .trim()
                .split_once(':')
                .ok_or_else(|| ExecutorError::Parse {
                    host: host.to_owned(),
                    message: format!("malformed brick line `{line}`"),
                })?;
        bricks.push(BrickAddress {
            host: brick_host.to_owned(),
            path: path.to_owned(),
        });
    }
    match found_name {
        Some(found) if found == name => Ok(VolumeReport {
            name: found,
            bricks,
        }),
        _ => Err(ExecutorError::Parse {
            host: host.to_owned(),
            message: format!("volume info did not describe {name}"),
        }),
    }
}

#[derive(Debug, Deserialize)]
struct BlockCreateOutput {
    #[serde(rename = "IQN", default)]
    iqn: String,
    #[serde(rename = "USERNAME", default)]
    username: String,
    #[serde(rename = "PASSWORD", default)]
    password: String,
    #[serde(rename = "PORTAL(S)", default)]
    portals: Vec<String>,
    #[serde(rename = "RESULT", default)]
    result: String,
    #[serde(rename = "errMsg", default)]
    err_msg: String,
}

fn parse_block_create(host: &str, stdout: &str) -> Result<BlockConnection, ExecutorError> {
    let parsed: BlockCreateOutput =
        serde_json::from_str(stdout.trim()).map_err(|err| ExecutorError::Parse {
            host: host.to_owned(),
            message: err.to_string(),
        })?;
    if parsed.result != "SUCCESS" {
        return Err(ExecutorError::Command {
            host: host.to_owned(),
            message: parsed.err_msg,
        });
    }
    let hosts = parsed
        .portals
        .iter()
        .map(|portal| {
            portal
                .rsplit_once(':')
                .map_or_else(|| portal.clone(), |(addr, _)| addr.to_owned())
        })
        .collect();
    Ok(BlockConnection {
        hosts,
        iqn: parsed.iqn,
        lun: 0,
        username: parsed.username,
        password: parsed.password,
    })
}

impl<R> SshExecutor<R>
where
    R: ProcessRunner + Clone + Send + Sync + 'static,
{
    /// Creates an executor using `runner` to launch the SSH client.
    #[must_use]
    pub fn new(config: SshConfig, runner: R) -> Self {
        Self {
            config: Arc::new(config),
            runner,
        }
    }

    /// Returns the connection settings.
    #[must_use]
    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    fn ssh_args(&self, host: &str, script: &str) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(self.config.port.to_string()),
        ];
        if let Some(identity) = &self.config.identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(identity));
        }
        args.push(OsString::from("-o"));
        args.push(OsString::from("BatchMode=yes"));
        args.push(OsString::from(format!("{}@{host}", self.config.user)));
        args.push(OsString::from(script));
        args
    }

    fn line(&self, words: &[&str]) -> String {
        if self.config.use_sudo {
            format!("sudo {}", shell(words))
        } else {
            shell(words)
        }
    }

    fn gluster(&self, words: &[&str]) -> String {
        let mut all = vec![self.config.gluster_bin.as_str(), "--mode=script"];
        all.extend_from_slice(words);
        self.line(&all)
    }

    async fn exec(&self, host: &str, script: String) -> Result<ProcessOutput, ExecutorError> {
        tracing::debug!(host, %script, "running remote command");
        let args = self.ssh_args(host, &script);
        let runner = self.runner.clone();
        let program = self.config.ssh_bin.clone();
        let joined = tokio::task::spawn_blocking(move || runner.run(&program, &args)).await;
        match joined {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(ExecutorError::Command {
                host: host.to_owned(),
                message: err.to_string(),
            }),
            Err(err) => Err(ExecutorError::Command {
                host: host.to_owned(),
                message: err.to_string(),
            }),
        }
    }

    async fn checked(
        &self,
        host: &str,
        target: &str,
        script: String,
    ) -> Result<String, ExecutorError> {
        let output = self.exec(host, script).await?;
        classify(host, target, output)
    }

    fn volume_layout_words(durability: Durability) -> Vec<String> {
        match durability {
            Durability::None => Vec::new(),
            Durability::Replicate { replica } => {
                vec![String::from("replica"), replica.to_string()]
            }
            Durability::Disperse { data, redundancy } => vec![
                String::from("disperse-data"),
                data.to_string(),
                String::from("redundancy"),
                redundancy.to_string(),
            ],
        }
    }

    fn option_lines(&self, name: &str, options: &[String]) -> Vec<String> {
        options
            .iter()
            .filter_map(|option| option.split_once(' '))
            .map(|(key, value)| self.gluster(&["volume", "set", name, key.trim(), value.trim()]))
            .collect()
    }

    async fn create_volume(
        &self,
        host: &str,
        volume: &VolumeRequest,
    ) -> Result<(), ExecutorError> {
        let layout = Self::volume_layout_words(volume.durability);
        let specs: Vec<String> = volume.bricks.iter().map(BrickAddress::spec).collect();
        let mut words = vec!["volume", "create", volume.name.as_str()];
        words.extend(layout.iter().map(String::as_str));
        words.extend(specs.iter().map(String::as_str));
        words.push("force");
        self.checked(host, &volume.name, self.gluster(&words)).await?;
        let mut lines = self.option_lines(&volume.name, &volume.options);
        lines.push(self.gluster(&["volume", "start", volume.name.as_str()]));
        self.checked(host, &volume.name, lines.join(" && ")).await?;
        Ok(())
    }

    async fn destroy_brick(
        &self,
        host: &str,
        brick: &BrickRequest,
    ) -> Result<bool, ExecutorError> {
        let mount = escape(brick.mount_point().into()).into_owned();
        let unmount = format!(
            "if mountpoint -q {mount}; then {}; fi",
            self.line(&["umount", brick.mount_point()])
        );
        self.checked(host, &brick.id, unmount).await?;
        let lv = format!("{}/{}", brick.volume_group, brick.lv_name);
        match self
            .checked(host, &brick.id, self.line(&["lvremove", "-f", &lv]))
            .await
        {
            Ok(_) | Err(ExecutorError::NotFound { .. }) => {}
            Err(err) => return Err(err),
        }
        let Some(pool) = &brick.pool_name else {
            return Ok(false);
        };
        let pool_lv = format!("{}/{pool}", brick.volume_group);
        let count = self
            .checked(
                host,
                &brick.id,
                self.line(&["lvs", "--noheadings", "-o", "thin_count", &pool_lv]),
            )
            .await;
        match count {
            Err(ExecutorError::NotFound { .. }) => Ok(true),
            Err(err) => Err(err),
            Ok(text) if text.trim() == "0" => {
                match self
                    .checked(host, &brick.id, self.line(&["lvremove", "-f", &pool_lv]))
                    .await
                {
                    Ok(_) | Err(ExecutorError::NotFound { .. }) => Ok(true),
                    Err(err) => Err(err),
                }
            }
            Ok(_) => Ok(false),
        }
    }

    async fn clone_volume(
        &self,
        host: &str,
        request: &CloneRequest,
    ) -> Result<VolumeReport, ExecutorError> {
        let snapshot = format!("{}_snap", request.clone);
        let script = [
            self.gluster(&["snapshot", "create", &snapshot, &request.volume, "no-timestamp"]),
            self.gluster(&["snapshot", "activate", &snapshot]),
            self.gluster(&["snapshot", "clone", &request.clone, &snapshot]),
        ]
        .join(" && ");
        self.checked(host, &request.clone, script).await?;
        let info = self
            .checked(
                host,
                &request.clone,
                self.gluster(&["volume", "info", &request.clone]),
            )
            .await?;
        let report = parse_volume_info(host, &request.clone, &info)?;
        if let Err(err) = self
            .checked(host, &snapshot, self.gluster(&["snapshot", "delete", &snapshot]))
            .await
        {
            tracing::warn!(host, snapshot = %snapshot, error = %err, "failed to delete clone snapshot");
        }
        Ok(report)
    }
}

impl<R> Executor for SshExecutor<R>
where
    R: ProcessRunner + Clone + Send + Sync + 'static,
{
    fn glusterd_check<'a>(&'a self, host: &'a str) -> ExecFuture<'a, ()> {
        Box::pin(async move {
            self.checked(host, "glusterd", self.line(&["systemctl", "-q", "is-active", "glusterd"]))
                .await
                .map(drop)
        })
    }

    fn brick_create<'a>(&'a self, host: &'a str, brick: &'a BrickRequest) -> ExecFuture<'a, ()> {
        Box::pin(async move {
            let Some(pool) = &brick.pool_name else {
                return Err(ExecutorError::Command {
                    host: host.to_owned(),
                    message: format!("brick {} has no thin pool to create", brick.id),
                });
            };
            let pool_lv = format!("{}/{pool}", brick.volume_group);
            let device = format!("/dev/mapper/{}-{}", brick.volume_group, brick.lv_name);
            let metadata = format!("{}K", brick.pool_metadata_kib);
            let tp_size = format!("{}K", brick.tp_size_kib);
            let size = format!("{}K", brick.size_kib);
            let script = [
                self.line(&["mkdir", "-p", brick.mount_point()]),
                self.line(&[
                    "lvcreate",
                    "-qq",
                    "--autobackup=n",
                    "--poolmetadatasize",
                    &metadata,
                    "--chunksize",
                    "256K",
                    "--size",
                    &tp_size,
                    "--thin",
                    &pool_lv,
                    "--virtualsize",
                    &size,
                    "--name",
                    &brick.lv_name,
                ]),
                self.line(&["mkfs.xfs", "-i", "size=512", "-n", "size=8192", &device]),
                self.line(&[
                    "mount",
                    "-o",
                    "rw,inode64,noatime,nouuid",
                    &device,
                    brick.mount_point(),
                ]),
                self.line(&["mkdir", "-p", &brick.path]),
            ]
            .join(" && ");
            self.checked(host, &brick.id, script).await.map(drop)
        })
    }

    fn brick_destroy<'a>(
        &'a self,
        host: &'a str,
        brick: &'a BrickRequest,
    ) -> ExecFuture<'a, bool> {
        Box::pin(self.destroy_brick(host, brick))
    }

    fn volume_create<'a>(
        &'a self,
        host: &'a str,
        volume: &'a VolumeRequest,
    ) -> ExecFuture<'a, ()> {
        Box::pin(self.create_volume(host, volume))
    }

    fn volume_destroy<'a>(&'a self, host: &'a str, name: &'a str) -> ExecFuture<'a, ()> {
        Box::pin(async move {
            match self
                .checked(host, name, self.gluster(&["volume", "stop", name, "force"]))
                .await
            {
                Ok(_) => {}
                Err(ExecutorError::Command { message, .. })
                    if message.contains("not in the started state") => {}
                Err(err) => return Err(err),
            }
            self.checked(host, name, self.gluster(&["volume", "delete", name]))
                .await
                .map(drop)
        })
    }

    fn volume_destroy_check<'a>(&'a self, host: &'a str, name: &'a str) -> ExecFuture<'a, ()> {
        Box::pin(async move {
            self.checked(host, name, self.gluster(&["volume", "info", name]))
                .await?;
            let snapshots = self
                .checked(host, name, self.gluster(&["snapshot", "list", name]))
                .await?;
            let has_snapshots = snapshots
                .lines()
                .map(str::trim)
                .any(|line| !line.is_empty() && !line.starts_with("No snapshots"));
            if has_snapshots {
                return Err(ExecutorError::Command {
                    host: host.to_owned(),
                    message: format!("volume {name} still has snapshots"),
                });
            }
            Ok(())
        })
    }

    fn volume_expand<'a>(
        &'a self,
        host: &'a str,
        volume: &'a VolumeRequest,
    ) -> ExecFuture<'a, ()> {
        Box::pin(async move {
            let specs: Vec<String> = volume.bricks.iter().map(BrickAddress::spec).collect();
            let replica = match volume.durability {
                Durability::Replicate { replica } => Some(replica.to_string()),
                Durability::None | Durability::Disperse { .. } => None,
            };
            let mut words = vec!["volume", "add-brick", volume.name.as_str()];
            if let Some(count) = &replica {
                words.push("replica");
                words.push(count);
            }
            words.extend(specs.iter().map(String::as_str));
            words.push("force");
            self.checked(host, &volume.name, self.gluster(&words))
                .await
                .map(drop)
        })
    }

    fn volume_modify<'a>(
        &'a self,
        host: &'a str,
        name: &'a str,
        change: &'a VolumeModify,
    ) -> ExecFuture<'a, ()> {
        Box::pin(async move {
            let script = match change {
                VolumeModify::Start => self.gluster(&["volume", "start", name]),
                VolumeModify::Stop => self.gluster(&["volume", "stop", name, "force"]),
                VolumeModify::SetOptions(options) => {
                    let lines = self.option_lines(name, options);
                    if lines.is_empty() {
                        return Ok(());
                    }
                    lines.join(" && ")
                }
            };
            self.checked(host, name, script).await.map(drop)
        })
    }

    fn volume_info<'a>(&'a self, host: &'a str, name: &'a str) -> ExecFuture<'a, VolumeReport> {
        Box::pin(async move {
            let stdout = self
                .checked(host, name, self.gluster(&["volume", "info", name]))
                .await?;
            parse_volume_info(host, name, &stdout)
        })
    }

    fn volume_clone<'a>(
        &'a self,
        host: &'a str,
        request: &'a CloneRequest,
    ) -> ExecFuture<'a, VolumeReport> {
        Box::pin(self.clone_volume(host, request))
    }

    fn volume_replace_brick<'a>(
        &'a self,
        host: &'a str,
        request: &'a ReplaceBrickRequest,
    ) -> ExecFuture<'a, ()> {
        Box::pin(async move {
            let old = request.old.spec();
            let new = request.new.spec();
            let script = self.gluster(&[
                "volume",
                "replace-brick",
                &request.volume,
                &old,
                &new,
                "commit",
                "force",
            ]);
            self.checked(host, &request.volume, script).await.map(drop)
        })
    }

    fn block_volume_create<'a>(
        &'a self,
        host: &'a str,
        request: &'a BlockVolumeRequest,
    ) -> ExecFuture<'a, BlockConnection> {
        Box::pin(async move {
            let target = format!("{}/{}", request.hosting_volume, request.name);
            let ha = request.hosts.len().to_string();
            let hosts = request.hosts.join(",");
            let size = format!("{}GiB", request.size_gib);
            let mut words: Vec<&str> = vec![
                self.config.gluster_block_bin.as_str(),
                "create",
                target.as_str(),
                "ha",
                ha.as_str(),
            ];
            if request.auth {
                words.extend(["auth", "enable"]);
            }
            words.extend([
                "prealloc",
                "full",
                hosts.as_str(),
                size.as_str(),
                "--json",
            ]);
            let stdout = self.checked(host, &request.name, self.line(&words)).await?;
            parse_block_create(host, &stdout)
        })
    }

    fn block_volume_destroy<'a>(
        &'a self,
        host: &'a str,
        hosting_volume: &'a str,
        name: &'a str,
    ) -> ExecFuture<'a, ()> {
        Box::pin(async move {
            let target = format!("{hosting_volume}/{name}");
            let script = self.line(&[
                self.config.gluster_block_bin.as_str(),
                "delete",
                &target,
                "--json",
            ]);
            self.checked(host, name, script).await.map(drop)
        })
    }
}
