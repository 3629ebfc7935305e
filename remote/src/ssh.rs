// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A [`Transport`] built on the system `ssh` client

use crate::error::CommandFailureInfo;
use crate::Output;
use crate::RemoteError;
use crate::Session;
use crate::Transport;
use async_trait::async_trait;
use camino::Utf8PathBuf;
use serde::Deserialize;
use serde::Serialize;
use slog::o;
use slog::warn;
use slog::Logger;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use trellis_common::api::external::Instance;
use trellis_common::backoff::remote_connect_policy;
use trellis_common::backoff::retry_notify;
use trellis_common::backoff::BackoffError;

/// Exit status `ssh` uses for its own failures, as opposed to the remote
/// command's.
const SSH_ERROR_EXIT: i32 = 255;

/// How to reach instances over ssh
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SshConfig {
    pub ssh_binary: Utf8PathBuf,
    pub user: String,
    pub private_key: Option<Utf8PathBuf>,
    /// Bound on a single connection attempt
    pub connect_timeout: Duration,
    /// Bound on retrying connection attempts for one session
    pub max_connect_elapsed: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        SshConfig {
            ssh_binary: Utf8PathBuf::from("ssh"),
            user: String::from("root"),
            private_key: None,
            connect_timeout: Duration::from_secs(10),
            max_connect_elapsed: Duration::from_secs(60),
        }
    }
}

pub struct SshTransport {
    log: Logger,
    config: Arc<SshConfig>,
}

impl SshTransport {
    pub fn new(log: &Logger, config: SshConfig) -> Arc<SshTransport> {
        Arc::new(SshTransport {
            log: log.new(o!("component" => "SshTransport")),
            config: Arc::new(config),
        })
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(
        &self,
        instance: &Instance,
    ) -> Result<Box<dyn Session>, RemoteError> {
        let address = instance
            .management_ip
            .ok_or_else(|| RemoteError::NoAddress {
                instance: instance.name.clone(),
            })?
            .to_string();
        let session = SshSession {
            config: self.config.clone(),
            instance: instance.name.clone(),
            address,
        };

        // Instances may still be booting; keep trying to run a no-op until
        // ssh itself stops failing.
        let probe = || async {
            let output = session
                .run("true", false, None)
                .await
                .map_err(BackoffError::permanent)?;
            if output.exit_code == SSH_ERROR_EXIT {
                return Err(BackoffError::transient(RemoteError::Connect {
                    instance: session.instance.clone(),
                    message: output.stderr.trim_end().to_string(),
                }));
            }
            Ok(())
        };
        let log_failure = |error: RemoteError, delay: Duration| {
            warn!(self.log, "failed to connect; will retry";
                "instance" => &session.instance,
                "error" => %error,
                "retry_after" => ?delay,
            );
        };
        retry_notify(
            remote_connect_policy(self.config.max_connect_elapsed),
            probe,
            log_failure,
        )
        .await?;

        Ok(Box::new(session))
    }
}

struct SshSession {
    config: Arc<SshConfig>,
    instance: String,
    address: String,
}

/// Quote `s` for a POSIX shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn with_root(command: &str, as_root: bool) -> String {
    if as_root {
        format!("sudo sh -c {}", shell_quote(command))
    } else {
        command.to_string()
    }
}

impl SshSession {
    fn command(&self, remote_command: &str) -> Command {
        let mut cmd = Command::new(self.config.ssh_binary.as_str());
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.config.connect_timeout.as_secs().max(1)
            ));
        if let Some(key) = &self.config.private_key {
            cmd.arg("-i").arg(key.as_str());
        }
        cmd.arg(format!("{}@{}", self.config.user, self.address))
            .arg("--")
            .arg(remote_command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(
        &self,
        command: &str,
        as_root: bool,
        stdin: Option<&[u8]>,
    ) -> Result<Output, RemoteError> {
        let remote_command = with_root(command, as_root);
        let mut cmd = self.command(&remote_command);
        let transport_error = |err| RemoteError::Transport {
            instance: self.instance.clone(),
            operation: command.to_string(),
            err,
        };

        let output = match stdin {
            None => cmd.stdin(Stdio::null()).output().await,
            Some(data) => {
                let mut child =
                    cmd.stdin(Stdio::piped()).spawn().map_err(transport_error)?;
                if let Some(mut pipe) = child.stdin.take() {
                    pipe.write_all(data).await.map_err(transport_error)?;
                }
                child.wait_with_output().await
            }
        }
        .map_err(transport_error)?;

        Ok(Output {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn run_checked(
        &self,
        command: &str,
        as_root: bool,
        stdin: Option<&[u8]>,
    ) -> Result<Output, RemoteError> {
        let output = self.run(command, as_root, stdin).await?;
        if !output.is_success() {
            return Err(RemoteError::CommandFailed(Box::new(
                CommandFailureInfo {
                    instance: self.instance.clone(),
                    command: command.to_string(),
                    exit_code: output.exit_code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                },
            )));
        }
        Ok(output)
    }
}

#[async_trait]
impl Session for SshSession {
    async fn execute(
        &mut self,
        command: &str,
        as_root: bool,
    ) -> Result<Output, RemoteError> {
        self.run(command, as_root, None).await
    }

    async fn write_file(
        &mut self,
        path: &str,
        data: &[u8],
        as_root: bool,
    ) -> Result<(), RemoteError> {
        let command = format!("cat > {}", shell_quote(path));
        self.run_checked(&command, as_root, Some(data)).await.map(|_| ())
    }

    async fn append_file(
        &mut self,
        path: &str,
        data: &[u8],
        as_root: bool,
    ) -> Result<(), RemoteError> {
        let command = format!("cat >> {}", shell_quote(path));
        self.run_checked(&command, as_root, Some(data)).await.map(|_| ())
    }

    async fn read_file(
        &mut self,
        path: &str,
        as_root: bool,
    ) -> Result<Vec<u8>, RemoteError> {
        let command = format!("cat {}", shell_quote(path));
        let output = self.run_checked(&command, as_root, None).await?;
        Ok(output.stdout.into_bytes())
    }
}
