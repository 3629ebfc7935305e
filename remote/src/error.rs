// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;
use trellis_common::api::external::Error as ApiError;

/// Details about a remote command that ran but did not succeed
#[derive(Debug, Clone, PartialEq)]
pub struct CommandFailureInfo {
    pub instance: String,
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl std::fmt::Display for CommandFailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "command [{}] on {} exited with {}",
            self.command, self.instance, self.exit_code
        )?;
        if !self.stderr.is_empty() {
            write!(f, ": {}", self.stderr.trim_end())?;
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RemoteError {
    #[error("{0}")]
    CommandFailed(Box<CommandFailureInfo>),

    #[error("failed to connect to {instance}: {message}")]
    Connect { instance: String, message: String },

    #[error("transport error on {instance} during [{operation}]")]
    Transport {
        instance: String,
        operation: String,
        #[source]
        err: std::io::Error,
    },

    #[error("command [{command}] on {instance} did not finish within {timeout:?}")]
    Timeout { instance: String, command: String, timeout: Duration },

    #[error("instance {instance} has no management address")]
    NoAddress { instance: String },
}

impl RemoteError {
    /// Returns whether a new session might succeed where this one failed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Connect { .. })
    }
}

impl From<RemoteError> for ApiError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::CommandFailed(info) => {
                let CommandFailureInfo {
                    instance,
                    command,
                    exit_code,
                    stdout,
                    stderr,
                } = *info;
                ApiError::RemoteExecution {
                    instance,
                    command,
                    exit_code,
                    stdout,
                    stderr,
                }
            }
            RemoteError::Transport { instance, operation, err } => {
                ApiError::RemoteExecution {
                    instance,
                    command: operation,
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: err.to_string(),
                }
            }
            RemoteError::Timeout { instance, command, timeout } => {
                ApiError::Timeout {
                    timeout,
                    operation: Some(format!(
                        "remote command [{}] on {}",
                        command, instance
                    )),
                    option: None,
                }
            }
            err @ RemoteError::Connect { .. } => {
                ApiError::unavail(&err.to_string())
            }
            err @ RemoteError::NoAddress { .. } => {
                ApiError::internal_error(&err.to_string())
            }
        }
    }
}
