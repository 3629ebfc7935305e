// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::RemoteError;
use async_trait::async_trait;
use trellis_common::api::external::Instance;

/// The result of a command that ran to completion on an instance
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Output {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success() -> Output {
        Output::default()
    }

    pub fn with_stdout(stdout: impl Into<String>) -> Output {
        Output { exit_code: 0, stdout: stdout.into(), stderr: String::new() }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Output {
        Output { exit_code, stdout: String::new(), stderr: stderr.into() }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Opens sessions to instances.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        instance: &Instance,
    ) -> Result<Box<dyn Session>, RemoteError>;
}

/// One open connection to an instance.
///
/// A session is owned by exactly one caller and is closed when dropped.
#[async_trait]
pub trait Session: Send {
    /// Runs `command`, returning its output regardless of exit code.
    async fn execute(
        &mut self,
        command: &str,
        as_root: bool,
    ) -> Result<Output, RemoteError>;

    /// Replaces the contents of `path` with `data`.
    async fn write_file(
        &mut self,
        path: &str,
        data: &[u8],
        as_root: bool,
    ) -> Result<(), RemoteError>;

    /// Appends `data` to `path`, creating it if needed.
    async fn append_file(
        &mut self,
        path: &str,
        data: &[u8],
        as_root: bool,
    ) -> Result<(), RemoteError>;

    async fn read_file(
        &mut self,
        path: &str,
        as_root: bool,
    ) -> Result<Vec<u8>, RemoteError>;
}
