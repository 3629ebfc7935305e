// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Remote command execution against cluster instances
//!
//! The provisioner never talks to an instance directly.  Every command and
//! file operation goes through a [`RemoteExecutor`], which opens a
//! [`Session`] from a [`Transport`] for the duration of one call (or one
//! batch of calls) and closes it again, even on error.  The executor also
//! bounds how many sessions may be open at once, both process-wide and per
//! cluster.
//!
//! - In production the transport is usually an [`SshTransport`].
//! - Under test a [`FakeTransport`] may be used, which records what was run
//!   and answers with scripted output.

mod error;
mod executor;
mod fake;
mod ssh;
mod transport;

pub use error::CommandFailureInfo;
pub use error::RemoteError;
pub use executor::ClusterRemote;
pub use executor::ExecOptions;
pub use executor::RemoteExecutor;
pub use executor::RemoteLimits;
pub use fake::CommandHandler;
pub use fake::FakeCommand;
pub use fake::FakeFileWrite;
pub use fake::FakeTransport;
pub use ssh::SshConfig;
pub use ssh::SshTransport;
pub use transport::Output;
pub use transport::Session;
pub use transport::Transport;
