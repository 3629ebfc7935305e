// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cluster provisioning orchestration
//!
//! The [`Orchestrator`] drives clusters through creation, scaling and
//! termination.  It runs remote work on the cluster's instances through a
//! [`trellis_remote::RemoteExecutor`], leaves service-specific decisions to
//! a [`plugin::Plugin`], and records what happened, step by step, through
//! the [`progress::ProgressTracker`].
//!
//! Everything outside this process (the cloud, persistent storage, secret
//! storage, the job service) is reached through the traits in [`infra`],
//! [`db`], [`keystore`] and [`jobs`].  The [`sim`] module implements all of
//! them in memory.

pub mod config;
pub mod context;
pub mod db;
pub mod decommission;
pub mod infra;
pub mod jobs;
pub mod keystore;
mod orchestrator;
pub mod plugin;
pub mod progress;
pub mod sim;

pub use config::Config;
pub use orchestrator::OperationTicket;
pub use orchestrator::Orchestrator;
pub use orchestrator::Outcome;
pub use orchestrator::ScaleRequest;
