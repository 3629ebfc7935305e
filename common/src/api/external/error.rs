// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling facilities for the provisioning engine

use super::ResourceType;
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use std::time::Duration;
use trellis_task_group::TaskError;
use uuid::Uuid;

/// An error that can be generated while driving a cluster through its
/// lifecycle
///
/// These may be generated by the orchestrator itself, by a plugin, or by one
/// of the collaborators (infrastructure, remote transport, data store).  The
/// variants are kinds, not sources: a plugin that finds the wrong number of
/// namenodes and the orchestrator that finds a bad scale request both report
/// their problem with the variant that describes it.
#[derive(Clone, Debug, Deserialize, thiserror::Error, PartialEq, Serialize)]
pub enum Error {
    /// An object needed as part of this operation was not found.
    #[error("Object (of type {lookup_type:?}) not found: {type_name}")]
    ObjectNotFound { type_name: ResourceType, lookup_type: LookupType },
    /// An object already exists with the specified name or identifier.
    #[error("Object (of type {type_name:?}) already exists: {object_name}")]
    ObjectAlreadyExists { type_name: ResourceType, object_name: String },
    /// The request was well-formed, but the operation cannot be completed given
    /// the current state of the system.
    #[error("Invalid Request: {message}")]
    InvalidRequest { message: String },
    /// Another lifecycle operation is already outstanding on the cluster.
    #[error("Conflict: {message}")]
    Conflict { message: String },
    /// A plugin rejected the cluster (or the requested change to it).
    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
    /// A poll exceeded its configured bound.
    #[error("{}", timeout_message(.operation, .timeout, .option))]
    Timeout {
        timeout: Duration,
        operation: Option<String>,
        option: Option<String>,
    },
    /// A remote command returned non-zero.
    #[error(
        "Remote command failed on {instance}: {command:?} \
         (exit code {exit_code}): {stderr}"
    )]
    RemoteExecution {
        instance: String,
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    /// A plugin option or process configuration value is unusable.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The system encountered an unhandled operational error.
    #[error("Internal Error: {internal_message}")]
    InternalError { internal_message: String },
    /// The system (or part of it) is unavailable.
    #[error("Service Unavailable: {internal_message}")]
    ServiceUnavailable { internal_message: String },
}

fn timeout_message(
    operation: &Option<String>,
    timeout: &Duration,
    option: &Option<String>,
) -> String {
    let mut message = match operation {
        Some(operation) => format!("'{}' timed out", operation),
        None => String::from("Operation timed out"),
    };
    message.push_str(&format!(" after {} second(s)", timeout.as_secs()));
    if let Some(option) = option {
        message.push_str(&format!(" (configuration option: '{}')", option));
    }
    message
}

/// Indicates how an object was looked up (for an `ObjectNotFound` error)
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum LookupType {
    /// a specific name was requested
    ByName(String),
    /// a specific id was requested
    ById(Uuid),
}

impl LookupType {
    /// Returns an ObjectNotFound error appropriate for the case where this
    /// lookup failed
    pub fn into_not_found(self, type_name: ResourceType) -> Error {
        Error::ObjectNotFound { type_name, lookup_type: self }
    }
}

impl From<&str> for LookupType {
    fn from(name: &str) -> Self {
        LookupType::ByName(name.to_owned())
    }
}

impl From<Uuid> for LookupType {
    fn from(uuid: Uuid) -> Self {
        LookupType::ById(uuid)
    }
}

impl Error {
    /// Returns whether the error is likely transient and could reasonably be
    /// retried
    pub fn retryable(&self) -> bool {
        match self {
            Error::ServiceUnavailable { .. } => true,

            Error::ObjectNotFound { .. }
            | Error::ObjectAlreadyExists { .. }
            | Error::InvalidRequest { .. }
            | Error::Conflict { .. }
            | Error::ValidationFailed { .. }
            | Error::Timeout { .. }
            | Error::RemoteExecution { .. }
            | Error::Configuration { .. }
            | Error::InternalError { .. } => false,
        }
    }

    /// Returns whether this error reports that some object is gone.  The
    /// orchestrator uses this to tell a concurrent delete apart from a real
    /// failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ObjectNotFound { .. })
    }

    /// Generates an [`Error::ObjectNotFound`] error for a lookup by object id.
    pub fn not_found_by_id(type_name: ResourceType, id: &Uuid) -> Error {
        LookupType::ById(*id).into_not_found(type_name)
    }

    /// Generates an [`Error::ObjectNotFound`] error for a lookup by object
    /// name.
    pub fn not_found_by_name(type_name: ResourceType, name: &str) -> Error {
        LookupType::from(name).into_not_found(type_name)
    }

    /// Generates an [`Error::InternalError`] error with the specific message
    ///
    /// InternalError should be used for operational conditions that should not
    /// happen but that we cannot reasonably handle at runtime.
    pub fn internal_error(internal_message: &str) -> Error {
        Error::InternalError { internal_message: internal_message.to_owned() }
    }

    /// Generates an [`Error::InvalidRequest`] error with the specific message
    pub fn invalid_request(message: &str) -> Error {
        Error::InvalidRequest { message: message.to_owned() }
    }

    /// Generates an [`Error::Conflict`] error with the specific message
    pub fn conflict(message: &str) -> Error {
        Error::Conflict { message: message.to_owned() }
    }

    /// Generates an [`Error::ValidationFailed`] error with the specific
    /// message
    pub fn validation(message: impl Into<String>) -> Error {
        Error::ValidationFailed { message: message.into() }
    }

    /// Generates an [`Error::Configuration`] error with the specific message
    pub fn configuration(message: impl Into<String>) -> Error {
        Error::Configuration { message: message.into() }
    }

    /// Generates an [`Error::ServiceUnavailable`] error with the specific
    /// message
    ///
    /// This should be used for transient failures where the caller might be
    /// expected to retry.
    pub fn unavail(message: &str) -> Error {
        Error::ServiceUnavailable { internal_message: message.to_owned() }
    }

    /// Given an [`Error`] with an internal message, return the same error with
    /// `context` prepended to it to provide more context
    ///
    /// If the error has no internal message, then it is returned unchanged.
    pub fn internal_context<C>(self, context: C) -> Error
    where
        C: Display + Send + Sync + 'static,
    {
        match self {
            Error::ObjectNotFound { .. }
            | Error::ObjectAlreadyExists { .. }
            | Error::InvalidRequest { .. }
            | Error::Conflict { .. }
            | Error::ValidationFailed { .. }
            | Error::Timeout { .. }
            | Error::RemoteExecution { .. } => self,
            Error::Configuration { message } => Error::Configuration {
                message: format!("{}: {}", context, message),
            },
            Error::InternalError { internal_message } => Error::InternalError {
                internal_message: format!("{}: {}", context, internal_message),
            },
            Error::ServiceUnavailable { internal_message } => {
                Error::ServiceUnavailable {
                    internal_message: format!(
                        "{}: {}",
                        context, internal_message
                    ),
                }
            }
        }
    }
}

impl From<TaskError<Error>> for Error {
    /// A failed task surfaces as its own error so the kind (timeout, remote
    /// failure, ...) survives the fan-out.
    fn from(error: TaskError<Error>) -> Error {
        match error {
            TaskError::Failed { error, .. } => error,
            TaskError::Panicked { name, message } => Error::InternalError {
                internal_message: format!(
                    "task {:?} panicked: {}",
                    name, message
                ),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::Error;
    use super::ResourceType;
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn test_timeout_message_names_option() {
        let error = Error::Timeout {
            timeout: Duration::from_secs(300),
            operation: Some(String::from("Wait for decommissioning")),
            option: Some(String::from("NodeManagers decommissioning timeout")),
        };
        assert_eq!(
            error.to_string(),
            "'Wait for decommissioning' timed out after 300 second(s) \
             (configuration option: 'NodeManagers decommissioning timeout')"
        );

        let error = Error::Timeout {
            timeout: Duration::from_secs(5),
            operation: None,
            option: None,
        };
        assert_eq!(error.to_string(), "Operation timed out after 5 second(s)");
    }

    #[test]
    fn test_internal_context() {
        let error = Error::internal_error("boom").internal_context("starting");
        assert_eq!(error.to_string(), "Internal Error: starting: boom");

        let id = Uuid::new_v4();
        let error = Error::not_found_by_id(ResourceType::Cluster, &id);
        assert!(error.is_not_found());
        assert_eq!(error.clone().internal_context("ignored"), error);
    }

    #[test]
    fn test_retryable() {
        assert!(Error::unavail("busy").retryable());
        assert!(!Error::validation("two namenodes").retryable());
        assert!(!Error::conflict("scaling").retryable());
    }
}
