// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities for polling for a condition
//!
//! Much of provisioning consists of asking a remote service whether it has
//! caught up yet: are all the datanodes live, has the nodemanager drained,
//! does the new VM answer on its management address.  [`wait_for_condition`]
//! is the primitive loop; [`poll`] layers on the operation and option names
//! used in error reports and the policy for checks that return an error.
//!
//! A timeout only stops the *waiting*.  Whatever the check is observing
//! keeps going.

use crate::api::external::Error as ApiError;
use slog::debug;
use slog::warn;
use slog::Logger;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Result of one evaluation of a condition
#[derive(Debug, Error)]
pub enum CondCheckError<E> {
    /// the condition we're waiting for is not true
    #[error("poll condition not yet ready")]
    NotYet,
    /// stop polling because we've encountered a non-retryable error
    #[error("non-retryable error while polling on condition")]
    Failed(#[from] E),
}

/// Result of [`wait_for_condition`]
#[derive(Debug, Error)]
pub enum Error<E> {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("{0}")]
    PermanentError(E),
}

/// Poll the given closure until it succeeds, returns a permanent error, or
/// a given time has expired
///
/// The condition is always evaluated at least once, even when `poll_max` is
/// zero: a misconfigured timeout should not hide a condition that already
/// holds.  Between evaluations the loop sleeps for `poll_interval`; that
/// sleep and the condition itself are the only places the loop yields.
pub async fn wait_for_condition<O, E, Func, Fut>(
    mut cond: Func,
    poll_interval: &Duration,
    poll_max: &Duration,
) -> Result<O, Error<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
{
    let poll_start = Instant::now();
    loop {
        match cond().await {
            Ok(output) => return Ok(output),
            Err(CondCheckError::Failed(e)) => {
                return Err(Error::PermanentError(e));
            }
            Err(CondCheckError::NotYet) => (),
        }

        let duration = Instant::now().duration_since(poll_start);
        if duration >= *poll_max {
            return Err(Error::TimedOut(duration));
        }

        tokio::time::sleep(*poll_interval).await;
    }
}

/// What [`poll`] does when the check itself returns an error
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OnCheckError {
    /// Stop polling and return the error.
    Fail,
    /// Treat the error as the condition being met.  Used where the object
    /// disappearing is itself the thing being waited for.
    Succeed,
    /// Log the error and keep polling.
    Retry,
}

/// Describes one poll: what it is called, how long it may take, and which
/// configuration option bounds it
#[derive(Clone, Debug)]
pub struct PollOptions {
    pub operation: String,
    pub timeout: Duration,
    pub interval: Duration,
    /// Name of the configuration option that set `timeout`, reported on
    /// timeout so operators know what to tune
    pub timeout_option: Option<String>,
    pub on_error: OnCheckError,
}

impl PollOptions {
    pub fn new(
        operation: impl Into<String>,
        timeout: Duration,
        interval: Duration,
    ) -> PollOptions {
        PollOptions {
            operation: operation.into(),
            timeout,
            interval,
            timeout_option: None,
            on_error: OnCheckError::Fail,
        }
    }

    pub fn with_timeout_option(mut self, option: impl Into<String>) -> Self {
        self.timeout_option = Some(option.into());
        self
    }

    pub fn on_error(mut self, on_error: OnCheckError) -> Self {
        self.on_error = on_error;
        self
    }
}

/// Result of [`poll`]
#[derive(Debug, Error)]
pub enum PollError<E> {
    #[error("'{operation}' timed out after {timeout:?}")]
    TimedOut {
        operation: String,
        timeout: Duration,
        timeout_option: Option<String>,
    },
    #[error("'{operation}' failed")]
    Check {
        operation: String,
        #[source]
        error: E,
    },
}

impl From<PollError<ApiError>> for ApiError {
    fn from(error: PollError<ApiError>) -> ApiError {
        match error {
            PollError::TimedOut { operation, timeout, timeout_option } => {
                ApiError::Timeout {
                    timeout,
                    operation: Some(operation),
                    option: timeout_option,
                }
            }
            PollError::Check { error, .. } => error,
        }
    }
}

/// Repeatedly evaluate `check` until it returns `true` or `options.timeout`
/// elapses
///
/// Errors from `check` are handled as `options.on_error` says.
pub async fn poll<E, Func, Fut>(
    log: &Logger,
    options: &PollOptions,
    mut check: Func,
) -> Result<(), PollError<E>>
where
    E: std::fmt::Display,
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let on_error = options.on_error;
    let mut attempts: u64 = 0;
    let result = wait_for_condition(
        || {
            attempts += 1;
            let fut = check();
            async move {
                match fut.await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(CondCheckError::NotYet),
                    Err(error) => match on_error {
                        OnCheckError::Fail => Err(CondCheckError::Failed(error)),
                        OnCheckError::Succeed => Ok(()),
                        OnCheckError::Retry => {
                            warn!(log, "poll check failed, retrying";
                                "operation" => &options.operation,
                                "error" => %error,
                            );
                            Err(CondCheckError::NotYet)
                        }
                    },
                }
            }
        },
        &options.interval,
        &options.timeout,
    )
    .await;

    match result {
        Ok(()) => {
            debug!(log, "poll condition met";
                "operation" => &options.operation,
                "attempts" => attempts,
            );
            Ok(())
        }
        Err(Error::TimedOut(elapsed)) => {
            warn!(log, "poll timed out";
                "operation" => &options.operation,
                "timeout" => ?options.timeout,
                "elapsed" => ?elapsed,
                "attempts" => attempts,
            );
            Err(PollError::TimedOut {
                operation: options.operation.clone(),
                timeout: options.timeout,
                timeout_option: options.timeout_option.clone(),
            })
        }
        Err(Error::PermanentError(error)) => Err(PollError::Check {
            operation: options.operation.clone(),
            error,
        }),
    }
}
