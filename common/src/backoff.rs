// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Module providing utilities for retrying operations with exponential backoff.

use std::time::Duration;

pub use ::backoff::future::{retry, retry_notify};
pub use ::backoff::Error as BackoffError;
pub use ::backoff::{backoff::Backoff, ExponentialBackoff, Notify};

/// Return a backoff policy for establishing a remote session with an
/// instance that may still be booting.
///
/// Unlike the internal service policies, this one gives up: after
/// `max_elapsed` the last transient error is returned to the caller.
pub fn remote_connect_policy(max_elapsed: Duration) -> ExponentialBackoff {
    const INITIAL_INTERVAL: Duration = Duration::from_millis(250);
    const MAX_INTERVAL: Duration = Duration::from_secs(10);
    let mut policy =
        internal_service_policy_with_max(INITIAL_INTERVAL, MAX_INTERVAL);
    policy.max_elapsed_time = Some(max_elapsed);
    policy
}

fn internal_service_policy_with_max(
    initial_interval: Duration,
    max_interval: Duration,
) -> ExponentialBackoff {
    let current_interval = initial_interval;
    ExponentialBackoff {
        current_interval,
        initial_interval,
        multiplier: 2.0,
        max_interval,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}
