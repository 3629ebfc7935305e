// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A bounded group of per-instance tasks that always runs to completion.
//!
//! [`TaskGroup`] is used wherever the provisioner fans out one unit of work
//! per instance (push a config file, start a daemon, wait for an address).
//! The important property is what happens when one of those units fails:
//! the group does not return until *every* task it spawned has finished,
//! even though the caller will ultimately see only one error.  Remote
//! sessions and progress events belonging to the other tasks are therefore
//! always settled before the caller reacts to the failure.
//!
//! # Why not just use a JoinSet?
//!
//! A [JoinSet] aborts its tasks when it is dropped and has no limit on the
//! number of tasks running at once.  [`TaskGroup`] keeps the [JoinSet] for
//! the bookkeeping, bounds concurrency with a [Semaphore], and reports the
//! failure of the earliest-*spawned* task rather than whichever happened to
//! finish first, so error reporting does not depend on scheduling.

use futures::FutureExt;
use slog::debug;
use slog::o;
use slog::warn;
use slog::Logger;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// The default number of tasks allowed to run at once in a [`TaskGroup`].
pub const DEFAULT_MAX_PARALLELISM: usize = 16;

/// Describes why a task in a [`TaskGroup`] did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum TaskError<E> {
    #[error("task {name:?} failed")]
    Failed {
        name: String,
        #[source]
        error: E,
    },
    #[error("task {name:?} panicked: {message}")]
    Panicked { name: String, message: String },
}

impl<E> TaskError<E> {
    /// Returns the name the failing task was spawned with.
    pub fn task_name(&self) -> &str {
        match self {
            TaskError::Failed { name, .. } | TaskError::Panicked { name, .. } => {
                name
            }
        }
    }
}

enum Failure<E> {
    Error(E),
    Panic(String),
}

struct Completed<E> {
    index: usize,
    result: Result<(), Failure<E>>,
}

/// A collection of tokio tasks which execute in parallel, up to a maximum
/// amount of parallelism, and which are always joined as a unit.
///
/// Callers are expected to finish every group with [`TaskGroup::join`] or
/// [`TaskGroup::finish`].  Dropping a group with tasks outstanding aborts
/// them, which is exactly what this type exists to avoid.
#[must_use = "a TaskGroup must be joined for its tasks to be waited on"]
pub struct TaskGroup<E> {
    log: Logger,
    semaphore: Arc<Semaphore>,
    set: JoinSet<Completed<E>>,
    names: Vec<String>,
}

impl<E: Send + 'static> TaskGroup<E> {
    /// Creates a new group with [`DEFAULT_MAX_PARALLELISM`].
    pub fn new(log: &Logger, group_name: &str) -> TaskGroup<E> {
        Self::new_with_parallelism(log, group_name, DEFAULT_MAX_PARALLELISM)
    }

    /// Creates a new group allowing at most `max_parallelism` tasks to run
    /// at once.  A value of zero is treated as one.
    pub fn new_with_parallelism(
        log: &Logger,
        group_name: &str,
        max_parallelism: usize,
    ) -> TaskGroup<E> {
        let log = log.new(o!("task_group" => group_name.to_string()));
        let semaphore = Arc::new(Semaphore::new(max_parallelism.max(1)));
        TaskGroup { log, semaphore, set: JoinSet::new(), names: Vec::new() }
    }

    /// Number of tasks spawned so far.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Spawn a task immediately, but only allow it to execute once the group
    /// is within its parallelism constraint.
    pub fn spawn<F>(&mut self, name: impl Into<String>, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        let index = self.names.len();
        let name = name.into();
        debug!(self.log, "spawning task"; "task" => &name, "index" => index);
        self.names.push(name);

        let semaphore = Arc::clone(&self.semaphore);
        self.set.spawn(async move {
            // Hold onto the permit until the task finishes executing
            let permit =
                semaphore.acquire_owned().await.expect("semaphore acquire");
            let result = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(error)) => Err(Failure::Error(error)),
                Err(payload) => Err(Failure::Panic(panic_message(payload))),
            };
            drop(permit);
            Completed { index, result }
        });
    }

    /// Wait for every spawned task to finish.
    ///
    /// If any task failed, the failure of the task that was spawned first is
    /// returned; failures of later tasks are logged and dropped.
    pub async fn join(mut self) -> Result<(), TaskError<E>> {
        let mut first: Option<(usize, Failure<E>)> = None;
        let mut nfailed = 0;

        while let Some(joined) = self.set.join_next().await {
            let (index, failure) = match joined {
                Ok(Completed { result: Ok(()), .. }) => continue,
                Ok(Completed { index, result: Err(failure) }) => {
                    (index, failure)
                }
                // Tasks are never aborted and panics are caught inside the
                // task, so this only happens if the runtime is shutting down.
                Err(join_error) => {
                    (usize::MAX, Failure::Panic(join_error.to_string()))
                }
            };

            nfailed += 1;
            let name = self.task_name(index);
            warn!(self.log, "task failed"; "task" => name, "index" => index);
            match &first {
                Some((earliest, _)) if *earliest <= index => {}
                _ => first = Some((index, failure)),
            }
        }

        match first {
            None => {
                debug!(self.log, "all tasks completed";
                    "ntasks" => self.names.len());
                Ok(())
            }
            Some((index, failure)) => {
                warn!(self.log, "task group finished with failures";
                    "ntasks" => self.names.len(),
                    "nfailed" => nfailed,
                );
                let name = self.task_name(index).to_string();
                Err(match failure {
                    Failure::Error(error) => TaskError::Failed { name, error },
                    Failure::Panic(message) => {
                        TaskError::Panicked { name, message }
                    }
                })
            }
        }
    }

    /// Wait for every spawned task to finish, then report the outcome of the
    /// enclosing scope.
    ///
    /// `body` is the result of the code that spawned the tasks.  If it is an
    /// error, that error takes precedence over any task failure, but it is
    /// still only returned once all tasks have finished.
    pub async fn finish<T, E2>(self, body: Result<T, E2>) -> Result<T, E2>
    where
        E2: From<TaskError<E>>,
    {
        let joined = self.join().await;
        let value = body?;
        joined.map_err(E2::from)?;
        Ok(value)
    }

    fn task_name(&self, index: usize) -> &str {
        self.names.get(index).map(String::as_str).unwrap_or("<unknown>")
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("<non-string panic payload>")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use rand::Rng;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;
    use std::time::Duration;
    use trellis_test_utils::dev::test_setup_log;

    #[derive(Debug, PartialEq, thiserror::Error)]
    #[error("task {0} broke")]
    struct Broke(usize);

    #[tokio::test]
    async fn test_all_succeed() {
        let logctx = test_setup_log("test_all_succeed");
        let count = Arc::new(AtomicUsize::new(0));

        let mut group = TaskGroup::<Broke>::new(&logctx.log, "succeed");
        for i in 0..32 {
            let count = count.clone();
            group.spawn(format!("task-{i}"), async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        assert_eq!(group.len(), 32);
        group.join().await.expect("no task should fail");
        assert_eq!(count.load(Ordering::SeqCst), 32);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_failure_waits_for_every_task() {
        let logctx = test_setup_log("test_failure_waits_for_every_task");
        let finished = Arc::new(AtomicUsize::new(0));
        let ntasks = 8;
        let failing = 3;

        let mut group = TaskGroup::new(&logctx.log, "one-fails");
        for i in 0..ntasks {
            let finished = finished.clone();
            group.spawn(format!("task-{i}"), async move {
                // Tasks spawned after the failing one take longer, so the
                // failure lands well before they are done.
                if i > failing {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                finished.fetch_add(1, Ordering::SeqCst);
                if i == failing {
                    Err(Broke(i))
                } else {
                    Ok(())
                }
            });
        }

        let error = group.join().await.unwrap_err();
        assert_eq!(finished.load(Ordering::SeqCst), ntasks);
        assert_eq!(error.task_name(), "task-3");
        assert_matches!(error, TaskError::Failed { error: Broke(3), .. });
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_earliest_spawned_failure_wins() {
        let logctx = test_setup_log("test_earliest_spawned_failure_wins");

        let mut group = TaskGroup::new(&logctx.log, "ordering");
        for i in 0..5usize {
            group.spawn(format!("task-{i}"), async move {
                // The task spawned first fails last.
                let delay = 50 - (i as u64) * 10;
                tokio::time::sleep(Duration::from_millis(delay)).await;
                if i == 1 || i == 4 {
                    Err(Broke(i))
                } else {
                    Ok(())
                }
            });
        }

        let error = group.join().await.unwrap_err();
        assert_matches!(error, TaskError::Failed { error: Broke(1), .. });
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_body_error_takes_precedence() {
        let logctx = test_setup_log("test_body_error_takes_precedence");
        let finished = Arc::new(AtomicUsize::new(0));

        let mut group = TaskGroup::new(&logctx.log, "body");
        for i in 0..4usize {
            let finished = finished.clone();
            group.spawn(format!("task-{i}"), async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Err(Broke(i))
            });
        }

        #[derive(Debug, PartialEq)]
        enum Outer {
            Body,
            Task,
        }
        impl From<TaskError<Broke>> for Outer {
            fn from(_: TaskError<Broke>) -> Outer {
                Outer::Task
            }
        }

        let result: Result<(), Outer> = group.finish(Err(Outer::Body)).await;
        assert_eq!(result, Err(Outer::Body));
        assert_eq!(finished.load(Ordering::SeqCst), 4);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_panicking_task_is_reported() {
        let logctx = test_setup_log("test_panicking_task_is_reported");
        let finished = Arc::new(AtomicUsize::new(0));

        let mut group = TaskGroup::<Broke>::new(&logctx.log, "panics");
        group.spawn("explodes", async { panic!("kaboom") });
        for i in 0..3 {
            let finished = finished.clone();
            group.spawn(format!("task-{i}"), async move {
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let error = group.join().await.unwrap_err();
        assert_eq!(finished.load(Ordering::SeqCst), 3);
        assert_matches!(
            error,
            TaskError::Panicked { ref name, ref message }
                if name == "explodes" && message == "kaboom"
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let logctx = test_setup_log("test_parallelism_is_bounded");
        let task_limit = 4;
        let running = Arc::new(AtomicUsize::new(0));
        let high_water = Arc::new(Mutex::new(0usize));

        let mut group =
            TaskGroup::<Broke>::new_with_parallelism(&logctx.log, "bounded", task_limit);
        for i in 0..32 {
            let running = running.clone();
            let high_water = high_water.clone();
            group.spawn(format!("task-{i}"), async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                {
                    let mut high = high_water.lock().unwrap();
                    *high = (*high).max(now);
                }
                let delay = rand::thread_rng().gen_range(1..5);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }
        group.join().await.unwrap();

        let high = *high_water.lock().unwrap();
        assert!(high <= task_limit, "saw {high} tasks running at once");
        assert_eq!(running.load(Ordering::SeqCst), 0);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_empty_group() {
        let logctx = test_setup_log("test_empty_group");
        let group = TaskGroup::<Broke>::new(&logctx.log, "empty");
        assert!(group.is_empty());
        group.join().await.unwrap();
        logctx.cleanup_successful();
    }
}
