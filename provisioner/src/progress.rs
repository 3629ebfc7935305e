// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisioning progress: steps and the events recorded against them
//!
//! A cluster's provisioning log is a sequence of *steps*, each a named phase
//! with an expected number of units, and the *events* that report how each
//! unit went.  The [`ProgressTracker`] maintains these invariants for every
//! cluster:
//!
//! * at most one step is open (`successful` unset) at any time;
//! * `completed` equals the number of successful events recorded for a step;
//! * a step fails as soon as any of its events reports failure, and its
//!   events are retained so the failure can be diagnosed;
//! * a step succeeds once `completed` reaches `total`, at which point its
//!   events are purged.
//!
//! Tracking is instrumentation.  None of the tracker's operations return an
//! error: if the cluster has been deleted, tracking is disabled, or the data
//! store fails, the operation logs and does nothing.
//!
//! All reads and writes for one cluster go through a per-cluster lock, so
//! events arriving concurrently from many per-instance tasks cannot lose
//! each other's updates.

use crate::db::DataStore;
use chrono::Utc;
use futures::FutureExt;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use slog_error_chain::InlineErrorChain;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use trellis_common::api::external::Error;
use trellis_common::api::external::EventInstance;
use trellis_common::api::external::Instance;
use trellis_common::api::external::ProvisionProgress;
use trellis_common::api::external::ProvisioningEvent;
use trellis_common::api::external::ProvisioningStep;
use trellis_common::api::external::StepProgress;
use trellis_common::typed_uuid::ClusterUuid;
use trellis_common::typed_uuid::EventUuid;
use trellis_common::typed_uuid::StepUuid;

/// Diagnostic attached to a step that was still open when the next one began
pub const SUPERSEDED_MESSAGE: &str =
    "step superseded before all of its units reported";

pub struct ProgressTracker {
    log: Logger,
    datastore: Arc<dyn DataStore>,
    enabled: bool,
    locks: Mutex<BTreeMap<ClusterUuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProgressTracker {
    pub fn new(
        log: &Logger,
        datastore: Arc<dyn DataStore>,
        disable_event_log: bool,
    ) -> ProgressTracker {
        let log = log.new(o!("component" => "ProgressTracker"));
        if disable_event_log {
            info!(log, "provisioning event log is disabled");
        }
        ProgressTracker {
            log,
            datastore,
            enabled: !disable_event_log,
            locks: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn cluster_lock(
        &self,
        cluster_id: ClusterUuid,
    ) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().unwrap().entry(cluster_id).or_default().clone()
    }

    /// Releases the lock bookkeeping for a deleted cluster.
    pub fn forget_cluster(&self, cluster_id: ClusterUuid) {
        self.locks.lock().unwrap().remove(&cluster_id);
    }

    /// Opens a new step for `cluster_id` and returns its id.
    ///
    /// A step that is still open is first resolved from its events, and if
    /// that does not close it, it is closed as failed.  Returns `None` when
    /// tracking is disabled or the cluster is gone.
    pub async fn open_step(
        &self,
        cluster_id: ClusterUuid,
        step_name: &str,
        total: usize,
    ) -> Option<StepUuid> {
        if !self.enabled {
            return None;
        }
        let lock = self.cluster_lock(cluster_id);
        let _guard = lock.lock().await;

        let log = self.log.new(o!(
            "cluster_id" => cluster_id.to_string(),
            "step" => step_name.to_string(),
        ));
        match self.open_step_locked(&log, cluster_id, step_name, total).await {
            Ok(id) => Some(id),
            Err(error) => {
                self.report(&log, "failed to open provisioning step", &error);
                None
            }
        }
    }

    async fn open_step_locked(
        &self,
        log: &Logger,
        cluster_id: ClusterUuid,
        step_name: &str,
        total: usize,
    ) -> Result<StepUuid, Error> {
        self.resolve_locked(cluster_id).await?;

        for mut step in self.datastore.step_list(cluster_id).await? {
            if !step.is_open() {
                continue;
            }
            warn!(log, "closing superseded step";
                "superseded" => &step.step_name,
                "completed" => step.completed,
                "total" => step.total,
            );
            self.datastore
                .event_create(ProvisioningEvent {
                    id: EventUuid::new_v4(),
                    step_id: step.id,
                    instance: None,
                    successful: false,
                    event_info: Some(SUPERSEDED_MESSAGE.to_string()),
                    time_created: Utc::now(),
                })
                .await?;
            step.successful = Some(false);
            step.completed_at = Some(Utc::now());
            self.datastore.step_update(&step).await?;
        }

        let now = Utc::now();
        let step = ProvisioningStep {
            id: StepUuid::new_v4(),
            cluster_id,
            step_name: step_name.to_string(),
            total,
            completed: 0,
            successful: if total == 0 { Some(true) } else { None },
            started_at: now,
            completed_at: if total == 0 { Some(now) } else { None },
        };
        let step = self.datastore.step_create(step).await?;
        debug!(log, "opened provisioning step";
            "step_id" => %step.id,
            "total" => total,
        );
        Ok(step.id)
    }

    /// Records one unit's outcome.
    ///
    /// The event is recorded against `step_id`, or against the cluster's
    /// open step if `step_id` is `None`.  An event for a step that already
    /// failed is still kept; one for a step that already succeeded is
    /// dropped.
    pub async fn record_event(
        &self,
        cluster_id: ClusterUuid,
        step_id: Option<StepUuid>,
        instance: Option<&Instance>,
        successful: bool,
        event_info: Option<String>,
    ) {
        if !self.enabled {
            return;
        }
        let lock = self.cluster_lock(cluster_id);
        let _guard = lock.lock().await;

        let log = self.log.new(o!("cluster_id" => cluster_id.to_string()));
        let result = self
            .record_event_locked(
                &log, cluster_id, step_id, instance, successful, event_info,
            )
            .await;
        if let Err(error) = result {
            self.report(&log, "failed to record provisioning event", &error);
        }
    }

    async fn record_event_locked(
        &self,
        log: &Logger,
        cluster_id: ClusterUuid,
        step_id: Option<StepUuid>,
        instance: Option<&Instance>,
        successful: bool,
        event_info: Option<String>,
    ) -> Result<(), Error> {
        let steps = self.datastore.step_list(cluster_id).await?;
        let step = match step_id {
            Some(id) => steps.iter().find(|s| s.id == id),
            None => steps.iter().rev().find(|s| s.is_open()),
        };
        let Some(step) = step else {
            debug!(log, "no step to record event against";
                "step_id" => ?step_id);
            return Ok(());
        };
        if step.successful == Some(true) {
            warn!(log, "dropping event for a step that already succeeded";
                "step" => &step.step_name);
            return Ok(());
        }

        if !successful {
            info!(log, "recording failure event";
                "step" => &step.step_name,
                "instance" => instance.map(|i| i.name.as_str()),
                "event_info" => event_info.as_deref(),
            );
        }
        self.datastore
            .event_create(ProvisioningEvent {
                id: EventUuid::new_v4(),
                step_id: step.id,
                instance: instance.map(|i| EventInstance {
                    instance_id: i.id,
                    instance_name: i.name.clone(),
                    node_group_id: i.node_group_id,
                }),
                successful,
                event_info,
                time_created: Utc::now(),
            })
            .await?;
        self.resolve_locked(cluster_id).await
    }

    /// Recomputes `completed` and `successful` for every step that has not
    /// yet succeeded.
    pub async fn resolve_open_steps(&self, cluster_id: ClusterUuid) {
        if !self.enabled {
            return;
        }
        let lock = self.cluster_lock(cluster_id);
        let _guard = lock.lock().await;
        if let Err(error) = self.resolve_locked(cluster_id).await {
            let log = self.log.new(o!("cluster_id" => cluster_id.to_string()));
            self.report(&log, "failed to resolve provisioning steps", &error);
        }
    }

    async fn resolve_locked(&self, cluster_id: ClusterUuid) -> Result<(), Error> {
        for mut step in self.datastore.step_list(cluster_id).await? {
            if step.successful == Some(true) {
                continue;
            }
            let events = self.datastore.event_list(step.id).await?;
            let completed = events.iter().filter(|e| e.successful).count();
            let failed = events.iter().any(|e| !e.successful);

            let successful = if failed {
                Some(false)
            } else if completed >= step.total {
                Some(true)
            } else {
                None
            };
            if completed == step.completed && successful == step.successful {
                continue;
            }

            step.completed = completed;
            if successful.is_some() && step.completed_at.is_none() {
                step.completed_at = Some(Utc::now());
            }
            step.successful = successful;
            self.datastore.step_update(&step).await?;
            if successful == Some(true) {
                self.datastore.event_purge(step.id).await?;
            }
        }
        Ok(())
    }

    /// Returns the cluster's open step, if any.
    pub async fn current_step(
        &self,
        cluster_id: ClusterUuid,
    ) -> Option<StepUuid> {
        if !self.enabled {
            return None;
        }
        let steps = self.datastore.step_list(cluster_id).await.ok()?;
        steps.iter().rev().find(|s| s.is_open()).map(|s| s.id)
    }

    /// Returns every step of the cluster with the events it still retains.
    pub async fn cluster_progress(
        &self,
        cluster_id: ClusterUuid,
    ) -> Result<ProvisionProgress, Error> {
        let lock = self.cluster_lock(cluster_id);
        let _guard = lock.lock().await;
        let mut steps = Vec::new();
        for step in self.datastore.step_list(cluster_id).await? {
            let events = self.datastore.event_list(step.id).await?;
            steps.push(StepProgress { step, events });
        }
        Ok(ProvisionProgress { steps })
    }

    /// Runs `fut` as one unit of work on `instance`, recording its outcome.
    ///
    /// A panic inside `fut` is recorded as a failure and then resumed.
    pub async fn track_instance<T, F>(
        &self,
        cluster_id: ClusterUuid,
        step_id: Option<StepUuid>,
        instance: &Instance,
        fut: F,
    ) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        self.track(cluster_id, step_id, Some(instance), fut).await
    }

    /// Runs `fut` as one cluster-wide unit of work, recording its outcome.
    pub async fn track_cluster<T, F>(
        &self,
        cluster_id: ClusterUuid,
        step_id: Option<StepUuid>,
        fut: F,
    ) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        self.track(cluster_id, step_id, None, fut).await
    }

    async fn track<T, F>(
        &self,
        cluster_id: ClusterUuid,
        step_id: Option<StepUuid>,
        instance: Option<&Instance>,
        fut: F,
    ) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(value)) => {
                self.record_event(cluster_id, step_id, instance, true, None)
                    .await;
                Ok(value)
            }
            Ok(Err(error)) => {
                let info = InlineErrorChain::new(&error).to_string();
                self.record_event(
                    cluster_id,
                    step_id,
                    instance,
                    false,
                    Some(info),
                )
                .await;
                Err(error)
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| String::from("unknown panic"));
                self.record_event(
                    cluster_id,
                    step_id,
                    instance,
                    false,
                    Some(format!("panicked: {}", message)),
                )
                .await;
                std::panic::resume_unwind(payload)
            }
        }
    }

    fn report(&self, log: &Logger, message: &str, error: &Error) {
        if error.is_not_found() {
            debug!(log, "{}: cluster is gone", message);
        } else {
            warn!(log, "{}", message; "error" => InlineErrorChain::new(error));
        }
    }
}
