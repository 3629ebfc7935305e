// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drives clusters through their lifecycle
//!
//! Every phase transition is persisted before the phase runs, and every
//! transition first checks that the cluster still exists and is not being
//! deleted.  A cluster deleted while an operation is in flight is not an
//! error: the operation stops at the next phase boundary and reports
//! [`Outcome::Abandoned`].  Remote work already dispatched runs to
//! completion.
//!
//! Creating and scaling a cluster take an [`OperationTicket`], so at most
//! one of them is outstanding per cluster.  Termination never waits for the
//! ticket.

mod create;
mod scale;
mod terminate;

pub use scale::ScaleRequest;

use crate::context::ProvisionContext;
use crate::context::Services;
use crate::context::WAIT_UNTIL_ACCESSIBLE_OPTION;
use crate::plugin::PluginRegistry;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use slog_error_chain::InlineErrorChain;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use trellis_common::api::external::Cluster;
use trellis_common::api::external::ClusterStatus;
use trellis_common::api::external::Error;
use trellis_common::api::external::Instance;
use trellis_common::api::external::LookupResult;
use trellis_common::api::external::ProvisionProgress;
use trellis_common::poll::PollOptions;
use trellis_common::typed_uuid::ClusterUuid;

/// How a lifecycle operation ended, when it did not fail
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Completed,
    /// The cluster was deleted while the operation was in flight.
    Abandoned,
}

/// Why a lifecycle operation stopped early
enum Stop {
    Abandoned,
    Failed(Error),
}

impl From<Error> for Stop {
    fn from(error: Error) -> Self {
        Stop::Failed(error)
    }
}

struct OrchestratorInner {
    log: Logger,
    services: Arc<Services>,
    registry: Arc<PluginRegistry>,
    /// clusters with a create or scale in flight
    busy: Mutex<BTreeSet<ClusterUuid>>,
}

/// Marks a cluster as having a lifecycle operation in flight until dropped
pub struct OperationTicket {
    id: ClusterUuid,
    inner: Arc<OrchestratorInner>,
    removed: bool,
}

impl OperationTicket {
    /// Idempotently releases the cluster for the next operation.
    pub fn release(&mut self) {
        if !self.removed {
            self.inner.busy.lock().unwrap().remove(&self.id);
            self.removed = true;
        }
    }
}

impl Drop for OperationTicket {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    pub fn new(
        log: &Logger,
        services: Arc<Services>,
        registry: Arc<PluginRegistry>,
    ) -> Orchestrator {
        Orchestrator {
            inner: Arc::new(OrchestratorInner {
                log: log.new(o!("component" => "Orchestrator")),
                services,
                registry,
                busy: Mutex::new(BTreeSet::new()),
            }),
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.inner.services
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.inner.registry
    }

    pub async fn cluster(&self, id: ClusterUuid) -> LookupResult<Cluster> {
        self.inner.services.datastore.cluster_get(id).await
    }

    /// Steps and retained events of a cluster's provisioning log.
    pub async fn cluster_progress(
        &self,
        id: ClusterUuid,
    ) -> Result<ProvisionProgress, Error> {
        self.inner.services.tracker.cluster_progress(id).await
    }

    /// Claims `id` for one lifecycle operation.
    pub fn acquire(
        &self,
        id: ClusterUuid,
        operation: &str,
    ) -> Result<OperationTicket, Error> {
        let mut busy = self.inner.busy.lock().unwrap();
        if !busy.insert(id) {
            return Err(Error::conflict(&format!(
                "cannot start {}: another operation is in progress on \
                 cluster {}",
                operation, id
            )));
        }
        Ok(OperationTicket { id, inner: self.inner.clone(), removed: false })
    }

    fn context(&self, id: ClusterUuid) -> ProvisionContext {
        ProvisionContext::new(self.inner.services.clone(), id)
    }

    /// Reloads the cluster, stopping if it is gone or being deleted.
    async fn still_exists(
        &self,
        ctx: &ProvisionContext,
    ) -> Result<Cluster, Stop> {
        match ctx.cluster().await {
            Ok(cluster) if cluster.status == ClusterStatus::Deleting => {
                Err(Stop::Abandoned)
            }
            Ok(cluster) => Ok(cluster),
            Err(error) if error.is_not_found() => Err(Stop::Abandoned),
            Err(error) => Err(Stop::Failed(error)),
        }
    }

    /// Persists the cluster's move into `status`.
    async fn transition(
        &self,
        ctx: &ProvisionContext,
        status: ClusterStatus,
        description: &str,
    ) -> Result<Cluster, Stop> {
        self.still_exists(ctx).await?;
        match self
            .inner
            .services
            .datastore
            .cluster_update_status(ctx.cluster_id(), status, description)
            .await
        {
            Ok(cluster) => {
                info!(ctx.log(), "cluster status changed";
                    "status" => %status,
                    "description" => description,
                );
                Ok(cluster)
            }
            // A concurrent terminate got there first.
            Err(error) if error.is_not_found() => Err(Stop::Abandoned),
            Err(Error::Conflict { .. }) => Err(Stop::Abandoned),
            Err(error) => Err(Stop::Failed(error)),
        }
    }

    /// Closes out a lifecycle operation.
    ///
    /// A failure moves the cluster to `Error`, with the error chain as its
    /// status description, unless the cluster went away in the meantime.
    async fn finish(
        &self,
        ctx: &ProvisionContext,
        operation: &str,
        result: Result<(), Stop>,
    ) -> Result<Outcome, Error> {
        let tracker = &self.inner.services.tracker;
        let error = match result {
            Ok(()) => {
                tracker.resolve_open_steps(ctx.cluster_id()).await;
                info!(ctx.log(), "{} complete", operation);
                return Ok(Outcome::Completed);
            }
            Err(Stop::Abandoned) => {
                info!(ctx.log(), "cluster was deleted; abandoning {}", operation);
                return Ok(Outcome::Abandoned);
            }
            Err(Stop::Failed(error)) => error,
        };

        if let Err(Stop::Abandoned) = self.still_exists(ctx).await {
            info!(ctx.log(), "cluster was deleted; abandoning {}", operation;
                "error" => InlineErrorChain::new(&error));
            return Ok(Outcome::Abandoned);
        }
        tracker.resolve_open_steps(ctx.cluster_id()).await;
        warn!(ctx.log(), "{} failed", operation;
            "error" => InlineErrorChain::new(&error));
        let description = InlineErrorChain::new(&error).to_string();
        match self
            .inner
            .services
            .datastore
            .cluster_record_failure(ctx.cluster_id(), &description)
            .await
        {
            Ok(_) => (),
            // A terminate started after the check above.
            Err(update_error)
                if update_error.is_not_found()
                    || matches!(update_error, Error::Conflict { .. }) =>
            {
                info!(ctx.log(), "cluster was deleted; abandoning {}", operation;
                    "error" => InlineErrorChain::new(&error));
                return Ok(Outcome::Abandoned);
            }
            Err(update_error) => {
                warn!(ctx.log(), "failed to record cluster error";
                    "error" => InlineErrorChain::new(&update_error));
            }
        }
        Err(error)
    }

    /// Persists instances created by `create` as one step, recording an
    /// event per instance.
    ///
    /// If `cluster` is deleted while the instances are being created, the
    /// terminate has already shut down everything it knew about, so the
    /// late arrivals are released here before abandoning.
    async fn spawn_instances<Fut>(
        &self,
        ctx: &ProvisionContext,
        cluster: &Cluster,
        expected: usize,
        create: Fut,
    ) -> Result<Vec<Instance>, Stop>
    where
        Fut: Future<Output = Result<Vec<Instance>, Error>>,
    {
        let services = &self.inner.services;
        let cluster_id = ctx.cluster_id();
        let step_id = ctx.open_step("Spawning instances", expected).await;
        let instances = match create.await {
            Ok(instances) => instances,
            Err(error) => {
                let info = InlineErrorChain::new(&error).to_string();
                services
                    .tracker
                    .record_event(cluster_id, step_id, None, false, Some(info))
                    .await;
                return Err(Stop::Failed(error));
            }
        };
        match self.still_exists(ctx).await {
            Ok(_) => (),
            Err(Stop::Abandoned) => {
                self.release_instances(ctx, cluster, &instances).await;
                return Err(Stop::Abandoned);
            }
            Err(stop) => return Err(stop),
        }
        for instance in &instances {
            if let Err(error) =
                services.datastore.instance_add(cluster_id, instance.clone()).await
            {
                if error.is_not_found() {
                    self.release_instances(ctx, cluster, &instances).await;
                    return Err(Stop::Abandoned);
                }
                let info = InlineErrorChain::new(&error).to_string();
                services
                    .tracker
                    .record_event(
                        cluster_id,
                        step_id,
                        Some(instance),
                        false,
                        Some(info),
                    )
                    .await;
                return Err(Stop::Failed(error));
            }
            services
                .tracker
                .record_event(cluster_id, step_id, Some(instance), true, None)
                .await;
        }
        info!(ctx.log(), "instances spawned"; "count" => instances.len());
        Ok(instances)
    }

    /// Deletes instances that were created for a cluster that no longer
    /// wants them.  Failures are logged.
    async fn release_instances(
        &self,
        ctx: &ProvisionContext,
        cluster: &Cluster,
        instances: &[Instance],
    ) {
        if instances.is_empty() {
            return;
        }
        info!(ctx.log(), "releasing instances created for a deleted cluster";
            "count" => instances.len());
        if let Err(error) =
            self.inner.services.infra.delete_instances(cluster, instances).await
        {
            warn!(ctx.log(), "failed to release instances";
                "error" => InlineErrorChain::new(&error));
        }
    }

    /// Waits until every instance answers over the remote transport.
    async fn await_instances(
        &self,
        ctx: &ProvisionContext,
        instances: &[Instance],
    ) -> Result<(), Stop> {
        let options = PollOptions::new(
            "Wait for instance accessibility",
            ctx.timeouts().wait_until_accessible(),
            ctx.timeouts().default_poll_interval(),
        )
        .with_timeout_option(WAIT_UNTIL_ACCESSIBLE_OPTION);
        let options = Arc::new(options);
        ctx.for_each_instance(
            "Wait for instance accessibility",
            instances,
            |ctx, instance| {
                let options = options.clone();
                async move {
                    ctx.remote().await_accessible(&instance, &options).await
                }
            },
        )
        .await?;
        Ok(())
    }

    /// Hands pending job executions to the job manager.  Failures are
    /// logged; the cluster is active either way.
    async fn resume_pending_jobs(&self, ctx: &ProvisionContext) {
        let jobs = &self.inner.services.jobs;
        let pending = match jobs.pending_executions(ctx.cluster_id()).await {
            Ok(pending) => pending,
            Err(error) => {
                warn!(ctx.log(), "failed to list pending job executions";
                    "error" => InlineErrorChain::new(&error));
                return;
            }
        };
        for execution_id in pending {
            match jobs.run_execution(ctx.cluster_id(), execution_id).await {
                Ok(()) => info!(ctx.log(), "resumed job execution";
                    "execution_id" => execution_id.to_string()),
                Err(error) => warn!(ctx.log(), "failed to resume job execution";
                    "execution_id" => execution_id.to_string(),
                    "error" => InlineErrorChain::new(&error),
                ),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::test_config;
    use crate::sim::SimEnvironment;
    use assert_matches::assert_matches;
    use trellis_test_utils::dev::test_setup_log;

    #[tokio::test]
    async fn test_ticket_conflict() {
        let logctx = test_setup_log("test_ticket_conflict");
        let env = SimEnvironment::new(&logctx.log, &test_config()).unwrap();
        let id = ClusterUuid::new_v4();

        let mut ticket = env.orchestrator.acquire(id, "provision").unwrap();
        assert_matches!(
            env.orchestrator.acquire(id, "scale").map(|_| ()),
            Err(Error::Conflict { .. })
        );
        // Other clusters are unaffected.
        let _other =
            env.orchestrator.acquire(ClusterUuid::new_v4(), "scale").unwrap();

        ticket.release();
        ticket.release();
        let ticket = env.orchestrator.acquire(id, "scale").unwrap();
        drop(ticket);
        env.orchestrator.acquire(id, "scale").unwrap();
        logctx.cleanup_successful();
    }
}
