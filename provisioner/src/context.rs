// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared collaborators and the per-cluster context handed to plugins

use crate::config::Config;
use crate::config::DecommissionConfig;
use crate::config::ProvisioningConfig;
use crate::config::TimeoutsConfig;
use crate::db::DataStore;
use crate::infra::Infrastructure;
use crate::jobs::JobManager;
use crate::keystore::KeyStore;
use crate::plugin::PluginOption;
use crate::progress::ProgressTracker;
use slog::debug;
use slog::o;
use slog::Logger;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use trellis_common::api::external::Cluster;
use trellis_common::api::external::Error;
use trellis_common::api::external::Instance;
use trellis_common::api::external::LookupResult;
use trellis_common::poll;
use trellis_common::poll::PollOptions;
use trellis_common::typed_uuid::ClusterUuid;
use trellis_common::typed_uuid::StepUuid;
use trellis_remote::ClusterRemote;
use trellis_remote::RemoteExecutor;
use trellis_task_group::TaskGroup;

/// Option name reported when waiting for instance accessibility times out
pub const WAIT_UNTIL_ACCESSIBLE_OPTION: &str = "wait_until_accessible_secs";

/// Option name reported when instance deletion times out
pub const DELETE_INSTANCES_OPTION: &str = "delete_instances_secs";

/// Every collaborator the orchestrator and plugins use
pub struct Services {
    pub log: Logger,
    pub datastore: Arc<dyn DataStore>,
    pub tracker: ProgressTracker,
    pub remote: RemoteExecutor,
    pub infra: Arc<dyn Infrastructure>,
    pub keystore: Arc<dyn KeyStore>,
    pub jobs: Arc<dyn JobManager>,
    pub provisioning: ProvisioningConfig,
    pub timeouts: TimeoutsConfig,
    pub decommission: DecommissionConfig,
}

impl Services {
    pub fn new(
        log: &Logger,
        config: &Config,
        datastore: Arc<dyn DataStore>,
        remote: RemoteExecutor,
        infra: Arc<dyn Infrastructure>,
        keystore: Arc<dyn KeyStore>,
        jobs: Arc<dyn JobManager>,
    ) -> Services {
        let tracker = ProgressTracker::new(
            log,
            datastore.clone(),
            config.provisioning.disable_event_log,
        );
        Services {
            log: log.clone(),
            datastore,
            tracker,
            remote,
            infra,
            keystore,
            jobs,
            provisioning: config.provisioning.clone(),
            timeouts: config.timeouts.clone(),
            decommission: config.decommission.clone(),
        }
    }
}

/// Everything an operation on one cluster needs
///
/// Cheap to clone; per-instance tasks each get their own copy.
#[derive(Clone)]
pub struct ProvisionContext {
    services: Arc<Services>,
    cluster_id: ClusterUuid,
    log: Logger,
}

impl ProvisionContext {
    pub fn new(
        services: Arc<Services>,
        cluster_id: ClusterUuid,
    ) -> ProvisionContext {
        let log =
            services.log.new(o!("cluster_id" => cluster_id.to_string()));
        ProvisionContext { services, cluster_id, log }
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn cluster_id(&self) -> ClusterUuid {
        self.cluster_id
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn keystore(&self) -> &Arc<dyn KeyStore> {
        &self.services.keystore
    }

    pub fn timeouts(&self) -> &TimeoutsConfig {
        &self.services.timeouts
    }

    /// Remote operations on this cluster's instances.
    pub fn remote(&self) -> ClusterRemote {
        self.services.remote.cluster(self.cluster_id)
    }

    /// Reloads the cluster record.
    pub async fn cluster(&self) -> LookupResult<Cluster> {
        self.services.datastore.cluster_get(self.cluster_id).await
    }

    pub async fn cluster_exists(&self) -> bool {
        self.services.datastore.cluster_exists(self.cluster_id).await
    }

    pub async fn open_step(
        &self,
        step_name: &str,
        total: usize,
    ) -> Option<StepUuid> {
        self.services.tracker.open_step(self.cluster_id, step_name, total).await
    }

    /// Runs `f` for every instance in parallel as one provisioning step.
    ///
    /// Each instance's outcome is recorded as an event of the step.  Returns
    /// once every task has finished, with the error of the earliest-started
    /// task that failed.
    pub async fn for_each_instance<F, Fut>(
        &self,
        step_name: &str,
        instances: &[Instance],
        f: F,
    ) -> Result<(), Error>
    where
        F: Fn(ProvisionContext, Instance) -> Fut,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let step_id = self.open_step(step_name, instances.len()).await;
        let mut group = TaskGroup::new_with_parallelism(
            &self.log,
            step_name,
            self.services.provisioning.max_parallel_instance_tasks,
        );
        for instance in instances {
            let work = f(self.clone(), instance.clone());
            let services = self.services.clone();
            let cluster_id = self.cluster_id;
            let instance = instance.clone();
            group.spawn(instance.name.clone(), async move {
                services
                    .tracker
                    .track_instance(cluster_id, step_id, &instance, work)
                    .await
            });
        }
        group.join().await.map_err(Error::from)
    }

    /// Runs `fut` as a one-unit, cluster-wide provisioning step.
    pub async fn run_cluster_step<T, Fut>(
        &self,
        step_name: &str,
        fut: Fut,
    ) -> Result<T, Error>
    where
        Fut: Future<Output = Result<T, Error>>,
    {
        let step_id = self.open_step(step_name, 1).await;
        self.services.tracker.track_cluster(self.cluster_id, step_id, fut).await
    }

    /// Poll options bounded by the configured defaults.
    pub fn default_poll_options(&self, operation: &str) -> PollOptions {
        PollOptions::new(
            operation,
            self.services.timeouts.default_poll_timeout(),
            self.services.timeouts.default_poll_interval(),
        )
    }

    /// Polls `check` until it returns `true`, as `options` describe.
    pub async fn poll<F, Fut>(
        &self,
        options: &PollOptions,
        check: F,
    ) -> Result<(), Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, Error>>,
    {
        poll::poll(&self.log, options, check).await.map_err(Error::from)
    }

    /// Resolves a plugin option for `cluster`.
    ///
    /// The cluster's own configuration wins, then the process-wide
    /// override, then the option's default.
    pub fn option_value(
        &self,
        cluster: &Cluster,
        option: &PluginOption,
    ) -> Result<u64, Error> {
        if let Some(value) = cluster.config_value(option.target, option.name) {
            return value.as_u64().ok_or_else(|| {
                Error::configuration(format!(
                    "option {:?} for {} must be a non-negative integer, \
                     not {}",
                    option.name, option.target, value
                ))
            });
        }
        Ok(self
            .services
            .decommission
            .override_for(option.name)
            .unwrap_or(option.default))
    }

    /// Polls `check` with the timeout taken from `option`.
    ///
    /// If the cluster is deleted while polling, the poll ends successfully:
    /// nothing will ever change on a cluster that is gone.
    pub async fn plugin_option_poll<F, Fut>(
        &self,
        option: &PluginOption,
        operation: &str,
        interval: Duration,
        mut check: F,
    ) -> Result<(), Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, Error>>,
    {
        let cluster = match self.cluster().await {
            Ok(cluster) => cluster,
            Err(error) if error.is_not_found() => return Ok(()),
            Err(error) => return Err(error),
        };
        let timeout = Duration::from_secs(self.option_value(&cluster, option)?);
        let options = PollOptions::new(operation, timeout, interval)
            .with_timeout_option(option.name);

        self.poll(&options, || {
            let fut = check();
            async move {
                if !self.cluster_exists().await {
                    debug!(self.log, "cluster is gone; abandoning poll";
                        "operation" => operation);
                    return Ok(true);
                }
                fut.await
            }
        })
        .await
    }

    /// Removes instances from the infrastructure and then from the cluster
    /// record.
    pub async fn delete_instances(
        &self,
        instances: &[Instance],
    ) -> Result<(), Error> {
        if instances.is_empty() {
            return Ok(());
        }
        let cluster = self.cluster().await?;
        let timeout = self.services.timeouts.delete_instances();
        tokio::time::timeout(
            timeout,
            self.services.infra.delete_instances(&cluster, instances),
        )
        .await
        .map_err(|_| Error::Timeout {
            timeout,
            operation: Some(String::from("Delete instances")),
            option: Some(String::from(DELETE_INSTANCES_OPTION)),
        })??;

        for instance in instances {
            match self
                .services
                .datastore
                .instance_remove(self.cluster_id, instance.id)
                .await
            {
                Ok(()) => {}
                Err(error) if error.is_not_found() => {}
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    /// Stores a plugin-private value on the cluster record.
    pub async fn set_extra(&self, key: &str, value: &str) -> Result<(), Error> {
        let cluster = self.cluster().await?;
        let mut extra = cluster.extra;
        extra.insert(key.to_string(), value.to_string());
        self.services
            .datastore
            .cluster_update_extra(self.cluster_id, extra)
            .await
            .map(|_| ())
    }
}
