// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cluster creation

use super::Orchestrator;
use super::Outcome;
use super::Stop;
use crate::context::ProvisionContext;
use chrono::Utc;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use trellis_common::api::external::Cluster;
use trellis_common::api::external::ClusterCreate;
use trellis_common::api::external::ClusterStatus;
use trellis_common::api::external::CreateResult;
use trellis_common::api::external::Error;
use trellis_common::api::external::NodeGroup;
use trellis_common::api::external::NodeGroupCreate;
use trellis_common::typed_uuid::ClusterUuid;
use trellis_common::typed_uuid::NodeGroupUuid;

pub(super) fn new_node_group(params: &NodeGroupCreate) -> NodeGroup {
    NodeGroup {
        id: NodeGroupUuid::new_v4(),
        name: params.name.clone(),
        count: params.count,
        node_processes: params.node_processes.clone(),
        flavor: params.flavor.clone(),
        node_configs: params.node_configs.clone(),
        instances: Vec::new(),
    }
}

impl Orchestrator {
    /// Records a new cluster in `Validating`, ready for
    /// [`Orchestrator::provision_cluster`].
    pub async fn create_cluster(
        &self,
        params: ClusterCreate,
    ) -> CreateResult<Cluster> {
        let plugin = self.inner.registry.get(&params.plugin_name)?;
        if !plugin.descriptor().has_version(&params.plugin_version) {
            return Err(Error::invalid_request(&format!(
                "plugin {:?} does not support version {:?}",
                params.plugin_name, params.plugin_version
            )));
        }
        if params.node_groups.is_empty() {
            return Err(Error::invalid_request(
                "a cluster needs at least one node group",
            ));
        }
        let mut names = BTreeSet::new();
        for node_group in &params.node_groups {
            if !names.insert(node_group.name.as_str()) {
                return Err(Error::invalid_request(&format!(
                    "duplicate node group name {:?}",
                    node_group.name
                )));
            }
        }

        let now = Utc::now();
        let cluster = Cluster {
            id: ClusterUuid::new_v4(),
            name: params.name,
            tenant_id: params.tenant_id,
            plugin_name: params.plugin_name,
            plugin_version: params.plugin_version,
            status: ClusterStatus::Validating,
            status_description: String::new(),
            node_groups: params.node_groups.iter().map(new_node_group).collect(),
            cluster_configs: params.cluster_configs,
            extra: BTreeMap::new(),
            provision_progress: Vec::new(),
            time_created: now,
            time_updated: now,
        };
        self.inner.services.datastore.cluster_create(cluster).await
    }

    /// Takes a cluster created by [`Orchestrator::create_cluster`] all the
    /// way to `Active`.
    ///
    /// On failure the cluster is left in `Error` and the error is returned.
    pub async fn provision_cluster(
        &self,
        id: ClusterUuid,
    ) -> Result<Outcome, Error> {
        let _ticket = self.acquire(id, "provisioning")?;
        let cluster = self.cluster(id).await?;
        if cluster.status != ClusterStatus::Validating {
            return Err(Error::invalid_request(&format!(
                "cluster {:?} is {}, not {}",
                cluster.name,
                cluster.status,
                ClusterStatus::Validating
            )));
        }
        let ctx = self.context(id);
        let result = self.provision(&ctx).await;
        self.finish(&ctx, "provisioning", result).await
    }

    async fn provision(&self, ctx: &ProvisionContext) -> Result<(), Stop> {
        let cluster = self.still_exists(ctx).await?;
        let plugin = self.inner.registry.plugin_for(&cluster)?;

        let cluster = self
            .transition(ctx, ClusterStatus::Validating, "validating cluster")
            .await?;
        plugin.validate(ctx, &cluster).await?;

        let cluster = self
            .transition(
                ctx,
                ClusterStatus::InfraUpdating,
                "updating infrastructure requirements",
            )
            .await?;
        plugin.update_infra(ctx, &cluster).await?;

        let cluster = self
            .transition(ctx, ClusterStatus::Spawning, "creating instances")
            .await?;
        let expected = cluster.node_groups.iter().map(|ng| ng.count).sum();
        let instances = self
            .spawn_instances(
                ctx,
                &cluster,
                expected,
                self.inner.services.infra.create_cluster(&cluster),
            )
            .await?;

        self.transition(
            ctx,
            ClusterStatus::Waiting,
            "waiting for instances to become accessible",
        )
        .await?;
        self.await_instances(ctx, &instances).await?;

        let cluster = self
            .transition(ctx, ClusterStatus::Configuring, "configuring cluster")
            .await?;
        plugin.configure_cluster(ctx, &cluster).await?;

        let cluster = self
            .transition(ctx, ClusterStatus::Starting, "starting cluster")
            .await?;
        plugin.start_cluster(ctx, &cluster).await?;

        self.transition(ctx, ClusterStatus::Active, "").await?;
        self.resume_pending_jobs(ctx).await;
        Ok(())
    }
}
