// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Growing and shrinking clusters
//!
//! Shrinking happens first: the instances being removed are drained by the
//! plugin and deleted, and only then are node group counts updated and new
//! instances created.  If configuring the new instances fails, the removal
//! is not undone.

use super::create::new_node_group;
use super::Orchestrator;
use super::Outcome;
use super::Stop;
use crate::context::ProvisionContext;
use crate::plugin::Capability;
use crate::plugin::Plugin;
use serde::Deserialize;
use serde::Serialize;
use slog::info;
use std::collections::BTreeMap;
use trellis_common::api::external::Cluster;
use trellis_common::api::external::ClusterStatus;
use trellis_common::api::external::Error;
use trellis_common::api::external::Instance;
use trellis_common::api::external::NodeGroupCreate;
use trellis_common::api::external::ResourceType;
use trellis_common::typed_uuid::ClusterUuid;
use trellis_common::typed_uuid::NodeGroupUuid;
use trellis_common::typed_uuid::ToUntypedUuid;

/// A change to a cluster's size
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ScaleRequest {
    /// New instance counts for existing node groups
    #[serde(default)]
    pub resize: BTreeMap<NodeGroupUuid, usize>,
    /// Node groups to add
    #[serde(default)]
    pub add: Vec<NodeGroupCreate>,
}

/// The highest-indexed instances of each node group shrinking under
/// `resize`.
pub(crate) fn instances_to_remove(
    cluster: &Cluster,
    resize: &BTreeMap<NodeGroupUuid, usize>,
) -> Vec<Instance> {
    let mut removing = Vec::new();
    for node_group in &cluster.node_groups {
        let Some(count) = resize.get(&node_group.id) else {
            continue;
        };
        let mut instances: Vec<&Instance> = node_group.instances.iter().collect();
        instances.sort_by_key(|i| i.index);
        removing.extend(instances.into_iter().skip(*count).cloned());
    }
    removing
}

fn new_instance_count(
    cluster: &Cluster,
    request: &ScaleRequest,
) -> usize {
    let grown: usize = cluster
        .node_groups
        .iter()
        .filter_map(|ng| {
            let count = request.resize.get(&ng.id)?;
            Some(count.saturating_sub(ng.instances.len()))
        })
        .sum();
    grown + request.add.iter().map(|ng| ng.count).sum::<usize>()
}

impl Orchestrator {
    /// Resizes a cluster's node groups and adds new ones.
    ///
    /// The request is checked up front, including by the plugin; a rejected
    /// request returns an error and leaves the cluster `Active`.
    pub async fn scale_cluster(
        &self,
        id: ClusterUuid,
        request: ScaleRequest,
    ) -> Result<Outcome, Error> {
        let _ticket = self.acquire(id, "scaling")?;
        let ctx = self.context(id);
        let cluster = ctx.cluster().await?;
        let plugin = self.inner.registry.plugin_for(&cluster)?;
        self.check_scale_request(&ctx, &cluster, plugin.as_ref(), &request)
            .await?;

        let result = self.scale(&ctx, plugin.as_ref(), &request).await;
        self.finish(&ctx, "scaling", result).await
    }

    async fn check_scale_request(
        &self,
        ctx: &ProvisionContext,
        cluster: &Cluster,
        plugin: &dyn Plugin,
        request: &ScaleRequest,
    ) -> Result<(), Error> {
        if cluster.status != ClusterStatus::Active {
            return Err(Error::invalid_request(&format!(
                "cluster {:?} is {}; only active clusters can be scaled",
                cluster.name, cluster.status
            )));
        }
        for id in request.resize.keys() {
            if cluster.node_group(*id).is_none() {
                return Err(Error::not_found_by_id(
                    ResourceType::NodeGroup,
                    &id.to_untyped_uuid(),
                ));
            }
        }
        for node_group in &request.add {
            if cluster.node_groups.iter().any(|ng| ng.name == node_group.name)
            {
                return Err(Error::ObjectAlreadyExists {
                    type_name: ResourceType::NodeGroup,
                    object_name: node_group.name.clone(),
                });
            }
        }
        let unchanged = request.resize.iter().all(|(id, count)| {
            cluster.node_group(*id).is_some_and(|ng| ng.instances.len() == *count)
        });
        if request.add.is_empty() && unchanged {
            return Err(Error::invalid_request(
                "scale request does not change the cluster",
            ));
        }

        let descriptor = plugin.descriptor();
        if new_instance_count(cluster, request) > 0
            && !descriptor.supports(Capability::ScaleCluster)
        {
            return Err(plugin.unsupported(Capability::ScaleCluster));
        }
        if descriptor.supports(Capability::ValidateScaling) {
            plugin
                .validate_scaling(ctx, cluster, &request.resize, &request.add)
                .await?;
        }
        Ok(())
    }

    async fn scale(
        &self,
        ctx: &ProvisionContext,
        plugin: &dyn Plugin,
        request: &ScaleRequest,
    ) -> Result<(), Stop> {
        let services = &self.inner.services;
        let cluster = self.still_exists(ctx).await?;

        let removing = instances_to_remove(&cluster, &request.resize);
        if !removing.is_empty() {
            let cluster = self
                .transition(
                    ctx,
                    ClusterStatus::Decommissioning,
                    "decommissioning instances",
                )
                .await?;
            info!(ctx.log(), "removing instances";
                "count" => removing.len());
            if plugin.descriptor().supports(Capability::DecommissionNodes) {
                plugin.decommission_nodes(ctx, &cluster, &removing).await?;
            }
            // Whatever the plugin did not remove itself.
            let cluster = self.still_exists(ctx).await?;
            let leftovers: Vec<Instance> = removing
                .into_iter()
                .filter(|i| cluster.instance(i.id).is_some())
                .collect();
            ctx.delete_instances(&leftovers).await?;
        }

        self.transition(ctx, ClusterStatus::Scaling, "scaling cluster").await?;
        let mut counts = request.resize.clone();
        for (node_group_id, count) in &request.resize {
            services
                .datastore
                .node_group_update_count(ctx.cluster_id(), *node_group_id, *count)
                .await?;
        }
        for params in &request.add {
            let node_group = services
                .datastore
                .node_group_add(ctx.cluster_id(), new_node_group(params))
                .await?;
            counts.insert(node_group.id, node_group.count);
        }

        let cluster = self.still_exists(ctx).await?;
        let expected = new_instance_count(&cluster, request);
        let new_instances = self
            .spawn_instances(
                ctx,
                &cluster,
                expected,
                services.infra.scale_cluster(&cluster, &counts),
            )
            .await?;

        if !new_instances.is_empty() {
            self.transition(
                ctx,
                ClusterStatus::Waiting,
                "waiting for new instances to become accessible",
            )
            .await?;
            self.await_instances(ctx, &new_instances).await?;

            let cluster = self
                .transition(
                    ctx,
                    ClusterStatus::Configuring,
                    "configuring new instances",
                )
                .await?;
            plugin.scale_cluster(ctx, &cluster, &new_instances).await?;
        }

        self.transition(ctx, ClusterStatus::Active, "").await?;
        Ok(())
    }
}
