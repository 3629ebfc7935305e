// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistence interface for clusters and their provisioning log
//!
//! The orchestrator and the progress tracker persist everything through a
//! [`DataStore`].  Lookups of a cluster that has been deleted fail with
//! [`Error::ObjectNotFound`]; callers rely on that to notice concurrent
//! deletion.
//!
//! [`Error::ObjectNotFound`]: trellis_common::api::external::Error::ObjectNotFound

mod memory;

pub use memory::MemoryDataStore;

use async_trait::async_trait;
use std::collections::BTreeMap;
use trellis_common::api::external::Cluster;
use trellis_common::api::external::ClusterStatus;
use trellis_common::api::external::CreateResult;
use trellis_common::api::external::DeleteResult;
use trellis_common::api::external::Instance;
use trellis_common::api::external::ListResultVec;
use trellis_common::api::external::LookupResult;
use trellis_common::api::external::NodeGroup;
use trellis_common::api::external::ProvisioningEvent;
use trellis_common::api::external::ProvisioningStep;
use trellis_common::api::external::UpdateResult;
use trellis_common::typed_uuid::ClusterUuid;
use trellis_common::typed_uuid::InstanceUuid;
use trellis_common::typed_uuid::NodeGroupUuid;
use trellis_common::typed_uuid::StepUuid;

#[async_trait]
pub trait DataStore: Send + Sync {
    // Clusters

    async fn cluster_create(&self, cluster: Cluster) -> CreateResult<Cluster>;

    async fn cluster_get(&self, id: ClusterUuid) -> LookupResult<Cluster>;

    async fn cluster_list(&self) -> ListResultVec<Cluster>;

    /// Returns whether the cluster record still exists.
    async fn cluster_exists(&self, id: ClusterUuid) -> bool {
        self.cluster_get(id).await.is_ok()
    }

    /// Moves the cluster to `status`.
    ///
    /// Once a cluster is `Deleting`, only `Deleting` and `Error` are
    /// accepted; anything else fails with [`Error::Conflict`] so that an
    /// operation racing with termination cannot resurrect the cluster.
    ///
    /// [`Error::Conflict`]: trellis_common::api::external::Error::Conflict
    async fn cluster_update_status(
        &self,
        id: ClusterUuid,
        status: ClusterStatus,
        description: &str,
    ) -> UpdateResult<Cluster>;

    /// Moves the cluster to `Error` with `description`, unless it is being
    /// deleted, in which case this fails with [`Error::Conflict`] and the
    /// cluster stays `Deleting`.
    ///
    /// [`Error::Conflict`]: trellis_common::api::external::Error::Conflict
    async fn cluster_record_failure(
        &self,
        id: ClusterUuid,
        description: &str,
    ) -> UpdateResult<Cluster>;

    /// Replaces the plugin-private key/value bag.
    async fn cluster_update_extra(
        &self,
        id: ClusterUuid,
        extra: BTreeMap<String, String>,
    ) -> UpdateResult<Cluster>;

    /// Removes the cluster along with its node groups, instances, steps and
    /// events.
    async fn cluster_delete(&self, id: ClusterUuid) -> DeleteResult;

    // Node groups and instances

    async fn node_group_add(
        &self,
        cluster_id: ClusterUuid,
        node_group: NodeGroup,
    ) -> CreateResult<NodeGroup>;

    async fn node_group_update_count(
        &self,
        cluster_id: ClusterUuid,
        node_group_id: NodeGroupUuid,
        count: usize,
    ) -> UpdateResult<NodeGroup>;

    async fn instance_add(
        &self,
        cluster_id: ClusterUuid,
        instance: Instance,
    ) -> CreateResult<Instance>;

    async fn instance_remove(
        &self,
        cluster_id: ClusterUuid,
        instance_id: InstanceUuid,
    ) -> DeleteResult;

    // Provisioning steps and events

    /// Appends a step to the cluster's provisioning log.
    async fn step_create(
        &self,
        step: ProvisioningStep,
    ) -> CreateResult<ProvisioningStep>;

    async fn step_update(&self, step: &ProvisioningStep) -> UpdateResult<()>;

    /// Lists the cluster's steps in the order they were created.
    async fn step_list(
        &self,
        cluster_id: ClusterUuid,
    ) -> ListResultVec<ProvisioningStep>;

    async fn event_create(
        &self,
        event: ProvisioningEvent,
    ) -> CreateResult<ProvisioningEvent>;

    async fn event_list(
        &self,
        step_id: StepUuid,
    ) -> ListResultVec<ProvisioningEvent>;

    /// Deletes every event recorded against a step.
    async fn event_purge(&self, step_id: StepUuid) -> DeleteResult;
}
