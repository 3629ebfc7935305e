// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the cloud that hosts cluster instances

use async_trait::async_trait;
use std::collections::BTreeMap;
use trellis_common::api::external::Cluster;
use trellis_common::api::external::Error;
use trellis_common::api::external::Instance;
use trellis_common::typed_uuid::NodeGroupUuid;

/// Creates and destroys the VMs behind a cluster.
///
/// The infrastructure never touches the cluster record; the orchestrator
/// persists whatever instances it returns.
#[async_trait]
pub trait Infrastructure: Send + Sync {
    /// Creates `count` instances for every node group of a new cluster.
    async fn create_cluster(
        &self,
        cluster: &Cluster,
    ) -> Result<Vec<Instance>, Error>;

    /// Brings each node group up to the count in `node_group_counts`,
    /// returning only the instances that were created.
    ///
    /// Node groups holding more instances than their new count lose their
    /// highest-indexed instances.
    async fn scale_cluster(
        &self,
        cluster: &Cluster,
        node_group_counts: &BTreeMap<NodeGroupUuid, usize>,
    ) -> Result<Vec<Instance>, Error>;

    async fn delete_instances(
        &self,
        cluster: &Cluster,
        instances: &[Instance],
    ) -> Result<(), Error>;

    /// Releases every resource held for the cluster.
    async fn shutdown_cluster(&self, cluster: &Cluster) -> Result<(), Error>;
}
