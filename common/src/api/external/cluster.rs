// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Clusters, node groups and instances

use super::ProvisioningStep;
use crate::typed_uuid::ClusterUuid;
use crate::typed_uuid::InstanceUuid;
use crate::typed_uuid::NodeGroupUuid;
use chrono::DateTime;
use chrono::Utc;
use parse_display::Display;
use parse_display::FromStr;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::net::IpAddr;

/// User-supplied configuration values, keyed first by target (e.g. "HDFS",
/// "general") and then by option name.
pub type ClusterConfigs = BTreeMap<String, BTreeMap<String, serde_json::Value>>;

/// Lifecycle state of a cluster
///
/// Creation walks `Validating` through `Active`; scaling walks
/// `Decommissioning`, `Scaling` and (if instances were added) `Configuring`
/// back to `Active`; termination moves to `Deleting` before the record is
/// removed.  `Error` is reachable from any non-terminal state.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    Eq,
    FromStr,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum ClusterStatus {
    Validating,
    InfraUpdating,
    Spawning,
    Waiting,
    Configuring,
    Starting,
    Active,
    Decommissioning,
    Scaling,
    Deleting,
    Error,
}

impl ClusterStatus {
    /// Returns whether a lifecycle operation is driving the cluster right now.
    pub fn is_transitional(&self) -> bool {
        !matches!(self, ClusterStatus::Active | ClusterStatus::Error)
    }
}

/// A provisioned VM, owned by exactly one node group
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Instance {
    pub id: InstanceUuid,
    pub node_group_id: NodeGroupUuid,
    /// Host name, unique within the cluster
    pub name: String,
    /// Position of this instance within its node group
    pub index: usize,
    pub fqdn: String,
    /// Address used to reach the instance's remote transport
    pub management_ip: Option<IpAddr>,
    pub internal_ip: Option<IpAddr>,
    pub time_created: DateTime<Utc>,
}

impl Instance {
    pub fn hostname(&self) -> &str {
        &self.name
    }
}

/// A set of homogeneous instances sharing role assignment and sizing
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct NodeGroup {
    pub id: NodeGroupUuid,
    pub name: String,
    /// Desired number of instances
    pub count: usize,
    pub node_processes: BTreeSet<String>,
    pub flavor: String,
    pub node_configs: ClusterConfigs,
    pub instances: Vec<Instance>,
}

impl NodeGroup {
    pub fn has_process(&self, process: &str) -> bool {
        self.node_processes.contains(process)
    }
}

/// A cluster record, as persisted by the data store
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Cluster {
    pub id: ClusterUuid,
    pub name: String,
    pub tenant_id: String,
    pub plugin_name: String,
    pub plugin_version: String,
    pub status: ClusterStatus,
    pub status_description: String,
    pub node_groups: Vec<NodeGroup>,
    pub cluster_configs: ClusterConfigs,
    /// Plugin-private persisted state (secret ids and the like)
    pub extra: BTreeMap<String, String>,
    pub provision_progress: Vec<ProvisioningStep>,
    pub time_created: DateTime<Utc>,
    pub time_updated: DateTime<Utc>,
}

impl Cluster {
    /// Iterates over every instance of every node group.
    pub fn instances(&self) -> impl Iterator<Item = &Instance> + '_ {
        self.node_groups.iter().flat_map(|ng| ng.instances.iter())
    }

    pub fn instance_count(&self) -> usize {
        self.node_groups.iter().map(|ng| ng.instances.len()).sum()
    }

    /// Returns the instances whose node group runs `process`.
    pub fn instances_with_process(&self, process: &str) -> Vec<&Instance> {
        self.node_groups
            .iter()
            .filter(|ng| ng.has_process(process))
            .flat_map(|ng| ng.instances.iter())
            .collect()
    }

    /// Returns the first instance running `process`, if any.
    pub fn instance_with_process(&self, process: &str) -> Option<&Instance> {
        self.instances_with_process(process).into_iter().next()
    }

    /// Number of instances the node groups ask for that run `process`.
    pub fn process_count(&self, process: &str) -> usize {
        self.node_groups
            .iter()
            .filter(|ng| ng.has_process(process))
            .map(|ng| ng.count)
            .sum()
    }

    pub fn instance(&self, id: InstanceUuid) -> Option<&Instance> {
        self.instances().find(|i| i.id == id)
    }

    pub fn node_group(&self, id: NodeGroupUuid) -> Option<&NodeGroup> {
        self.node_groups.iter().find(|ng| ng.id == id)
    }

    /// Returns the node group owning `instance`.
    pub fn node_group_of(&self, instance: &Instance) -> Option<&NodeGroup> {
        self.node_group(instance.node_group_id)
    }

    /// Returns the processes that run on `instance`.
    pub fn processes_of(&self, instance: &Instance) -> BTreeSet<String> {
        self.node_group_of(instance)
            .map(|ng| ng.node_processes.clone())
            .unwrap_or_default()
    }

    /// Looks up a user-supplied configuration value.
    pub fn config_value(
        &self,
        target: &str,
        name: &str,
    ) -> Option<&serde_json::Value> {
        self.cluster_configs.get(target).and_then(|section| section.get(name))
    }
}

/// Parameters used to create a node group
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct NodeGroupCreate {
    pub name: String,
    pub count: usize,
    pub node_processes: BTreeSet<String>,
    #[serde(default = "default_flavor")]
    pub flavor: String,
    #[serde(default)]
    pub node_configs: ClusterConfigs,
}

fn default_flavor() -> String {
    String::from("m1.medium")
}

/// Parameters used to create a cluster
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ClusterCreate {
    pub name: String,
    pub tenant_id: String,
    pub plugin_name: String,
    pub plugin_version: String,
    pub node_groups: Vec<NodeGroupCreate>,
    #[serde(default)]
    pub cluster_configs: ClusterConfigs,
}
