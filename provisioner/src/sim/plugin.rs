// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A plugin for a pretend distributed service
//!
//! The service has the same shape as HDFS/YARN (a namenode and a
//! resourcemanager owning datanode and nodemanager membership) but every
//! command is a no-op `sim-*` command, so tests can script the remote side
//! with a fake transport.

use super::PLUGIN_NAME;
use crate::context::ProvisionContext;
use crate::decommission::DecommissionCoordinator;
use crate::decommission::NodeStatus;
use crate::decommission::NodeStatusSource;
use crate::decommission::RoleDecommission;
use crate::decommission::DATANODES_DECOMMISSIONING_TIMEOUT;
use crate::decommission::NODEMANAGERS_DECOMMISSIONING_TIMEOUT;
use crate::plugin::Capability;
use crate::plugin::Plugin;
use crate::plugin::PluginDescriptor;
use crate::plugin::PluginOption;
use async_trait::async_trait;
use itertools::Itertools;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use trellis_common::api::external::Cluster;
use trellis_common::api::external::Error;
use trellis_common::api::external::Instance;
use trellis_common::api::external::NodeGroupCreate;
use trellis_common::typed_uuid::ClusterUuid;
use trellis_common::typed_uuid::InstanceUuid;
use trellis_common::typed_uuid::NodeGroupUuid;
use trellis_common::typed_uuid::SecretUuid;
use trellis_remote::ExecOptions;

/// Key in `cluster.extra` holding the id of the cluster's secret
pub const SECRET_EXTRA_KEY: &str = "sim_secret_id";

pub const NODE_CONF: &str = "/etc/trellis/node.conf";
pub const CONFIGURE_COMMAND: &str = "sim-configure-node";

/// When the simulated masters report excluded hosts as decommissioned
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecommissionMode {
    /// on the first status check
    Immediate,
    Never,
    /// once this many status checks have reported them in progress
    AfterPolls(usize),
}

struct SimControls {
    validation_failure: Option<String>,
    scaling_failure: Option<String>,
    decommission_mode: DecommissionMode,
    terminated: Vec<ClusterUuid>,
}

pub struct SimPlugin {
    descriptor: PluginDescriptor,
    controls: Arc<Mutex<SimControls>>,
    status_checks: Arc<AtomicUsize>,
}

impl Default for SimPlugin {
    fn default() -> Self {
        SimPlugin::new()
    }
}

impl SimPlugin {
    pub fn new() -> SimPlugin {
        SimPlugin {
            descriptor: PluginDescriptor {
                name: PLUGIN_NAME.to_string(),
                title: String::from("Simulated service"),
                versions: vec![String::from("1.0")],
                capabilities: [
                    Capability::ScaleCluster,
                    Capability::DecommissionNodes,
                    Capability::ValidateScaling,
                ]
                .into_iter()
                .collect(),
            },
            controls: Arc::new(Mutex::new(SimControls {
                validation_failure: None,
                scaling_failure: None,
                decommission_mode: DecommissionMode::Immediate,
                terminated: Vec::new(),
            })),
            status_checks: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make `validate` reject every cluster with `message`.
    pub fn fail_validation(&self, message: Option<&str>) {
        self.controls.lock().unwrap().validation_failure =
            message.map(str::to_string);
    }

    /// Make `validate_scaling` reject every request with `message`.
    pub fn fail_scaling_validation(&self, message: Option<&str>) {
        self.controls.lock().unwrap().scaling_failure =
            message.map(str::to_string);
    }

    pub fn set_decommission_mode(&self, mode: DecommissionMode) {
        self.controls.lock().unwrap().decommission_mode = mode;
    }

    /// Number of decommission status checks made so far.
    pub fn status_checks(&self) -> usize {
        self.status_checks.load(Ordering::SeqCst)
    }

    /// Clusters whose teardown hook has run.
    pub fn terminated(&self) -> Vec<ClusterUuid> {
        self.controls.lock().unwrap().terminated.clone()
    }

    fn roles(&self) -> Vec<RoleDecommission> {
        [
            ("datanode", "namenode", DATANODES_DECOMMISSIONING_TIMEOUT),
            ("nodemanager", "resourcemanager", NODEMANAGERS_DECOMMISSIONING_TIMEOUT),
        ]
        .into_iter()
        .map(|(role, master, timeout_option)| {
            let exclude_path = format!("/etc/trellis/{}.exclude", role);
            RoleDecommission {
                role: role.to_string(),
                master_process: master.to_string(),
                include_path: format!("/etc/trellis/{}.include", role),
                exclude_path: exclude_path.clone(),
                refresh_command: format!("sim-refresh-nodes {}", role),
                timeout_option,
                status_source: Arc::new(SimNodeStatus {
                    controls: self.controls.clone(),
                    checks: self.status_checks.clone(),
                    exclude_path,
                }),
            }
        })
        .collect()
    }

    async fn configure_instances(
        &self,
        ctx: &ProvisionContext,
        step_name: &str,
        cluster: &Cluster,
        instances: &[Instance],
    ) -> Result<(), Error> {
        let node_confs: BTreeMap<InstanceUuid, String> = instances
            .iter()
            .map(|instance| {
                let conf = format!(
                    "cluster = {}\nprocesses = {}\n",
                    cluster.name,
                    cluster.processes_of(instance).iter().join(",")
                );
                (instance.id, conf)
            })
            .collect();
        let node_confs = Arc::new(node_confs);
        ctx.for_each_instance(step_name, instances, |ctx, instance| {
            let node_confs = node_confs.clone();
            async move {
                let conf = node_confs.get(&instance.id).cloned().unwrap_or_default();
                let remote = ctx.remote();
                remote
                    .write_file(&instance, NODE_CONF, conf.as_bytes(), true)
                    .await?;
                remote
                    .execute(&instance, CONFIGURE_COMMAND, &ExecOptions::as_root())
                    .await?;
                Ok::<(), Error>(())
            }
        })
        .await
    }

    async fn start_instances(
        &self,
        ctx: &ProvisionContext,
        step_name: &str,
        cluster: &Cluster,
        instances: &[Instance],
    ) -> Result<(), Error> {
        let commands: BTreeMap<InstanceUuid, String> = instances
            .iter()
            .map(|instance| {
                let processes = cluster.processes_of(instance);
                (instance.id, format!("sim-start {}", processes.iter().join(" ")))
            })
            .collect();
        let commands = Arc::new(commands);
        ctx.for_each_instance(step_name, instances, |ctx, instance| {
            let commands = commands.clone();
            async move {
                let command =
                    commands.get(&instance.id).cloned().unwrap_or_default();
                ctx.remote()
                    .execute(&instance, &command, &ExecOptions::as_root())
                    .await?;
                Ok::<(), Error>(())
            }
        })
        .await
    }
}

#[async_trait]
impl Plugin for SimPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn options(&self) -> Vec<PluginOption> {
        vec![DATANODES_DECOMMISSIONING_TIMEOUT, NODEMANAGERS_DECOMMISSIONING_TIMEOUT]
    }

    async fn validate(
        &self,
        _ctx: &ProvisionContext,
        cluster: &Cluster,
    ) -> Result<(), Error> {
        if let Some(message) =
            self.controls.lock().unwrap().validation_failure.clone()
        {
            return Err(Error::validation(message));
        }
        let namenodes = cluster.process_count("namenode");
        if namenodes != 1 {
            return Err(Error::validation(format!(
                "namenode must be on exactly one instance, not {}",
                namenodes
            )));
        }
        Ok(())
    }

    async fn configure_cluster(
        &self,
        ctx: &ProvisionContext,
        cluster: &Cluster,
    ) -> Result<(), Error> {
        let secret = ctx
            .keystore()
            .store_secret(&format!("sim-credential-{}", cluster.id))
            .await?;
        ctx.set_extra(SECRET_EXTRA_KEY, &secret.to_string()).await?;

        let instances: Vec<Instance> = cluster.instances().cloned().collect();
        self.configure_instances(ctx, "Configure instances", cluster, &instances)
            .await
    }

    async fn start_cluster(
        &self,
        ctx: &ProvisionContext,
        cluster: &Cluster,
    ) -> Result<(), Error> {
        let instances: Vec<Instance> = cluster.instances().cloned().collect();
        self.start_instances(ctx, "Start the cluster", cluster, &instances).await
    }

    async fn scale_cluster(
        &self,
        ctx: &ProvisionContext,
        cluster: &Cluster,
        instances: &[Instance],
    ) -> Result<(), Error> {
        self.configure_instances(ctx, "Configure new instances", cluster, instances)
            .await?;
        self.start_instances(ctx, "Start new instances", cluster, instances)
            .await
    }

    async fn decommission_nodes(
        &self,
        ctx: &ProvisionContext,
        cluster: &Cluster,
        instances: &[Instance],
    ) -> Result<(), Error> {
        DecommissionCoordinator::new(ctx)
            .decommission(cluster, instances, &self.roles())
            .await
    }

    async fn validate_scaling(
        &self,
        _ctx: &ProvisionContext,
        cluster: &Cluster,
        existing: &BTreeMap<NodeGroupUuid, usize>,
        additional: &[NodeGroupCreate],
    ) -> Result<(), Error> {
        if let Some(message) =
            self.controls.lock().unwrap().scaling_failure.clone()
        {
            return Err(Error::validation(message));
        }
        for node_group in &cluster.node_groups {
            if node_group.has_process("namenode")
                && existing.get(&node_group.id).is_some_and(|c| *c != node_group.count)
            {
                return Err(Error::validation(format!(
                    "node group {:?} runs the namenode and cannot be resized",
                    node_group.name
                )));
            }
        }
        if let Some(node_group) =
            additional.iter().find(|ng| ng.node_processes.contains("namenode"))
        {
            return Err(Error::validation(format!(
                "new node group {:?} may not run a namenode",
                node_group.name
            )));
        }
        Ok(())
    }

    async fn on_terminate_cluster(
        &self,
        ctx: &ProvisionContext,
        cluster: &Cluster,
    ) -> Result<(), Error> {
        if let Some(id) = cluster.extra.get(SECRET_EXTRA_KEY) {
            let id: SecretUuid = id.parse().map_err(|e| {
                Error::internal_error(&format!("bad secret id {:?}: {}", id, e))
            })?;
            match ctx.keystore().delete_secret(id).await {
                Ok(()) => {}
                Err(error) if error.is_not_found() => {}
                Err(error) => return Err(error),
            }
        }
        self.controls.lock().unwrap().terminated.push(cluster.id);
        Ok(())
    }
}

/// Reports the hosts in a master's exclude file as decommissioning or
/// decommissioned, according to the plugin's [`DecommissionMode`].
struct SimNodeStatus {
    controls: Arc<Mutex<SimControls>>,
    checks: Arc<AtomicUsize>,
    exclude_path: String,
}

#[async_trait]
impl NodeStatusSource for SimNodeStatus {
    async fn statuses(
        &self,
        ctx: &ProvisionContext,
        master: &Instance,
    ) -> Result<BTreeMap<String, NodeStatus>, Error> {
        let excluded =
            ctx.remote().read_file(master, &self.exclude_path, true).await?;
        let checks = self.checks.fetch_add(1, Ordering::SeqCst) + 1;
        let mode = self.controls.lock().unwrap().decommission_mode;
        let status = match mode {
            DecommissionMode::Immediate => NodeStatus::Decommissioned,
            DecommissionMode::Never => NodeStatus::Decommissioning,
            DecommissionMode::AfterPolls(n) if checks > n => {
                NodeStatus::Decommissioned
            }
            DecommissionMode::AfterPolls(_) => NodeStatus::Decommissioning,
        };
        Ok(String::from_utf8_lossy(&excluded)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|host| (host.trim().to_string(), status))
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_roles() {
        let plugin = SimPlugin::new();
        let roles = plugin.roles();
        assert_eq!(roles.len(), 2);
        assert_eq!(roles[0].include_path, "/etc/trellis/datanode.include");
        assert_eq!(roles[1].master_process, "resourcemanager");
        assert_eq!(
            roles[1].timeout_option.name,
            "NodeManagers decommissioning timeout"
        );
    }
}
