// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Vanilla Apache Hadoop (HDFS and YARN)
//!
//! One instance runs the namenode and one the resourcemanager (possibly the
//! same instance); datanodes and nodemanagers run wherever their node groups
//! say.  Membership of both services is controlled through include and
//! exclude files, which is also how workers are drained on scale-down.

mod config;
mod status;
mod versions;

use crate::context::ProvisionContext;
use crate::decommission::DecommissionCoordinator;
use crate::decommission::RoleDecommission;
use crate::decommission::DATANODES_DECOMMISSIONING_TIMEOUT;
use crate::decommission::NODEMANAGERS_DECOMMISSIONING_TIMEOUT;
use crate::decommission::NodeStatus;
use crate::decommission::NodeStatusSource;
use crate::plugin::Capability;
use crate::plugin::Plugin;
use crate::plugin::PluginDescriptor;
use crate::plugin::PluginOption;
use async_trait::async_trait;
use slog::info;
use std::collections::BTreeMap;
use std::sync::Arc;
use trellis_common::api::external::Cluster;
use trellis_common::api::external::Error;
use trellis_common::api::external::Instance;
use trellis_common::api::external::NodeGroupCreate;
use trellis_common::typed_uuid::InstanceUuid;
use trellis_common::typed_uuid::NodeGroupUuid;
use trellis_remote::ExecOptions;
use versions::VersionProfile;

pub use status::parse_dfsadmin_report;
pub use status::parse_yarn_node_list;

pub const PLUGIN_NAME: &str = "hadoop";

pub const DFS_REPLICATION: PluginOption = PluginOption {
    name: "dfs.replication",
    target: "HDFS",
    default: 3,
    description: "Default block replication",
};

pub const DATANODES_STARTUP_TIMEOUT: PluginOption = PluginOption {
    name: "DataNodes startup timeout",
    target: "HDFS",
    default: 10800,
    description: "Timeout for datanodes to register with the namenode after \
                  startup, in seconds",
};

const MASTER_PROCESSES: &[&str] =
    &["namenode", "secondarynamenode", "resourcemanager", "historyserver"];
const WORKER_PROCESSES: &[&str] = &["datanode", "nodemanager"];

pub struct HadoopPlugin {
    descriptor: PluginDescriptor,
}

impl Default for HadoopPlugin {
    fn default() -> Self {
        HadoopPlugin::new()
    }
}

impl HadoopPlugin {
    pub fn new() -> HadoopPlugin {
        HadoopPlugin {
            descriptor: PluginDescriptor {
                name: PLUGIN_NAME.to_string(),
                title: String::from("Apache Hadoop"),
                versions: versions::versions(),
                capabilities: [
                    Capability::ScaleCluster,
                    Capability::DecommissionNodes,
                    Capability::ValidateScaling,
                ]
                .into_iter()
                .collect(),
            },
        }
    }

    fn profile(cluster: &Cluster) -> Result<&'static VersionProfile, Error> {
        versions::profile(&cluster.plugin_version)
    }

    fn master<'c>(
        cluster: &'c Cluster,
        process: &str,
    ) -> Result<&'c Instance, Error> {
        cluster.instance_with_process(process).ok_or_else(|| {
            Error::validation(format!("cluster has no {}", process))
        })
    }

    fn roles(profile: &'static VersionProfile) -> Vec<RoleDecommission> {
        vec![
            RoleDecommission {
                role: String::from("datanode"),
                master_process: String::from("namenode"),
                include_path: profile.conf_file(config::HDFS_INCLUDE),
                exclude_path: profile.conf_file(config::HDFS_EXCLUDE),
                refresh_command: profile.refresh_hdfs_nodes(),
                timeout_option: DATANODES_DECOMMISSIONING_TIMEOUT,
                status_source: Arc::new(status::DatanodeReport { profile }),
            },
            RoleDecommission {
                role: String::from("nodemanager"),
                master_process: String::from("resourcemanager"),
                include_path: profile.conf_file(config::YARN_INCLUDE),
                exclude_path: profile.conf_file(config::YARN_EXCLUDE),
                refresh_command: profile.refresh_yarn_nodes(),
                timeout_option: NODEMANAGERS_DECOMMISSIONING_TIMEOUT,
                status_source: Arc::new(status::NodemanagerReport { profile }),
            },
        ]
    }

    /// Writes every configuration file each of `instances` needs, as one
    /// step.
    async fn write_configs(
        &self,
        ctx: &ProvisionContext,
        cluster: &Cluster,
        instances: &[Instance],
    ) -> Result<(), Error> {
        let profile = Self::profile(cluster)?;
        let namenode = Self::master(cluster, "namenode")?;
        let resourcemanager = Self::master(cluster, "resourcemanager")?;
        let replication = ctx.option_value(cluster, &DFS_REPLICATION)?;

        let datanodes = config_host_list(cluster, "datanode");
        let nodemanagers = config_host_list(cluster, "nodemanager");
        let hosts = config::hosts_file(cluster);

        let mut per_instance: BTreeMap<InstanceUuid, BTreeMap<String, Vec<u8>>> =
            BTreeMap::new();
        for instance in instances {
            let node_group = cluster.node_group_of(instance).ok_or_else(|| {
                Error::internal_error(&format!(
                    "instance {} has no node group",
                    instance.name
                ))
            })?;
            let mut files = BTreeMap::new();
            for (name, properties) in config::site_files(
                profile,
                cluster,
                node_group,
                namenode,
                resourcemanager,
                replication,
            ) {
                files.insert(
                    profile.conf_file(name),
                    config::render_configuration(&properties).into_bytes(),
                );
            }
            files.insert(
                profile.conf_file(config::HDFS_INCLUDE),
                datanodes.clone().into_bytes(),
            );
            files.insert(
                profile.conf_file(config::YARN_INCLUDE),
                nodemanagers.clone().into_bytes(),
            );
            files.insert(profile.conf_file(config::HDFS_EXCLUDE), Vec::new());
            files.insert(profile.conf_file(config::YARN_EXCLUDE), Vec::new());
            files.insert(String::from("/etc/hosts"), hosts.clone().into_bytes());
            per_instance.insert(instance.id, files);
        }
        let per_instance = Arc::new(per_instance);

        ctx.for_each_instance("Configure instances", instances, |ctx, instance| {
            let per_instance = per_instance.clone();
            async move {
                let Some(files) = per_instance.get(&instance.id) else {
                    return Ok(());
                };
                let remote = ctx.remote();
                remote.write_files(&instance, files, true).await?;
                remote
                    .execute(
                        &instance,
                        "mkdir -p /var/lib/hadoop/tmp /var/lib/hadoop/namenode \
                         /var/lib/hadoop/datanode",
                        &ExecOptions::as_root(),
                    )
                    .await?;
                Ok::<(), Error>(())
            }
        })
        .await
    }

    /// Starts the worker processes on `instances`, as one step.
    async fn start_workers(
        &self,
        ctx: &ProvisionContext,
        cluster: &Cluster,
        instances: &[Instance],
    ) -> Result<(), Error> {
        let profile = Self::profile(cluster)?;
        let mut commands: BTreeMap<InstanceUuid, Vec<String>> = BTreeMap::new();
        let mut workers = Vec::new();
        for instance in instances {
            let processes = cluster.processes_of(instance);
            let starts: Vec<String> = WORKER_PROCESSES
                .iter()
                .filter(|p| processes.contains(**p))
                .filter_map(|p| profile.start_command(p))
                .collect();
            if !starts.is_empty() {
                commands.insert(instance.id, starts);
                workers.push(instance.clone());
            }
        }
        let commands = Arc::new(commands);
        ctx.for_each_instance("Start worker services", &workers, |ctx, instance| {
            let commands = commands.clone();
            async move {
                let starts =
                    commands.get(&instance.id).cloned().unwrap_or_default();
                ctx.remote()
                    .execute_batch(&instance, &starts, &ExecOptions::as_root())
                    .await?;
                Ok::<(), Error>(())
            }
        })
        .await
    }

    async fn wait_for_datanodes(
        &self,
        ctx: &ProvisionContext,
        cluster: &Cluster,
    ) -> Result<(), Error> {
        let profile = Self::profile(cluster)?;
        let namenode = Self::master(cluster, "namenode")?;
        let expected = cluster.instances_with_process("datanode").len();
        let source = status::DatanodeReport { profile };
        let interval = ctx.timeouts().default_poll_interval();
        ctx.plugin_option_poll(
            &DATANODES_STARTUP_TIMEOUT,
            "Wait for DataNodes startup",
            interval,
            || async {
                let statuses = source.statuses(ctx, namenode).await?;
                let live = statuses
                    .values()
                    .filter(|s| **s == NodeStatus::InService)
                    .count();
                Ok::<bool, Error>(live >= expected)
            },
        )
        .await
    }

    async fn refresh_membership(
        &self,
        ctx: &ProvisionContext,
        cluster: &Cluster,
    ) -> Result<(), Error> {
        for role in Self::roles(Self::profile(cluster)?) {
            let master = Self::master(cluster, &role.master_process)?;
            ctx.remote()
                .execute(master, &role.refresh_command, &ExecOptions::as_root())
                .await?;
        }
        Ok(())
    }
}

fn config_host_list(cluster: &Cluster, process: &str) -> String {
    crate::decommission::render_host_list(
        cluster
            .instances_with_process(process)
            .into_iter()
            .map(Instance::hostname),
    )
}

/// Checks process counts: `count` reports how many instances will run a
/// process.
fn validate_topology(
    count: impl Fn(&str) -> usize,
    replication: u64,
) -> Result<(), Error> {
    for process in ["namenode", "resourcemanager"] {
        let n = count(process);
        if n != 1 {
            return Err(Error::validation(format!(
                "{} must be on exactly one instance, not {}",
                process, n
            )));
        }
    }
    let secondaries = count("secondarynamenode");
    if secondaries > 1 {
        return Err(Error::validation(format!(
            "secondarynamenode must be on at most one instance, not {}",
            secondaries
        )));
    }
    let datanodes = count("datanode");
    if datanodes == 0 {
        return Err(Error::validation("cluster needs at least one datanode"));
    }
    if replication > datanodes as u64 {
        return Err(Error::validation(format!(
            "{} is {}, but only {} datanode(s) would remain",
            DFS_REPLICATION.name, replication, datanodes
        )));
    }
    Ok(())
}

#[async_trait]
impl Plugin for HadoopPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn options(&self) -> Vec<PluginOption> {
        vec![
            DFS_REPLICATION,
            DATANODES_STARTUP_TIMEOUT,
            DATANODES_DECOMMISSIONING_TIMEOUT,
            NODEMANAGERS_DECOMMISSIONING_TIMEOUT,
        ]
    }

    async fn validate(
        &self,
        ctx: &ProvisionContext,
        cluster: &Cluster,
    ) -> Result<(), Error> {
        Self::profile(cluster)?;
        let replication = ctx.option_value(cluster, &DFS_REPLICATION)?;
        validate_topology(|p| cluster.process_count(p), replication)
    }

    async fn configure_cluster(
        &self,
        ctx: &ProvisionContext,
        cluster: &Cluster,
    ) -> Result<(), Error> {
        let instances: Vec<Instance> = cluster.instances().cloned().collect();
        self.write_configs(ctx, cluster, &instances).await
    }

    async fn start_cluster(
        &self,
        ctx: &ProvisionContext,
        cluster: &Cluster,
    ) -> Result<(), Error> {
        let profile = Self::profile(cluster)?;
        let namenode = Self::master(cluster, "namenode")?.clone();

        let mut masters: BTreeMap<InstanceUuid, (Instance, Vec<String>)> =
            BTreeMap::new();
        masters
            .entry(namenode.id)
            .or_insert_with(|| (namenode.clone(), Vec::new()))
            .1
            .push(profile.format_namenode());
        for process in MASTER_PROCESSES {
            for instance in cluster.instances_with_process(process) {
                if let Some(command) = profile.start_command(process) {
                    masters
                        .entry(instance.id)
                        .or_insert_with(|| (instance.clone(), Vec::new()))
                        .1
                        .push(command);
                }
            }
        }

        ctx.run_cluster_step("Start master services", async {
            for (instance, commands) in masters.values() {
                info!(ctx.log(), "starting master services";
                    "instance" => &instance.name,
                    "commands" => commands.len(),
                );
                ctx.remote()
                    .execute_batch(instance, commands, &ExecOptions::as_root())
                    .await?;
            }
            Ok::<(), Error>(())
        })
        .await?;

        let instances: Vec<Instance> = cluster.instances().cloned().collect();
        self.start_workers(ctx, cluster, &instances).await?;
        self.wait_for_datanodes(ctx, cluster).await
    }

    async fn scale_cluster(
        &self,
        ctx: &ProvisionContext,
        cluster: &Cluster,
        instances: &[Instance],
    ) -> Result<(), Error> {
        // Every instance gets the new include lists and hosts file.
        let all: Vec<Instance> = cluster.instances().cloned().collect();
        self.write_configs(ctx, cluster, &all).await?;
        self.refresh_membership(ctx, cluster).await?;
        self.start_workers(ctx, cluster, instances).await
    }

    async fn decommission_nodes(
        &self,
        ctx: &ProvisionContext,
        cluster: &Cluster,
        instances: &[Instance],
    ) -> Result<(), Error> {
        let roles = Self::roles(Self::profile(cluster)?);
        DecommissionCoordinator::new(ctx)
            .decommission(cluster, instances, &roles)
            .await
    }

    async fn validate_scaling(
        &self,
        ctx: &ProvisionContext,
        cluster: &Cluster,
        existing: &BTreeMap<NodeGroupUuid, usize>,
        additional: &[NodeGroupCreate],
    ) -> Result<(), Error> {
        for node_group in &cluster.node_groups {
            let Some(count) = existing.get(&node_group.id) else {
                continue;
            };
            if *count != node_group.count
                && MASTER_PROCESSES.iter().any(|p| node_group.has_process(p))
            {
                return Err(Error::validation(format!(
                    "node group {:?} runs master processes and cannot be \
                     resized",
                    node_group.name
                )));
            }
        }
        for node_group in additional {
            if MASTER_PROCESSES
                .iter()
                .any(|p| node_group.node_processes.contains(*p))
            {
                return Err(Error::validation(format!(
                    "new node group {:?} may not run master processes",
                    node_group.name
                )));
            }
        }

        let replication = ctx.option_value(cluster, &DFS_REPLICATION)?;
        let count = |process: &str| -> usize {
            let current: usize = cluster
                .node_groups
                .iter()
                .filter(|ng| ng.has_process(process))
                .map(|ng| existing.get(&ng.id).copied().unwrap_or(ng.count))
                .sum();
            let added: usize = additional
                .iter()
                .filter(|ng| ng.node_processes.contains(process))
                .map(|ng| ng.count)
                .sum();
            current + added
        };
        validate_topology(count, replication)
    }
}
