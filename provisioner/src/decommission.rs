// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Draining instances out of a distributed service before removing them
//!
//! Services like HDFS and YARN keep their own idea of cluster membership:
//! the master reads an *include* file (hosts allowed to join) and an
//! *exclude* file (hosts being drained).  Removing a data-bearing instance
//! safely means
//!
//! 1. publishing the new include and exclude lists to every instance,
//! 2. asking the master to re-read them,
//! 3. waiting until the master reports every excluded host as
//!    decommissioned, and only then
//! 4. clearing the exclude list, deleting the instances and refreshing the
//!    master once more.
//!
//! If the wait in step 3 times out, no instance is deleted.  A node stuck
//! in "decommissioning" can be investigated; deleted storage cannot be
//! recovered.

use crate::context::ProvisionContext;
use crate::plugin::PluginOption;
use async_trait::async_trait;
use parse_display::Display;
use slog::info;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use trellis_common::api::external::Cluster;
use trellis_common::api::external::Error;
use trellis_common::api::external::Instance;
use trellis_remote::ExecOptions;

pub const DATANODES_DECOMMISSIONING_TIMEOUT: PluginOption = PluginOption {
    name: "DataNodes decommissioning timeout",
    target: "HDFS",
    default: 3600 * 4,
    description: "Timeout for datanode decommissioning operation during \
                  scaling, in seconds",
};

pub const NODEMANAGERS_DECOMMISSIONING_TIMEOUT: PluginOption = PluginOption {
    name: "NodeManagers decommissioning timeout",
    target: "YARN",
    default: 300,
    description: "Timeout for nodemanager decommissioning operation during \
                  scaling, in seconds",
};

/// Membership state of one host as reported by a service's master
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum NodeStatus {
    InService,
    Decommissioning,
    Decommissioned,
    Unknown,
}

/// Reports membership status per host name, as seen by `master`.
#[async_trait]
pub trait NodeStatusSource: Send + Sync {
    async fn statuses(
        &self,
        ctx: &ProvisionContext,
        master: &Instance,
    ) -> Result<BTreeMap<String, NodeStatus>, Error>;
}

/// How to decommission one role (e.g. "datanode")
#[derive(Clone)]
pub struct RoleDecommission {
    /// process whose hosts are being drained
    pub role: String,
    /// process that owns membership for `role`
    pub master_process: String,
    pub include_path: String,
    pub exclude_path: String,
    /// run as root on the master to make it re-read its lists
    pub refresh_command: String,
    pub timeout_option: PluginOption,
    pub status_source: Arc<dyn NodeStatusSource>,
}

/// One line per host, in the order given.
pub fn render_host_list<'a>(hosts: impl IntoIterator<Item = &'a str>) -> String {
    hosts.into_iter().map(|h| format!("{h}\n")).collect()
}

struct DrainedRole<'r> {
    role: &'r RoleDecommission,
    master: Instance,
    survivors: Vec<String>,
}

pub struct DecommissionCoordinator<'a> {
    ctx: &'a ProvisionContext,
    poll_interval: Duration,
}

impl<'a> DecommissionCoordinator<'a> {
    pub fn new(ctx: &'a ProvisionContext) -> DecommissionCoordinator<'a> {
        let poll_interval = ctx.timeouts().default_poll_interval();
        DecommissionCoordinator { ctx, poll_interval }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Drains `removing` out of every role in `roles`, then deletes them.
    pub async fn decommission(
        &self,
        cluster: &Cluster,
        removing: &[Instance],
        roles: &[RoleDecommission],
    ) -> Result<(), Error> {
        let removing_ids: BTreeSet<_> = removing.iter().map(|i| i.id).collect();
        let live: Vec<Instance> = cluster.instances().cloned().collect();
        let mut drained = Vec::new();

        for role in roles {
            let excluded: Vec<&Instance> = removing
                .iter()
                .filter(|i| cluster.processes_of(i).contains(&role.role))
                .collect();
            if excluded.is_empty() {
                continue;
            }
            let master = cluster
                .instance_with_process(&role.master_process)
                .ok_or_else(|| {
                    Error::configuration(format!(
                        "no {} to decommission {}s through",
                        role.master_process, role.role
                    ))
                })?
                .clone();
            if removing_ids.contains(&master.id) {
                return Err(Error::invalid_request(&format!(
                    "cannot remove {}, which runs the {}",
                    master.name, role.master_process
                )));
            }
            let survivors: Vec<String> = cluster
                .instances_with_process(&role.role)
                .into_iter()
                .filter(|i| !removing_ids.contains(&i.id))
                .map(|i| i.name.clone())
                .collect();
            let excluded_names: Vec<String> =
                excluded.iter().map(|i| i.name.clone()).collect();

            info!(self.ctx.log(), "decommissioning";
                "role" => &role.role,
                "hosts" => excluded_names.join(","),
            );
            self.publish_lists(
                &format!("Decommission {}s", role.role),
                &live,
                role,
                &survivors,
                &excluded_names,
            )
            .await?;
            self.refresh(role, &master).await?;
            self.wait_for_decommission(role, &master, &excluded_names).await?;

            drained.push(DrainedRole { role, master, survivors });
        }

        if drained.is_empty() {
            return self.ctx.delete_instances(removing).await;
        }

        let remaining: Vec<Instance> = live
            .into_iter()
            .filter(|i| !removing_ids.contains(&i.id))
            .collect();
        for DrainedRole { role, survivors, .. } in &drained {
            self.publish_lists(
                &format!("Update {} membership", role.role),
                &remaining,
                role,
                survivors,
                &[],
            )
            .await?;
        }
        self.ctx.delete_instances(removing).await?;
        for DrainedRole { role, master, .. } in &drained {
            self.refresh(role, master).await?;
        }
        Ok(())
    }

    async fn publish_lists(
        &self,
        step_name: &str,
        instances: &[Instance],
        role: &RoleDecommission,
        include: &[String],
        exclude: &[String],
    ) -> Result<(), Error> {
        let mut files = BTreeMap::new();
        files.insert(
            role.include_path.clone(),
            render_host_list(include.iter().map(String::as_str)).into_bytes(),
        );
        files.insert(
            role.exclude_path.clone(),
            render_host_list(exclude.iter().map(String::as_str)).into_bytes(),
        );
        let files = Arc::new(files);
        self.ctx
            .for_each_instance(step_name, instances, |ctx, instance| {
                let files = files.clone();
                async move {
                    ctx.remote()
                        .write_files(&instance, &files, true)
                        .await
                        .map_err(Error::from)
                }
            })
            .await
    }

    async fn refresh(
        &self,
        role: &RoleDecommission,
        master: &Instance,
    ) -> Result<(), Error> {
        self.ctx
            .remote()
            .execute(master, &role.refresh_command, &ExecOptions::as_root())
            .await?;
        Ok(())
    }

    async fn wait_for_decommission(
        &self,
        role: &RoleDecommission,
        master: &Instance,
        hosts: &[String],
    ) -> Result<(), Error> {
        let operation = format!("Wait for {}s decommissioning", role.role);
        self.ctx
            .plugin_option_poll(
                &role.timeout_option,
                &operation,
                self.poll_interval,
                || async {
                    let statuses =
                        role.status_source.statuses(self.ctx, master).await?;
                    Ok::<bool, Error>(hosts.iter().all(|host| {
                        statuses.get(host) == Some(&NodeStatus::Decommissioned)
                    }))
                },
            )
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_render_host_list() {
        assert_eq!(render_host_list(["a", "b"]), "a\nb\n");
        assert_eq!(render_host_list(Vec::<&str>::new()), "");
    }

    #[test]
    fn test_option_defaults() {
        assert_eq!(DATANODES_DECOMMISSIONING_TIMEOUT.default, 14400);
        assert_eq!(NODEMANAGERS_DECOMMISSIONING_TIMEOUT.target, "YARN");
    }
}
