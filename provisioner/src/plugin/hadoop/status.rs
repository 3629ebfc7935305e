// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Node membership as reported by the HDFS namenode and YARN
//! resourcemanager

use super::versions::VersionProfile;
use crate::context::ProvisionContext;
use crate::decommission::NodeStatus;
use crate::decommission::NodeStatusSource;
use async_trait::async_trait;
use std::collections::BTreeMap;
use trellis_common::api::external::Error;
use trellis_common::api::external::Instance;
use trellis_remote::ExecOptions;

/// Parses the output of `hdfs dfsadmin -report`.
///
/// Each datanode section starts with a `Hostname:` line and carries a
/// `Decommission Status :` line.
pub fn parse_dfsadmin_report(report: &str) -> BTreeMap<String, NodeStatus> {
    let mut statuses = BTreeMap::new();
    let mut host: Option<String> = None;
    for line in report.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "Hostname" => host = Some(value.trim().to_string()),
            "Decommission Status" => {
                if let Some(host) = host.take() {
                    let status = match value.trim() {
                        "Normal" => NodeStatus::InService,
                        "Decommission in progress" => {
                            NodeStatus::Decommissioning
                        }
                        "Decommissioned" => NodeStatus::Decommissioned,
                        _ => NodeStatus::Unknown,
                    };
                    statuses.insert(host, status);
                }
            }
            _ => {}
        }
    }
    statuses
}

/// Parses the output of `yarn node -all -list`.
///
/// Node lines look like `host:port  STATE  http-address  containers`.
pub fn parse_yarn_node_list(listing: &str) -> BTreeMap<String, NodeStatus> {
    listing
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let node_id = fields.next()?;
            let state = fields.next()?;
            let (host, port) = node_id.rsplit_once(':')?;
            port.parse::<u16>().ok()?;
            let status = match state {
                "RUNNING" | "NEW" | "UNHEALTHY" => NodeStatus::InService,
                "DECOMMISSIONING" => NodeStatus::Decommissioning,
                "DECOMMISSIONED" | "LOST" | "SHUTDOWN" => {
                    NodeStatus::Decommissioned
                }
                _ => NodeStatus::Unknown,
            };
            Some((host.to_string(), status))
        })
        .collect()
}

/// Datanode status, from the namenode's report
pub struct DatanodeReport {
    pub profile: &'static VersionProfile,
}

#[async_trait]
impl NodeStatusSource for DatanodeReport {
    async fn statuses(
        &self,
        ctx: &ProvisionContext,
        master: &Instance,
    ) -> Result<BTreeMap<String, NodeStatus>, Error> {
        let output = ctx
            .remote()
            .execute(
                master,
                &self.profile.dfsadmin_report(),
                &ExecOptions::as_root(),
            )
            .await?;
        Ok(parse_dfsadmin_report(&output.stdout))
    }
}

/// Nodemanager status, from the resourcemanager's node list
pub struct NodemanagerReport {
    pub profile: &'static VersionProfile,
}

#[async_trait]
impl NodeStatusSource for NodemanagerReport {
    async fn statuses(
        &self,
        ctx: &ProvisionContext,
        master: &Instance,
    ) -> Result<BTreeMap<String, NodeStatus>, Error> {
        let output = ctx
            .remote()
            .execute(
                master,
                &self.profile.yarn_node_list(),
                &ExecOptions::as_root(),
            )
            .await?;
        Ok(parse_yarn_node_list(&output.stdout))
    }
}
