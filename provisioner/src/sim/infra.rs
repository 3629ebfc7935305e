// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated cloud

use crate::infra::Infrastructure;
use async_trait::async_trait;
use chrono::Utc;
use slog::info;
use slog::o;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::Duration;
use trellis_common::api::external::Cluster;
use trellis_common::api::external::Error;
use trellis_common::api::external::Instance;
use trellis_common::api::external::NodeGroup;
use trellis_common::typed_uuid::ClusterUuid;
use trellis_common::typed_uuid::InstanceUuid;
use trellis_common::typed_uuid::NodeGroupUuid;

#[derive(Default)]
struct SimInfraState {
    instances: BTreeMap<ClusterUuid, Vec<Instance>>,
    shut_down: BTreeSet<ClusterUuid>,
    next_address: u32,
    create_failure: Option<String>,
    delete_failure: Option<String>,
    shutdown_failure: Option<String>,
    create_delay: Duration,
}

impl SimInfraState {
    fn next_ip(&mut self) -> IpAddr {
        let n = self.next_address;
        self.next_address += 1;
        IpAddr::V4(Ipv4Addr::new(10, 0, (n / 250) as u8, (n % 250 + 1) as u8))
    }

    fn new_instance(
        &mut self,
        cluster: &Cluster,
        node_group_id: NodeGroupUuid,
        node_group_name: &str,
        index: usize,
    ) -> Instance {
        let name = format!("{}-{}-{}", cluster.name, node_group_name, index);
        let ip = self.next_ip();
        Instance {
            id: InstanceUuid::new_v4(),
            node_group_id,
            fqdn: format!("{}.trellis.test", name),
            name,
            index,
            management_ip: Some(ip),
            internal_ip: Some(ip),
            time_created: Utc::now(),
        }
    }
}

/// An [`Infrastructure`] whose VMs exist only in memory
///
/// Instances are named `{cluster}-{node group}-{index}` and get addresses
/// from 10.0.0.0/16.
pub struct SimInfrastructure {
    log: Logger,
    state: Mutex<SimInfraState>,
}

impl SimInfrastructure {
    pub fn new(log: &Logger) -> SimInfrastructure {
        SimInfrastructure {
            log: log.new(o!("component" => "SimInfrastructure")),
            state: Mutex::new(SimInfraState::default()),
        }
    }

    /// Instances currently allocated to `cluster_id`.
    pub fn instances(&self, cluster_id: ClusterUuid) -> Vec<Instance> {
        self.state
            .lock()
            .unwrap()
            .instances
            .get(&cluster_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_shut_down(&self, cluster_id: ClusterUuid) -> bool {
        self.state.lock().unwrap().shut_down.contains(&cluster_id)
    }

    /// Make instance creation fail with `message` (or succeed again).
    pub fn fail_create(&self, message: Option<&str>) {
        self.state.lock().unwrap().create_failure = message.map(str::to_string);
    }

    pub fn fail_delete(&self, message: Option<&str>) {
        self.state.lock().unwrap().delete_failure = message.map(str::to_string);
    }

    pub fn fail_shutdown(&self, message: Option<&str>) {
        self.state.lock().unwrap().shutdown_failure =
            message.map(str::to_string);
    }

    /// Delay every instance creation by `delay`.
    pub fn set_create_delay(&self, delay: Duration) {
        self.state.lock().unwrap().create_delay = delay;
    }

    async fn creation_delay(&self) -> Result<(), Error> {
        let (delay, failure) = {
            let state = self.state.lock().unwrap();
            (state.create_delay, state.create_failure.clone())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(message) => Err(Error::unavail(&message)),
            None => Ok(()),
        }
    }

    fn grow(
        state: &mut SimInfraState,
        cluster: &Cluster,
        node_group: &NodeGroup,
        count: usize,
        allocated: &[Instance],
    ) -> Vec<Instance> {
        let have = allocated
            .iter()
            .filter(|i| i.node_group_id == node_group.id)
            .count();
        let mut next_index = allocated
            .iter()
            .filter(|i| i.node_group_id == node_group.id)
            .map(|i| i.index + 1)
            .max()
            .unwrap_or(0);
        let mut created = Vec::new();
        for _ in have..count {
            created.push(state.new_instance(
                cluster,
                node_group.id,
                &node_group.name,
                next_index,
            ));
            next_index += 1;
        }
        created
    }
}

#[async_trait]
impl Infrastructure for SimInfrastructure {
    async fn create_cluster(
        &self,
        cluster: &Cluster,
    ) -> Result<Vec<Instance>, Error> {
        self.creation_delay().await?;
        let mut state = self.state.lock().unwrap();
        let mut created = Vec::new();
        for node_group in &cluster.node_groups {
            let allocated: Vec<Instance> =
                state.instances.get(&cluster.id).cloned().unwrap_or_default();
            created.extend(Self::grow(
                &mut state,
                cluster,
                node_group,
                node_group.count,
                &allocated,
            ));
        }
        state
            .instances
            .entry(cluster.id)
            .or_default()
            .extend(created.iter().cloned());
        info!(self.log, "created instances";
            "cluster_id" => cluster.id.to_string(),
            "count" => created.len(),
        );
        Ok(created)
    }

    async fn scale_cluster(
        &self,
        cluster: &Cluster,
        node_group_counts: &BTreeMap<NodeGroupUuid, usize>,
    ) -> Result<Vec<Instance>, Error> {
        self.creation_delay().await?;
        let mut state = self.state.lock().unwrap();
        let mut allocated =
            state.instances.get(&cluster.id).cloned().unwrap_or_default();
        let mut created = Vec::new();
        for node_group in &cluster.node_groups {
            let Some(count) = node_group_counts.get(&node_group.id) else {
                continue;
            };
            let mut members: Vec<&Instance> = allocated
                .iter()
                .filter(|i| i.node_group_id == node_group.id)
                .collect();
            if members.len() > *count {
                members.sort_by_key(|i| i.index);
                let extra: BTreeSet<InstanceUuid> =
                    members[*count..].iter().map(|i| i.id).collect();
                allocated.retain(|i| !extra.contains(&i.id));
            } else {
                created.extend(Self::grow(
                    &mut state,
                    cluster,
                    node_group,
                    *count,
                    &allocated,
                ));
            }
        }
        allocated.extend(created.iter().cloned());
        state.instances.insert(cluster.id, allocated);
        info!(self.log, "scaled cluster";
            "cluster_id" => cluster.id.to_string(),
            "created" => created.len(),
        );
        Ok(created)
    }

    async fn delete_instances(
        &self,
        cluster: &Cluster,
        instances: &[Instance],
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = &state.delete_failure {
            return Err(Error::unavail(message));
        }
        let doomed: BTreeSet<InstanceUuid> =
            instances.iter().map(|i| i.id).collect();
        if let Some(allocated) = state.instances.get_mut(&cluster.id) {
            allocated.retain(|i| !doomed.contains(&i.id));
        }
        info!(self.log, "deleted instances";
            "cluster_id" => cluster.id.to_string(),
            "count" => doomed.len(),
        );
        Ok(())
    }

    async fn shutdown_cluster(&self, cluster: &Cluster) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = &state.shutdown_failure {
            return Err(Error::unavail(message));
        }
        state.instances.remove(&cluster.id);
        state.shut_down.insert(cluster.id);
        info!(self.log, "shut down cluster";
            "cluster_id" => cluster.id.to_string());
        Ok(())
    }
}
