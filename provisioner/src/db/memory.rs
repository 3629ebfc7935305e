// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::DataStore;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Mutex;
use trellis_common::api::external::Cluster;
use trellis_common::api::external::ClusterStatus;
use trellis_common::api::external::CreateResult;
use trellis_common::api::external::DeleteResult;
use trellis_common::api::external::Error;
use trellis_common::api::external::Instance;
use trellis_common::api::external::ListResultVec;
use trellis_common::api::external::LookupResult;
use trellis_common::api::external::NodeGroup;
use trellis_common::api::external::ProvisioningEvent;
use trellis_common::api::external::ProvisioningStep;
use trellis_common::api::external::ResourceType;
use trellis_common::api::external::UpdateResult;
use trellis_common::typed_uuid::ClusterUuid;
use trellis_common::typed_uuid::InstanceUuid;
use trellis_common::typed_uuid::NodeGroupUuid;
use trellis_common::typed_uuid::StepUuid;
use trellis_common::typed_uuid::ToUntypedUuid;

#[derive(Default)]
struct State {
    clusters: BTreeMap<ClusterUuid, Cluster>,
    step_owners: BTreeMap<StepUuid, ClusterUuid>,
    events: BTreeMap<StepUuid, Vec<ProvisioningEvent>>,
}

impl State {
    fn cluster_mut(&mut self, id: ClusterUuid) -> LookupResult<&mut Cluster> {
        self.clusters.get_mut(&id).ok_or_else(|| {
            Error::not_found_by_id(
                ResourceType::Cluster,
                &id.to_untyped_uuid(),
            )
        })
    }

    fn step_mut(
        &mut self,
        id: StepUuid,
    ) -> LookupResult<&mut ProvisioningStep> {
        let not_found = || {
            Error::not_found_by_id(
                ResourceType::ProvisioningStep,
                &id.to_untyped_uuid(),
            )
        };
        let cluster_id = *self.step_owners.get(&id).ok_or_else(not_found)?;
        self.cluster_mut(cluster_id)?
            .provision_progress
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(not_found)
    }
}

/// A [`DataStore`] that keeps everything in process memory
#[derive(Default)]
pub struct MemoryDataStore {
    state: Mutex<State>,
}

impl MemoryDataStore {
    pub fn new() -> MemoryDataStore {
        MemoryDataStore::default()
    }

    /// Number of events currently stored, across all clusters.
    pub fn event_count(&self) -> usize {
        self.state.lock().unwrap().events.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl DataStore for MemoryDataStore {
    async fn cluster_create(&self, cluster: Cluster) -> CreateResult<Cluster> {
        let mut state = self.state.lock().unwrap();
        if state.clusters.values().any(|c| {
            c.name == cluster.name && c.tenant_id == cluster.tenant_id
        }) {
            return Err(Error::ObjectAlreadyExists {
                type_name: ResourceType::Cluster,
                object_name: cluster.name,
            });
        }
        state.clusters.insert(cluster.id, cluster.clone());
        Ok(cluster)
    }

    async fn cluster_get(&self, id: ClusterUuid) -> LookupResult<Cluster> {
        let mut state = self.state.lock().unwrap();
        state.cluster_mut(id).map(|c| c.clone())
    }

    async fn cluster_list(&self) -> ListResultVec<Cluster> {
        Ok(self.state.lock().unwrap().clusters.values().cloned().collect())
    }

    async fn cluster_update_status(
        &self,
        id: ClusterUuid,
        status: ClusterStatus,
        description: &str,
    ) -> UpdateResult<Cluster> {
        let mut state = self.state.lock().unwrap();
        let cluster = state.cluster_mut(id)?;
        if cluster.status == ClusterStatus::Deleting
            && !matches!(status, ClusterStatus::Deleting | ClusterStatus::Error)
        {
            return Err(Error::conflict(&format!(
                "cluster {:?} is being deleted",
                cluster.name
            )));
        }
        cluster.status = status;
        cluster.status_description = description.to_string();
        cluster.time_updated = Utc::now();
        Ok(cluster.clone())
    }

    async fn cluster_record_failure(
        &self,
        id: ClusterUuid,
        description: &str,
    ) -> UpdateResult<Cluster> {
        let mut state = self.state.lock().unwrap();
        let cluster = state.cluster_mut(id)?;
        if cluster.status == ClusterStatus::Deleting {
            return Err(Error::conflict(&format!(
                "cluster {:?} is being deleted",
                cluster.name
            )));
        }
        cluster.status = ClusterStatus::Error;
        cluster.status_description = description.to_string();
        cluster.time_updated = Utc::now();
        Ok(cluster.clone())
    }

    async fn cluster_update_extra(
        &self,
        id: ClusterUuid,
        extra: BTreeMap<String, String>,
    ) -> UpdateResult<Cluster> {
        let mut state = self.state.lock().unwrap();
        let cluster = state.cluster_mut(id)?;
        cluster.extra = extra;
        cluster.time_updated = Utc::now();
        Ok(cluster.clone())
    }

    async fn cluster_delete(&self, id: ClusterUuid) -> DeleteResult {
        let mut state = self.state.lock().unwrap();
        let cluster = state.clusters.remove(&id).ok_or_else(|| {
            Error::not_found_by_id(ResourceType::Cluster, &id.to_untyped_uuid())
        })?;
        for step in &cluster.provision_progress {
            state.step_owners.remove(&step.id);
            state.events.remove(&step.id);
        }
        Ok(())
    }

    async fn node_group_add(
        &self,
        cluster_id: ClusterUuid,
        node_group: NodeGroup,
    ) -> CreateResult<NodeGroup> {
        let mut state = self.state.lock().unwrap();
        let cluster = state.cluster_mut(cluster_id)?;
        if cluster.node_groups.iter().any(|ng| ng.name == node_group.name) {
            return Err(Error::ObjectAlreadyExists {
                type_name: ResourceType::NodeGroup,
                object_name: node_group.name,
            });
        }
        cluster.node_groups.push(node_group.clone());
        cluster.time_updated = Utc::now();
        Ok(node_group)
    }

    async fn node_group_update_count(
        &self,
        cluster_id: ClusterUuid,
        node_group_id: NodeGroupUuid,
        count: usize,
    ) -> UpdateResult<NodeGroup> {
        let mut state = self.state.lock().unwrap();
        let cluster = state.cluster_mut(cluster_id)?;
        let node_group = cluster
            .node_groups
            .iter_mut()
            .find(|ng| ng.id == node_group_id)
            .ok_or_else(|| {
                Error::not_found_by_id(
                    ResourceType::NodeGroup,
                    &node_group_id.to_untyped_uuid(),
                )
            })?;
        node_group.count = count;
        Ok(node_group.clone())
    }

    async fn instance_add(
        &self,
        cluster_id: ClusterUuid,
        instance: Instance,
    ) -> CreateResult<Instance> {
        let mut state = self.state.lock().unwrap();
        let cluster = state.cluster_mut(cluster_id)?;
        if cluster.instances().any(|i| i.name == instance.name) {
            return Err(Error::ObjectAlreadyExists {
                type_name: ResourceType::Instance,
                object_name: instance.name,
            });
        }
        let node_group = cluster
            .node_groups
            .iter_mut()
            .find(|ng| ng.id == instance.node_group_id)
            .ok_or_else(|| {
                Error::not_found_by_id(
                    ResourceType::NodeGroup,
                    &instance.node_group_id.to_untyped_uuid(),
                )
            })?;
        node_group.instances.push(instance.clone());
        node_group.instances.sort_by_key(|i| i.index);
        Ok(instance)
    }

    async fn instance_remove(
        &self,
        cluster_id: ClusterUuid,
        instance_id: InstanceUuid,
    ) -> DeleteResult {
        let mut state = self.state.lock().unwrap();
        let cluster = state.cluster_mut(cluster_id)?;
        for node_group in &mut cluster.node_groups {
            if let Some(position) =
                node_group.instances.iter().position(|i| i.id == instance_id)
            {
                node_group.instances.remove(position);
                return Ok(());
            }
        }
        Err(Error::not_found_by_id(
            ResourceType::Instance,
            &instance_id.to_untyped_uuid(),
        ))
    }

    async fn step_create(
        &self,
        step: ProvisioningStep,
    ) -> CreateResult<ProvisioningStep> {
        let mut state = self.state.lock().unwrap();
        state.cluster_mut(step.cluster_id)?.provision_progress.push(step.clone());
        state.step_owners.insert(step.id, step.cluster_id);
        Ok(step)
    }

    async fn step_update(&self, step: &ProvisioningStep) -> UpdateResult<()> {
        let mut state = self.state.lock().unwrap();
        *state.step_mut(step.id)? = step.clone();
        Ok(())
    }

    async fn step_list(
        &self,
        cluster_id: ClusterUuid,
    ) -> ListResultVec<ProvisioningStep> {
        let mut state = self.state.lock().unwrap();
        Ok(state.cluster_mut(cluster_id)?.provision_progress.clone())
    }

    async fn event_create(
        &self,
        event: ProvisioningEvent,
    ) -> CreateResult<ProvisioningEvent> {
        let mut state = self.state.lock().unwrap();
        // Refuse events for steps that vanished with their cluster.
        state.step_mut(event.step_id)?;
        state.events.entry(event.step_id).or_default().push(event.clone());
        Ok(event)
    }

    async fn event_list(
        &self,
        step_id: StepUuid,
    ) -> ListResultVec<ProvisioningEvent> {
        let state = self.state.lock().unwrap();
        Ok(state.events.get(&step_id).cloned().unwrap_or_default())
    }

    async fn event_purge(&self, step_id: StepUuid) -> DeleteResult {
        self.state.lock().unwrap().events.remove(&step_id);
        Ok(())
    }
}
