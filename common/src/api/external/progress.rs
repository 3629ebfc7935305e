// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisioning steps and the events recorded against them

use crate::typed_uuid::ClusterUuid;
use crate::typed_uuid::EventUuid;
use crate::typed_uuid::InstanceUuid;
use crate::typed_uuid::NodeGroupUuid;
use crate::typed_uuid::StepUuid;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// A named phase of lifecycle work with an expected number of units
///
/// `completed` always equals the number of successful events recorded for
/// the step.  `successful` is `None` while the step is open, `Some(false)` as
/// soon as any event reports failure, and `Some(true)` once `completed`
/// reaches `total`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ProvisioningStep {
    pub id: StepUuid,
    pub cluster_id: ClusterUuid,
    pub step_name: String,
    pub total: usize,
    pub completed: usize,
    pub successful: Option<bool>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProvisioningStep {
    pub fn is_open(&self) -> bool {
        self.successful.is_none()
    }
}

/// The instance an event is about
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct EventInstance {
    pub instance_id: InstanceUuid,
    pub instance_name: String,
    pub node_group_id: NodeGroupUuid,
}

/// One unit's outcome within a step
///
/// `instance` is `None` for cluster-wide units of work (e.g. "format the
/// namenode").
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ProvisioningEvent {
    pub id: EventUuid,
    pub step_id: StepUuid,
    pub instance: Option<EventInstance>,
    pub successful: bool,
    pub event_info: Option<String>,
    pub time_created: DateTime<Utc>,
}

/// A step together with the events it still retains
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StepProgress {
    pub step: ProvisioningStep,
    pub events: Vec<ProvisioningEvent>,
}

/// The full provisioning log of a cluster, in the order steps were opened
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ProvisionProgress {
    pub steps: Vec<StepProgress>,
}

impl ProvisionProgress {
    /// Returns the open step, if there is one.
    pub fn current_step(&self) -> Option<&ProvisioningStep> {
        self.steps.iter().map(|s| &s.step).rev().find(|s| s.is_open())
    }

    /// Iterates over every failure event still retained.
    pub fn failures(&self) -> impl Iterator<Item = &ProvisioningEvent> + '_ {
        self.steps
            .iter()
            .flat_map(|s| s.events.iter())
            .filter(|e| !e.successful)
    }

    pub fn event_count(&self) -> usize {
        self.steps.iter().map(|s| s.events.len()).sum()
    }
}
