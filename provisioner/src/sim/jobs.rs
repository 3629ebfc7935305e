// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::jobs::JobManager;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use trellis_common::api::external::Error;
use trellis_common::api::external::ListResultVec;
use trellis_common::typed_uuid::ClusterUuid;
use trellis_common::typed_uuid::JobExecutionUuid;

#[derive(Default)]
struct SimJobState {
    pending: BTreeMap<ClusterUuid, Vec<JobExecutionUuid>>,
    resumed: Vec<(ClusterUuid, JobExecutionUuid)>,
    failure: Option<String>,
}

/// A [`JobManager`] that only records which executions it was asked to run
#[derive(Default)]
pub struct SimJobManager {
    state: Mutex<SimJobState>,
}

impl SimJobManager {
    pub fn new() -> SimJobManager {
        SimJobManager::default()
    }

    /// Queues a new pending execution for `cluster_id`.
    pub fn add_pending(&self, cluster_id: ClusterUuid) -> JobExecutionUuid {
        let id = JobExecutionUuid::new_v4();
        self.state
            .lock()
            .unwrap()
            .pending
            .entry(cluster_id)
            .or_default()
            .push(id);
        id
    }

    /// Executions that have been run, in order.
    pub fn resumed(&self) -> Vec<(ClusterUuid, JobExecutionUuid)> {
        self.state.lock().unwrap().resumed.clone()
    }

    pub fn fail_runs(&self, message: Option<&str>) {
        self.state.lock().unwrap().failure = message.map(str::to_string);
    }
}

#[async_trait]
impl JobManager for SimJobManager {
    async fn pending_executions(
        &self,
        cluster_id: ClusterUuid,
    ) -> ListResultVec<JobExecutionUuid> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pending
            .get(&cluster_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn run_execution(
        &self,
        cluster_id: ClusterUuid,
        execution_id: JobExecutionUuid,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = &state.failure {
            return Err(Error::unavail(message));
        }
        if let Some(pending) = state.pending.get_mut(&cluster_id) {
            pending.retain(|id| *id != execution_id);
        }
        state.resumed.push((cluster_id, execution_id));
        Ok(())
    }
}
