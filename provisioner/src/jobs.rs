// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the job execution service

use async_trait::async_trait;
use trellis_common::api::external::Error;
use trellis_common::api::external::ListResultVec;
use trellis_common::typed_uuid::ClusterUuid;
use trellis_common::typed_uuid::JobExecutionUuid;

/// Submits job executions to the workflow engine.
///
/// Executions requested while a cluster was still being provisioned wait
/// as "pending" until the cluster becomes active.
#[async_trait]
pub trait JobManager: Send + Sync {
    async fn pending_executions(
        &self,
        cluster_id: ClusterUuid,
    ) -> ListResultVec<JobExecutionUuid>;

    async fn run_execution(
        &self,
        cluster_id: ClusterUuid,
        execution_id: JobExecutionUuid,
    ) -> Result<(), Error>;
}
