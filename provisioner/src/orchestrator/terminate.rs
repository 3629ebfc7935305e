// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cluster termination

use super::Orchestrator;
use slog::info;
use slog::warn;
use slog_error_chain::InlineErrorChain;
use trellis_common::api::external::ClusterStatus;
use trellis_common::api::external::Error;
use trellis_common::typed_uuid::ClusterUuid;

impl Orchestrator {
    /// Tears a cluster down, whatever state it is in.
    ///
    /// Plugin teardown is best-effort.  If the infrastructure cannot release
    /// the cluster's instances, the cluster is left in `Error` and the
    /// record is kept, so the instances are not orphaned.
    pub async fn terminate_cluster(&self, id: ClusterUuid) -> Result<(), Error> {
        let services = &self.inner.services;
        let ctx = self.context(id);
        let cluster = services
            .datastore
            .cluster_update_status(id, ClusterStatus::Deleting, "deleting cluster")
            .await?;
        info!(ctx.log(), "terminating cluster"; "name" => &cluster.name);

        match self.inner.registry.plugin_for(&cluster) {
            Ok(plugin) => {
                if let Err(error) = plugin.on_terminate_cluster(&ctx, &cluster).await
                {
                    warn!(ctx.log(), "plugin teardown failed";
                        "error" => InlineErrorChain::new(&error));
                }
            }
            Err(error) => {
                warn!(ctx.log(), "skipping plugin teardown";
                    "error" => InlineErrorChain::new(&error));
            }
        }

        if let Err(error) = services.infra.shutdown_cluster(&cluster).await {
            warn!(ctx.log(), "failed to release cluster infrastructure";
                "error" => InlineErrorChain::new(&error));
            let description = format!(
                "failed to release infrastructure: {}",
                InlineErrorChain::new(&error)
            );
            if let Err(update_error) = services
                .datastore
                .cluster_update_status(id, ClusterStatus::Error, &description)
                .await
            {
                warn!(ctx.log(), "failed to record cluster error";
                    "error" => InlineErrorChain::new(&update_error));
            }
            return Err(error);
        }

        match services.datastore.cluster_delete(id).await {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {}
            Err(error) => return Err(error),
        }
        services.tracker.forget_cluster(id);
        services.remote.forget_cluster(id);
        info!(ctx.log(), "cluster terminated");
        Ok(())
    }
}
