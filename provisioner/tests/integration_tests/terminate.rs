// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tests for terminating clusters

use crate::common::TestContext;
use assert_matches::assert_matches;
use trellis_common::api::external::ClusterStatus;
use trellis_common::api::external::Error;
use trellis_common::typed_uuid::ClusterUuid;
use trellis_provisioner::sim::cluster_request;
use trellis_provisioner::sim::SECRET_EXTRA_KEY;

#[tokio::test(start_paused = true)]
async fn test_terminate_active_cluster() {
    let cptestctx = TestContext::new("test_terminate_active_cluster");
    let env = &cptestctx.env;
    let cluster = cptestctx.active_cluster("c1", 2).await;
    assert!(cluster.extra.contains_key(SECRET_EXTRA_KEY));
    assert_eq!(env.keystore.len(), 1);

    env.orchestrator.terminate_cluster(cluster.id).await.unwrap();

    assert!(env.keystore.is_empty());
    assert!(env.infra.is_shut_down(cluster.id));
    assert_eq!(env.plugin.terminated(), vec![cluster.id]);
    assert!(env
        .orchestrator
        .cluster(cluster.id)
        .await
        .unwrap_err()
        .is_not_found());
    // The progress log went with it.
    assert!(env.orchestrator.cluster_progress(cluster.id).await.is_err());

    // A second termination finds nothing to terminate.
    assert!(env
        .orchestrator
        .terminate_cluster(cluster.id)
        .await
        .unwrap_err()
        .is_not_found());

    cptestctx.teardown();
}

#[tokio::test(start_paused = true)]
async fn test_terminate_failed_cluster() {
    let cptestctx = TestContext::new("test_terminate_failed_cluster");
    let env = &cptestctx.env;
    env.plugin.fail_validation(Some("nope"));
    let cluster =
        env.orchestrator.create_cluster(cluster_request("c1", 1)).await.unwrap();
    env.orchestrator.provision_cluster(cluster.id).await.unwrap_err();

    // No secret was ever stored; teardown copes.
    env.orchestrator.terminate_cluster(cluster.id).await.unwrap();
    assert!(env.infra.is_shut_down(cluster.id));
    assert!(env
        .orchestrator
        .cluster(cluster.id)
        .await
        .unwrap_err()
        .is_not_found());

    cptestctx.teardown();
}

#[tokio::test(start_paused = true)]
async fn test_terminate_infra_failure() {
    let cptestctx = TestContext::new("test_terminate_infra_failure");
    let env = &cptestctx.env;
    let cluster = cptestctx.active_cluster("c1", 2).await;
    env.infra.fail_shutdown(Some("cloud unreachable"));

    let error = env.orchestrator.terminate_cluster(cluster.id).await.unwrap_err();
    assert_matches!(error, Error::ServiceUnavailable { .. });

    // The record is kept so the instances are not forgotten.
    let cluster = env.orchestrator.cluster(cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Error);
    assert!(cluster.status_description.contains("cloud unreachable"));
    assert_eq!(env.infra.instances(cluster.id).len(), 3);

    // Once the cloud is back, termination goes through.
    env.infra.fail_shutdown(None);
    env.orchestrator.terminate_cluster(cluster.id).await.unwrap();
    assert!(env.infra.is_shut_down(cluster.id));

    cptestctx.teardown();
}

#[tokio::test]
async fn test_terminate_unknown_cluster() {
    let cptestctx = TestContext::new("test_terminate_unknown_cluster");
    let error = cptestctx
        .env
        .orchestrator
        .terminate_cluster(ClusterUuid::new_v4())
        .await
        .unwrap_err();
    assert!(error.is_not_found());
    cptestctx.teardown();
}
