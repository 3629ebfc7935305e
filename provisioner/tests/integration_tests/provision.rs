// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tests for creating and provisioning clusters

use crate::common::TestContext;
use assert_matches::assert_matches;
use std::time::Duration;
use trellis_common::api::external::ClusterStatus;
use trellis_common::api::external::Error;
use trellis_provisioner::sim::cluster_request;
use trellis_provisioner::sim::CONFIGURE_COMMAND;
use trellis_provisioner::sim::NODE_CONF;
use trellis_provisioner::Outcome;

#[tokio::test(start_paused = true)]
async fn test_provision_happy_path() {
    let cptestctx = TestContext::new("test_provision_happy_path");
    let cluster = cptestctx.active_cluster("c1", 2).await;
    let env = &cptestctx.env;

    assert_eq!(cluster.instance_count(), 3);
    assert_eq!(env.infra.instances(cluster.id).len(), 3);
    assert!(cluster.status_description.is_empty());

    let progress = env.orchestrator.cluster_progress(cluster.id).await.unwrap();
    let names: Vec<&str> =
        progress.steps.iter().map(|s| s.step.step_name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "Spawning instances",
            "Wait for instance accessibility",
            "Configure instances",
            "Start the cluster",
        ]
    );
    for entry in &progress.steps {
        assert_eq!(entry.step.successful, Some(true));
        assert_eq!(entry.step.completed, 3);
        assert_eq!(entry.step.total, 3);
        assert!(entry.step.completed_at.is_some());
        assert!(entry.events.is_empty());
    }
    assert!(progress.current_step().is_none());

    // Every instance got its configuration.
    for instance in cluster.instances() {
        let conf = env.transport.file(&instance.name, NODE_CONF).unwrap();
        assert!(conf.contains("cluster = c1"));
        let commands = env.transport.commands_on(&instance.name);
        assert!(commands.iter().any(|c| c == CONFIGURE_COMMAND));
    }
    let master = env.transport.file("c1-master-0", NODE_CONF).unwrap();
    assert!(master.contains("namenode"));

    cptestctx.teardown();
}

#[tokio::test(start_paused = true)]
async fn test_provision_configure_failure() {
    let cptestctx = TestContext::new("test_provision_configure_failure");
    let env = &cptestctx.env;
    env.transport.fail_command(
        Some("c1-worker-0"),
        CONFIGURE_COMMAND,
        1,
        "disk full",
    );

    let cluster =
        env.orchestrator.create_cluster(cluster_request("c1", 2)).await.unwrap();
    let error = env.orchestrator.provision_cluster(cluster.id).await.unwrap_err();
    assert_matches!(
        &error,
        Error::RemoteExecution { instance, exit_code: 1, .. }
            if instance == "c1-worker-0"
    );

    let cluster = env.orchestrator.cluster(cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Error);
    assert!(cluster.status_description.contains("disk full"));

    let progress = env.orchestrator.cluster_progress(cluster.id).await.unwrap();
    let configure = progress
        .steps
        .iter()
        .find(|s| s.step.step_name == "Configure instances")
        .unwrap();
    assert_eq!(configure.step.successful, Some(false));
    assert_eq!(configure.step.completed, 2);
    assert_eq!(configure.events.len(), 3);
    let failures: Vec<_> =
        configure.events.iter().filter(|e| !e.successful).collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(
        failures[0].instance.as_ref().unwrap().instance_name,
        "c1-worker-0"
    );
    assert!(failures[0].event_info.as_ref().unwrap().contains("disk full"));

    // The cluster never got as far as starting.
    assert!(!progress.steps.iter().any(|s| s.step.step_name == "Start the cluster"));
    assert!(progress.current_step().is_none());

    cptestctx.teardown();
}

#[tokio::test(start_paused = true)]
async fn test_provision_validation_failure() {
    let cptestctx = TestContext::new("test_provision_validation_failure");
    let env = &cptestctx.env;
    env.plugin.fail_validation(Some("bad topology"));

    let cluster =
        env.orchestrator.create_cluster(cluster_request("c1", 2)).await.unwrap();
    let error = env.orchestrator.provision_cluster(cluster.id).await.unwrap_err();
    assert_matches!(error, Error::ValidationFailed { .. });

    let cluster = env.orchestrator.cluster(cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Error);
    assert!(cluster.status_description.contains("bad topology"));
    assert!(env.infra.instances(cluster.id).is_empty());

    // A cluster that is no longer validating cannot be provisioned again.
    assert_matches!(
        env.orchestrator.provision_cluster(cluster.id).await,
        Err(Error::InvalidRequest { .. })
    );

    cptestctx.teardown();
}

#[tokio::test(start_paused = true)]
async fn test_provision_spawn_failure() {
    let cptestctx = TestContext::new("test_provision_spawn_failure");
    let env = &cptestctx.env;
    env.infra.fail_create(Some("quota exceeded"));

    let cluster =
        env.orchestrator.create_cluster(cluster_request("c1", 2)).await.unwrap();
    let error = env.orchestrator.provision_cluster(cluster.id).await.unwrap_err();
    assert_matches!(error, Error::ServiceUnavailable { .. });

    let progress = env.orchestrator.cluster_progress(cluster.id).await.unwrap();
    assert_eq!(progress.steps.len(), 1);
    let spawn = &progress.steps[0];
    assert_eq!(spawn.step.step_name, "Spawning instances");
    assert_eq!(spawn.step.successful, Some(false));
    assert_eq!(spawn.events.len(), 1);
    assert!(spawn.events[0].instance.is_none());

    let cluster = env.orchestrator.cluster(cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Error);

    cptestctx.teardown();
}

#[tokio::test(start_paused = true)]
async fn test_provision_unreachable_instance() {
    let cptestctx = TestContext::new("test_provision_unreachable_instance");
    let env = &cptestctx.env;
    env.transport.set_unreachable("c1-worker-1", true);

    let cluster =
        env.orchestrator.create_cluster(cluster_request("c1", 2)).await.unwrap();
    let error = env.orchestrator.provision_cluster(cluster.id).await.unwrap_err();
    assert_matches!(error, Error::Timeout { .. });

    let progress = env.orchestrator.cluster_progress(cluster.id).await.unwrap();
    let wait = progress
        .steps
        .iter()
        .find(|s| s.step.step_name == "Wait for instance accessibility")
        .unwrap();
    assert_eq!(wait.step.successful, Some(false));
    assert_eq!(wait.step.completed, 2);

    cptestctx.teardown();
}

#[tokio::test(start_paused = true)]
async fn test_provision_abandoned_on_delete() {
    let cptestctx = TestContext::new("test_provision_abandoned_on_delete");
    let env = &cptestctx.env;
    env.infra.set_create_delay(Duration::from_secs(30));

    let cluster =
        env.orchestrator.create_cluster(cluster_request("c1", 2)).await.unwrap();
    let orchestrator = env.orchestrator.clone();
    let provision =
        tokio::spawn(async move { orchestrator.provision_cluster(cluster.id).await });

    // Let provisioning get as far as creating instances, then delete the
    // cluster out from under it.
    tokio::time::sleep(Duration::from_secs(5)).await;
    env.orchestrator.terminate_cluster(cluster.id).await.unwrap();

    let outcome = provision.await.unwrap().unwrap();
    assert_eq!(outcome, Outcome::Abandoned);
    assert!(env
        .orchestrator
        .cluster(cluster.id)
        .await
        .unwrap_err()
        .is_not_found());
    // The instances that finished creating after the terminate were
    // released rather than left behind.
    assert!(env.infra.instances(cluster.id).is_empty());

    cptestctx.teardown();
}

#[tokio::test(start_paused = true)]
async fn test_provision_conflict() {
    let cptestctx = TestContext::new("test_provision_conflict");
    let env = &cptestctx.env;
    env.infra.set_create_delay(Duration::from_secs(30));

    let cluster =
        env.orchestrator.create_cluster(cluster_request("c1", 2)).await.unwrap();
    let orchestrator = env.orchestrator.clone();
    let provision =
        tokio::spawn(async move { orchestrator.provision_cluster(cluster.id).await });
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_matches!(
        env.orchestrator.provision_cluster(cluster.id).await,
        Err(Error::Conflict { .. })
    );
    assert_eq!(provision.await.unwrap().unwrap(), Outcome::Completed);

    cptestctx.teardown();
}

#[tokio::test(start_paused = true)]
async fn test_pending_jobs_resumed() {
    let cptestctx = TestContext::new("test_pending_jobs_resumed");
    let env = &cptestctx.env;

    let cluster =
        env.orchestrator.create_cluster(cluster_request("c1", 1)).await.unwrap();
    let first = env.jobs.add_pending(cluster.id);
    let second = env.jobs.add_pending(cluster.id);
    env.orchestrator.provision_cluster(cluster.id).await.unwrap();
    assert_eq!(
        env.jobs.resumed(),
        vec![(cluster.id, first), (cluster.id, second)]
    );

    // A job service that fails does not fail the cluster.
    env.jobs.fail_runs(Some("job service down"));
    let cluster =
        env.orchestrator.create_cluster(cluster_request("c2", 1)).await.unwrap();
    env.jobs.add_pending(cluster.id);
    assert_eq!(
        env.orchestrator.provision_cluster(cluster.id).await.unwrap(),
        Outcome::Completed
    );
    let cluster = env.orchestrator.cluster(cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Active);

    cptestctx.teardown();
}
