// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tests for scaling clusters up and down

use crate::common::host_lines;
use crate::common::instance_names;
use crate::common::node_group;
use crate::common::TestContext;
use assert_matches::assert_matches;
use std::collections::BTreeMap;
use std::time::Duration;
use trellis_common::api::external::ClusterStatus;
use trellis_common::api::external::Error;
use trellis_common::api::external::NodeGroupCreate;
use trellis_provisioner::sim::cluster_request;
use trellis_provisioner::sim::DecommissionMode;
use trellis_provisioner::sim::SimEnvironment;
use trellis_provisioner::sim::CONFIGURE_COMMAND;
use trellis_provisioner::Outcome;
use trellis_provisioner::ScaleRequest;

const DATANODE_INCLUDE: &str = "/etc/trellis/datanode.include";
const DATANODE_EXCLUDE: &str = "/etc/trellis/datanode.exclude";

fn extra_workers(count: usize) -> NodeGroupCreate {
    NodeGroupCreate {
        name: String::from("extra"),
        count,
        node_processes: ["datanode", "nodemanager"]
            .into_iter()
            .map(String::from)
            .collect(),
        flavor: String::from("m1.small"),
        node_configs: Default::default(),
    }
}

/// The datanode include and exclude lists published to `instance` when the
/// drain started: the first non-empty exclude list and the include list
/// written with it.
fn drain_lists(env: &SimEnvironment, instance: &str) -> (String, String) {
    let writes: Vec<_> = env
        .transport
        .file_writes()
        .into_iter()
        .filter(|w| w.instance == instance)
        .collect();
    let exclude_at = writes
        .iter()
        .position(|w| w.path == DATANODE_EXCLUDE && !w.contents.is_empty())
        .unwrap();
    let include = writes[exclude_at..]
        .iter()
        .find(|w| w.path == DATANODE_INCLUDE)
        .unwrap();
    (include.contents.clone(), writes[exclude_at].contents.clone())
}

#[tokio::test(start_paused = true)]
async fn test_scale_up() {
    let cptestctx = TestContext::new("test_scale_up");
    let env = &cptestctx.env;
    let cluster = cptestctx.active_cluster("c1", 2).await;
    let worker = node_group(&cluster, "worker").id;

    let request = ScaleRequest {
        resize: [(worker, 3)].into_iter().collect(),
        add: vec![extra_workers(1)],
    };
    let outcome = env.orchestrator.scale_cluster(cluster.id, request).await.unwrap();
    assert_eq!(outcome, Outcome::Completed);

    let cluster = env.orchestrator.cluster(cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Active);
    assert_eq!(
        instance_names(node_group(&cluster, "worker")),
        vec!["c1-worker-0", "c1-worker-1", "c1-worker-2"]
    );
    assert_eq!(instance_names(node_group(&cluster, "extra")), vec!["c1-extra-0"]);
    assert_eq!(node_group(&cluster, "worker").count, 3);
    assert_eq!(env.infra.instances(cluster.id).len(), 5);

    // Only the new instances were configured again.
    let configured = |name: &str| {
        env.transport
            .commands_on(name)
            .iter()
            .filter(|c| *c == CONFIGURE_COMMAND)
            .count()
    };
    assert_eq!(configured("c1-worker-0"), 1);
    assert_eq!(configured("c1-worker-2"), 1);
    assert_eq!(configured("c1-extra-0"), 1);

    let progress = env.orchestrator.cluster_progress(cluster.id).await.unwrap();
    let names: Vec<&str> =
        progress.steps.iter().map(|s| s.step.step_name.as_str()).collect();
    assert_eq!(
        &names[4..],
        &[
            "Spawning instances",
            "Wait for instance accessibility",
            "Configure new instances",
            "Start new instances",
        ]
    );
    let spawn = &progress.steps[4].step;
    assert_eq!(spawn.total, 2);
    assert_eq!(spawn.completed, 2);
    assert!(progress.steps.iter().all(|s| s.step.successful == Some(true)));

    cptestctx.teardown();
}

#[tokio::test(start_paused = true)]
async fn test_scale_down() {
    let cptestctx = TestContext::new("test_scale_down");
    let env = &cptestctx.env;
    env.plugin.set_decommission_mode(DecommissionMode::AfterPolls(2));
    let cluster = cptestctx.active_cluster("c1", 4).await;
    let worker = node_group(&cluster, "worker").id;

    let request = ScaleRequest {
        resize: [(worker, 2)].into_iter().collect(),
        add: Vec::new(),
    };
    let outcome = env.orchestrator.scale_cluster(cluster.id, request).await.unwrap();
    assert_eq!(outcome, Outcome::Completed);
    assert!(env.plugin.status_checks() > 2);

    let cluster = env.orchestrator.cluster(cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Active);
    assert_eq!(node_group(&cluster, "worker").count, 2);
    assert_eq!(
        instance_names(node_group(&cluster, "worker")),
        vec!["c1-worker-0", "c1-worker-1"]
    );
    let mut remaining: Vec<String> = env
        .infra
        .instances(cluster.id)
        .into_iter()
        .map(|i| i.name)
        .collect();
    remaining.sort();
    assert_eq!(remaining, vec!["c1-master-0", "c1-worker-0", "c1-worker-1"]);

    // While draining, the master was told to exclude exactly the removed
    // workers and include exactly the survivors.
    let (include_during_drain, exclude_during_drain) =
        drain_lists(env, "c1-master-0");
    assert_eq!(
        host_lines(&exclude_during_drain),
        vec!["c1-worker-2", "c1-worker-3"]
    );
    assert_eq!(
        host_lines(&include_during_drain),
        vec!["c1-worker-0", "c1-worker-1"]
    );

    // Afterwards the lists describe the shrunken cluster.
    let include = env.transport.file("c1-master-0", DATANODE_INCLUDE).unwrap();
    assert_eq!(host_lines(&include), vec!["c1-worker-0", "c1-worker-1"]);
    let exclude = env.transport.file("c1-master-0", DATANODE_EXCLUDE).unwrap();
    assert!(host_lines(&exclude).is_empty());
    let master_commands = env.transport.commands_on("c1-master-0");
    assert!(master_commands.iter().any(|c| c == "sim-refresh-nodes datanode"));
    assert!(master_commands
        .iter()
        .any(|c| c == "sim-refresh-nodes nodemanager"));

    cptestctx.teardown();
}

#[tokio::test(start_paused = true)]
async fn test_scale_down_decommissioned_on_first_check() {
    let cptestctx =
        TestContext::new("test_scale_down_decommissioned_on_first_check");
    let env = &cptestctx.env;
    env.plugin.set_decommission_mode(DecommissionMode::Immediate);
    let cluster = cptestctx.active_cluster("c1", 3).await;
    let worker = node_group(&cluster, "worker").id;

    let request = ScaleRequest {
        resize: [(worker, 2)].into_iter().collect(),
        add: Vec::new(),
    };
    let outcome = env.orchestrator.scale_cluster(cluster.id, request).await.unwrap();
    assert_eq!(outcome, Outcome::Completed);
    // One check per drained role was enough.
    assert_eq!(env.plugin.status_checks(), 2);

    let (include_during_drain, exclude_during_drain) =
        drain_lists(env, "c1-master-0");
    assert_eq!(host_lines(&exclude_during_drain), vec!["c1-worker-2"]);
    assert_eq!(
        host_lines(&include_during_drain),
        vec!["c1-worker-0", "c1-worker-1"]
    );

    let cluster = env.orchestrator.cluster(cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Active);
    assert_eq!(node_group(&cluster, "worker").count, 2);
    assert_eq!(env.infra.instances(cluster.id).len(), 3);
    let exclude = env.transport.file("c1-master-0", DATANODE_EXCLUDE).unwrap();
    assert!(host_lines(&exclude).is_empty());

    cptestctx.teardown();
}

#[tokio::test(start_paused = true)]
async fn test_scale_down_decommission_timeout() {
    let cptestctx = TestContext::new("test_scale_down_decommission_timeout");
    let env = &cptestctx.env;
    env.plugin.set_decommission_mode(DecommissionMode::Never);

    let mut params = cluster_request("c1", 4);
    params.cluster_configs.insert(
        String::from("HDFS"),
        [(
            String::from("DataNodes decommissioning timeout"),
            serde_json::json!(60),
        )]
        .into_iter()
        .collect(),
    );
    let cluster = env.orchestrator.create_cluster(params).await.unwrap();
    env.orchestrator.provision_cluster(cluster.id).await.unwrap();
    let cluster = env.orchestrator.cluster(cluster.id).await.unwrap();
    let worker = node_group(&cluster, "worker").id;

    let request = ScaleRequest {
        resize: [(worker, 2)].into_iter().collect(),
        add: Vec::new(),
    };
    let error =
        env.orchestrator.scale_cluster(cluster.id, request).await.unwrap_err();
    assert_matches!(
        &error,
        Error::Timeout { timeout, option: Some(option), .. }
            if option == "DataNodes decommissioning timeout"
                && timeout.as_secs() == 60
    );

    // Nothing was deleted and the node group was not resized.
    assert_eq!(env.infra.instances(cluster.id).len(), 5);
    let cluster = env.orchestrator.cluster(cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Error);
    assert_eq!(cluster.instance_count(), 5);
    assert_eq!(node_group(&cluster, "worker").count, 4);

    cptestctx.teardown();
}

#[tokio::test(start_paused = true)]
async fn test_scale_failure_keeps_removals() {
    let cptestctx = TestContext::new("test_scale_failure_keeps_removals");
    let env = &cptestctx.env;
    env.transport.fail_command(
        Some("c1-extra-0"),
        CONFIGURE_COMMAND,
        2,
        "package missing",
    );
    let cluster = cptestctx.active_cluster("c1", 3).await;
    let worker = node_group(&cluster, "worker").id;

    let request = ScaleRequest {
        resize: [(worker, 2)].into_iter().collect(),
        add: vec![extra_workers(1)],
    };
    let error =
        env.orchestrator.scale_cluster(cluster.id, request).await.unwrap_err();
    assert_matches!(error, Error::RemoteExecution { exit_code: 2, .. });

    let cluster = env.orchestrator.cluster(cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Error);
    assert!(cluster.status_description.contains("package missing"));
    assert_eq!(
        instance_names(node_group(&cluster, "worker")),
        vec!["c1-worker-0", "c1-worker-1"]
    );
    assert_eq!(instance_names(node_group(&cluster, "extra")), vec!["c1-extra-0"]);
    let mut remaining: Vec<String> = env
        .infra
        .instances(cluster.id)
        .into_iter()
        .map(|i| i.name)
        .collect();
    remaining.sort();
    assert_eq!(
        remaining,
        vec!["c1-extra-0", "c1-master-0", "c1-worker-0", "c1-worker-1"]
    );

    cptestctx.teardown();
}

#[tokio::test(start_paused = true)]
async fn test_scale_rejected_requests() {
    let cptestctx = TestContext::new("test_scale_rejected_requests");
    let env = &cptestctx.env;
    let cluster = cptestctx.active_cluster("c1", 2).await;
    let master = node_group(&cluster, "master").id;
    let worker = node_group(&cluster, "worker").id;

    let cluster_id = cluster.id;
    let scale = move |resize: BTreeMap<_, usize>, add: Vec<NodeGroupCreate>| {
        env.orchestrator.scale_cluster(cluster_id, ScaleRequest { resize, add })
    };

    // Resizing the namenode's group is refused by the plugin.
    assert_matches!(
        scale([(master, 2)].into_iter().collect(), Vec::new()).await,
        Err(Error::ValidationFailed { .. })
    );
    // So is everything while the plugin says no.
    env.plugin.fail_scaling_validation(Some("maintenance window"));
    assert_matches!(
        scale([(worker, 3)].into_iter().collect(), Vec::new()).await,
        Err(Error::ValidationFailed { .. })
    );
    env.plugin.fail_scaling_validation(None);

    // A request that changes nothing.
    assert_matches!(
        scale([(worker, 2)].into_iter().collect(), Vec::new()).await,
        Err(Error::InvalidRequest { .. })
    );
    // A node group name that is already taken.
    let mut duplicate = extra_workers(1);
    duplicate.name = String::from("worker");
    assert_matches!(
        scale(BTreeMap::new(), vec![duplicate]).await,
        Err(Error::ObjectAlreadyExists { .. })
    );

    // None of that touched the cluster.
    let after = env.orchestrator.cluster(cluster.id).await.unwrap();
    assert_eq!(after.status, ClusterStatus::Active);
    assert_eq!(after.instance_count(), 3);
    assert_eq!(env.infra.instances(cluster.id).len(), 3);

    cptestctx.teardown();
}

#[tokio::test(start_paused = true)]
async fn test_scale_abandoned_on_delete() {
    let cptestctx = TestContext::new("test_scale_abandoned_on_delete");
    let env = &cptestctx.env;
    let cluster = cptestctx.active_cluster("c1", 2).await;
    let worker = node_group(&cluster, "worker").id;
    env.infra.set_create_delay(Duration::from_secs(30));

    let orchestrator = env.orchestrator.clone();
    let request = ScaleRequest {
        resize: [(worker, 4)].into_iter().collect(),
        add: Vec::new(),
    };
    let cluster_id = cluster.id;
    let scale = tokio::spawn(async move {
        orchestrator.scale_cluster(cluster_id, request).await
    });
    tokio::time::sleep(Duration::from_secs(5)).await;
    env.orchestrator.terminate_cluster(cluster.id).await.unwrap();

    assert_eq!(scale.await.unwrap().unwrap(), Outcome::Abandoned);
    assert!(env
        .orchestrator
        .cluster(cluster.id)
        .await
        .unwrap_err()
        .is_not_found());
    // Neither the new instances nor the old ones outlive the cluster.
    assert!(env.infra.instances(cluster.id).is_empty());

    cptestctx.teardown();
}

#[tokio::test(start_paused = true)]
async fn test_scale_requires_active_cluster() {
    let cptestctx = TestContext::new("test_scale_requires_active_cluster");
    let env = &cptestctx.env;
    let cluster =
        env.orchestrator.create_cluster(cluster_request("c1", 2)).await.unwrap();
    let worker = node_group(&cluster, "worker").id;

    let request = ScaleRequest {
        resize: [(worker, 3)].into_iter().collect(),
        add: Vec::new(),
    };
    assert_matches!(
        env.orchestrator.scale_cluster(cluster.id, request).await,
        Err(Error::InvalidRequest { .. })
    );
    let cluster = env.orchestrator.cluster(cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Validating);

    cptestctx.teardown();
}
