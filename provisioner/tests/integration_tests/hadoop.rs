// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tests running the Hadoop plugin against simulated instances

use crate::common::TestContext;
use assert_matches::assert_matches;
use std::collections::BTreeMap;
use trellis_common::api::external::ClusterCreate;
use trellis_common::api::external::ClusterStatus;
use trellis_common::api::external::Error;
use trellis_common::api::external::NodeGroupCreate;
use trellis_provisioner::Outcome;

const CONF_DIR: &str = "/opt/hadoop/etc/hadoop";

fn hadoop_request(name: &str, workers: usize) -> ClusterCreate {
    let processes = |list: &[&str]| list.iter().map(|p| p.to_string()).collect();
    let mut hdfs = BTreeMap::new();
    hdfs.insert(String::from("dfs.replication"), serde_json::json!(2));
    ClusterCreate {
        name: name.to_string(),
        tenant_id: String::from("hadoop-tenant"),
        plugin_name: String::from("hadoop"),
        plugin_version: String::from("3.0.1"),
        node_groups: vec![
            NodeGroupCreate {
                name: String::from("master"),
                count: 1,
                node_processes: processes(&[
                    "namenode",
                    "secondarynamenode",
                    "resourcemanager",
                    "historyserver",
                ]),
                flavor: String::from("m1.large"),
                node_configs: Default::default(),
            },
            NodeGroupCreate {
                name: String::from("worker"),
                count: workers,
                node_processes: processes(&["datanode", "nodemanager"]),
                flavor: String::from("m1.medium"),
                node_configs: Default::default(),
            },
        ],
        cluster_configs: [(String::from("HDFS"), hdfs)].into_iter().collect(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_hadoop_provision() {
    let cptestctx = TestContext::new("test_hadoop_provision");
    let env = &cptestctx.env;

    let cluster =
        env.orchestrator.create_cluster(hadoop_request("hd", 3)).await.unwrap();
    env.answer_datanode_reports(&cluster);
    let outcome = env.orchestrator.provision_cluster(cluster.id).await.unwrap();
    assert_eq!(outcome, Outcome::Completed);

    let cluster = env.orchestrator.cluster(cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Active);

    let progress = env.orchestrator.cluster_progress(cluster.id).await.unwrap();
    let names: Vec<&str> =
        progress.steps.iter().map(|s| s.step.step_name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "Spawning instances",
            "Wait for instance accessibility",
            "Configure instances",
            "Start master services",
            "Start worker services",
        ]
    );
    assert!(progress.steps.iter().all(|s| s.step.successful == Some(true)));

    // Site files carry the cluster's overrides and point at the masters.
    let hdfs_site = env
        .transport
        .file("hd-worker-1", &format!("{}/hdfs-site.xml", CONF_DIR))
        .unwrap();
    assert!(hdfs_site.contains("<name>dfs.replication</name>\n    <value>2</value>"));
    let core_site = env
        .transport
        .file("hd-worker-1", &format!("{}/core-site.xml", CONF_DIR))
        .unwrap();
    assert!(core_site.contains("hdfs://hd-master-0:9000"));
    let include = env
        .transport
        .file("hd-master-0", &format!("{}/dn-include", CONF_DIR))
        .unwrap();
    assert_eq!(include, "hd-worker-0\nhd-worker-1\nhd-worker-2\n");

    // The namenode was formatted before anything started, and the workers
    // started their daemons.
    let master = env.transport.commands_on("hd-master-0");
    let format = master.iter().position(|c| c.contains("namenode -format"));
    let start = master.iter().position(|c| c.contains("--daemon start namenode"));
    assert!(format.unwrap() < start.unwrap());
    let worker = env.transport.commands_on("hd-worker-0");
    assert!(worker.iter().any(|c| c.ends_with("hdfs --daemon start datanode")));
    assert!(worker.iter().any(|c| c.ends_with("yarn --daemon start nodemanager")));

    cptestctx.teardown();
}

#[tokio::test(start_paused = true)]
async fn test_hadoop_datanodes_never_register() {
    let cptestctx = TestContext::new("test_hadoop_datanodes_never_register");
    let env = &cptestctx.env;

    let mut params = hadoop_request("hd", 2);
    params
        .cluster_configs
        .get_mut("HDFS")
        .unwrap()
        .insert(String::from("DataNodes startup timeout"), serde_json::json!(30));
    // Nobody answers the datanode report, so no datanode ever shows up.
    let cluster = env.orchestrator.create_cluster(params).await.unwrap();
    let error = env.orchestrator.provision_cluster(cluster.id).await.unwrap_err();
    assert_matches!(
        &error,
        Error::Timeout { option: Some(option), .. }
            if option == "DataNodes startup timeout"
    );

    let cluster = env.orchestrator.cluster(cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Error);

    cptestctx.teardown();
}

#[tokio::test(start_paused = true)]
async fn test_hadoop_rejects_bad_topology() {
    let cptestctx = TestContext::new("test_hadoop_rejects_bad_topology");
    let env = &cptestctx.env;

    // Replication 2 needs at least two datanodes.
    let cluster =
        env.orchestrator.create_cluster(hadoop_request("hd", 1)).await.unwrap();
    let error = env.orchestrator.provision_cluster(cluster.id).await.unwrap_err();
    assert_matches!(
        &error,
        Error::ValidationFailed { message } if message.contains("dfs.replication")
    );
    assert!(env.infra.instances(cluster.id).is_empty());

    cptestctx.teardown();
}
