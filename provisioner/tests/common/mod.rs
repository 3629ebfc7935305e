// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared setup for the integration tests

use camino::Utf8Path;
use trellis_common::api::external::Cluster;
use trellis_common::api::external::ClusterStatus;
use trellis_common::api::external::NodeGroup;
use trellis_provisioner::sim::cluster_request;
use trellis_provisioner::sim::SimEnvironment;
use trellis_provisioner::Config;
use trellis_provisioner::Outcome;
use trellis_test_utils::dev::test_setup_log;
use trellis_test_utils::dev::LogContext;

/// Loads `tests/config.test.toml`.
pub fn load_test_config() -> Config {
    let config_file_path = Utf8Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("config.test.toml");
    let config = Config::from_file(&config_file_path)
        .unwrap_or_else(|e| panic!("failed to load {}: {}", config_file_path, e));
    config.validate().expect("test config is invalid");
    config
}

pub struct TestContext {
    pub logctx: LogContext,
    pub env: SimEnvironment,
}

impl TestContext {
    pub fn new(test_name: &str) -> TestContext {
        TestContext::with_config(test_name, load_test_config())
    }

    pub fn with_config(test_name: &str, config: Config) -> TestContext {
        let logctx = test_setup_log(test_name);
        let env = SimEnvironment::new(&logctx.log, &config).unwrap();
        TestContext { logctx, env }
    }

    pub fn teardown(self) {
        self.logctx.cleanup_successful();
    }

    /// Creates and provisions a sim cluster with `workers` worker
    /// instances, which must end up active.
    pub async fn active_cluster(&self, name: &str, workers: usize) -> Cluster {
        let orchestrator = &self.env.orchestrator;
        let cluster =
            orchestrator.create_cluster(cluster_request(name, workers)).await.unwrap();
        let outcome = orchestrator.provision_cluster(cluster.id).await.unwrap();
        assert_eq!(outcome, Outcome::Completed);
        let cluster = orchestrator.cluster(cluster.id).await.unwrap();
        assert_eq!(cluster.status, ClusterStatus::Active);
        cluster
    }
}

pub fn node_group<'c>(cluster: &'c Cluster, name: &str) -> &'c NodeGroup {
    cluster
        .node_groups
        .iter()
        .find(|ng| ng.name == name)
        .unwrap_or_else(|| panic!("no node group {:?}", name))
}

/// Sorted instance names of a node group.
pub fn instance_names(node_group: &NodeGroup) -> Vec<String> {
    let mut names: Vec<String> =
        node_group.instances.iter().map(|i| i.name.clone()).collect();
    names.sort();
    names
}

/// Sorted non-empty lines of a host list.
pub fn host_lines(contents: &str) -> Vec<String> {
    let mut lines: Vec<String> = contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect();
    lines.sort();
    lines
}
