// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated collaborators
//!
//! Everything the orchestrator talks to, in memory: a cloud
//! ([`SimInfrastructure`]), a job service ([`SimJobManager`]), a data store,
//! a key store and a remote transport that answers scripted commands.  Used
//! by the test suite and by `trellis-provisioner simulate`.

mod infra;
mod jobs;
mod plugin;

pub use crate::db::MemoryDataStore;
pub use crate::keystore::MemoryKeyStore;
pub use infra::SimInfrastructure;
pub use jobs::SimJobManager;
pub use plugin::DecommissionMode;
pub use plugin::SimPlugin;
pub use plugin::CONFIGURE_COMMAND;
pub use plugin::NODE_CONF;
pub use plugin::SECRET_EXTRA_KEY;

use crate::config::Config;
use crate::context::Services;
use crate::orchestrator::Orchestrator;
use crate::plugin::hadoop::HadoopPlugin;
use crate::plugin::PluginRegistry;
use dropshot::ConfigLogging;
use dropshot::ConfigLoggingLevel;
use slog::Logger;
use std::collections::BTreeSet;
use std::sync::Arc;
use trellis_common::api::external::Cluster;
use trellis_common::api::external::ClusterCreate;
use trellis_common::api::external::Error;
use trellis_common::api::external::NodeGroupCreate;
use trellis_remote::FakeTransport;
use trellis_remote::Output;
use trellis_remote::RemoteExecutor;

pub const PLUGIN_NAME: &str = "sim";

/// A configuration suitable for running against simulated collaborators
pub fn test_config() -> Config {
    Config {
        log: ConfigLogging::StderrTerminal { level: ConfigLoggingLevel::Info },
        provisioning: Default::default(),
        remote: Default::default(),
        timeouts: Default::default(),
        decommission: Default::default(),
        plugins: Default::default(),
    }
}

/// A request for a sim cluster with one master instance and `workers`
/// worker instances
pub fn cluster_request(name: &str, workers: usize) -> ClusterCreate {
    let processes = |list: &[&str]| list.iter().map(|p| p.to_string()).collect();
    ClusterCreate {
        name: name.to_string(),
        tenant_id: String::from("sim-tenant"),
        plugin_name: PLUGIN_NAME.to_string(),
        plugin_version: String::from("1.0"),
        node_groups: vec![
            NodeGroupCreate {
                name: String::from("master"),
                count: 1,
                node_processes: processes(&["namenode", "resourcemanager"]),
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
        cluster_configs: Default::default(),
    }
}

/// An orchestrator wired to simulated collaborators, with handles to each
/// of them for inspection and fault injection
pub struct SimEnvironment {
    pub log: Logger,
    pub transport: Arc<FakeTransport>,
    pub datastore: Arc<MemoryDataStore>,
    pub infra: Arc<SimInfrastructure>,
    pub keystore: Arc<MemoryKeyStore>,
    pub jobs: Arc<SimJobManager>,
    pub plugin: Arc<SimPlugin>,
    pub services: Arc<Services>,
    pub orchestrator: Orchestrator,
}

impl SimEnvironment {
    pub fn new(log: &Logger, config: &Config) -> Result<SimEnvironment, Error> {
        let transport = FakeTransport::new(log);
        let datastore = Arc::new(MemoryDataStore::new());
        let infra = Arc::new(SimInfrastructure::new(log));
        let keystore = Arc::new(MemoryKeyStore::new());
        let jobs = Arc::new(SimJobManager::new());
        let plugin = Arc::new(SimPlugin::new());

        let remote =
            RemoteExecutor::new(log, transport.clone(), config.remote.limits());
        let services = Arc::new(Services::new(
            log,
            config,
            datastore.clone(),
            remote,
            infra.clone(),
            keystore.clone(),
            jobs.clone(),
        ));

        let mut registry = PluginRegistry::new();
        for name in &config.plugins.enabled {
            match name.as_str() {
                PLUGIN_NAME => registry.register(plugin.clone())?,
                crate::plugin::hadoop::PLUGIN_NAME => {
                    registry.register(Arc::new(HadoopPlugin::new()))?
                }
                other => {
                    return Err(Error::configuration(format!(
                        "unknown plugin {:?}",
                        other
                    )));
                }
            }
        }

        let orchestrator =
            Orchestrator::new(log, services.clone(), Arc::new(registry));
        Ok(SimEnvironment {
            log: log.clone(),
            transport,
            datastore,
            infra,
            keystore,
            jobs,
            plugin,
            services,
            orchestrator,
        })
    }

    /// Answers `hdfs dfsadmin -report` for `cluster` with every datanode
    /// the simulated cloud currently holds reported as in service.
    pub fn answer_datanode_reports(&self, cluster: &Cluster) {
        let infra = self.infra.clone();
        let cluster_id = cluster.id;
        let datanode_groups: BTreeSet<_> = cluster
            .node_groups
            .iter()
            .filter(|ng| ng.has_process("datanode"))
            .map(|ng| ng.id)
            .collect();
        self.transport.add_handler(move |command| {
            if !command.command.ends_with("dfsadmin -report") {
                return None;
            }
            let report: String = infra
                .instances(cluster_id)
                .iter()
                .filter(|i| datanode_groups.contains(&i.node_group_id))
                .map(|i| {
                    let ip = i
                        .internal_ip
                        .map(|ip| ip.to_string())
                        .unwrap_or_default();
                    format!(
                        "Name: {ip}:9866 ({name})\nHostname: {name}\n\
                         Decommission Status : Normal\n\n",
                        ip = ip,
                        name = i.name,
                    )
                })
                .collect();
            Some(Output::with_stdout(report))
        });
    }
}
