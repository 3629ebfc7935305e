// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisioning plugins and the registry that holds them
//!
//! A plugin knows how to turn a set of provisioned instances into a working
//! service (HDFS and YARN, for instance).  The orchestrator decides *when*
//! each plugin operation runs; the plugin decides *what* runs on the
//! instances.
//!
//! Optional operations are advertised through [`Capability`] flags in the
//! plugin's [`PluginDescriptor`].  The orchestrator checks the flags before
//! calling an optional operation, so a plugin never has to be asked whether
//! it "really" implements something.

pub mod hadoop;

use crate::config::PluginsConfig;
use crate::context::ProvisionContext;
use crate::sim::SimPlugin;
use async_trait::async_trait;
use parse_display::Display;
use parse_display::FromStr;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use trellis_common::api::external::Cluster;
use trellis_common::api::external::Error;
use trellis_common::api::external::Instance;
use trellis_common::api::external::LookupResult;
use trellis_common::api::external::NodeGroupCreate;
use trellis_common::api::external::ResourceType;
use trellis_common::typed_uuid::NodeGroupUuid;

/// Optional plugin operations
#[derive(
    Clone,
    Copy,
    Debug,
    Display,
    Eq,
    FromStr,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[display(style = "snake_case")]
pub enum Capability {
    /// [`Plugin::scale_cluster`]: bring newly added instances into service
    ScaleCluster,
    /// [`Plugin::decommission_nodes`]: drain instances before removal
    DecommissionNodes,
    /// [`Plugin::validate_scaling`]: vet a scale request up front
    ValidateScaling,
}

#[derive(Clone, Debug, Serialize)]
pub struct PluginDescriptor {
    pub name: String,
    pub title: String,
    pub versions: Vec<String>,
    pub capabilities: BTreeSet<Capability>,
}

impl PluginDescriptor {
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn has_version(&self, version: &str) -> bool {
        self.versions.iter().any(|v| v == version)
    }
}

/// A tunable a plugin reads from `cluster_configs[target][name]`
#[derive(Clone, Copy, Debug, Serialize)]
pub struct PluginOption {
    pub name: &'static str,
    pub target: &'static str,
    pub default: u64,
    pub description: &'static str,
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn descriptor(&self) -> &PluginDescriptor;

    /// Options the plugin understands, for display and validation.
    fn options(&self) -> Vec<PluginOption> {
        Vec::new()
    }

    /// Checks that the cluster can be provisioned at all.
    async fn validate(
        &self,
        ctx: &ProvisionContext,
        cluster: &Cluster,
    ) -> Result<(), Error>;

    /// Adjusts infrastructure requirements before instances are created.
    async fn update_infra(
        &self,
        _ctx: &ProvisionContext,
        _cluster: &Cluster,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn configure_cluster(
        &self,
        ctx: &ProvisionContext,
        cluster: &Cluster,
    ) -> Result<(), Error>;

    async fn start_cluster(
        &self,
        ctx: &ProvisionContext,
        cluster: &Cluster,
    ) -> Result<(), Error>;

    /// Brings `instances`, just added to `cluster`, into service.
    async fn scale_cluster(
        &self,
        _ctx: &ProvisionContext,
        _cluster: &Cluster,
        _instances: &[Instance],
    ) -> Result<(), Error> {
        Err(self.unsupported(Capability::ScaleCluster))
    }

    /// Drains `instances` out of service and removes them.
    async fn decommission_nodes(
        &self,
        _ctx: &ProvisionContext,
        _cluster: &Cluster,
        _instances: &[Instance],
    ) -> Result<(), Error> {
        Err(self.unsupported(Capability::DecommissionNodes))
    }

    /// Vets a scale request: `existing` maps node groups to their new
    /// counts, `additional` lists node groups to be created.
    async fn validate_scaling(
        &self,
        _ctx: &ProvisionContext,
        _cluster: &Cluster,
        _existing: &BTreeMap<NodeGroupUuid, usize>,
        _additional: &[NodeGroupCreate],
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Releases external resources the plugin created for the cluster.
    async fn on_terminate_cluster(
        &self,
        _ctx: &ProvisionContext,
        _cluster: &Cluster,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn unsupported(&self, capability: Capability) -> Error {
        Error::invalid_request(&format!(
            "plugin {:?} does not support {}",
            self.descriptor().name,
            capability
        ))
    }
}

/// The set of plugins available to the orchestrator
#[derive(Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> PluginRegistry {
        PluginRegistry::default()
    }

    /// Builds a registry containing the plugins enabled in `config`.
    pub fn from_config(config: &PluginsConfig) -> Result<PluginRegistry, Error> {
        let mut registry = PluginRegistry::new();
        for name in &config.enabled {
            let plugin: Arc<dyn Plugin> = match name.as_str() {
                hadoop::PLUGIN_NAME => Arc::new(hadoop::HadoopPlugin::new()),
                crate::sim::PLUGIN_NAME => Arc::new(SimPlugin::new()),
                other => {
                    return Err(Error::configuration(format!(
                        "unknown plugin {:?}",
                        other
                    )));
                }
            };
            registry.register(plugin)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), Error> {
        let name = plugin.descriptor().name.clone();
        if self.plugins.contains_key(&name) {
            return Err(Error::ObjectAlreadyExists {
                type_name: ResourceType::Plugin,
                object_name: name,
            });
        }
        self.plugins.insert(name, plugin);
        Ok(())
    }

    pub fn get(&self, name: &str) -> LookupResult<Arc<dyn Plugin>> {
        self.plugins
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found_by_name(ResourceType::Plugin, name))
    }

    /// Returns the plugin for `cluster`, checking that it supports the
    /// cluster's plugin version.
    pub fn plugin_for(&self, cluster: &Cluster) -> LookupResult<Arc<dyn Plugin>> {
        let plugin = self.get(&cluster.plugin_name)?;
        if !plugin.descriptor().has_version(&cluster.plugin_version) {
            return Err(Error::not_found_by_name(
                ResourceType::PluginVersion,
                &format!("{}-{}", cluster.plugin_name, cluster.plugin_version),
            ));
        }
        Ok(plugin)
    }

    pub fn descriptors(&self) -> Vec<PluginDescriptor> {
        self.plugins.values().map(|p| p.descriptor().clone()).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_registry_from_config() {
        let registry = PluginRegistry::from_config(&PluginsConfig::default())
            .unwrap();
        let names: Vec<_> =
            registry.descriptors().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["hadoop", "sim"]);

        let hadoop = registry.get("hadoop").unwrap();
        assert!(hadoop.descriptor().supports(Capability::DecommissionNodes));
        assert!(hadoop.descriptor().has_version("3.0.1"));

        assert_matches!(
            registry.get("storm").map(|_| ()),
            Err(Error::ObjectNotFound { type_name: ResourceType::Plugin, .. })
        );
    }

    #[test]
    fn test_unknown_plugin_in_config() {
        let config = PluginsConfig { enabled: vec![String::from("spark")] };
        assert_matches!(
            PluginRegistry::from_config(&config).map(|_| ()),
            Err(Error::Configuration { .. })
        );
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(SimPlugin::new())).unwrap();
        assert_matches!(
            registry.register(Arc::new(SimPlugin::new())),
            Err(Error::ObjectAlreadyExists { .. })
        );
    }

    #[test]
    fn test_capability_display() {
        assert_eq!(Capability::DecommissionNodes.to_string(), "decommission_nodes");
    }
}
