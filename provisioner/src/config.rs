// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration related types used by the provisioner

use crate::decommission::DATANODES_DECOMMISSIONING_TIMEOUT;
use crate::decommission::NODEMANAGERS_DECOMMISSIONING_TIMEOUT;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use dropshot::ConfigLogging;
use serde::Deserialize;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use trellis_remote::RemoteLimits;
use trellis_remote::SshConfig;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    pub log: ConfigLogging,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub decommission: DecommissionConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
}

impl Config {
    /// Load a `Config` from the given TOML file
    ///
    /// The result has not been checked with [`Config::validate`].
    pub fn from_file<P: AsRef<Utf8Path>>(
        path: P,
    ) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|error| {
            ConfigError::Io { error, path: path.to_owned() }
        })?;
        toml::from_str(&data).map_err(|error| ConfigError::Parse {
            error,
            path: path.to_owned(),
        })
    }

    /// Checks values that parse but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provisioning.max_parallel_instance_tasks == 0 {
            return Err(ConfigError::Invalid(String::from(
                "provisioning.max_parallel_instance_tasks must be at least 1",
            )));
        }
        if self.remote.global_remote_threshold == 0
            || self.remote.cluster_remote_threshold == 0
        {
            return Err(ConfigError::Invalid(String::from(
                "remote thresholds must be at least 1",
            )));
        }
        if self.remote.cluster_remote_threshold
            > self.remote.global_remote_threshold
        {
            return Err(ConfigError::Invalid(format!(
                "remote.cluster_remote_threshold ({}) exceeds \
                 remote.global_remote_threshold ({})",
                self.remote.cluster_remote_threshold,
                self.remote.global_remote_threshold,
            )));
        }
        if self.timeouts.default_poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(String::from(
                "timeouts.default_poll_interval_secs must be at least 1",
            )));
        }
        if self.plugins.enabled.is_empty() {
            return Err(ConfigError::Invalid(String::from(
                "plugins.enabled must name at least one plugin",
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Turns every progress tracker operation into a no-op.
    pub disable_event_log: bool,
    /// Bound on concurrently running per-instance tasks within one step
    pub max_parallel_instance_tasks: usize,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        ProvisioningConfig {
            disable_event_log: false,
            max_parallel_instance_tasks:
                trellis_task_group::DEFAULT_MAX_PARALLELISM,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub global_remote_threshold: usize,
    pub cluster_remote_threshold: usize,
    pub ssh_binary: Utf8PathBuf,
    pub ssh_user: String,
    pub ssh_private_key: Option<Utf8PathBuf>,
    pub connect_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        let limits = RemoteLimits::default();
        RemoteConfig {
            global_remote_threshold: limits.global,
            cluster_remote_threshold: limits.per_cluster,
            ssh_binary: Utf8PathBuf::from("ssh"),
            ssh_user: String::from("root"),
            ssh_private_key: None,
            connect_timeout_secs: 10,
        }
    }
}

impl RemoteConfig {
    pub fn limits(&self) -> RemoteLimits {
        RemoteLimits {
            global: self.global_remote_threshold,
            per_cluster: self.cluster_remote_threshold,
        }
    }

    pub fn ssh_config(&self, timeouts: &TimeoutsConfig) -> SshConfig {
        SshConfig {
            ssh_binary: self.ssh_binary.clone(),
            user: self.ssh_user.clone(),
            private_key: self.ssh_private_key.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            max_connect_elapsed: timeouts.wait_until_accessible(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub wait_until_accessible_secs: u64,
    pub default_poll_timeout_secs: u64,
    pub default_poll_interval_secs: u64,
    pub delete_instances_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        TimeoutsConfig {
            wait_until_accessible_secs: 600,
            default_poll_timeout_secs: 3600,
            default_poll_interval_secs: 5,
            delete_instances_secs: 600,
        }
    }
}

impl TimeoutsConfig {
    pub fn wait_until_accessible(&self) -> Duration {
        Duration::from_secs(self.wait_until_accessible_secs)
    }

    pub fn default_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.default_poll_timeout_secs)
    }

    pub fn default_poll_interval(&self) -> Duration {
        Duration::from_secs(self.default_poll_interval_secs)
    }

    pub fn delete_instances(&self) -> Duration {
        Duration::from_secs(self.delete_instances_secs)
    }
}

/// Process-wide overrides for the per-role decommission timeouts
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DecommissionConfig {
    pub datanode_timeout_secs: Option<u64>,
    pub nodemanager_timeout_secs: Option<u64>,
}

impl DecommissionConfig {
    /// Returns the override for the plugin option named `option`, if any.
    pub fn override_for(&self, option: &str) -> Option<u64> {
        if option == DATANODES_DECOMMISSIONING_TIMEOUT.name {
            self.datanode_timeout_secs
        } else if option == NODEMANAGERS_DECOMMISSIONING_TIMEOUT.name {
            self.nodemanager_timeout_secs
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PluginsConfig {
    pub enabled: Vec<String>,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        PluginsConfig {
            enabled: vec![String::from("hadoop"), String::from("sim")],
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {path}")]
    Io {
        #[source]
        error: std::io::Error,
        path: Utf8PathBuf,
    },
    #[error("Failed to parse config file: {path}")]
    Parse {
        #[source]
        error: toml::de::Error,
        path: Utf8PathBuf,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config: Config = toml::from_str(
            r#"
            [log]
            mode = "stderr-terminal"
            level = "info"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert!(!config.provisioning.disable_event_log);
        assert_eq!(config.remote.global_remote_threshold, 100);
        assert_eq!(config.remote.cluster_remote_threshold, 70);
        assert_eq!(config.timeouts.wait_until_accessible_secs, 600);
        assert_eq!(config.plugins.enabled, vec!["hadoop", "sim"]);
    }

    #[test]
    fn test_validate_rejects_bad_thresholds() {
        let config: Config = toml::from_str(
            r#"
            [log]
            mode = "stderr-terminal"
            level = "info"

            [remote]
            global_remote_threshold = 10
            cluster_remote_threshold = 20
            "#,
        )
        .unwrap();
        assert_matches!(config.validate(), Err(ConfigError::Invalid(_)));
    }

    #[test]
    fn test_decommission_overrides() {
        let config = DecommissionConfig {
            datanode_timeout_secs: Some(30),
            nodemanager_timeout_secs: None,
        };
        assert_eq!(
            config.override_for(DATANODES_DECOMMISSIONING_TIMEOUT.name),
            Some(30)
        );
        assert_eq!(
            config.override_for(NODEMANAGERS_DECOMMISSIONING_TIMEOUT.name),
            None
        );
        assert_eq!(config.override_for("dfs.replication"), None);
    }

    #[test]
    fn test_missing_file() {
        let error = Config::from_file("/nonexistent/trellis.toml").unwrap_err();
        assert_matches!(error, ConfigError::Io { .. });
    }
}
