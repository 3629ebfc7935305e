// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-version differences between Hadoop releases
//!
//! Everything that differs between supported releases is data in a
//! [`VersionProfile`]; the plugin logic itself is shared.  Command templates
//! may use `{home}` (the Hadoop installation directory) and `{daemon}`.

use trellis_common::api::external::Error;
use trellis_common::api::external::ResourceType;

#[derive(Debug)]
pub struct VersionProfile {
    pub version: &'static str,
    pub home: &'static str,
    pub conf_dir: &'static str,
    pub format_namenode: &'static str,
    pub hdfs_daemon: &'static str,
    pub yarn_daemon: &'static str,
    pub mapred_daemon: &'static str,
    pub refresh_hdfs_nodes: &'static str,
    pub refresh_yarn_nodes: &'static str,
    pub dfsadmin_report: &'static str,
    pub yarn_node_list: &'static str,
    /// Port datanodes serve block transfers on
    pub datanode_port: u16,
}

const HADOOP_2_DAEMONS: (&str, &str, &str) = (
    "{home}/sbin/hadoop-daemon.sh start {daemon}",
    "{home}/sbin/yarn-daemon.sh start {daemon}",
    "{home}/sbin/mr-jobhistory-daemon.sh start {daemon}",
);

pub static PROFILES: &[VersionProfile] = &[
    VersionProfile {
        version: "2.7.1",
        home: "/opt/hadoop",
        conf_dir: "/opt/hadoop/etc/hadoop",
        format_namenode: "{home}/bin/hdfs namenode -format -nonInteractive",
        hdfs_daemon: HADOOP_2_DAEMONS.0,
        yarn_daemon: HADOOP_2_DAEMONS.1,
        mapred_daemon: HADOOP_2_DAEMONS.2,
        refresh_hdfs_nodes: "{home}/bin/hdfs dfsadmin -refreshNodes",
        refresh_yarn_nodes: "{home}/bin/yarn rmadmin -refreshNodes",
        dfsadmin_report: "{home}/bin/hdfs dfsadmin -report",
        yarn_node_list: "{home}/bin/yarn node -all -list",
        datanode_port: 50010,
    },
    VersionProfile {
        version: "2.8.2",
        home: "/opt/hadoop",
        conf_dir: "/opt/hadoop/etc/hadoop",
        format_namenode: "{home}/bin/hdfs namenode -format -nonInteractive",
        hdfs_daemon: HADOOP_2_DAEMONS.0,
        yarn_daemon: HADOOP_2_DAEMONS.1,
        mapred_daemon: HADOOP_2_DAEMONS.2,
        refresh_hdfs_nodes: "{home}/bin/hdfs dfsadmin -refreshNodes",
        refresh_yarn_nodes: "{home}/bin/yarn rmadmin -refreshNodes",
        dfsadmin_report: "{home}/bin/hdfs dfsadmin -report",
        yarn_node_list: "{home}/bin/yarn node -all -list",
        datanode_port: 50010,
    },
    VersionProfile {
        version: "3.0.1",
        home: "/opt/hadoop",
        conf_dir: "/opt/hadoop/etc/hadoop",
        format_namenode: "{home}/bin/hdfs namenode -format -nonInteractive",
        hdfs_daemon: "{home}/bin/hdfs --daemon start {daemon}",
        yarn_daemon: "{home}/bin/yarn --daemon start {daemon}",
        mapred_daemon: "{home}/bin/mapred --daemon start {daemon}",
        refresh_hdfs_nodes: "{home}/bin/hdfs dfsadmin -refreshNodes",
        refresh_yarn_nodes: "{home}/bin/yarn rmadmin -refreshNodes",
        dfsadmin_report: "{home}/bin/hdfs dfsadmin -report",
        yarn_node_list: "{home}/bin/yarn node -all -list",
        datanode_port: 9866,
    },
];

pub fn versions() -> Vec<String> {
    PROFILES.iter().map(|p| p.version.to_string()).collect()
}

pub fn profile(version: &str) -> Result<&'static VersionProfile, Error> {
    PROFILES.iter().find(|p| p.version == version).ok_or_else(|| {
        Error::not_found_by_name(
            ResourceType::PluginVersion,
            &format!("hadoop-{}", version),
        )
    })
}

impl VersionProfile {
    fn expand(&self, template: &str, daemon: &str) -> String {
        template.replace("{home}", self.home).replace("{daemon}", daemon)
    }

    /// Command that starts `process` on its instance.
    pub fn start_command(&self, process: &str) -> Option<String> {
        let template = match process {
            "namenode" | "secondarynamenode" | "datanode" => self.hdfs_daemon,
            "resourcemanager" | "nodemanager" => self.yarn_daemon,
            "historyserver" => self.mapred_daemon,
            _ => return None,
        };
        Some(self.expand(template, process))
    }

    pub fn format_namenode(&self) -> String {
        self.expand(self.format_namenode, "namenode")
    }

    pub fn refresh_hdfs_nodes(&self) -> String {
        self.expand(self.refresh_hdfs_nodes, "")
    }

    pub fn refresh_yarn_nodes(&self) -> String {
        self.expand(self.refresh_yarn_nodes, "")
    }

    pub fn dfsadmin_report(&self) -> String {
        self.expand(self.dfsadmin_report, "")
    }

    pub fn yarn_node_list(&self) -> String {
        self.expand(self.yarn_node_list, "")
    }

    pub fn conf_file(&self, name: &str) -> String {
        format!("{}/{}", self.conf_dir, name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_start_commands_differ_by_release() {
        let old = profile("2.7.1").unwrap();
        assert_eq!(
            old.start_command("datanode").unwrap(),
            "/opt/hadoop/sbin/hadoop-daemon.sh start datanode"
        );
        let new = profile("3.0.1").unwrap();
        assert_eq!(
            new.start_command("nodemanager").unwrap(),
            "/opt/hadoop/bin/yarn --daemon start nodemanager"
        );
        assert_eq!(new.start_command("oozie"), None);
        assert!(profile("1.2.1").unwrap_err().is_not_found());
        assert_eq!(versions(), vec!["2.7.1", "2.8.2", "3.0.1"]);
    }
}
