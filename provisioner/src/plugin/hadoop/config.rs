// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rendering of Hadoop's `*-site.xml` files

use super::versions::VersionProfile;
use super::DFS_REPLICATION;
use std::collections::BTreeMap;
use trellis_common::api::external::Cluster;
use trellis_common::api::external::ClusterConfigs;
use trellis_common::api::external::Instance;
use trellis_common::api::external::NodeGroup;

pub const HDFS_INCLUDE: &str = "dn-include";
pub const HDFS_EXCLUDE: &str = "dn-exclude";
pub const YARN_INCLUDE: &str = "nm-include";
pub const YARN_EXCLUDE: &str = "nm-exclude";

const DATA_DIR: &str = "/var/lib/hadoop";

/// Which site file each configuration target ends up in
const SITE_FILES: &[(&str, &str)] = &[
    ("general", "core-site.xml"),
    ("HDFS", "hdfs-site.xml"),
    ("YARN", "yarn-site.xml"),
    ("MapReduce", "mapred-site.xml"),
];

type Properties = BTreeMap<String, String>;

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn render_configuration(properties: &Properties) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<configuration>\n",
    );
    for (name, value) in properties {
        xml.push_str(&format!(
            "  <property>\n    <name>{}</name>\n    <value>{}</value>\n  \
             </property>\n",
            escape(name),
            escape(value)
        ));
    }
    xml.push_str("</configuration>\n");
    xml
}

/// Hadoop properties are dotted names; anything else in a target's section
/// is a plugin option and is not written out.
fn is_hadoop_property(name: &str) -> bool {
    name.contains('.') && !name.contains(char::is_whitespace)
}

fn json_to_property(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn apply_overrides(
    files: &mut BTreeMap<&'static str, Properties>,
    configs: &ClusterConfigs,
) {
    for (target, file) in SITE_FILES {
        let Some(section) = configs.get(*target) else {
            continue;
        };
        let properties = files.entry(file).or_default();
        for (name, value) in section {
            if is_hadoop_property(name) {
                properties.insert(name.clone(), json_to_property(value));
            }
        }
    }
}

/// Site files for one node group, keyed by file name.
///
/// Built-in defaults are overridden by the cluster's configuration, which
/// in turn is overridden by the node group's.
pub fn site_files(
    profile: &VersionProfile,
    cluster: &Cluster,
    node_group: &NodeGroup,
    namenode: &Instance,
    resourcemanager: &Instance,
    replication: u64,
) -> BTreeMap<&'static str, Properties> {
    let mut files: BTreeMap<&'static str, Properties> = BTreeMap::new();
    let conf = |name: &str| profile.conf_file(name);

    let core = files.entry("core-site.xml").or_default();
    core.insert(
        "fs.defaultFS".into(),
        format!("hdfs://{}:9000", namenode.hostname()),
    );
    core.insert("hadoop.tmp.dir".into(), format!("{}/tmp", DATA_DIR));

    let hdfs = files.entry("hdfs-site.xml").or_default();
    hdfs.insert(DFS_REPLICATION.name.into(), replication.to_string());
    hdfs.insert("dfs.hosts".into(), conf(HDFS_INCLUDE));
    hdfs.insert("dfs.hosts.exclude".into(), conf(HDFS_EXCLUDE));
    hdfs.insert(
        "dfs.namenode.name.dir".into(),
        format!("file://{}/namenode", DATA_DIR),
    );
    hdfs.insert(
        "dfs.datanode.data.dir".into(),
        format!("file://{}/datanode", DATA_DIR),
    );
    hdfs.insert(
        "dfs.datanode.address".into(),
        format!("0.0.0.0:{}", profile.datanode_port),
    );

    let yarn = files.entry("yarn-site.xml").or_default();
    yarn.insert(
        "yarn.resourcemanager.hostname".into(),
        resourcemanager.hostname().to_string(),
    );
    yarn.insert(
        "yarn.resourcemanager.nodes.include-path".into(),
        conf(YARN_INCLUDE),
    );
    yarn.insert(
        "yarn.resourcemanager.nodes.exclude-path".into(),
        conf(YARN_EXCLUDE),
    );
    yarn.insert(
        "yarn.nodemanager.aux-services".into(),
        "mapreduce_shuffle".into(),
    );

    let mapred = files.entry("mapred-site.xml").or_default();
    mapred.insert("mapreduce.framework.name".into(), "yarn".into());

    apply_overrides(&mut files, &cluster.cluster_configs);
    apply_overrides(&mut files, &node_group.node_configs);
    files
}

/// `/etc/hosts` lines for every instance of the cluster.
pub fn hosts_file(cluster: &Cluster) -> String {
    let mut hosts = String::from("127.0.0.1 localhost\n");
    for instance in cluster.instances() {
        let Some(ip) = instance.internal_ip.or(instance.management_ip) else {
            continue;
        };
        hosts.push_str(&format!(
            "{} {} {}\n",
            ip,
            instance.fqdn,
            instance.hostname()
        ));
    }
    hosts
}
