// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable for the trellis provisioner

use anyhow::anyhow;
use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use trellis_common::api::external::ClusterCreate;
use trellis_common::cmd::fatal;
use trellis_common::cmd::CmdError;
use trellis_provisioner::sim::SimEnvironment;
use trellis_provisioner::Config;
use trellis_provisioner::Outcome;

#[derive(Debug, Parser)]
#[clap(name = "trellis-provisioner", about = "Cluster provisioning engine")]
enum Args {
    /// Parse and check a configuration file, then exit
    CheckConfig {
        #[clap(name = "CONFIG_FILE_PATH", action)]
        config_file_path: Utf8PathBuf,
    },

    /// Provision a cluster against simulated infrastructure and print its
    /// provisioning log
    Simulate {
        #[clap(name = "CONFIG_FILE_PATH", action)]
        config_file_path: Utf8PathBuf,

        /// TOML description of the cluster to create
        #[clap(name = "CLUSTER_FILE_PATH", action)]
        cluster_file_path: Utf8PathBuf,
    },
}

#[tokio::main]
async fn main() {
    if let Err(cmd_error) = do_run().await {
        fatal(cmd_error);
    }
}

fn load_config(path: &Utf8PathBuf) -> Result<Config, CmdError> {
    let config = Config::from_file(path)
        .and_then(|config| config.validate().map(|()| config))
        .map_err(|e| CmdError::Failure(anyhow!(e)))?;
    Ok(config)
}

async fn do_run() -> Result<(), CmdError> {
    let args = Args::parse();

    match args {
        Args::CheckConfig { config_file_path } => {
            load_config(&config_file_path)?;
            println!("{}: ok", config_file_path);
            Ok(())
        }
        Args::Simulate { config_file_path, cluster_file_path } => {
            let config = load_config(&config_file_path)?;
            let log = config.log.to_logger("trellis-provisioner").map_err(
                |msg| CmdError::Failure(anyhow!("initializing logger: {}", msg)),
            )?;
            simulate(&log, &config, &cluster_file_path)
                .await
                .map_err(CmdError::Failure)
        }
    }
}

async fn simulate(
    log: &slog::Logger,
    config: &Config,
    cluster_file_path: &Utf8PathBuf,
) -> anyhow::Result<()> {
    let contents = std::fs::read_to_string(cluster_file_path)
        .with_context(|| format!("reading {}", cluster_file_path))?;
    let params: ClusterCreate = toml::from_str(&contents)
        .with_context(|| format!("parsing {}", cluster_file_path))?;

    let env = SimEnvironment::new(log, config)?;
    let cluster = env.orchestrator.create_cluster(params).await?;
    env.answer_datanode_reports(&cluster);
    let result = env.orchestrator.provision_cluster(cluster.id).await;

    let progress = env.orchestrator.cluster_progress(cluster.id).await?;
    for entry in &progress.steps {
        let step = &entry.step;
        let status = match step.successful {
            None => "open",
            Some(true) => "ok",
            Some(false) => "FAILED",
        };
        println!(
            "{:<40} {:>3}/{:<3} {}",
            step.step_name, step.completed, step.total, status
        );
        for event in entry.events.iter().filter(|e| !e.successful) {
            let instance = event
                .instance
                .as_ref()
                .map_or("cluster", |i| i.instance_name.as_str());
            println!(
                "    {}: {}",
                instance,
                event.event_info.as_deref().unwrap_or("failed")
            );
        }
    }

    match result? {
        Outcome::Completed => {
            let cluster = env.orchestrator.cluster(cluster.id).await?;
            println!("cluster {:?} is {}", cluster.name, cluster.status);
            Ok(())
        }
        Outcome::Abandoned => {
            Err(anyhow!("cluster {:?} was deleted", cluster.name))
        }
    }
}
