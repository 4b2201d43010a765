use crate::cli::{connect, run_child};
use crate::config::Config;
use crate::errors::Result;
use crate::kafka::KafkaCluster;
use colored::*;
use std::collections::BTreeMap;

/// Command-line overrides for the `kafka` config section
#[derive(Debug, Default)]
pub struct ClusterOptions {
    pub version: Option<String>,
    pub brokers: Option<usize>,
    pub internal_topics_rf: Option<usize>,
}

/// Start a cluster, run a command with KAFKA_BOOTSTRAP_SERVERS set, stop the cluster
pub fn run(config: &Config, options: ClusterOptions, command: Vec<String>) -> Result<i32> {
    let docker = connect(config)?;

    let mut kafka_config = config.kafka.clone();
    if let Some(version) = options.version {
        kafka_config.confluent_version = version;
    }
    if let Some(brokers) = options.brokers {
        kafka_config.brokers = brokers;
    }
    if let Some(rf) = options.internal_topics_rf {
        kafka_config.internal_topics_rf = rf;
    }

    let mut cluster = KafkaCluster::from_config(docker, &kafka_config, &config.ports)?
        .with_poll_interval(config.wait.poll_interval()?);

    println!(
        "Starting Kafka {} with {} broker(s)...",
        kafka_config.confluent_version.cyan(),
        cluster.brokers_num()
    );
    cluster.start()?;

    let bootstrap = cluster.bootstrap_servers();
    println!("{} Cluster ready: {}", "✓".green().bold(), bootstrap.green());

    let mut env = BTreeMap::new();
    env.insert("KAFKA_BOOTSTRAP_SERVERS".to_string(), bootstrap);
    env.insert("STACKRIG_NETWORK".to_string(), cluster.network_name().to_string());

    let code = run_child(&command, &env);
    cluster.stop()?;
    println!("{} Cluster stopped", "✓".green().bold());
    code
}
