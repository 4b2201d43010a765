use crate::common::FakeDocker;
use stackrig::config::{KafkaConfig, PortsConfig};
use stackrig::docker::ports::PortAllocator;
use stackrig::errors::RigError;
use stackrig::kafka::{KafkaCluster, CLUSTER_LABEL, KAFKA_PORT};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn fast(cluster: KafkaCluster) -> KafkaCluster {
    cluster
        .with_poll_interval(Duration::from_millis(5))
        .with_readiness_timeout(Duration::from_millis(100))
        .with_broker_startup_timeout(Duration::from_millis(100))
}

#[test]
fn test_rejects_zero_brokers() {
    let docker = Arc::new(FakeDocker::new());
    let result = KafkaCluster::new(docker, "7.4.0", 0, 0);

    match result {
        Err(RigError::InvalidArgument(message)) => assert!(message.contains("brokersNum")),
        _ => panic!("zero brokers must be rejected"),
    }
}

#[test]
fn test_rejects_replication_factor_out_of_range() {
    let docker = Arc::new(FakeDocker::new());

    assert!(matches!(
        KafkaCluster::new(docker.clone(), "7.4.0", 3, 4),
        Err(RigError::InvalidArgument(_))
    ));
    assert!(matches!(
        KafkaCluster::new(docker.clone(), "7.4.0", 3, 0),
        Err(RigError::InvalidArgument(_))
    ));
    assert!(KafkaCluster::new(docker, "7.4.0", 3, 3).is_ok());
}

#[test]
fn test_rejects_invalid_version_tag() {
    let docker = Arc::new(FakeDocker::new());
    assert!(matches!(
        KafkaCluster::new(docker, "not a tag", 1, 1),
        Err(RigError::InvalidImageName(_, _))
    ));
}

#[test]
fn test_describes_brokers_without_starting() {
    let docker = Arc::new(FakeDocker::new());
    let cluster = KafkaCluster::new(docker.clone(), "7.4.0", 3, 2).unwrap();

    assert_eq!(cluster.brokers().len(), 3);
    assert!(!cluster.is_started());
    assert!(docker.calls().is_empty(), "nothing may touch docker before start");

    for (i, broker) in cluster.brokers().iter().enumerate() {
        assert_eq!(broker.id(), i);
        assert_eq!(broker.alias(), format!("broker-{}", i));
        assert_eq!(broker.spec().image.to_string(), "confluentinc/cp-kafka:7.4.0");
        assert_eq!(broker.spec().network.as_deref(), Some(cluster.network_name()));
        assert_eq!(broker.spec().env["KAFKA_OFFSETS_TOPIC_REPLICATION_FACTOR"], "2");
    }

    let zookeeper = cluster.zookeeper_spec();
    assert_eq!(zookeeper.image.to_string(), "confluentinc/cp-zookeeper:7.4.0");
    assert_eq!(zookeeper.network_aliases, vec!["zookeeper"]);
    assert_eq!(zookeeper.env["ZOOKEEPER_CLIENT_PORT"], "2181");
}

#[test]
fn test_bootstrap_servers_lists_every_broker() {
    let docker = Arc::new(FakeDocker::new());
    let cluster = KafkaCluster::new(docker, "7.4.0", 3, 2).unwrap();

    let servers = cluster.bootstrap_servers();
    let parts: Vec<&str> = servers.split(',').collect();
    assert_eq!(parts.len(), 3);
    for (part, broker) in parts.iter().zip(cluster.brokers()) {
        assert_eq!(*part, format!("PLAINTEXT://localhost:{}", broker.host_port()));
    }
}

#[test]
fn test_broker_ports_come_from_allocator() {
    let docker = Arc::new(FakeDocker::new());
    let mut ports = PortAllocator::new();

    let first = KafkaCluster::with_ports(docker.clone(), "7.4.0", 2, 1, &mut ports).unwrap();
    let second = KafkaCluster::with_ports(docker, "7.4.0", 2, 1, &mut ports).unwrap();

    let mut all: Vec<u16> = first
        .brokers()
        .iter()
        .chain(second.brokers())
        .map(|b| b.host_port())
        .collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 4, "clusters sharing an allocator never share ports");
    assert_eq!(ports.list_all().len(), 4);
}

#[test]
fn test_clusters_built_with_new_never_share_host_ports() {
    let docker = Arc::new(FakeDocker::new());

    let clusters: Vec<KafkaCluster> = (0..200)
        .map(|_| KafkaCluster::new(docker.clone(), "7.4.0", 3, 1).unwrap())
        .collect();

    let mut seen = HashSet::new();
    for (index, cluster) in clusters.iter().enumerate() {
        for broker in cluster.brokers() {
            assert!(
                seen.insert(broker.host_port()),
                "port {} of cluster #{} is already advertised by another cluster",
                broker.host_port(),
                index
            );
        }
    }
    assert_eq!(seen.len(), 600);
}

#[test]
fn test_containers_carry_cluster_label() {
    let docker = Arc::new(FakeDocker::new());
    let cluster = KafkaCluster::new(docker, "7.4.0", 2, 1).unwrap();

    let network = cluster.network_name().to_string();
    assert_eq!(cluster.zookeeper_spec().labels[CLUSTER_LABEL], network);
    for broker in cluster.brokers() {
        assert_eq!(broker.spec().labels[CLUSTER_LABEL], network);
    }
}

#[test]
fn test_failing_zookeeper_shell_is_reported() {
    let docker = Arc::new(FakeDocker::new().failing_zookeeper_shell("Connection refused"));
    let mut cluster = fast(KafkaCluster::new(docker.clone(), "7.4.0", 2, 1).unwrap());

    match cluster.start().unwrap_err() {
        RigError::Timeout { last_error, .. } => {
            let last_error = last_error.unwrap_or_default();
            assert!(last_error.contains("zookeeper-shell exited with 1"));
            assert!(last_error.contains("Connection refused"));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(docker.container_count(), 0);
}

#[test]
fn test_start_is_sequential_and_waits_for_registration() {
    let docker = Arc::new(FakeDocker::new());
    let mut cluster = fast(KafkaCluster::new(docker.clone(), "7.4.0", 3, 2).unwrap());

    cluster.start().unwrap();
    assert!(cluster.is_started());
    assert!(cluster.brokers().iter().all(|b| b.is_running()));

    let calls = docker.calls();
    let create_network = format!("network create {}", cluster.network_name());
    let lifecycle: Vec<&str> = calls
        .iter()
        .map(String::as_str)
        .filter(|c| c.starts_with("run") || c.starts_with("network create"))
        .collect();
    assert_eq!(
        lifecycle,
        vec![
            create_network.as_str(),
            "run zookeeper",
            "run broker-0",
            "run broker-1",
            "run broker-2",
        ]
    );

    let probes = docker.calls_starting_with("exec");
    assert_eq!(probes.len(), 1);
    assert!(probes[0].contains("zookeeper-shell zookeeper:2181 ls /brokers/ids | tail -n 1"));
    assert_eq!(cluster.registered_broker_ids().unwrap(), vec![0, 1, 2]);
}

#[test]
fn test_start_times_out_when_brokers_do_not_register() {
    let docker = Arc::new(FakeDocker::new().with_registered_limit(2));
    let mut cluster = fast(KafkaCluster::new(docker.clone(), "7.4.0", 3, 2).unwrap());

    let err = cluster.start().unwrap_err();
    match &err {
        RigError::Timeout { last_error, .. } => {
            assert!(last_error
                .as_deref()
                .unwrap_or_default()
                .contains("ZooKeeper is not ready yet"));
        }
        other => panic!("unexpected error: {}", other),
    }

    assert!(docker.calls_starting_with("exec").len() > 1, "readiness is polled");
    assert!(!cluster.is_started());
    assert_eq!(docker.container_count(), 0);
    assert_eq!(docker.network_count(), 0);
}

#[test]
fn test_failed_broker_tears_down_started_members() {
    let docker = Arc::new(FakeDocker::new().failing_run_for("broker-1"));
    let mut cluster = fast(KafkaCluster::new(docker.clone(), "7.4.0", 3, 2).unwrap());

    assert!(cluster.start().is_err());

    assert!(docker.calls_starting_with("run broker-2").is_empty());
    let mut removed = docker.calls_starting_with("rm ");
    removed.sort();
    assert_eq!(removed, vec!["rm broker-0", "rm zookeeper"]);
    assert_eq!(docker.network_count(), 0);
}

#[test]
fn test_stop_removes_everything_once() {
    let docker = Arc::new(FakeDocker::new());
    let mut cluster = fast(KafkaCluster::new(docker.clone(), "7.4.0", 2, 1).unwrap());

    cluster.start().unwrap();
    cluster.stop().unwrap();
    cluster.stop().unwrap();

    assert_eq!(docker.container_count(), 0);
    assert_eq!(docker.network_count(), 0);
    assert_eq!(docker.calls_starting_with("rm ").len(), 3);
    assert_eq!(docker.calls_starting_with("network rm").len(), 1);
    assert!(cluster.brokers().iter().all(|b| !b.is_running()));
}

#[test]
fn test_drop_stops_cluster() {
    let docker = Arc::new(FakeDocker::new());
    {
        let mut cluster = fast(KafkaCluster::new(docker.clone(), "7.4.0", 2, 2).unwrap());
        cluster.start().unwrap();
        assert_eq!(docker.container_count(), 3);
    }
    assert_eq!(docker.container_count(), 0);
    assert_eq!(docker.network_count(), 0);
}

#[test]
fn test_from_config() {
    let docker = Arc::new(FakeDocker::new());
    let config = KafkaConfig {
        confluent_version: "7.5.1".to_string(),
        brokers: 2,
        internal_topics_rf: 1,
        ..KafkaConfig::default()
    };

    let cluster = KafkaCluster::from_config(docker, &config, &PortsConfig::default()).unwrap();
    assert_eq!(cluster.brokers_num(), 2);
    assert_eq!(cluster.internal_topics_rf(), 1);
    assert_eq!(
        cluster.brokers()[0].spec().image.to_string(),
        "confluentinc/cp-kafka:7.5.1"
    );
    assert!(cluster.brokers()[0].spec().ports.contains_key(&KAFKA_PORT));
}
