// Multi-broker Kafka cluster fixture
//
// One ZooKeeper node plus N identically configured brokers on a private
// network. Brokers start one at a time; the cluster counts as ready once
// every broker id is registered in ZooKeeper.

use crate::clock::{Clock, SystemClock};
use crate::config::{KafkaConfig, PortsConfig};
use crate::docker::client::DockerClient;
use crate::docker::container::{Container, ContainerSpec, WaitStrategy};
use crate::docker::network::{random_name, Network};
use crate::docker::ports::PortAllocator;
use crate::errors::{Result, RigError};
use crate::image::ImageName;
use crate::wait::{Await, DEFAULT_POLL_INTERVAL};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use std::time::Duration;

pub const ZOOKEEPER_PORT: u16 = 2181;
/// Listener published to the host
pub const KAFKA_PORT: u16 = 9093;
/// Listener brokers use to reach each other
pub const BROKER_PORT: u16 = 9092;

pub const ZOOKEEPER_IMAGE: &str = "confluentinc/cp-zookeeper";
pub const KAFKA_IMAGE: &str = "confluentinc/cp-kafka";
pub const ZOOKEEPER_ALIAS: &str = "zookeeper";
/// Label tying every container of a cluster to its network name
pub const CLUSTER_LABEL: &str = "org.stackrig.kafka.cluster";

pub const DEFAULT_BROKER_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(10);

const BROKER_STARTED_PATTERN: &str = r"\[KafkaServer id=\d+\] started";

/// Host ports of clusters built with `KafkaCluster::new`, shared by the whole process
fn shared_ports() -> MutexGuard<'static, PortAllocator> {
    static PORTS: OnceLock<Mutex<PortAllocator>> = OnceLock::new();
    PORTS
        .get_or_init(|| Mutex::new(PortAllocator::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// One broker of the cluster
pub struct KafkaBroker {
    id: usize,
    host_port: u16,
    spec: ContainerSpec,
    container: Option<Container>,
}

impl KafkaBroker {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Network alias other containers use, `broker-<id>`
    pub fn alias(&self) -> String {
        broker_alias(self.id)
    }

    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    /// Address clients on the host connect to
    pub fn bootstrap_server(&self) -> String {
        format!("PLAINTEXT://localhost:{}", self.host_port)
    }

    pub fn spec(&self) -> &ContainerSpec {
        &self.spec
    }

    pub fn container(&self) -> Option<&Container> {
        self.container.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.container.is_some()
    }
}

pub fn broker_alias(id: usize) -> String {
    format!("broker-{}", id)
}

/// Kafka cluster with `brokers_num` brokers sharing one ZooKeeper
pub struct KafkaCluster {
    docker: Arc<dyn DockerClient>,
    brokers_num: usize,
    internal_topics_rf: usize,
    network_name: String,
    zookeeper_spec: ContainerSpec,
    zookeeper: Option<Container>,
    brokers: Vec<KafkaBroker>,
    network: Option<Network>,
    /// Owners to release from the process-wide allocator on drop
    shared_port_owners: Vec<String>,
    readiness_timeout: Duration,
    poll_interval: Duration,
    clock: Arc<dyn Clock>,
}

impl KafkaCluster {
    /// Describe a cluster; nothing is started until `start`
    ///
    /// Broker host ports come from an allocator shared by every cluster in the
    /// process and are returned to it when the cluster is dropped.
    pub fn new(
        docker: Arc<dyn DockerClient>,
        confluent_platform_version: &str,
        brokers_num: usize,
        internal_topics_rf: usize,
    ) -> Result<Self> {
        let mut cluster = Self::with_ports(
            docker,
            confluent_platform_version,
            brokers_num,
            internal_topics_rf,
            &mut shared_ports(),
        )?;
        cluster.shared_port_owners = cluster
            .brokers
            .iter()
            .map(|broker| port_owner(&cluster.network_name, broker.id))
            .collect();
        Ok(cluster)
    }

    /// Like `new`, taking broker host ports from `ports`
    pub fn with_ports(
        docker: Arc<dyn DockerClient>,
        confluent_platform_version: &str,
        brokers_num: usize,
        internal_topics_rf: usize,
        ports: &mut PortAllocator,
    ) -> Result<Self> {
        if brokers_num == 0 {
            return Err(RigError::InvalidArgument(format!(
                "brokersNum '{}' must be greater than 0",
                brokers_num
            )));
        }
        if internal_topics_rf == 0 || internal_topics_rf > brokers_num {
            return Err(RigError::InvalidArgument(format!(
                "internalTopicsRf '{}' must be greater than 0 and at most brokersNum '{}'",
                internal_topics_rf, brokers_num
            )));
        }

        let network_name = random_name("stackrig-kafka-");

        let zookeeper_image =
            ImageName::parse(ZOOKEEPER_IMAGE)?.with_tag(confluent_platform_version)?;
        let zookeeper_spec = ContainerSpec::new(zookeeper_image)
            .with_network(&network_name)
            .with_network_alias(ZOOKEEPER_ALIAS)
            .with_label(CLUSTER_LABEL, &network_name)
            .with_env("ZOOKEEPER_CLIENT_PORT", ZOOKEEPER_PORT);

        let kafka_image = ImageName::parse(KAFKA_IMAGE)?.with_tag(confluent_platform_version)?;
        let mut brokers = Vec::with_capacity(brokers_num);
        for id in 0..brokers_num {
            let owner = port_owner(&network_name, id);
            let host_port = match allocate_broker_port(ports, &owner) {
                Ok(port) => port,
                Err(e) => {
                    for allocated in 0..id {
                        ports.release(&port_owner(&network_name, allocated));
                    }
                    return Err(e);
                }
            };

            let spec = broker_spec(
                kafka_image.clone(),
                &network_name,
                id,
                host_port,
                internal_topics_rf,
            );
            brokers.push(KafkaBroker {
                id,
                host_port,
                spec,
                container: None,
            });
        }

        Ok(Self {
            docker,
            brokers_num,
            internal_topics_rf,
            network_name,
            zookeeper_spec,
            zookeeper: None,
            brokers,
            network: None,
            shared_port_owners: Vec::new(),
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            clock: Arc::new(SystemClock),
        })
    }

    /// Cluster described by the `kafka` (and `ports`) sections of the config
    pub fn from_config(
        docker: Arc<dyn DockerClient>,
        config: &KafkaConfig,
        ports: &PortsConfig,
    ) -> Result<Self> {
        let mut allocator = match ports.range()? {
            Some((start, end)) => PortAllocator::with_range(start, end)?,
            None => PortAllocator::new(),
        };

        Ok(Self::with_ports(
            docker,
            &config.confluent_version,
            config.brokers,
            config.internal_topics_rf,
            &mut allocator,
        )?
        .with_broker_startup_timeout(config.startup_timeout()?)
        .with_readiness_timeout(config.readiness_timeout()?))
    }

    pub fn with_broker_startup_timeout(mut self, timeout: Duration) -> Self {
        for broker in &mut self.brokers {
            broker.spec.startup_timeout = timeout;
        }
        self
    }

    /// How long to wait for all brokers to register in ZooKeeper
    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }

    /// Poll interval for container startup and readiness probes
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self.zookeeper_spec.poll_interval = interval;
        for broker in &mut self.brokers {
            broker.spec.poll_interval = interval;
        }
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn brokers(&self) -> &[KafkaBroker] {
        &self.brokers
    }

    pub fn brokers_num(&self) -> usize {
        self.brokers_num
    }

    pub fn internal_topics_rf(&self) -> usize {
        self.internal_topics_rf
    }

    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    pub fn zookeeper_spec(&self) -> &ContainerSpec {
        &self.zookeeper_spec
    }

    pub fn zookeeper(&self) -> Option<&Container> {
        self.zookeeper.as_ref()
    }

    pub fn is_started(&self) -> bool {
        self.zookeeper.is_some()
    }

    /// Comma-joined bootstrap addresses of every broker
    pub fn bootstrap_servers(&self) -> String {
        self.brokers
            .iter()
            .map(KafkaBroker::bootstrap_server)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Start ZooKeeper, then each broker in turn, then wait for registration
    ///
    /// Brokers start sequentially to avoid resource contention on small CI
    /// machines. Anything started is torn down again if a step fails.
    pub fn start(&mut self) -> Result<()> {
        if self.is_started() {
            return Ok(());
        }

        tracing::info!(
            network = %self.network_name,
            brokers = self.brokers_num,
            rf = self.internal_topics_rf,
            "starting kafka cluster"
        );

        if let Err(e) = self
            .start_members()
            .and_then(|_| self.await_brokers_registered())
        {
            tracing::warn!(
                network = %self.network_name,
                error = %e,
                "kafka cluster failed to start"
            );
            if let Err(stop_err) = self.stop() {
                tracing::warn!(error = %stop_err, "cleanup after failed start also failed");
            }
            return Err(e);
        }

        tracing::info!(bootstrap_servers = %self.bootstrap_servers(), "kafka cluster is ready");
        Ok(())
    }

    fn start_members(&mut self) -> Result<()> {
        self.network = Some(Network::create_named(self.docker.clone(), &self.network_name)?);
        self.zookeeper = Some(Container::start(self.docker.clone(), self.zookeeper_spec.clone())?);

        for broker in &mut self.brokers {
            tracing::debug!(broker = broker.id, port = broker.host_port, "starting broker");
            broker.container = Some(Container::start(self.docker.clone(), broker.spec.clone())?);
        }
        Ok(())
    }

    /// Ids of the brokers currently registered in ZooKeeper
    pub fn registered_broker_ids(&self) -> Result<Vec<u32>> {
        let zookeeper = self
            .zookeeper
            .as_ref()
            .ok_or_else(|| RigError::NotReady("ZooKeeper is not running".to_string()))?;

        let result = zookeeper.exec(registered_brokers_command().as_slice())?;
        if !result.success() {
            return Err(RigError::NotReady(format!(
                "zookeeper-shell exited with {}: {}",
                result.exit_code,
                result.stderr.trim()
            )));
        }
        parse_broker_ids(&result.stdout)
    }

    fn await_brokers_registered(&self) -> Result<()> {
        let waiter = Await::at_most(self.readiness_timeout)
            .poll_interval(self.poll_interval)
            .with_clock(self.clock.clone());

        waiter.until_asserted("brokers to register in ZooKeeper", || {
            let ids = self.registered_broker_ids()?;
            if ids.len() != self.brokers_num {
                return Err(RigError::NotReady(format!(
                    "ZooKeeper is not ready yet ({} of {} brokers registered)",
                    ids.len(),
                    self.brokers_num
                )));
            }
            Ok(())
        })
    }

    /// Stop every container in parallel, then remove the network
    pub fn stop(&mut self) -> Result<()> {
        let mut containers: Vec<Container> = self
            .brokers
            .iter_mut()
            .filter_map(|b| b.container.take())
            .collect();
        containers.extend(self.zookeeper.take());

        if !containers.is_empty() {
            tracing::info!(
                network = %self.network_name,
                count = containers.len(),
                "stopping kafka cluster"
            );
        }

        let errors: Vec<String> = thread::scope(|scope| {
            let handles: Vec<_> = containers
                .iter_mut()
                .map(|container| scope.spawn(move || container.stop()))
                .collect();

            handles
                .into_iter()
                .filter_map(|handle| match handle.join() {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => Some("container stop panicked".to_string()),
                })
                .collect()
        });

        // Network removal fails while containers are still attached
        if errors.is_empty() {
            if let Some(mut network) = self.network.take() {
                network.remove()?;
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RigError::DockerError(format!(
                "Failed to stop kafka cluster: {}",
                errors.join("; ")
            )))
        }
    }
}

impl Drop for KafkaCluster {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(
                network = %self.network_name,
                error = %e,
                "failed to stop kafka cluster"
            );
        }
        if !self.shared_port_owners.is_empty() {
            let mut ports = shared_ports();
            for owner in &self.shared_port_owners {
                ports.release(owner);
            }
        }
    }
}

fn port_owner(network: &str, broker_id: usize) -> String {
    format!("{}/{}", network, broker_alias(broker_id))
}

fn allocate_broker_port(ports: &mut PortAllocator, owner: &str) -> Result<u16> {
    ports
        .allocate(owner, &[KAFKA_PORT])?
        .get(&KAFKA_PORT)
        .copied()
        .ok_or_else(|| RigError::PortAllocationError(format!("No port for {}", owner)))
}

fn broker_spec(
    image: ImageName,
    network: &str,
    id: usize,
    host_port: u16,
    internal_topics_rf: usize,
) -> ContainerSpec {
    let alias = broker_alias(id);

    ContainerSpec::new(image)
        .with_network(network)
        .with_network_alias(&alias)
        .with_label(CLUSTER_LABEL, network)
        .with_port_binding(KAFKA_PORT, host_port)
        .with_env("KAFKA_BROKER_ID", id)
        .with_env("KAFKA_ZOOKEEPER_CONNECT", format!("{}:{}", ZOOKEEPER_ALIAS, ZOOKEEPER_PORT))
        .with_env(
            "KAFKA_LISTENERS",
            format!("PLAINTEXT://0.0.0.0:{},BROKER://0.0.0.0:{}", KAFKA_PORT, BROKER_PORT),
        )
        .with_env(
            "KAFKA_ADVERTISED_LISTENERS",
            format!("PLAINTEXT://localhost:{},BROKER://{}:{}", host_port, alias, BROKER_PORT),
        )
        .with_env("KAFKA_LISTENER_SECURITY_PROTOCOL_MAP", "BROKER:PLAINTEXT,PLAINTEXT:PLAINTEXT")
        .with_env("KAFKA_INTER_BROKER_LISTENER_NAME", "BROKER")
        .with_env("KAFKA_OFFSETS_TOPIC_REPLICATION_FACTOR", internal_topics_rf)
        .with_env("KAFKA_OFFSETS_TOPIC_NUM_PARTITIONS", internal_topics_rf)
        .with_env("KAFKA_TRANSACTION_STATE_LOG_REPLICATION_FACTOR", internal_topics_rf)
        .with_env("KAFKA_TRANSACTION_STATE_LOG_MIN_ISR", internal_topics_rf)
        .with_env("KAFKA_GROUP_INITIAL_REBALANCE_DELAY_MS", 0)
        .with_startup_timeout(DEFAULT_BROKER_STARTUP_TIMEOUT)
        .with_wait_strategy(WaitStrategy::LogMessage(BROKER_STARTED_PATTERN.to_string()))
}

/// Command run inside ZooKeeper to list registered broker ids
pub fn registered_brokers_command() -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!(
            "zookeeper-shell {}:{} ls /brokers/ids | tail -n 1",
            ZOOKEEPER_ALIAS, ZOOKEEPER_PORT
        ),
    ]
}

/// Parse the last line of `ls /brokers/ids`, e.g. `[0, 1, 2]`
pub fn parse_broker_ids(output: &str) -> Result<Vec<u32>> {
    let line = output.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim();

    let inner = line
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(|| RigError::NotReady(format!("ZooKeeper is not ready yet: '{}'", line)))?;

    inner
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(|id| {
            id.parse::<u32>()
                .map_err(|_| RigError::NotReady(format!("Unexpected broker id '{}'", id)))
        })
        .collect()
}
