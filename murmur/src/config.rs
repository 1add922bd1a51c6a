use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use gethostname::gethostname;

use anyhow::Result;
use crate::error::MurmurError;
use crate::ip_addr::IpAddress;

// Default configuration constants
pub(crate) const DEFAULT_IP_ADDR: Ipv4Addr = Ipv4Addr::LOCALHOST;
pub(crate) const DEFAULT_PORT: u16 = 5870;
pub(crate) const DEFAULT_BASE_PROBING_INTERVAL: u64 = 1_000; // 1 second base interval
pub(crate) const DEFAULT_BASE_GOSSIP_INTERVAL: u64 = 200; // 200 milliseconds
pub(crate) const DEFAULT_PUSH_PULL_INTERVAL: u64 = 30_000; // 30 seconds
pub(crate) const DEFAULT_ACK_TIMEOUT: u64 = 500; // 500 milliseconds
pub(crate) const DEFAULT_INDIRECT_ACK_TIMEOUT: u64 = 500; // 500 milliseconds
pub(crate) const DEFAULT_BASE_SUSPICIOUS_TIMEOUT: u64 = 5_000; // 5 seconds
pub(crate) const DEFAULT_STREAM_TIMEOUT: u64 = 5_000; // 5 seconds
pub(crate) const DEFAULT_DEAD_NODE_GOSSIP_WINDOW: u64 = 30_000; // 30 seconds
pub(crate) const DEFAULT_DEAD_NODE_RETENTION: u64 = 3_600_000; // 1 hour in milliseconds
pub(crate) const DEFAULT_MEMBER_LOG_INTERVAL: u64 = 60_000; // 1 minute
pub(crate) const DEFAULT_LEAVE_TIMEOUT: u64 = 1_000; // 1 second
pub(crate) const DEFAULT_RETRANSMIT_MULT: u32 = 4;
pub(crate) const DEFAULT_GOSSIP_NODES: usize = 3;
pub(crate) const DEFAULT_INDIRECT_CHECKS: usize = 3;
pub(crate) const DEFAULT_PROBE_BATCH: usize = 1;
pub(crate) const DEFAULT_MAX_PIGGYBACK_UPDATES: usize = 8;
pub(crate) const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 1_000;
pub(crate) const MAX_RETRY_DELAY: u64 = 60; // in secs
pub(crate) const MAX_UDP_PACKET_SIZE: usize = 1400;
pub(crate) const MAX_STREAM_FRAME_SIZE: usize = 8 * 1024 * 1024;
pub(crate) const META_MAX_SIZE: usize = 512;

/// [`NetworkType`] Represents the type of network environment the gossip protocol is operating in.
/// This affects the periodic intervals.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum NetworkType {
    /// Local network (e.g., localhost or same machine)
    #[default]
    Local,
    /// Local Area Network (LAN)
    LAN,
    /// Wide Area Network (WAN)
    WAN,
}

impl NetworkType {
    fn factor(&self) -> f64 {
        match self {
            NetworkType::Local => 1.0,
            NetworkType::LAN => 1.5,
            NetworkType::WAN => 3.0,
        }
    }
}

/// [`MurmurConfig`] configuration of a murmur node
#[derive(Debug, Clone)]
pub struct MurmurConfig {
    /// Name of the node, unique within the cluster
    pub(crate) name: String,

    /// Port the node binds for both datagrams and streams
    pub(crate) port: u16,

    /// IP address the node binds to
    pub(crate) ip_addr: IpAddr,

    /// Address advertised to peers; resolved from the bind address when unset
    pub(crate) advertise_addr: Option<SocketAddr>,

    /// Base interval between two probe rounds, scaled by network type
    pub(crate) base_probing_interval: Duration,

    /// Number of members probed per round
    pub(crate) probe_batch: usize,

    /// Timeout for the direct ACK of a probe
    pub(crate) ack_timeout: Duration,

    /// Extra time granted to indirect probes once the direct ACK is missed
    pub(crate) indirect_ack_timeout: Duration,

    /// Number of members asked to probe on our behalf
    pub(crate) indirect_checks: usize,

    /// Base time a member stays suspect before being declared dead.
    /// Scaled logarithmically with the cluster size.
    pub(crate) base_suspicious_timeout: Duration,

    /// Base interval between two gossip rounds, scaled by network type
    pub(crate) base_gossip_interval: Duration,

    /// Number of random members gossiped to each round
    pub(crate) gossip_nodes: usize,

    /// Upper bound on membership updates piggybacked on one packet
    pub(crate) max_piggyback_updates: usize,

    /// Base interval between two push-pull (anti-entropy) exchanges
    pub(crate) base_push_pull_interval: Duration,

    /// Timeout of a whole push-pull exchange, connect included
    pub(crate) stream_timeout: Duration,

    /// Retransmit multiplier: a broadcast is sent
    /// `ceil(retransmit_mult * log10(N + 1))` times
    pub(crate) retransmit_mult: u32,

    /// The time window during which dead nodes are still gossiped to,
    /// allowing them an opportunity to refute their dead status.
    pub(crate) dead_node_gossip_window: Duration,

    /// How long dead or departed nodes stay in the registry
    pub(crate) dead_node_retention: Duration,

    /// Interval of the operator member listing; `None` disables it
    pub(crate) member_log_interval: Option<Duration>,

    /// Longest `leave` waits for the departure to be fully disseminated
    pub(crate) leave_timeout: Duration,

    /// Type of network the node is operating in (Local, LAN, or WAN)
    pub(crate) network_type: NetworkType,
}

impl MurmurConfig {
    pub fn ip_addr(&self) -> IpAddr {
        self.ip_addr
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip_addr, self.port)
    }

    pub fn advertise_addr(&self) -> Option<SocketAddr> {
        self.advertise_addr
    }

    pub fn retransmit_mult(&self) -> u32 {
        self.retransmit_mult
    }

    /// Scales a base interval according to the network type:
    /// - Local: No additional adjustment
    /// - LAN: 1.5x increase to account for slightly higher latency
    /// - WAN: 3x increase to account for significantly higher latency
    pub(crate) fn calculate_interval(&self, interval: Duration) -> Duration {
        let interval_ms = interval.as_millis() as f64 * self.network_type.factor();
        Duration::from_millis(interval_ms as u64)
    }

    pub fn probe_interval(&self) -> Duration {
        self.calculate_interval(self.base_probing_interval)
    }

    pub fn gossip_interval(&self) -> Duration {
        self.calculate_interval(self.base_gossip_interval)
    }

    pub fn push_pull_interval(&self) -> Duration {
        self.calculate_interval(self.base_push_pull_interval)
    }

    /// Returns the fixed ACK timeout of a direct probe.
    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    /// Total time a probe may take, indirect phase included.
    pub fn probe_timeout(&self) -> Duration {
        self.ack_timeout + self.indirect_ack_timeout
    }

    /// Calculates the suspicious timeout based on cluster size
    ///
    /// The suspicious timeout increases logarithmically with cluster size to reduce
    /// false positives in larger clusters.
    pub fn suspicious_timeout(&self, cluster_size: usize) -> Duration {
        let base_ms = self.base_suspicious_timeout.as_millis() as f64;
        let log_factor = (cluster_size as f64).ln().max(1.0);
        Duration::from_millis((base_ms * log_factor) as u64)
    }

    pub fn stream_timeout(&self) -> Duration {
        self.stream_timeout
    }

    /// Returns the time window during which dead nodes are still gossiped to.
    pub fn dead_node_gossip_window(&self) -> Duration {
        self.dead_node_gossip_window
    }

    pub fn dead_node_retention(&self) -> Duration {
        self.dead_node_retention
    }

    pub fn leave_timeout(&self) -> Duration {
        self.leave_timeout
    }
}

pub struct MurmurConfigBuilder {
    name: Option<String>,
    port: u16,
    ip_addr: IpAddr,
    advertise_addr: Option<SocketAddr>,
    base_probing_interval: Duration,
    probe_batch: usize,
    ack_timeout: Duration,
    indirect_ack_timeout: Duration,
    indirect_checks: usize,
    base_suspicious_timeout: Duration,
    base_gossip_interval: Duration,
    gossip_nodes: usize,
    max_piggyback_updates: usize,
    base_push_pull_interval: Duration,
    stream_timeout: Duration,
    retransmit_mult: u32,
    dead_node_gossip_window: Duration,
    dead_node_retention: Duration,
    member_log_interval: Option<Duration>,
    leave_timeout: Duration,
    network_type: NetworkType,
}

impl Default for MurmurConfigBuilder {
    fn default() -> MurmurConfigBuilder {
        Self {
            name: None,
            port: DEFAULT_PORT,
            ip_addr: IpAddr::V4(DEFAULT_IP_ADDR),
            advertise_addr: None,
            base_probing_interval: Duration::from_millis(DEFAULT_BASE_PROBING_INTERVAL),
            probe_batch: DEFAULT_PROBE_BATCH,
            ack_timeout: Duration::from_millis(DEFAULT_ACK_TIMEOUT),
            indirect_ack_timeout: Duration::from_millis(DEFAULT_INDIRECT_ACK_TIMEOUT),
            indirect_checks: DEFAULT_INDIRECT_CHECKS,
            base_suspicious_timeout: Duration::from_millis(DEFAULT_BASE_SUSPICIOUS_TIMEOUT),
            base_gossip_interval: Duration::from_millis(DEFAULT_BASE_GOSSIP_INTERVAL),
            gossip_nodes: DEFAULT_GOSSIP_NODES,
            max_piggyback_updates: DEFAULT_MAX_PIGGYBACK_UPDATES,
            base_push_pull_interval: Duration::from_millis(DEFAULT_PUSH_PULL_INTERVAL),
            stream_timeout: Duration::from_millis(DEFAULT_STREAM_TIMEOUT),
            retransmit_mult: DEFAULT_RETRANSMIT_MULT,
            dead_node_gossip_window: Duration::from_millis(DEFAULT_DEAD_NODE_GOSSIP_WINDOW),
            dead_node_retention: Duration::from_millis(DEFAULT_DEAD_NODE_RETENTION),
            member_log_interval: Some(Duration::from_millis(DEFAULT_MEMBER_LOG_INTERVAL)),
            leave_timeout: Duration::from_millis(DEFAULT_LEAVE_TIMEOUT),
            network_type: NetworkType::default(),
        }
    }
}

impl MurmurConfigBuilder {
    /// Creates a new [`MurmurConfigBuilder`] with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the name of the node
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the port number for the node
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the IP address for the node
    pub fn with_addr(mut self, addr: impl Into<IpAddress>) -> Self {
        self.ip_addr = addr.into().0;
        self
    }

    /// Sets the address advertised to other members
    pub fn with_advertise_addr(mut self, addr: SocketAddr) -> Self {
        self.advertise_addr = Some(addr);
        self
    }

    /// Sets the base probing interval
    pub fn with_probing_interval(mut self, interval: Duration) -> Self {
        self.base_probing_interval = interval;
        self
    }

    /// Sets how many members are probed per round
    pub fn with_probe_batch(mut self, batch: usize) -> Self {
        self.probe_batch = batch;
        self
    }

    /// Sets the ACK timeout of a direct probe
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Sets the time granted to indirect probes
    pub fn with_indirect_ack_timeout(mut self, timeout: Duration) -> Self {
        self.indirect_ack_timeout = timeout;
        self
    }

    /// Sets how many members relay an indirect probe
    pub fn with_indirect_checks(mut self, checks: usize) -> Self {
        self.indirect_checks = checks;
        self
    }

    /// Sets the base suspicious timeout
    pub fn with_suspicious_timeout(mut self, timeout: Duration) -> Self {
        self.base_suspicious_timeout = timeout;
        self
    }

    /// Sets the base gossip interval
    pub fn with_gossip_interval(mut self, interval: Duration) -> Self {
        self.base_gossip_interval = interval;
        self
    }

    /// Sets how many members are gossiped to per round
    pub fn with_gossip_nodes(mut self, nodes: usize) -> Self {
        self.gossip_nodes = nodes;
        self
    }

    /// Sets the maximum number of membership updates per packet
    pub fn with_max_piggyback_updates(mut self, max: usize) -> Self {
        self.max_piggyback_updates = max;
        self
    }

    /// Sets the base push-pull interval
    pub fn with_push_pull_interval(mut self, interval: Duration) -> Self {
        self.base_push_pull_interval = interval;
        self
    }

    /// Sets the timeout of stream exchanges
    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    /// Sets the retransmit multiplier
    pub fn with_retransmit_mult(mut self, mult: u32) -> Self {
        self.retransmit_mult = mult;
        self
    }

    /// Sets the time window for gossiping to supposedly dead nodes.
    pub fn with_dead_node_gossip_window(mut self, window: Duration) -> Self {
        self.dead_node_gossip_window = window;
        self
    }

    /// Sets how long dead nodes are kept before being purged.
    pub fn with_dead_node_retention(mut self, retention: Duration) -> Self {
        self.dead_node_retention = retention;
        self
    }

    /// Sets the member listing interval, `None` turns the listing off
    pub fn with_member_log_interval(mut self, interval: Option<Duration>) -> Self {
        self.member_log_interval = interval;
        self
    }

    /// Sets how long `leave` may wait for its announcement to go out
    pub fn with_leave_timeout(mut self, timeout: Duration) -> Self {
        self.leave_timeout = timeout;
        self
    }

    /// Sets the network type (Local, LAN, or WAN)
    pub fn with_network_type(mut self, network_type: NetworkType) -> Self {
        self.network_type = network_type;
        self
    }

    /// Validates the current configuration
    ///
    /// Checks that all necessary fields are set and have non-zero values where appropriate.
    pub(crate) fn validate(&self) -> Result<()> {
        let fail = |reason: &str| Err(MurmurError::Config(reason.to_string()).into());

        if matches!(self.name.as_deref(), Some("")) {
            return fail("node name is empty");
        }
        if self.base_probing_interval.is_zero() {
            return fail("base probing interval is not set");
        }
        if self.ack_timeout.is_zero() {
            return fail("ACK timeout is not set");
        }
        if self.indirect_ack_timeout.is_zero() {
            return fail("indirect ACK timeout is not set");
        }
        if self.ack_timeout + self.indirect_ack_timeout > self.base_probing_interval {
            return fail("probe timeout (ack + indirect ack) must not exceed the probing interval");
        }
        if self.base_suspicious_timeout.is_zero() {
            return fail("base suspicious timeout is not set");
        }
        if self.base_gossip_interval.is_zero() {
            return fail("base gossip interval is not set");
        }
        if self.base_push_pull_interval.is_zero() {
            return fail("base push-pull interval is not set");
        }
        if self.stream_timeout.is_zero() {
            return fail("stream timeout is not set");
        }
        if self.probe_batch == 0 {
            return fail("probe batch must be greater than zero(0)");
        }
        if self.retransmit_mult == 0 {
            return fail("retransmit multiplier must be greater than zero(0)");
        }
        if self.dead_node_retention < self.dead_node_gossip_window {
            return fail("dead node retention must cover the dead node gossip window");
        }
        if self.leave_timeout.is_zero() {
            return fail("leave timeout is not set");
        }
        if matches!(self.member_log_interval, Some(interval) if interval.is_zero()) {
            return fail("member log interval must be greater than zero when enabled");
        }

        Ok(())
    }

    /// Builds the final MurmurConfig
    ///
    /// If the name is not set, it uses the hostname of the machine.
    pub fn build(mut self) -> Result<MurmurConfig> {
        self.fill();
        self.validate()?;

        Ok(MurmurConfig {
            name: self.name.unwrap_or_default(),
            port: self.port,
            ip_addr: self.ip_addr,
            advertise_addr: self.advertise_addr,
            base_probing_interval: self.base_probing_interval,
            probe_batch: self.probe_batch,
            ack_timeout: self.ack_timeout,
            indirect_ack_timeout: self.indirect_ack_timeout,
            indirect_checks: self.indirect_checks,
            base_suspicious_timeout: self.base_suspicious_timeout,
            base_gossip_interval: self.base_gossip_interval,
            gossip_nodes: self.gossip_nodes,
            max_piggyback_updates: self.max_piggyback_updates,
            base_push_pull_interval: self.base_push_pull_interval,
            stream_timeout: self.stream_timeout,
            retransmit_mult: self.retransmit_mult,
            dead_node_gossip_window: self.dead_node_gossip_window,
            dead_node_retention: self.dead_node_retention,
            member_log_interval: self.member_log_interval,
            leave_timeout: self.leave_timeout,
            network_type: self.network_type,
        })
    }

    /// Fills in any missing fields with default values
    fn fill(&mut self) {
        if self.name.is_none() {
            self.name = Some(gethostname().to_string_lossy().into_owned());
        }
    }
}
