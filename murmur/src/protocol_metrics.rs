use lazy_static::lazy_static;
use metrics::{describe_counter, describe_gauge, Counter, Gauge};

pub(crate) struct MurmurMetrics {
    // Failure detection
    pub probes: Counter,
    pub probe_failures: Counter,
    pub suspicions: Counter,
    pub confirmed_deaths: Counter,
    pub refutations: Counter,

    // Dissemination
    pub gossip_packets: Counter,
    pub push_pulls: Counter,
    pub push_pull_failures: Counter,
    pub malformed_messages: Counter,

    // Shared value
    pub value_deliveries: Counter,

    // Registry
    pub active_members: Gauge,
}

impl MurmurMetrics {
    fn new() -> Self {
        let metrics = Self {
            probes: metrics::counter!("murmur.probes"),
            probe_failures: metrics::counter!("murmur.probe_failures"),
            suspicions: metrics::counter!("murmur.suspicions"),
            confirmed_deaths: metrics::counter!("murmur.confirmed_deaths"),
            refutations: metrics::counter!("murmur.refutations"),
            gossip_packets: metrics::counter!("murmur.gossip_packets"),
            push_pulls: metrics::counter!("murmur.push_pulls"),
            push_pull_failures: metrics::counter!("murmur.push_pull_failures"),
            malformed_messages: metrics::counter!("murmur.malformed_messages"),
            value_deliveries: metrics::counter!("murmur.value_deliveries"),
            active_members: metrics::gauge!("murmur.active_members"),
        };

        describe_counter!("murmur.probes", "Probes started by the failure detector");
        describe_counter!("murmur.probe_failures", "Probes without direct or indirect ack");
        describe_counter!("murmur.suspicions", "Members marked suspect locally");
        describe_counter!("murmur.confirmed_deaths", "Suspects declared dead after the suspicion timeout");
        describe_counter!("murmur.refutations", "Times the local node refuted a suspicion about itself");
        describe_counter!("murmur.gossip_packets", "Gossip packets sent by the gossip tick");
        describe_counter!("murmur.push_pulls", "Completed push-pull exchanges");
        describe_counter!("murmur.push_pull_failures", "Failed push-pull exchanges");
        describe_counter!("murmur.malformed_messages", "Inbound packets or payloads that failed to decode");
        describe_counter!("murmur.value_deliveries", "Shared value messages delivered");
        describe_gauge!("murmur.active_members", "Alive and suspect members, local node included");

        metrics
    }
}

lazy_static! {
    pub(crate) static ref METRICS: MurmurMetrics = MurmurMetrics::new();
}
