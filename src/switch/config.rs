/// All retry, expiry and rate-limit policy of the switching and multicast
/// core. Every value is in milliseconds on the monotonic clock that callers
/// pass into each operation - the core never samples a clock itself.
#[derive(Debug)]
pub struct SwitchConfig {
    /// incomplete fragmented packets older than this are dropped silently
    pub fragment_timeout: u64,

    pub whois_retry_interval: u64,
    /// each retry consults a peer not asked before in this resolution cycle
    pub max_whois_retries: usize,

    /// egress packets waiting on identity resolution expire after this
    pub tx_queue_timeout: u64,
    /// inbound packets waiting on identity resolution expire after this
    pub rx_queue_timeout: u64,

    /// minimum spacing of rendezvous signaling per (unordered) peer pair
    pub min_unite_interval: u64,
    /// delay between NAT-traversal strategy steps for one contact
    pub nat_escalation_delay: u64,
    /// number of sequential-port probes after the direct attempt
    pub nat_port_escalation_steps: u32,

    /// multicast members not re-announced within this window are dropped
    pub member_liveness_window: u64,
    /// minimum spacing of explicit upstream gathers per group
    pub explicit_gather_interval: u64,
    /// pending outbound multicasts expire after this
    pub multicast_transmit_timeout: u64,
    /// hard ceiling on tracked groups; new groups are refused beyond it
    pub max_multicast_groups: usize,
    /// full sweep cadence for the group table
    pub multicast_clean_interval: u64,

    pub relay_max_hops: u8,
    /// wire payload budget: gather responses stop appending at this size and
    /// larger egress packets are fragmented
    pub payload_mtu: usize,
    /// upper bound on the delay reported by timer tasks
    pub max_timer_interval: u64,
}

impl SwitchConfig {
    pub fn new() -> SwitchConfig {
        SwitchConfig {
            fragment_timeout: 1_000,
            whois_retry_interval: 500,
            max_whois_retries: 4,
            tx_queue_timeout: 5_000,
            rx_queue_timeout: 5_000,
            min_unite_interval: 30_000,
            nat_escalation_delay: 1_000,
            nat_port_escalation_steps: 4,
            member_liveness_window: 600_000,
            explicit_gather_interval: 60_000,
            multicast_transmit_timeout: 5_000,
            max_multicast_groups: 1_600,
            multicast_clean_interval: 120_000,
            relay_max_hops: 3,
            payload_mtu: 1_444,
            max_timer_interval: 1_000,
        }
    }
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self::new()
    }
}
