use common_kafka::config::{ConsumerConfig, KafkaConfig};
use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "::")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3305")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    #[envconfig(default = "aggregate_events")]
    pub events_topic: String,

    // Compacted; one record per entity, tombstones delete
    #[envconfig(default = "aggregate_state")]
    pub state_topic: String,

    // Unique per application cluster. Two deployments sharing a prefix and
    // state topic will fence each other's publishers.
    #[envconfig(default = "shard-coordinator")]
    pub transactional_id_prefix: String,

    #[envconfig(default = "50")]
    pub publisher_flush_interval_ms: u64,

    #[envconfig(default = "500")]
    pub committer_max_batch: usize,

    #[envconfig(default = "10000")]
    pub committer_max_interval_ms: u64,

    #[envconfig(default = "4")]
    pub committer_parallelism: usize,

    // Passive-follower mode: track assignments but allocate no local
    // regions until a command actually has to route
    #[envconfig(default = "false")]
    pub dr_standby_enabled: bool,

    #[envconfig(default = "300000")]
    pub entire_replay_timeout_ms: u64,

    // Forwarded commands that take longer than this get an error log entry;
    // the caller's own deadline still governs what it observes
    #[envconfig(default = "10000")]
    pub router_ask_timeout_ms: u64,

    // The address peers and the partition assignor should use for this node
    #[envconfig(from = "ADVERTISED_HOST", default = "localhost")]
    pub advertised_host: String,

    #[envconfig(from = "ADVERTISED_PORT", default = "3305")]
    pub advertised_port: u16,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        // The consumed stream folds the state topic into the cursor index
        // that publishers poll for recovery and retirement
        ConsumerConfig::set_defaults("shard-coordinator", "aggregate_state");
        Self::init_from_env()
    }
}
