pub const COMMANDS_ROUTED: &str = "coordinator_commands_routed";
pub const COMMANDS_STASHED: &str = "coordinator_commands_stashed";
pub const DEAD_LETTERS: &str = "coordinator_dead_letters";
pub const UNROUTABLE_COMMANDS: &str = "coordinator_unroutable_commands";
pub const ASK_TIMEOUTS: &str = "coordinator_ask_timeouts";
pub const REGIONS_CREATED: &str = "coordinator_regions_created";
pub const REGIONS_DROPPED: &str = "coordinator_regions_dropped";
pub const ASSIGNMENT_UPDATES: &str = "coordinator_assignment_updates";
pub const STANDBY_ACTIVATIONS: &str = "coordinator_standby_activations";

pub const BATCHES_PUBLISHED: &str = "coordinator_batches_published";
pub const EVENTS_PUBLISHED: &str = "coordinator_events_published";
pub const EVENTS_FAILED_TO_PUBLISH: &str = "coordinator_events_failed_to_publish";
pub const PUBLISHER_FENCED: &str = "coordinator_publisher_fenced";
pub const FLUSH_TIME: &str = "coordinator_flush_time";
pub const FLUSH_BATCH_SIZE: &str = "coordinator_flush_batch_size";
pub const IN_FLIGHT_RECORDS: &str = "coordinator_in_flight_records";
pub const PENDING_WRITES: &str = "coordinator_pending_writes";
pub const PENDING_INITS: &str = "coordinator_pending_inits";
pub const RECORDS_RETIRED: &str = "coordinator_records_retired";
pub const STATE_CURRENT: &str = "coordinator_state_current";
pub const STATE_NOT_CURRENT: &str = "coordinator_state_not_current";

pub const EVENTS_CONSUMED: &str = "coordinator_events_consumed";
pub const OFFSETS_COMMITTED: &str = "coordinator_offsets_committed";
pub const CONSUMER_RESTARTS: &str = "coordinator_consumer_restarts";
pub const STREAM_STOPS: &str = "coordinator_stream_stops";
pub const REPLAYS_STARTED: &str = "coordinator_replays_started";
pub const REPLAYS_FAILED: &str = "coordinator_replays_failed";
