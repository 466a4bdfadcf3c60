/// A record to be appended to the log. `partition` forces the record onto an
/// exact partition; when `None` the broker-side partitioner places it by key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub topic: String,
    pub partition: Option<u32>,
    pub key: Option<String>,
    pub payload: Option<Vec<u8>>,
}

/// Broker acknowledgement for one appended record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub key: Option<String>,
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}
