use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

/// Progress marker the projection writes per partition: the offset of the
/// last event it has folded into the queryable view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMeta {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Option<String>,
}

/// Index key the projection uses for its per-partition cursors.
pub fn meta_key(topic: &str, partition: u32) -> String {
    format!("{topic}:{partition}")
}

/// Read side of the projection's metadata index. The publisher polls this to
/// learn how far the projection has processed, which is what retires
/// in-flight records and gates recovery.
#[async_trait]
pub trait StateStoreMeta: Send + Sync {
    /// False until the projection's store has finished opening; polls are
    /// pointless before that.
    fn is_open(&self) -> bool;

    async fn get_meta(&self, topic: &str, partition: u32) -> Option<StateMeta>;
}

/// In-process cursor index, advanced by the consumed-stream flow. Backs the
/// publishers when the projection's own store does not expose its cursors.
#[derive(Default)]
pub struct ProcessedOffsetIndex {
    inner: RwLock<HashMap<String, StateMeta>>,
}

impl ProcessedOffsetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that everything up to `offset` has been folded in. Cursors
    /// only move forward; a stale advance is ignored.
    pub fn advance(&self, topic: &str, partition: u32, offset: u64) {
        let Ok(mut inner) = self.inner.write() else {
            return;
        };
        let entry = inner
            .entry(meta_key(topic, partition))
            .or_insert_with(|| StateMeta {
                topic: topic.to_string(),
                partition,
                offset,
                key: None,
            });
        if entry.offset < offset {
            entry.offset = offset;
        }
    }
}

#[async_trait]
impl StateStoreMeta for ProcessedOffsetIndex {
    fn is_open(&self) -> bool {
        true
    }

    async fn get_meta(&self, topic: &str, partition: u32) -> Option<StateMeta> {
        self.inner
            .read()
            .ok()?
            .get(&meta_key(topic, partition))
            .cloned()
    }
}
