//! In-memory bus with real partition/offset semantics.
//!
//! Topics are split into a fixed number of partitions; keys hash to a
//! partition, so equal keys stay FIFO. Consumer groups track committed
//! offsets per partition; anything delivered but not committed is delivered
//! again on the next poll. This backend drives the local runtime and every
//! test that needs at-least-once behavior without a broker.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use cdp_core::error::CdpResult;

use crate::{BusBackend, BusConsumer, BusMessage};

const DEFAULT_PARTITIONS: usize = 4;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<String>,
    payload: Option<Vec<u8>>,
}

type PartitionLog = Vec<StoredRecord>;

pub struct InMemoryBus {
    partition_count: usize,
    topics: DashMap<String, Arc<RwLock<Vec<PartitionLog>>>>,
    /// Committed offsets: `(topic, group)` -> per-partition high-water.
    committed: DashMap<(String, String), Vec<u64>>,
}

impl InMemoryBus {
    pub fn new() -> Arc<Self> {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    pub fn with_partitions(partition_count: usize) -> Arc<Self> {
        Arc::new(Self {
            partition_count: partition_count.max(1),
            topics: DashMap::new(),
            committed: DashMap::new(),
        })
    }

    /// Create a consumer for `topic` in `group`.
    pub fn consumer(
        self: &Arc<Self>,
        topic: impl Into<String>,
        group: impl Into<String>,
    ) -> InMemoryConsumer {
        InMemoryConsumer {
            bus: Arc::clone(self),
            topic: topic.into(),
            group: group.into(),
            delivered: Mutex::new(None),
        }
    }

    /// Total records ever published to `topic` (tombstones included).
    pub fn topic_len(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|t| t.read().iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// All payloads on `topic` in partition order, for assertions.
    pub fn drain_payloads(&self, topic: &str) -> Vec<Option<Vec<u8>>> {
        self.topics
            .get(topic)
            .map(|t| {
                t.read()
                    .iter()
                    .flat_map(|p| p.iter().map(|r| r.payload.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Records on `topic` whose key matches, for tombstone assertions.
    pub fn records_for_key(&self, topic: &str, key: &str) -> Vec<Option<Vec<u8>>> {
        self.topics
            .get(topic)
            .map(|t| {
                t.read()
                    .iter()
                    .flat_map(|p| {
                        p.iter()
                            .filter(|r| r.key.as_deref() == Some(key))
                            .map(|r| r.payload.clone())
                            .collect::<Vec<_>>()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn partition_for(&self, key: Option<&str>) -> usize {
        match key {
            None => 0,
            Some(k) => {
                let mut hasher = DefaultHasher::new();
                k.hash(&mut hasher);
                (hasher.finish() as usize) % self.partition_count
            }
        }
    }

    fn topic_log(&self, topic: &str) -> Arc<RwLock<Vec<PartitionLog>>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| {
                Arc::new(RwLock::new(vec![PartitionLog::new(); self.partition_count]))
            })
            .clone()
    }
}

#[async_trait]
impl BusBackend for InMemoryBus {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Option<&[u8]>,
    ) -> CdpResult<()> {
        let partition = self.partition_for(key);
        let log = self.topic_log(topic);
        log.write()[partition].push(StoredRecord {
            key: key.map(str::to_string),
            payload: payload.map(<[u8]>::to_vec),
        });
        Ok(())
    }

    async fn flush(&self, _timeout: Duration) -> CdpResult<()> {
        Ok(())
    }
}

/// Consumer over one topic/group with manual commit.
pub struct InMemoryConsumer {
    bus: Arc<InMemoryBus>,
    topic: String,
    group: String,
    /// Per-partition offsets delivered by the last poll, pending commit.
    delivered: Mutex<Option<Vec<u64>>>,
}

#[async_trait]
impl BusConsumer for InMemoryConsumer {
    async fn poll_batch(&self, max: usize) -> CdpResult<Vec<BusMessage>> {
        let log = self.bus.topic_log(&self.topic);
        let log = log.read();
        let key = (self.topic.clone(), self.group.clone());
        let offsets = self
            .bus
            .committed
            .get(&key)
            .map(|o| o.clone())
            .unwrap_or_else(|| vec![0; self.bus.partition_count]);

        // One partition-batch at a time: first partition with pending
        // records wins this poll.
        for (partition, records) in log.iter().enumerate() {
            let start = offsets[partition] as usize;
            if start >= records.len() {
                continue;
            }
            let end = (start + max.max(1)).min(records.len());
            let batch: Vec<BusMessage> = records[start..end]
                .iter()
                .enumerate()
                .map(|(i, r)| BusMessage {
                    topic: self.topic.clone(),
                    partition: partition as u32,
                    offset: (start + i) as u64,
                    key: r.key.clone(),
                    payload: r.payload.clone(),
                })
                .collect();
            let mut next = offsets.clone();
            next[partition] = end as u64;
            *self.delivered.lock() = Some(next);
            return Ok(batch);
        }
        Ok(Vec::new())
    }

    async fn commit(&self) -> CdpResult<()> {
        if let Some(next) = self.delivered.lock().take() {
            self.bus
                .committed
                .insert((self.topic.clone(), self.group.clone()), next);
        }
        Ok(())
    }
}
