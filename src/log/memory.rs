use super::partitioner::partition_for_key;
use super::{
    EventLog, LedgerCheck, LogEntry, LogError, LogPosition, OutboundRecord, PartitionClaim,
    ProducerLedger,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;

/// In-process log for tests and single-binary demos. Nothing survives a restart.
pub struct MemoryLog {
    topics: HashMap<String, Arc<MemoryTopic>>,
    ledger: Mutex<ProducerLedger>,
}

struct MemoryTopic {
    name: String,
    partitions: Vec<MemoryPartition>,
    /// (group, partition) -> next offset to read
    committed: Mutex<HashMap<(String, u32), u64>>,
}

struct MemoryPartition {
    entries: RwLock<Vec<LogEntry>>,
    high_water: watch::Sender<u64>,
}

impl MemoryLog {
    pub fn new(topic: &str, partitions: u32) -> Self {
        Self::with_topics(&[(topic, partitions)])
    }

    pub fn with_topics(topics: &[(&str, u32)]) -> Self {
        let topics = topics
            .iter()
            .map(|(name, count)| {
                let partitions = (0..*count)
                    .map(|_| MemoryPartition {
                        entries: RwLock::new(Vec::new()),
                        high_water: watch::channel(0).0,
                    })
                    .collect();
                let topic = MemoryTopic {
                    name: name.to_string(),
                    partitions,
                    committed: Mutex::new(HashMap::new()),
                };
                (name.to_string(), Arc::new(topic))
            })
            .collect();

        Self {
            topics,
            ledger: Mutex::new(ProducerLedger::default()),
        }
    }

    /// Snapshot of one partition's records, oldest first.
    pub fn entries(&self, topic: &str, partition: u32) -> Result<Vec<LogEntry>, LogError> {
        let topic = self.topic(topic)?;
        let partition = topic.partition(partition)?;
        let entries = partition
            .entries
            .read()
            .map_err(|_| LogError::Storage("partition lock poisoned".to_string()))?;
        Ok(entries.clone())
    }

    /// Total number of records across every partition of `topic`.
    pub fn len(&self, topic: &str) -> Result<usize, LogError> {
        let topic = self.topic(topic)?;
        Ok(topic
            .partitions
            .iter()
            .map(|p| *p.high_water.borrow() as usize)
            .sum())
    }

    pub fn committed_offset(&self, topic: &str, group: &str, partition: u32) -> Option<u64> {
        let topic = self.topic(topic).ok()?;
        topic.committed_offset(group, partition).ok().flatten()
    }

    fn topic(&self, topic: &str) -> Result<&Arc<MemoryTopic>, LogError> {
        self.topics
            .get(topic)
            .ok_or_else(|| LogError::UnknownTopic(topic.to_string()))
    }
}

impl MemoryTopic {
    fn partition(&self, partition: u32) -> Result<&MemoryPartition, LogError> {
        self.partitions
            .get(partition as usize)
            .ok_or_else(|| LogError::UnknownPartition {
                topic: self.name.clone(),
                partition,
            })
    }

    fn committed_offset(&self, group: &str, partition: u32) -> Result<Option<u64>, LogError> {
        let committed = self
            .committed
            .lock()
            .map_err(|_| LogError::Storage("offset lock poisoned".to_string()))?;
        Ok(committed.get(&(group.to_string(), partition)).copied())
    }
}

#[async_trait]
impl EventLog for MemoryLog {
    async fn publish(&self, topic: &str, record: OutboundRecord) -> Result<LogPosition, LogError> {
        let topic = self.topic(topic)?;
        let partition_id = partition_for_key(&record.key, topic.partitions.len() as u32);
        let partition = topic.partition(partition_id)?;

        let mut ledger = self
            .ledger
            .lock()
            .map_err(|_| LogError::Storage("producer ledger lock poisoned".to_string()))?;
        if let LedgerCheck::Duplicate(position) = ledger.check(record.producer.as_ref())? {
            return Ok(position);
        }

        let offset = {
            let mut entries = partition
                .entries
                .write()
                .map_err(|_| LogError::Storage("partition lock poisoned".to_string()))?;
            let offset = entries.len() as u64;
            entries.push(LogEntry {
                partition: partition_id,
                offset,
                key: record.key,
                value: record.value,
                headers: record.headers,
            });
            offset
        };
        partition.high_water.send_replace(offset + 1);

        let position = LogPosition {
            partition: partition_id,
            offset,
        };
        ledger.record(record.producer.as_ref(), position);
        Ok(position)
    }

    async fn partition_count(&self, topic: &str) -> Result<u32, LogError> {
        Ok(self.topic(topic)?.partitions.len() as u32)
    }

    async fn claim(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
    ) -> Result<Box<dyn PartitionClaim>, LogError> {
        let topic = Arc::clone(self.topic(topic)?);
        let high_water = topic.partition(partition)?.high_water.subscribe();
        let committed = topic.committed_offset(group, partition)?;

        Ok(Box::new(MemoryClaim {
            topic,
            group: group.to_string(),
            partition,
            cursor: committed.unwrap_or(0),
            committed,
            high_water,
        }))
    }
}

struct MemoryClaim {
    topic: Arc<MemoryTopic>,
    group: String,
    partition: u32,
    cursor: u64,
    committed: Option<u64>,
    high_water: watch::Receiver<u64>,
}

#[async_trait]
impl PartitionClaim for MemoryClaim {
    fn partition(&self) -> u32 {
        self.partition
    }

    async fn next(&mut self) -> Result<LogEntry, LogError> {
        loop {
            let high_water = *self.high_water.borrow_and_update();
            if self.cursor < high_water {
                let partition = self.topic.partition(self.partition)?;
                let entries = partition
                    .entries
                    .read()
                    .map_err(|_| LogError::Storage("partition lock poisoned".to_string()))?;
                let entry = entries
                    .get(self.cursor as usize)
                    .cloned()
                    .ok_or(LogError::Closed)?;
                self.cursor += 1;
                return Ok(entry);
            }
            self.high_water
                .changed()
                .await
                .map_err(|_| LogError::Closed)?;
        }
    }

    async fn commit(&mut self, next_offset: u64) -> Result<(), LogError> {
        let mut committed = self
            .topic
            .committed
            .lock()
            .map_err(|_| LogError::Storage("offset lock poisoned".to_string()))?;
        committed.insert((self.group.clone(), self.partition), next_offset);
        self.committed = Some(next_offset);
        Ok(())
    }

    fn committed(&self) -> Option<u64> {
        self.committed
    }
}
