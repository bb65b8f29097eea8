/* Licensed to the Apache Software Foundation (ASF) under one
 * or more contributor license agreements.  See the NOTICE file
 * distributed with this work for additional information
 * regarding copyright ownership.  The ASF licenses this file
 * to you under the Apache License, Version 2.0 (the
 * "License"); you may not use this file except in compliance
 * with the License.  You may obtain a copy of the License at
 *
 *   http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing,
 * software distributed under the License is distributed on an
 * "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
 * KIND, either express or implied.  See the License for the
 * specific language governing permissions and limitations
 * under the License.
 */

//! In-process transactional broker.
//!
//! Records produced inside a transaction become visible only when the transaction
//! commits, and every committed transaction appends one control marker to each
//! partition it wrote to, so a single record advances the high watermark by two.
//! Aborted transactions leave no trace in the logs but are kept in the transaction
//! history for inspection.

use crate::broker::{
    BrokerError, ConsumerGroupMetadata, Polled, RebalanceEvent, TransactionalConsumer,
    TransactionalProducer, Watermarks,
};
use crate::message::{Message, OutputRecord, TopicPartition};
use ahash::AHashMap;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Committed,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub outcome: TransactionOutcome,
    pub records: Vec<OutputRecord>,
    pub offsets: Vec<TopicPartition>,
}

#[derive(Debug, Clone)]
enum LogEntry {
    Record {
        key: Option<Bytes>,
        value: Option<Bytes>,
        headers: Vec<(String, Bytes)>,
    },
    Marker,
}

#[derive(Debug, Default)]
struct PartitionLog {
    entries: Vec<LogEntry>,
    low_watermark: u64,
}

impl PartitionLog {
    fn high_watermark(&self) -> u64 {
        self.entries.len() as u64
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: AHashMap<String, Vec<PartitionLog>>,
    committed_offsets: AHashMap<(String, String, u32), u64>,
    transactions: Vec<TransactionRecord>,
    failing_commits: u32,
}

impl BrokerState {
    fn partition_log(&self, topic: &str, partition: u32) -> Option<&PartitionLog> {
        self.topics
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
    }

    fn partition_log_mut(&mut self, topic: &str, partition: u32) -> &mut PartitionLog {
        let partitions = self.topics.entry(topic.to_owned()).or_default();
        while partitions.len() <= partition as usize {
            partitions.push(PartitionLog::default());
        }
        &mut partitions[partition as usize]
    }

    fn resolve_partition(&self, record: &OutputRecord) -> u32 {
        if let Some(partition) = record.partition {
            return partition;
        }

        let partitions_count = self
            .topics
            .get(&record.topic)
            .map(|partitions| partitions.len() as u32)
            .unwrap_or(1)
            .max(1);
        match &record.key {
            Some(key) => crc32fast::hash(key) % partitions_count,
            None => 0,
        }
    }

    fn append(&mut self, partition: u32, record: OutputRecord) -> u64 {
        let log = self.partition_log_mut(&record.topic, partition);
        let offset = log.high_watermark();
        log.entries.push(LogEntry::Record {
            key: record.key,
            value: record.value,
            headers: record.headers,
        });
        offset
    }

    fn commit(&mut self, records: &[OutputRecord], offsets: &[(String, TopicPartition)]) {
        let mut touched: Vec<(String, u32)> = Vec::new();
        for record in records {
            let partition = self.resolve_partition(record);
            self.append(partition, record.clone());
            if !touched
                .iter()
                .any(|(topic, p)| topic == &record.topic && *p == partition)
            {
                touched.push((record.topic.clone(), partition));
            }
        }

        for (topic, partition) in touched {
            self.partition_log_mut(&topic, partition)
                .entries
                .push(LogEntry::Marker);
        }

        for (group, offset) in offsets {
            if let Some(position) = offset.offset {
                self.committed_offsets.insert(
                    (group.clone(), offset.topic.clone(), offset.partition),
                    position,
                );
            }
        }
    }
}

/// Shared handle to the in-process broker. Cloning yields another handle to the same logs.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_topic(&self, topic: &str, partitions_count: u32) {
        let mut state = self.state.lock().await;
        if partitions_count > 0 {
            state.partition_log_mut(topic, partitions_count - 1);
        }
    }

    /// Appends a record outside of any transaction, returns its offset.
    pub async fn append(
        &self,
        topic: &str,
        partition: u32,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
    ) -> u64 {
        let record = OutputRecord {
            topic: topic.to_owned(),
            partition: Some(partition),
            key: key.map(Bytes::copy_from_slice),
            value: value.map(Bytes::copy_from_slice),
            headers: vec![],
        };
        self.state.lock().await.append(partition, record)
    }

    /// Appends the records as one committed transaction, including the control markers.
    pub async fn append_committed(&self, records: Vec<OutputRecord>) {
        let mut state = self.state.lock().await;
        state.commit(&records, &[]);
        state.transactions.push(TransactionRecord {
            outcome: TransactionOutcome::Committed,
            records,
            offsets: vec![],
        });
    }

    /// Drops everything below `low_watermark`, as retention or compaction would.
    pub async fn truncate(&self, topic: &str, partition: u32, low_watermark: u64) {
        let mut state = self.state.lock().await;
        let log = state.partition_log_mut(topic, partition);
        log.low_watermark = low_watermark.min(log.high_watermark());
    }

    pub async fn watermarks(&self, topic: &str, partition: u32) -> Watermarks {
        let state = self.state.lock().await;
        state
            .partition_log(topic, partition)
            .map(|log| Watermarks::new(log.low_watermark, log.high_watermark()))
            .unwrap_or_default()
    }

    /// Returns the visible records of a partition, control markers excluded.
    pub async fn records(&self, topic: &str, partition: u32) -> Vec<Message> {
        let state = self.state.lock().await;
        let Some(log) = state.partition_log(topic, partition) else {
            return vec![];
        };

        log.entries
            .iter()
            .enumerate()
            .skip(log.low_watermark as usize)
            .filter_map(|(offset, entry)| match entry {
                LogEntry::Record {
                    key,
                    value,
                    headers,
                } => Some(Message {
                    topic: topic.to_owned(),
                    partition,
                    offset: offset as u64,
                    key: key.clone(),
                    value: value.clone(),
                    headers: headers.clone(),
                }),
                LogEntry::Marker => None,
            })
            .collect()
    }

    pub async fn committed_offset(&self, group_id: &str, topic: &str, partition: u32) -> Option<u64> {
        let state = self.state.lock().await;
        state
            .committed_offsets
            .get(&(group_id.to_owned(), topic.to_owned(), partition))
            .copied()
    }

    pub async fn transactions(&self) -> Vec<TransactionRecord> {
        self.state.lock().await.transactions.clone()
    }

    /// Makes the next `count` transaction commits fail, the transaction stays open.
    pub async fn fail_next_commits(&self, count: u32) {
        self.state.lock().await.failing_commits = count;
    }

    pub fn producer(&self) -> MemoryProducer {
        MemoryProducer {
            broker: self.clone(),
            transaction: Mutex::new(None),
        }
    }

    pub fn consumer(&self, group_id: &str) -> MemoryConsumer {
        MemoryConsumer {
            broker: self.clone(),
            group_id: group_id.to_owned(),
            state: Arc::new(Mutex::new(ConsumerState::default())),
        }
    }
}

#[derive(Debug, Default)]
struct OpenTransaction {
    records: Vec<OutputRecord>,
    offsets: Vec<(String, TopicPartition)>,
}

#[derive(Debug)]
pub struct MemoryProducer {
    broker: MemoryBroker,
    transaction: Mutex<Option<OpenTransaction>>,
}

impl MemoryProducer {
    pub async fn in_transaction(&self) -> bool {
        self.transaction.lock().await.is_some()
    }
}

#[async_trait]
impl TransactionalProducer for MemoryProducer {
    async fn begin_transaction(&self) -> Result<(), BrokerError> {
        let mut transaction = self.transaction.lock().await;
        if transaction.is_some() {
            return Err(BrokerError::TransactionInProgress);
        }

        transaction.replace(OpenTransaction::default());
        trace!("Transaction started.");
        Ok(())
    }

    async fn produce(&self, record: OutputRecord) -> Result<(), BrokerError> {
        let mut transaction = self.transaction.lock().await;
        let Some(transaction) = transaction.as_mut() else {
            return Err(BrokerError::NoActiveTransaction);
        };

        transaction.records.push(record);
        Ok(())
    }

    async fn send_offsets_to_transaction(
        &self,
        offsets: &[TopicPartition],
        group: &ConsumerGroupMetadata,
    ) -> Result<(), BrokerError> {
        let mut transaction = self.transaction.lock().await;
        let Some(transaction) = transaction.as_mut() else {
            return Err(BrokerError::NoActiveTransaction);
        };

        transaction.offsets.extend(
            offsets
                .iter()
                .map(|offset| (group.group_id.clone(), offset.clone())),
        );
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<(), BrokerError> {
        let mut transaction = self.transaction.lock().await;
        let Some(open) = transaction.take() else {
            return Err(BrokerError::NoActiveTransaction);
        };

        let mut state = self.broker.state.lock().await;
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            transaction.replace(open);
            warn!("Transaction commit rejected by broker.");
            return Err(BrokerError::CommitFailed(
                "transaction coordinator unavailable".to_owned(),
            ));
        }

        state.commit(&open.records, &open.offsets);
        debug!(
            "Committed transaction with {} records and {} offsets.",
            open.records.len(),
            open.offsets.len()
        );
        state.transactions.push(TransactionRecord {
            outcome: TransactionOutcome::Committed,
            records: open.records,
            offsets: open.offsets.into_iter().map(|(_, offset)| offset).collect(),
        });
        Ok(())
    }

    async fn abort_transaction(&self, _timeout: Duration) -> Result<(), BrokerError> {
        let mut transaction = self.transaction.lock().await;
        let Some(open) = transaction.take() else {
            return Err(BrokerError::NoActiveTransaction);
        };

        debug!("Aborted transaction with {} records.", open.records.len());
        self.broker
            .state
            .lock()
            .await
            .transactions
            .push(TransactionRecord {
                outcome: TransactionOutcome::Aborted,
                records: open.records,
                offsets: open.offsets.into_iter().map(|(_, offset)| offset).collect(),
            });
        Ok(())
    }

    async fn poll(&self, _timeout: Duration) -> usize {
        0
    }
}

#[derive(Debug)]
struct AssignedPartition {
    partition: TopicPartition,
    position: Option<u64>,
    paused: bool,
    settled: bool,
}

#[derive(Debug, Default)]
struct ConsumerState {
    subscription: Vec<String>,
    assignment: Vec<AssignedPartition>,
    pending_events: VecDeque<RebalanceEvent>,
    cursor: usize,
    closed: bool,
}

impl ConsumerState {
    fn find_mut(&mut self, partition: &TopicPartition) -> Option<&mut AssignedPartition> {
        self.assignment
            .iter_mut()
            .find(|assigned| assigned.partition.same_partition(partition))
    }
}

/// Consumer handle. Clones share the same assignment, which lets a test drive
/// rebalances while the application owns the consumer.
///
/// Newly assigned partitions become active on the next `consume` call; seeking them
/// before that fails with `BrokerError::AssignmentNotSettled`. `consume` never waits,
/// it returns `Polled::Empty` right away when nothing is available.
#[derive(Debug, Clone)]
pub struct MemoryConsumer {
    broker: MemoryBroker,
    group_id: String,
    state: Arc<Mutex<ConsumerState>>,
}

impl MemoryConsumer {
    /// Queues a rebalance: the revocation (if any) followed by the assignment.
    pub async fn rebalance(&self, revoked: Vec<TopicPartition>, assigned: Vec<TopicPartition>) {
        let mut state = self.state.lock().await;
        if !revoked.is_empty() {
            state
                .pending_events
                .push_back(RebalanceEvent::Revoked(revoked));
        }
        state
            .pending_events
            .push_back(RebalanceEvent::Assigned(assigned));
    }

    /// Queues a lost-partitions event followed by an empty assignment.
    pub async fn lose(&self, lost: Vec<TopicPartition>) {
        let mut state = self.state.lock().await;
        state.pending_events.push_back(RebalanceEvent::Lost(lost));
        state
            .pending_events
            .push_back(RebalanceEvent::Assigned(vec![]));
    }

    pub async fn subscription(&self) -> Vec<String> {
        self.state.lock().await.subscription.clone()
    }

    pub async fn is_paused(&self, partition: &TopicPartition) -> bool {
        self.state
            .lock()
            .await
            .find_mut(partition)
            .map(|assigned| assigned.paused)
            .unwrap_or(false)
    }

    pub async fn position(&self, partition: &TopicPartition) -> Option<u64> {
        self.state
            .lock()
            .await
            .find_mut(partition)
            .and_then(|assigned| assigned.position)
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

#[async_trait]
impl TransactionalConsumer for MemoryConsumer {
    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.subscription = topics.to_vec();
        debug!("Consumer group: {} subscribed to: {topics:?}", self.group_id);
        Ok(())
    }

    async fn consume(&self, _timeout: Duration) -> Result<Polled, BrokerError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.closed {
            return Err(BrokerError::Closed);
        }

        if let Some(event) = state.pending_events.pop_front() {
            return Ok(Polled::Rebalance(event));
        }

        for assigned in state.assignment.iter_mut() {
            assigned.settled = true;
        }

        let broker = self.broker.state.lock().await;
        let count = state.assignment.len();
        for step in 0..count {
            let index = (state.cursor + step) % count;
            let assigned = &mut state.assignment[index];
            if assigned.paused {
                continue;
            }

            let topic = assigned.partition.topic.clone();
            let partition = assigned.partition.partition;
            let Some(log) = broker.partition_log(&topic, partition) else {
                continue;
            };

            let committed = broker
                .committed_offsets
                .get(&(self.group_id.clone(), topic.clone(), partition))
                .copied();
            let mut position = assigned
                .position
                .or(committed)
                .unwrap_or(log.low_watermark)
                .max(log.low_watermark);

            while position < log.high_watermark() {
                let entry = &log.entries[position as usize];
                position += 1;
                if let LogEntry::Record {
                    key,
                    value,
                    headers,
                } = entry
                {
                    assigned.position = Some(position);
                    let message = Message {
                        topic,
                        partition,
                        offset: position - 1,
                        key: key.clone(),
                        value: value.clone(),
                        headers: headers.clone(),
                    };
                    state.cursor = (index + 1) % count;
                    return Ok(Polled::Message(message));
                }
            }
            assigned.position = Some(position);
        }

        Ok(Polled::Empty)
    }

    async fn incremental_assign(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        for partition in partitions {
            if let Some(assigned) = state.find_mut(partition) {
                if partition.offset.is_some() {
                    assigned.position = partition.offset;
                }
                continue;
            }

            state.assignment.push(AssignedPartition {
                partition: TopicPartition::new(&partition.topic, partition.partition),
                position: partition.offset,
                paused: false,
                settled: false,
            });
        }
        Ok(())
    }

    async fn incremental_unassign(
        &self,
        partitions: &[TopicPartition],
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.assignment.retain(|assigned| {
            !partitions
                .iter()
                .any(|partition| assigned.partition.same_partition(partition))
        });
        state.cursor = 0;
        Ok(())
    }

    async fn pause(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        for partition in partitions {
            let Some(assigned) = state.find_mut(partition) else {
                return Err(BrokerError::NotAssigned(partition.clone()));
            };
            assigned.paused = true;
        }
        Ok(())
    }

    async fn resume(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        for partition in partitions {
            let Some(assigned) = state.find_mut(partition) else {
                return Err(BrokerError::NotAssigned(partition.clone()));
            };
            assigned.paused = false;
        }
        Ok(())
    }

    async fn seek(&self, partition: &TopicPartition) -> Result<(), BrokerError> {
        let Some(offset) = partition.offset else {
            return Err(BrokerError::MissingOffset(partition.clone()));
        };

        let mut state = self.state.lock().await;
        let Some(assigned) = state.find_mut(partition) else {
            return Err(BrokerError::NotAssigned(partition.clone()));
        };

        if !assigned.settled {
            return Err(BrokerError::AssignmentNotSettled(partition.clone()));
        }

        assigned.position = Some(offset);
        Ok(())
    }

    async fn get_watermark_offsets(
        &self,
        partition: &TopicPartition,
    ) -> Result<Watermarks, BrokerError> {
        Ok(self
            .broker
            .watermarks(&partition.topic, partition.partition)
            .await)
    }

    async fn assignment(&self) -> Result<Vec<TopicPartition>, BrokerError> {
        let state = self.state.lock().await;
        Ok(state
            .assignment
            .iter()
            .map(|assigned| assigned.partition.clone())
            .collect())
    }

    fn consumer_group_metadata(&self) -> ConsumerGroupMetadata {
        ConsumerGroupMetadata {
            group_id: self.group_id.clone(),
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.assignment.clear();
        state.pending_events.clear();
        debug!("Consumer for group: {} closed.", self.group_id);
        Ok(())
    }
}
