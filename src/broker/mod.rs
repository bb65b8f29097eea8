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

pub mod memory;

use crate::message::{Message, OutputRecord, TopicPartition};
use async_trait::async_trait;
use std::fmt::Display;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BrokerError {
    #[error("Topic not found: {0}")]
    TopicNotFound(String),
    #[error("Partition not found: {0}")]
    PartitionNotFound(TopicPartition),
    #[error("Partition is not assigned: {0}")]
    NotAssigned(TopicPartition),
    #[error("Failed to seek, assignment is not yet active for: {0}")]
    AssignmentNotSettled(TopicPartition),
    #[error("Seek requires an offset: {0}")]
    MissingOffset(TopicPartition),
    #[error("No transaction is in progress")]
    NoActiveTransaction,
    #[error("A transaction is already in progress")]
    TransactionInProgress,
    #[error("Transaction commit failed: {0}")]
    CommitFailed(String),
    #[error("Transaction abort failed: {0}")]
    AbortFailed(String),
    #[error("Produce failed: {0}")]
    ProduceFailed(String),
    #[error("Client is closed")]
    Closed,
}

/// Result of a single consume call.
#[derive(Debug, Clone, PartialEq)]
pub enum Polled {
    Message(Message),
    /// Partition assignment changed; the consumer expects the owner to react by
    /// incrementally assigning or unassigning the partitions.
    Rebalance(RebalanceEvent),
    /// No message arrived within the timeout.
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RebalanceEvent {
    Assigned(Vec<TopicPartition>),
    Revoked(Vec<TopicPartition>),
    Lost(Vec<TopicPartition>),
}

impl Display for RebalanceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (kind, partitions) = match self {
            RebalanceEvent::Assigned(partitions) => ("assigned", partitions),
            RebalanceEvent::Revoked(partitions) => ("revoked", partitions),
            RebalanceEvent::Lost(partitions) => ("lost", partitions),
        };
        write!(f, "{kind}: {}", format_partitions(partitions))
    }
}

/// Low and high offsets currently available for a partition.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub low: u64,
    pub high: u64,
}

impl Watermarks {
    pub fn new(low: u64, high: u64) -> Self {
        Self { low, high }
    }

    pub fn is_empty(&self) -> bool {
        self.low == self.high
    }
}

impl Display for Watermarks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.low, self.high)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerGroupMetadata {
    pub group_id: String,
}

/// The transactional half of the broker client used to publish outputs atomically
/// with the consumed offsets.
#[async_trait]
pub trait TransactionalProducer: Send + Sync {
    async fn begin_transaction(&self) -> Result<(), BrokerError>;

    async fn produce(&self, record: OutputRecord) -> Result<(), BrokerError>;

    async fn send_offsets_to_transaction(
        &self,
        offsets: &[TopicPartition],
        group: &ConsumerGroupMetadata,
    ) -> Result<(), BrokerError>;

    async fn commit_transaction(&self) -> Result<(), BrokerError>;

    async fn abort_transaction(&self, timeout: Duration) -> Result<(), BrokerError>;

    /// Serves delivery callbacks, returns how many were served.
    async fn poll(&self, timeout: Duration) -> usize;
}

/// The consumer half of the broker client. Partition assignment is incremental:
/// the owner reacts to `Polled::Rebalance` by calling `incremental_assign` or
/// `incremental_unassign` itself.
#[async_trait]
pub trait TransactionalConsumer: Send + Sync {
    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError>;

    async fn consume(&self, timeout: Duration) -> Result<Polled, BrokerError>;

    async fn incremental_assign(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError>;

    async fn incremental_unassign(&self, partitions: &[TopicPartition])
        -> Result<(), BrokerError>;

    async fn pause(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError>;

    async fn resume(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError>;

    /// Moves the position of an assigned partition to `partition.offset`.
    async fn seek(&self, partition: &TopicPartition) -> Result<(), BrokerError>;

    async fn get_watermark_offsets(
        &self,
        partition: &TopicPartition,
    ) -> Result<Watermarks, BrokerError>;

    async fn assignment(&self) -> Result<Vec<TopicPartition>, BrokerError>;

    fn consumer_group_metadata(&self) -> ConsumerGroupMetadata;

    async fn close(&self) -> Result<(), BrokerError>;
}

pub(crate) fn format_partitions(partitions: &[TopicPartition]) -> String {
    let partitions = partitions
        .iter()
        .map(|partition| partition.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{partitions}]")
}
