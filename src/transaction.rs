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

use crate::broker::{TransactionalConsumer, TransactionalProducer};
use crate::error::AppError;
use crate::message::{Message, OutputRecord, TopicPartition};
use crate::stats::AppStats;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Application logic invoked once per consumed message by `TransactionApp`.
#[async_trait]
pub trait TransactionHandler: Send {
    async fn handle(&mut self, transaction: &mut Transaction<'_>) -> Result<(), AppError>;
}

/// A single consumed message bound to the transactional producer/consumer pair.
///
/// The broker transaction is opened lazily by the first `produce` call. Committing
/// registers the consumed offset with the consumer group inside that transaction,
/// so outputs and the offset advance together. A transaction that never produced
/// anything has nothing to commit.
pub struct Transaction<'a> {
    message: Message,
    producer: &'a dyn TransactionalProducer,
    consumer: &'a dyn TransactionalConsumer,
    stats: &'a AppStats,
    committed: bool,
    active_transaction: bool,
}

impl<'a> Transaction<'a> {
    pub fn new(
        message: Message,
        producer: &'a dyn TransactionalProducer,
        consumer: &'a dyn TransactionalConsumer,
        stats: &'a AppStats,
    ) -> Self {
        Self {
            message,
            producer,
            consumer,
            stats,
            committed: false,
            active_transaction: false,
        }
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.message.key.as_ref()
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.message.value.as_ref()
    }

    pub fn headers(&self) -> HashMap<String, String> {
        self.message.headers_map()
    }

    pub fn topic(&self) -> &str {
        &self.message.topic
    }

    pub fn partition(&self) -> u32 {
        self.message.partition
    }

    pub fn offset(&self) -> u64 {
        self.message.offset
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn has_active_transaction(&self) -> bool {
        self.active_transaction
    }

    /// Sends the record within the broker transaction of this message, opening the
    /// transaction on first use. The source message headers are carried over.
    pub async fn produce(&mut self, mut record: OutputRecord) -> Result<(), AppError> {
        self.producer.poll(Duration::ZERO).await;
        if !self.active_transaction {
            self.producer.begin_transaction().await?;
            self.active_transaction = true;
        }

        record.inherit_headers(&self.message.headers);
        debug!(
            "Producing record to topic: {} for message at {}@{}",
            record.topic,
            self.message.topic_partition(),
            self.message.offset
        );
        self.producer.produce(record).await?;
        self.stats.increment_messages_produced();
        self.producer.poll(Duration::ZERO).await;
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<(), AppError> {
        self.commit_with(true).await
    }

    pub(crate) async fn commit_with(&mut self, mark_committed: bool) -> Result<(), AppError> {
        if !self.active_transaction {
            return Ok(());
        }

        let offset = TopicPartition::with_offset(
            &self.message.topic,
            self.message.partition,
            self.message.offset + 1,
        );
        self.producer
            .send_offsets_to_transaction(&[offset], &self.consumer.consumer_group_metadata())
            .await?;
        self.producer.commit_transaction().await?;
        self.active_transaction = false;
        self.stats.increment_transactions_committed();
        self.producer.poll(Duration::ZERO).await;
        self.committed = mark_committed;
        Ok(())
    }

    pub(crate) fn stats(&self) -> &'a AppStats {
        self.stats
    }

    pub(crate) fn mark_committed(&mut self) {
        self.committed = true;
    }

    /// Aborts the open broker transaction, if any. Failures are logged and swallowed
    /// since nothing more can be done about them.
    pub(crate) async fn abort(&mut self, timeout: Duration) {
        if !self.active_transaction {
            return;
        }

        self.active_transaction = false;
        match self.producer.abort_transaction(timeout).await {
            Ok(()) => {
                self.stats.increment_transactions_aborted();
                warn!(
                    "Aborted transaction for message at {}@{}",
                    self.message.topic_partition(),
                    self.message.offset
                );
            }
            Err(error) => {
                warn!(
                    "Failed to abort transaction for message at {}@{}. {error}",
                    self.message.topic_partition(),
                    self.message.offset
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{MemoryBroker, TransactionOutcome};

    fn message(offset: u64) -> Message {
        Message {
            topic: "orders".to_owned(),
            partition: 1,
            offset,
            key: Some(Bytes::from_static(b"A")),
            value: Some(Bytes::from_static(b"payload")),
            headers: vec![("guid".to_owned(), Bytes::from_static(b"g-1"))],
        }
    }

    #[tokio::test]
    async fn commit_without_produce_should_be_noop() {
        let broker = MemoryBroker::new();
        let producer = broker.producer();
        let consumer = broker.consumer("group");
        let stats = AppStats::default();
        let mut transaction = Transaction::new(message(3), &producer, &consumer, &stats);

        transaction.commit().await.unwrap();

        assert!(!transaction.is_committed());
        assert!(broker.transactions().await.is_empty());
        assert_eq!(broker.committed_offset("group", "orders", 1).await, None);
    }

    #[tokio::test]
    async fn commit_should_register_next_offset_and_outputs_atomically() {
        let broker = MemoryBroker::new();
        let producer = broker.producer();
        let consumer = broker.consumer("group");
        let stats = AppStats::default();
        let mut transaction = Transaction::new(message(3), &producer, &consumer, &stats);

        transaction
            .produce(OutputRecord::new("out").partition(0).value("first"))
            .await
            .unwrap();
        transaction
            .produce(OutputRecord::new("out").partition(0).value("second"))
            .await
            .unwrap();
        assert!(transaction.has_active_transaction());
        transaction.commit().await.unwrap();

        assert!(transaction.is_committed());
        assert!(!transaction.has_active_transaction());
        let transactions = broker.transactions().await;
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].outcome, TransactionOutcome::Committed);
        assert_eq!(transactions[0].records.len(), 2);
        assert_eq!(broker.committed_offset("group", "orders", 1).await, Some(4));
        assert_eq!(stats.snapshot().messages_produced, 2);
    }

    #[tokio::test]
    async fn produced_records_should_inherit_source_headers() {
        let broker = MemoryBroker::new();
        let producer = broker.producer();
        let consumer = broker.consumer("group");
        let stats = AppStats::default();
        let mut transaction = Transaction::new(message(0), &producer, &consumer, &stats);

        transaction
            .produce(OutputRecord::new("out").partition(0).value("v"))
            .await
            .unwrap();
        transaction.commit().await.unwrap();

        let records = broker.records("out", 0).await;
        assert_eq!(records[0].headers_map()["guid"], "g-1");
    }

    #[tokio::test]
    async fn abort_should_discard_outputs() {
        let broker = MemoryBroker::new();
        let producer = broker.producer();
        let consumer = broker.consumer("group");
        let stats = AppStats::default();
        let mut transaction = Transaction::new(message(0), &producer, &consumer, &stats);

        transaction
            .produce(OutputRecord::new("out").partition(0).value("v"))
            .await
            .unwrap();
        transaction.abort(Duration::from_secs(1)).await;

        assert!(!transaction.has_active_transaction());
        assert!(broker.records("out", 0).await.is_empty());
        assert_eq!(stats.snapshot().transactions_aborted, 1);
    }
}
