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

mod rebalance;
mod recovery;

use crate::app::{close_consumer, PollOutcome, ShutdownHandle};
use crate::broker::{Polled, TransactionalConsumer, TransactionalProducer, Watermarks};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::message::{Message, TopicPartition};
use crate::stats::{AppStats, StatsSnapshot};
use crate::store::{StoreFactory, TableStores};
use crate::table_transaction::{TableHandler, TableTransaction};
use crate::transaction::Transaction;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tracing::{error, info};

/// Lifecycle of an assigned primary partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum PartitionState {
    /// The table lags its changelog and waits for the recovery loop.
    RecoveryPending,
    Recovering,
    /// Recovered, consumption resumes once every pending recovery is done.
    ResumingConsumption,
    NormalConsumption,
}

/// A partition whose table must replay its changelog before consumption resumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryDescriptor {
    pub table_offset: u64,
    pub watermarks: Watermarks,
    /// The changelog partition, its offset is the replay starting point.
    pub partition: TopicPartition,
}

/// Runs a `TableHandler` against one consumed topic, keeping a local table per
/// assigned partition that is restored from the changelog topic after rebalances.
///
/// Rebalance events are applied from within the poll loop: newly assigned partitions
/// get their store mounted and are compared against the changelog watermarks. When a
/// table lags behind, every primary partition is paused and the next poll replays the
/// changelog before normal consumption resumes.
pub struct TableApp<C, P, H> {
    config: AppConfig,
    changelog_topic: String,
    consumer: C,
    producer: P,
    handler: H,
    tables: TableStores,
    assigned_partitions: BTreeMap<u32, TopicPartition>,
    pending_primary_partitions: BTreeMap<u32, TopicPartition>,
    recovery_descriptors: BTreeMap<u32, RecoveryDescriptor>,
    partition_states: BTreeMap<u32, PartitionState>,
    recovery_required: bool,
    stats: Arc<AppStats>,
    shutdown: ShutdownHandle,
}

impl<C, P, H> TableApp<C, P, H>
where
    C: TransactionalConsumer,
    P: TransactionalProducer,
    H: TableHandler,
{
    pub async fn new(
        config: AppConfig,
        consumer: C,
        producer: P,
        handler: H,
        store_factory: Arc<dyn StoreFactory>,
    ) -> Result<Self, AppError> {
        config.validate()?;
        if config.consume_topics.len() != 1 {
            return Err(AppError::InvalidConfiguration(format!(
                "table app requires exactly one topic to consume, got: {:?}",
                config.consume_topics
            )));
        }

        let changelog_topic = config.changelog_topic();
        consumer.subscribe(&config.consume_topics).await?;
        info!(
            "Table app: {} subscribed to topic: {}, changelog topic: {changelog_topic}",
            config.app_name, config.consume_topics[0]
        );
        Ok(Self {
            config,
            changelog_topic,
            consumer,
            producer,
            handler,
            tables: TableStores::new(store_factory),
            assigned_partitions: BTreeMap::new(),
            pending_primary_partitions: BTreeMap::new(),
            recovery_descriptors: BTreeMap::new(),
            partition_states: BTreeMap::new(),
            recovery_required: false,
            stats: Arc::new(AppStats::default()),
            shutdown: ShutdownHandle::new(),
        })
    }

    /// Replaces the shutdown handle, letting the caller stop `run` from elsewhere.
    pub fn with_shutdown_handle(mut self, shutdown: ShutdownHandle) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn changelog_topic(&self) -> &str {
        &self.changelog_topic
    }

    pub fn consumer(&self) -> &C {
        &self.consumer
    }

    pub fn producer(&self) -> &P {
        &self.producer
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Counters in the Prometheus text exposition format.
    pub fn metrics(&self) -> String {
        self.stats.get_formatted_output()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Returns `None` for partitions that are not assigned.
    pub fn partition_state(&self, partition: u32) -> Option<PartitionState> {
        self.partition_states.get(&partition).copied()
    }

    pub fn recovery_descriptors(&self) -> &BTreeMap<u32, RecoveryDescriptor> {
        &self.recovery_descriptors
    }

    pub fn is_recovery_required(&self) -> bool {
        self.recovery_required
    }

    /// Polls until shutdown is requested or an error occurs, then closes the consumer
    /// and every mounted table.
    pub async fn run(&mut self) -> Result<(), AppError> {
        info!("Starting table app: {}...", self.config.app_name);
        let result = loop {
            if self.shutdown.is_shutdown_requested() {
                info!("Shutdown requested for app: {}", self.config.app_name);
                break Ok(());
            }

            if let Err(error) = self.poll_once().await {
                error!(
                    "Table app: {} failed with error: {error} ({})",
                    self.config.app_name,
                    error.as_code()
                );
                break Err(error);
            }
        };

        close_consumer(&self.consumer).await;
        self.tables.close_all().await;
        info!("Table app: {} stopped.", self.config.app_name);
        result
    }

    /// Runs the pending table recovery if one was requested by the last rebalance,
    /// otherwise consumes and handles a single event.
    pub async fn poll_once(&mut self) -> Result<PollOutcome, AppError> {
        if self.recovery_required {
            return self.table_recovery().await;
        }

        match self.consumer.consume(self.config.poll_timeout).await? {
            Polled::Empty => {
                self.producer.poll(Duration::ZERO).await;
                Ok(PollOutcome::Idle)
            }
            Polled::Rebalance(event) => {
                let outcome = self.handle_rebalance(event).await?;
                self.track_rebalance_outcome(outcome);
                Ok(PollOutcome::Rebalanced(outcome))
            }
            Polled::Message(message) => {
                self.stats.increment_messages_consumed();
                self.process(message).await?;
                Ok(PollOutcome::Processed)
            }
        }
    }

    async fn process(&mut self, message: Message) -> Result<(), AppError> {
        if message.topic == self.changelog_topic {
            error!(
                "Consumed changelog record at {}@{} during normal consumption.",
                message.topic_partition(),
                message.offset
            );
            return Err(AppError::ChangelogAssignmentLeak(
                self.changelog_topic.clone(),
            ));
        }

        let handler = &mut self.handler;
        let transaction = Transaction::new(
            message,
            &self.producer,
            &self.consumer,
            self.stats.as_ref(),
        );
        let mut transaction =
            TableTransaction::new(transaction, &self.changelog_topic, &mut self.tables);
        if let Err(error) = handle_table_transaction(handler, &mut transaction).await {
            transaction.abort(self.config.abort_timeout).await;
            return Err(error);
        }

        self.stats.increment_messages_processed();
        Ok(())
    }
}

async fn handle_table_transaction<H: TableHandler>(
    handler: &mut H,
    transaction: &mut TableTransaction<'_>,
) -> Result<(), AppError> {
    handler.handle(transaction).await?;
    if !transaction.is_committed()
        || transaction.has_active_transaction()
        || transaction.pending_table_write().is_some()
    {
        transaction.commit().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_state_should_display_in_snake_case() {
        assert_eq!(PartitionState::RecoveryPending.to_string(), "recovery_pending");
        assert_eq!(
            PartitionState::NormalConsumption.to_string(),
            "normal_consumption"
        );
    }
}
