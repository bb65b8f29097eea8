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

pub mod table;

use crate::broker::{
    format_partitions, Polled, RebalanceEvent, TransactionalConsumer, TransactionalProducer,
};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::message::Message;
use crate::stats::{AppStats, StatsSnapshot};
use crate::transaction::{Transaction, TransactionHandler};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What a single `poll_once` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Processed,
    Idle,
    Rebalanced(RebalanceOutcome),
    Recovered,
}

/// How the app proceeds after a rebalance event was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceOutcome {
    /// At least one table lags its changelog, the next poll runs the recovery.
    RecoveryRequired,
    Resumed,
    /// Partitions were revoked or lost, an assignment event follows.
    AwaitingAssignment,
}

/// Cloneable flag stopping `run` before its next poll.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Consume, process and commit loop for handlers without table state.
pub struct TransactionApp<C, P, H> {
    config: AppConfig,
    consumer: C,
    producer: P,
    handler: H,
    stats: Arc<AppStats>,
    shutdown: ShutdownHandle,
}

impl<C, P, H> TransactionApp<C, P, H>
where
    C: TransactionalConsumer,
    P: TransactionalProducer,
    H: TransactionHandler,
{
    /// Validates the configuration and subscribes the consumer to the configured topics.
    pub async fn new(
        config: AppConfig,
        consumer: C,
        producer: P,
        handler: H,
    ) -> Result<Self, AppError> {
        config.validate()?;
        consumer.subscribe(&config.consume_topics).await?;
        info!(
            "Transaction app: {} subscribed to topics: {:?}",
            config.app_name, config.consume_topics
        );
        Ok(Self {
            config,
            consumer,
            producer,
            handler,
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

    /// Polls until shutdown is requested or an error occurs, then closes the consumer.
    pub async fn run(&mut self) -> Result<(), AppError> {
        info!("Starting transaction app: {}...", self.config.app_name);
        let result = loop {
            if self.shutdown.is_shutdown_requested() {
                info!("Shutdown requested for app: {}", self.config.app_name);
                break Ok(());
            }

            if let Err(error) = self.poll_once().await {
                error!(
                    "Transaction app: {} failed with error: {error} ({})",
                    self.config.app_name,
                    error.as_code()
                );
                break Err(error);
            }
        };

        close_consumer(&self.consumer).await;
        info!("Transaction app: {} stopped.", self.config.app_name);
        result
    }

    pub async fn poll_once(&mut self) -> Result<PollOutcome, AppError> {
        match self.consumer.consume(self.config.poll_timeout).await? {
            Polled::Empty => {
                self.producer.poll(Duration::ZERO).await;
                Ok(PollOutcome::Idle)
            }
            Polled::Rebalance(event) => {
                let outcome = self.handle_rebalance(event).await?;
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
        let handler = &mut self.handler;
        let mut transaction = Transaction::new(
            message,
            &self.producer,
            &self.consumer,
            self.stats.as_ref(),
        );
        if let Err(error) = handle_transaction(handler, &mut transaction).await {
            transaction.abort(self.config.abort_timeout).await;
            return Err(error);
        }

        self.stats.increment_messages_processed();
        Ok(())
    }

    async fn handle_rebalance(
        &mut self,
        event: RebalanceEvent,
    ) -> Result<RebalanceOutcome, AppError> {
        self.stats.increment_rebalances();
        info!("Rebalance triggered, {event}");
        match event {
            RebalanceEvent::Assigned(partitions) => {
                if partitions.is_empty() {
                    debug!("No new partitions assigned.");
                } else {
                    self.consumer.incremental_assign(&partitions).await?;
                    info!("Assigned partitions: {}", format_partitions(&partitions));
                }
                Ok(RebalanceOutcome::Resumed)
            }
            RebalanceEvent::Revoked(partitions) | RebalanceEvent::Lost(partitions) => {
                self.consumer.incremental_unassign(&partitions).await?;
                info!("Unassigned partitions: {}", format_partitions(&partitions));
                Ok(RebalanceOutcome::AwaitingAssignment)
            }
        }
    }
}

async fn handle_transaction<H: TransactionHandler>(
    handler: &mut H,
    transaction: &mut Transaction<'_>,
) -> Result<(), AppError> {
    handler.handle(transaction).await?;
    if !transaction.is_committed() || transaction.has_active_transaction() {
        transaction.commit().await?;
    }
    Ok(())
}

pub(crate) async fn close_consumer(consumer: &dyn TransactionalConsumer) {
    if let Err(error) = consumer.close().await {
        warn!("Failed to close consumer. {error}");
        return;
    }
    debug!("Consumer closed.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{
        MemoryBroker, MemoryConsumer, MemoryProducer, TransactionOutcome,
    };
    use crate::message::{OutputRecord, TopicPartition};
    use async_trait::async_trait;

    struct Forwarder {
        fail_after_produce: bool,
        shutdown_after: Option<(usize, ShutdownHandle)>,
        processed: usize,
    }

    impl Forwarder {
        fn new() -> Self {
            Self {
                fail_after_produce: false,
                shutdown_after: None,
                processed: 0,
            }
        }
    }

    #[async_trait]
    impl TransactionHandler for Forwarder {
        async fn handle(&mut self, transaction: &mut Transaction<'_>) -> Result<(), AppError> {
            let value = transaction.value().cloned().unwrap_or_default();
            transaction
                .produce(OutputRecord::new("out").partition(0).value(value))
                .await?;
            if self.fail_after_produce {
                return Err(AppError::handler("downstream rejected the record"));
            }

            self.processed += 1;
            if let Some((limit, shutdown)) = &self.shutdown_after {
                if self.processed >= *limit {
                    shutdown.shutdown();
                }
            }
            Ok(())
        }
    }

    type TestApp = TransactionApp<MemoryConsumer, MemoryProducer, Forwarder>;

    async fn setup(handler: Forwarder) -> (MemoryBroker, TestApp) {
        let broker = MemoryBroker::new();
        broker.append("in", 0, None, Some(b"first")).await;
        broker.append("in", 0, None, Some(b"second")).await;
        let consumer = broker.consumer("app");
        consumer
            .rebalance(vec![], vec![TopicPartition::new("in", 0)])
            .await;
        let app = TransactionApp::new(
            AppConfig::new("app", &["in"]),
            consumer,
            broker.producer(),
            handler,
        )
        .await
        .unwrap();
        (broker, app)
    }

    #[tokio::test]
    async fn poll_once_should_process_and_commit_message() {
        let (broker, mut app) = setup(Forwarder::new()).await;

        assert_eq!(
            app.poll_once().await.unwrap(),
            PollOutcome::Rebalanced(RebalanceOutcome::Resumed)
        );
        assert_eq!(app.poll_once().await.unwrap(), PollOutcome::Processed);

        let records = broker.records("out", 0).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value.as_deref(), Some(b"first".as_ref()));
        assert_eq!(broker.committed_offset("app", "in", 0).await, Some(1));
        assert_eq!(app.stats().messages_processed, 1);
        assert_eq!(app.consumer().subscription().await, vec!["in"]);
    }

    #[tokio::test]
    async fn lost_partitions_should_await_assignment() {
        let (_broker, mut app) = setup(Forwarder::new()).await;
        app.poll_once().await.unwrap();
        app.consumer().lose(vec![TopicPartition::new("in", 0)]).await;

        assert_eq!(
            app.poll_once().await.unwrap(),
            PollOutcome::Rebalanced(RebalanceOutcome::AwaitingAssignment)
        );
        assert_eq!(
            app.poll_once().await.unwrap(),
            PollOutcome::Rebalanced(RebalanceOutcome::Resumed)
        );
        assert!(app.consumer().assignment().await.unwrap().is_empty());
        assert_eq!(app.stats().rebalances, 3);
    }

    #[tokio::test]
    async fn handler_failure_should_abort_transaction() {
        let mut handler = Forwarder::new();
        handler.fail_after_produce = true;
        let (broker, mut app) = setup(handler).await;

        app.poll_once().await.unwrap();
        let result = app.poll_once().await;

        assert!(matches!(result, Err(AppError::Handler(_))));
        assert!(broker.records("out", 0).await.is_empty());
        let transactions = broker.transactions().await;
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].outcome, TransactionOutcome::Aborted);
        assert_eq!(broker.committed_offset("app", "in", 0).await, None);
        assert!(!app.producer().in_transaction().await);
    }

    #[tokio::test]
    async fn failed_commit_should_abort_and_stop_run() {
        let (broker, mut app) = setup(Forwarder::new()).await;
        broker.fail_next_commits(1).await;

        let result = app.run().await;

        assert!(matches!(result, Err(AppError::Broker(_))));
        assert!(broker.records("out", 0).await.is_empty());
        assert_eq!(app.stats().transactions_aborted, 1);
        assert!(app.consumer().is_closed().await);
    }

    #[tokio::test]
    async fn run_should_stop_on_shutdown_request() {
        let shutdown = ShutdownHandle::new();
        let mut handler = Forwarder::new();
        handler.shutdown_after = Some((2, shutdown.clone()));
        let (broker, app) = setup(handler).await;
        let mut app = app.with_shutdown_handle(shutdown);

        app.run().await.unwrap();

        assert_eq!(app.handler().processed, 2);
        assert_eq!(broker.records("out", 0).await.len(), 2);
        assert_eq!(broker.committed_offset("app", "in", 0).await, Some(2));
        assert!(app.consumer().is_closed().await);
    }
}
