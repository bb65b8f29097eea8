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

use super::{PartitionState, TableApp};
use crate::app::PollOutcome;
use crate::broker::{
    BrokerError, Polled, RebalanceEvent, TransactionalConsumer, TransactionalProducer,
};
use crate::error::AppError;
use crate::message::{Message, TopicPartition};
use crate::table_transaction::TableTransaction;
use crate::transaction::Transaction;
use tracing::{debug, info, warn};

/// Replay position after the last record of a committed changelog transaction.
const CHANGELOG_OFFSET_STEP: u64 = 2;

enum RecoveryRun {
    Completed,
    /// Too many consecutive empty polls, some tables are still behind.
    Exhausted,
    Interrupted(RebalanceEvent),
}

impl<C, P, H> TableApp<C, P, H>
where
    C: TransactionalConsumer,
    P: TransactionalProducer,
{
    /// Replays the changelog into every table pending recovery, then resumes normal
    /// consumption. A rebalance observed meanwhile is applied and the recovery is
    /// attempted again on the next poll with the descriptors it left behind.
    pub(super) async fn table_recovery(&mut self) -> Result<PollOutcome, AppError> {
        if self.recovery_descriptors.is_empty() {
            self.resume_consumption().await?;
            return Ok(PollOutcome::Recovered);
        }

        info!(
            "Beginning table recovery for partitions: {:?}",
            self.recovery_descriptors.keys()
        );
        self.stats.increment_recoveries();
        self.refresh_starting_offsets();
        debug!(
            "Table recovery status before recovery attempt: {:?}",
            self.recovery_descriptors
        );

        let run = match self.seek_changelog_partitions().await? {
            Some(event) => RecoveryRun::Interrupted(event),
            None => self.recovery_loop().await?,
        };
        match run {
            RecoveryRun::Completed => info!("Table recovery complete."),
            RecoveryRun::Exhausted => warn!(
                "No changelog records after {} polls, resuming with tables still behind for partitions: {:?}",
                self.config.recovery.empty_polls,
                self.recovery_descriptors.keys()
            ),
            RecoveryRun::Interrupted(event) => {
                info!("Table recovery interrupted by rebalance.");
                let outcome = self.handle_rebalance(event).await?;
                self.track_rebalance_outcome(outcome);
                return Ok(PollOutcome::Rebalanced(outcome));
            }
        }

        self.resume_consumption().await?;
        Ok(PollOutcome::Recovered)
    }

    /// Starts from the recorded table offset, or from the changelog low watermark when
    /// that offset is no longer retained.
    fn refresh_starting_offsets(&mut self) {
        for (partition, descriptor) in self.recovery_descriptors.iter_mut() {
            let mut offset = descriptor.table_offset;
            let watermarks = descriptor.watermarks;
            if watermarks.low > offset {
                info!(
                    "p{partition} table has an offset ({offset}) lower than the changelog low watermark ({}), likely due to retention settings. Starting from the low watermark.",
                    watermarks.low
                );
                offset = watermarks.low;
            }
            debug!(
                "p{partition} table has an offset delta of {}",
                watermarks.high.saturating_sub(offset)
            );
            descriptor.partition.offset = Some(offset);
            self.partition_states
                .insert(*partition, PartitionState::Recovering);
        }
    }

    /// Seeks every changelog partition to its starting offset. Assignments that are not
    /// active yet get a bounded number of throwaway polls, after which all partitions
    /// are sought again since a throwaway poll may consume from any of them.
    async fn seek_changelog_partitions(&mut self) -> Result<Option<RebalanceEvent>, AppError> {
        let partitions = self
            .recovery_descriptors
            .values()
            .map(|descriptor| descriptor.partition.clone())
            .collect::<Vec<_>>();
        let mut attempts = 0;
        loop {
            match self.seek_all(&partitions).await {
                Ok(()) => return Ok(None),
                Err(BrokerError::AssignmentNotSettled(partition))
                    if attempts < self.config.recovery.seek_retries =>
                {
                    attempts += 1;
                    debug!(
                        "Failed to seek {partition}, assignment is not active yet. Performing throwaway poll {attempts}/{}...",
                        self.config.recovery.seek_retries
                    );
                    if let Some(event) = self.throwaway_poll().await? {
                        return Ok(Some(event));
                    }
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    async fn seek_all(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        for partition in partitions {
            self.consumer.seek(partition).await?;
        }
        Ok(())
    }

    async fn throwaway_poll(&mut self) -> Result<Option<RebalanceEvent>, AppError> {
        match self
            .consumer
            .consume(self.config.recovery.poll_timeout)
            .await?
        {
            Polled::Empty => Ok(None),
            Polled::Rebalance(event) => Ok(Some(event)),
            Polled::Message(message) => {
                if message.topic == self.changelog_topic {
                    debug!(
                        "Discarding changelog record at {}@{} polled before seeking.",
                        message.topic_partition(),
                        message.offset
                    );
                } else {
                    self.rewind(&message).await?;
                }
                Ok(None)
            }
        }
    }

    async fn recovery_loop(&mut self) -> Result<RecoveryRun, AppError> {
        let max_empty_polls = self.config.recovery.empty_polls;
        let mut empty_polls = 0;
        while !self.recovery_descriptors.is_empty() {
            if empty_polls >= max_empty_polls {
                return Ok(RecoveryRun::Exhausted);
            }

            match self
                .consumer
                .consume(self.config.recovery.poll_timeout)
                .await?
            {
                Polled::Empty => {
                    empty_polls += 1;
                    debug!(
                        "No changelog records, checks remaining: {}",
                        max_empty_polls - empty_polls
                    );
                }
                Polled::Rebalance(event) => return Ok(RecoveryRun::Interrupted(event)),
                Polled::Message(message) => {
                    empty_polls = 0;
                    self.recover_record(message).await?;
                }
            }
        }
        Ok(RecoveryRun::Completed)
    }

    async fn recover_record(&mut self, message: Message) -> Result<(), AppError> {
        if message.topic != self.changelog_topic {
            self.rewind(&message).await?;
            return Ok(());
        }

        let partition = message.partition;
        let offset = message.offset;
        let Some(high) = self
            .recovery_descriptors
            .get(&partition)
            .map(|descriptor| descriptor.watermarks.high)
        else {
            debug!("Skipping changelog record for p{partition} without pending recovery.");
            return Ok(());
        };

        let transaction = Transaction::new(
            message,
            &self.producer,
            &self.consumer,
            self.stats.as_ref(),
        );
        TableTransaction::new(transaction, &self.changelog_topic, &mut self.tables)
            .recover_table_via_changelog()
            .await?;
        let next_offset = offset + CHANGELOG_OFFSET_STEP;
        debug!("Recovered changelog p{partition} up to offset: {next_offset}, high watermark: {high}");
        if high <= next_offset {
            info!("Table partition p{partition} fully recovered.");
            self.recovery_descriptors.remove(&partition);
            self.partition_states
                .insert(partition, PartitionState::ResumingConsumption);
        }
        Ok(())
    }

    /// Moves the consumer back so the record is delivered again after recovery.
    async fn rewind(&self, message: &Message) -> Result<(), AppError> {
        debug!(
            "Rewinding record at {}@{} consumed during table recovery.",
            message.topic_partition(),
            message.offset
        );
        self.consumer
            .seek(&TopicPartition::with_offset(
                &message.topic,
                message.partition,
                message.offset,
            ))
            .await?;
        Ok(())
    }
}
