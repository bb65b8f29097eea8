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

use super::{PartitionState, RecoveryDescriptor, TableApp};
use crate::app::RebalanceOutcome;
use crate::broker::{
    format_partitions, RebalanceEvent, TransactionalConsumer, TransactionalProducer,
};
use crate::error::AppError;
use crate::message::TopicPartition;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, warn};

impl<C, P, H> TableApp<C, P, H>
where
    C: TransactionalConsumer,
    P: TransactionalProducer,
{
    /// Applies a partition assignment change delivered by the consumer. The returned
    /// outcome tells the poll loop whether the tables must be recovered first.
    pub(super) async fn handle_rebalance(
        &mut self,
        event: RebalanceEvent,
    ) -> Result<RebalanceOutcome, AppError> {
        self.stats.increment_rebalances();
        info!("Rebalance triggered, {event}");
        match event {
            RebalanceEvent::Assigned(partitions) => self.assign(partitions).await,
            RebalanceEvent::Revoked(partitions) | RebalanceEvent::Lost(partitions) => {
                self.unassign(partitions).await?;
                Ok(RebalanceOutcome::AwaitingAssignment)
            }
        }
    }

    /// Records a required recovery so the next poll replays the changelog instead of
    /// consuming primary records.
    pub(super) fn track_rebalance_outcome(&mut self, outcome: RebalanceOutcome) {
        match outcome {
            RebalanceOutcome::RecoveryRequired => self.recovery_required = true,
            RebalanceOutcome::Resumed => self.recovery_required = false,
            RebalanceOutcome::AwaitingAssignment => {}
        }
    }

    async fn assign(
        &mut self,
        partitions: Vec<TopicPartition>,
    ) -> Result<RebalanceOutcome, AppError> {
        debug!(
            "Assigning additional partitions: {}",
            format_partitions(&partitions)
        );
        if partitions.is_empty() {
            let assignment = self.consumer.assignment().await?;
            if assignment.is_empty() {
                info!("Awaiting partition assignments from broker...");
            } else {
                info!(
                    "No new partitions assigned, keeping current assignment of: {}",
                    format_partitions(&assignment)
                );
            }
            return self.recover_or_resume().await;
        }

        for partition in &partitions {
            let primary = TopicPartition::new(&partition.topic, partition.partition);
            self.pending_primary_partitions
                .insert(partition.partition, primary.clone());
            self.assigned_partitions.insert(partition.partition, primary);
        }

        let pending = self
            .pending_primary_partitions
            .keys()
            .copied()
            .collect::<Vec<_>>();
        for partition in pending {
            self.tables.mount(partition).await?;
        }

        self.refresh_recovery_descriptors().await?;
        self.consumer.incremental_assign(&partitions).await?;
        for partition in &partitions {
            let state = if self.recovery_descriptors.contains_key(&partition.partition) {
                PartitionState::RecoveryPending
            } else {
                PartitionState::NormalConsumption
            };
            self.partition_states.insert(partition.partition, state);
        }

        self.assign_changelog_partitions().await?;
        info!("Partition assignment complete.");
        self.recover_or_resume().await
    }

    async fn unassign(&mut self, partitions: Vec<TopicPartition>) -> Result<(), AppError> {
        let revoked = partitions
            .iter()
            .map(|partition| partition.partition)
            .collect::<Vec<_>>();
        debug!(
            "Unassigning partitions: {}",
            format_partitions(&partitions)
        );
        self.consumer.incremental_unassign(&partitions).await?;

        let changelog_partitions = self
            .consumer
            .assignment()
            .await?
            .into_iter()
            .filter(|partition| {
                partition.topic == self.changelog_topic && revoked.contains(&partition.partition)
            })
            .collect::<Vec<_>>();
        if !changelog_partitions.is_empty() {
            debug!(
                "Unassigning changelog partitions of revoked partitions: {}",
                format_partitions(&changelog_partitions)
            );
            self.consumer
                .incremental_unassign(&changelog_partitions)
                .await?;
        }

        self.assigned_partitions
            .retain(|partition, _| !revoked.contains(partition));
        self.pending_primary_partitions
            .retain(|partition, _| !revoked.contains(partition));
        self.recovery_descriptors
            .retain(|partition, _| !revoked.contains(partition));
        self.partition_states
            .retain(|partition, _| !revoked.contains(partition));
        debug!(
            "Pending primary partitions after unassignment: {:?}, pending recoveries: {:?}",
            self.pending_primary_partitions.keys(),
            self.recovery_descriptors.keys()
        );
        self.tables.unmount(&revoked).await;
        Ok(())
    }

    /// Recomputes the recovery descriptors of every partition not yet resumed. A table
    /// needs recovery when its changelog is not empty and its recorded offset is below
    /// the changelog high watermark.
    async fn refresh_recovery_descriptors(&mut self) -> Result<(), AppError> {
        let mut descriptors = BTreeMap::new();
        for partition in self.pending_primary_partitions.keys().copied() {
            let changelog = TopicPartition::new(&self.changelog_topic, partition);
            let watermarks = self.consumer.get_watermark_offsets(&changelog).await?;
            debug!("Watermarks for changelog p{partition}: {watermarks}");
            if watermarks.is_empty() {
                continue;
            }

            let table_offset = self.tables.table_offset(partition).await?.unwrap_or(0);
            if table_offset < watermarks.high {
                descriptors.insert(
                    partition,
                    RecoveryDescriptor {
                        table_offset,
                        watermarks,
                        partition: changelog,
                    },
                );
            }
        }
        self.recovery_descriptors = descriptors;
        Ok(())
    }

    async fn assign_changelog_partitions(&mut self) -> Result<(), AppError> {
        let assignment = self.consumer.assignment().await?;
        let missing = self
            .recovery_descriptors
            .values()
            .filter(|descriptor| {
                !assignment
                    .iter()
                    .any(|assigned| assigned.same_partition(&descriptor.partition))
            })
            .map(|descriptor| descriptor.partition.clone())
            .collect::<Vec<_>>();
        if missing.is_empty() {
            return Ok(());
        }

        debug!(
            "New partition assignment will require table recovery, assigning changelog partitions: {}",
            format_partitions(&missing)
        );
        self.consumer.incremental_assign(&missing).await?;
        Ok(())
    }

    async fn recover_or_resume(&mut self) -> Result<RebalanceOutcome, AppError> {
        if self.recovery_descriptors.is_empty() {
            debug!("Preparing to resume consumption...");
            self.resume_consumption().await?;
            return Ok(RebalanceOutcome::Resumed);
        }

        debug!(
            "Table recovery required for partitions: {:?}",
            self.recovery_descriptors.keys()
        );
        let primaries = self.primary_partitions();
        if !primaries.is_empty() {
            self.consumer.pause(&primaries).await?;
        }
        Ok(RebalanceOutcome::RecoveryRequired)
    }

    /// Drops every changelog partition from the assignment, resumes all primary
    /// partitions and verifies the resulting assignment.
    pub(super) async fn resume_consumption(&mut self) -> Result<(), AppError> {
        for state in self.partition_states.values_mut() {
            if *state != PartitionState::NormalConsumption {
                *state = PartitionState::ResumingConsumption;
            }
        }

        let changelog_partitions = self
            .consumer
            .assignment()
            .await?
            .into_iter()
            .filter(|partition| partition.topic == self.changelog_topic)
            .collect::<Vec<_>>();
        if !changelog_partitions.is_empty() {
            debug!(
                "Unassigning changelog partitions: {}",
                format_partitions(&changelog_partitions)
            );
            self.consumer
                .incremental_unassign(&changelog_partitions)
                .await?;
        }

        let primaries = self.primary_partitions();
        if !primaries.is_empty() {
            debug!(
                "Resuming consumption for partitions: {}",
                format_partitions(&primaries)
            );
            self.consumer.resume(&primaries).await?;
        }

        self.confirm_proper_assignment().await?;
        self.recovery_descriptors.clear();
        self.pending_primary_partitions.clear();
        self.recovery_required = false;
        for state in self.partition_states.values_mut() {
            *state = PartitionState::NormalConsumption;
        }
        info!("Continuing normal consumption loop...");
        Ok(())
    }

    async fn confirm_proper_assignment(&self) -> Result<(), AppError> {
        let assignment = self.consumer.assignment().await?;
        if assignment
            .iter()
            .any(|partition| partition.topic == self.changelog_topic)
        {
            error!(
                "Changelog topic: {} was included in normal consumption assignment: {}",
                self.changelog_topic,
                format_partitions(&assignment)
            );
            return Err(AppError::ChangelogAssignmentLeak(
                self.changelog_topic.clone(),
            ));
        }

        let assigned = assignment
            .iter()
            .map(|partition| partition.partition)
            .collect::<BTreeSet<_>>();
        let tables = self.tables.partitions().into_iter().collect::<BTreeSet<_>>();
        if assigned != tables {
            warn!("Partition/table assignment mismatch, partitions: {assigned:?}, tables: {tables:?}");
        }
        Ok(())
    }

    fn primary_partitions(&self) -> Vec<TopicPartition> {
        self.assigned_partitions.values().cloned().collect()
    }
}
