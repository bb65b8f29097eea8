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

pub mod disk;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Reserved key holding the highest changelog offset reflected in a partition store.
pub const OFFSET_KEY: &[u8] = b"offset";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store for partition: {0} is closed")]
    Closed(u32),
    #[error("Invalid table offset: {0}")]
    InvalidOffset(String),
    #[error("Cannot open store at: {0}")]
    CannotOpenStore(String),
    #[error("Store engine error")]
    Engine(#[from] fjall::Error),
}

/// Durable key/value store holding the table state of a single partition.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LocalStore: Send + Sync + Debug {
    async fn read(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError>;

    async fn write(&mut self, key: &[u8], value: Bytes) -> Result<(), StoreError>;

    /// Writes all entries at once.
    async fn write_batch(&mut self, entries: Vec<(Bytes, Bytes)>) -> Result<(), StoreError>;

    async fn delete(&mut self, key: &[u8]) -> Result<(), StoreError>;

    /// Deletes the key and writes the entries in one atomic batch.
    async fn delete_and_write(
        &mut self,
        key: &[u8],
        entries: Vec<(Bytes, Bytes)>,
    ) -> Result<(), StoreError>;

    async fn close(&mut self) -> Result<(), StoreError>;
}

/// Opens the store of a partition when it gets assigned.
#[async_trait]
pub trait StoreFactory: Send + Sync + Debug {
    async fn open(&self, partition: u32) -> Result<Box<dyn LocalStore>, StoreError>;
}

/// Per-partition store handles, one for every partition currently assigned.
#[derive(Debug)]
pub struct TableStores {
    factory: Arc<dyn StoreFactory>,
    tables: BTreeMap<u32, Box<dyn LocalStore>>,
}

impl TableStores {
    pub fn new(factory: Arc<dyn StoreFactory>) -> Self {
        Self {
            factory,
            tables: BTreeMap::new(),
        }
    }

    /// Opens the store for the partition unless it is already open.
    pub async fn mount(&mut self, partition: u32) -> Result<(), StoreError> {
        if self.tables.contains_key(&partition) {
            return Ok(());
        }

        let store = self.factory.open(partition).await?;
        self.tables.insert(partition, store);
        debug!("Table store for p{partition} initialized");
        Ok(())
    }

    /// Closes the stores of the given partitions. Missing stores are tolerated since
    /// consecutive rebalances may revoke a partition that was never mounted.
    pub async fn unmount(&mut self, partitions: &[u32]) {
        debug!("Closing table stores for partitions: {partitions:?}");
        for partition in partitions {
            let Some(mut store) = self.tables.remove(partition) else {
                debug!(
                    "Table store for p{partition} was not mounted and could not be closed, likely caused by consecutive rebalances."
                );
                continue;
            };

            if let Err(error) = store.close().await {
                warn!("Failed to close table store for p{partition}. {error}");
                continue;
            }
            debug!("Table store for p{partition} closed.");
        }
        info!("Closed table stores for partitions: {partitions:?}");
    }

    pub async fn close_all(&mut self) {
        let partitions = self.partitions();
        if partitions.is_empty() {
            return;
        }
        self.unmount(&partitions).await;
    }

    pub fn is_mounted(&self, partition: u32) -> bool {
        self.tables.contains_key(&partition)
    }

    pub fn partitions(&self) -> Vec<u32> {
        self.tables.keys().copied().collect()
    }

    pub fn get(&self, partition: u32) -> Option<&dyn LocalStore> {
        self.tables.get(&partition).map(|store| store.as_ref())
    }

    pub fn get_mut(&mut self, partition: u32) -> Option<&mut Box<dyn LocalStore>> {
        self.tables.get_mut(&partition)
    }

    /// Returns the changelog offset recorded in the partition store, if any.
    pub async fn table_offset(&self, partition: u32) -> Result<Option<u64>, StoreError> {
        let Some(store) = self.get(partition) else {
            return Ok(None);
        };

        read_offset(store).await
    }
}

pub(crate) async fn read_offset(store: &dyn LocalStore) -> Result<Option<u64>, StoreError> {
    let Some(value) = store.read(OFFSET_KEY).await? else {
        return Ok(None);
    };

    let value = std::str::from_utf8(&value)
        .map_err(|_| StoreError::InvalidOffset(String::from_utf8_lossy(&value).into_owned()))?;
    value
        .trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| StoreError::InvalidOffset(value.to_owned()))
}

pub(crate) fn encode_offset(offset: u64) -> Bytes {
    Bytes::from(offset.to_string())
}
