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

use crate::store::{encode_offset, LocalStore, StoreError, StoreFactory, OFFSET_KEY};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;

type Entries = Arc<DashMap<Bytes, Bytes>>;

/// Keeps partition tables in memory. The data outlives the store handles, so closing
/// and reopening a partition behaves like remounting a table from disk.
#[derive(Debug, Default, Clone)]
pub struct MemoryStoreFactory {
    partitions: Arc<DashMap<u32, Entries>>,
}

impl MemoryStoreFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, partition: u32, key: &[u8]) -> Option<Bytes> {
        self.partitions
            .get(&partition)
            .and_then(|entries| entries.get(key).map(|value| value.clone()))
    }

    /// Overwrites the recorded changelog offset of the partition table.
    pub fn set_offset(&self, partition: u32, offset: u64) {
        self.entries(partition)
            .insert(Bytes::from_static(OFFSET_KEY), encode_offset(offset));
    }

    pub fn offset(&self, partition: u32) -> Option<u64> {
        self.get(partition, OFFSET_KEY)
            .and_then(|value| std::str::from_utf8(&value).ok()?.parse().ok())
    }

    /// Returns the table entries of the partition, the reserved offset key excluded.
    pub fn entries_count(&self, partition: u32) -> usize {
        self.partitions
            .get(&partition)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| entry.key().as_ref() != OFFSET_KEY)
                    .count()
            })
            .unwrap_or(0)
    }

    fn entries(&self, partition: u32) -> Entries {
        self.partitions.entry(partition).or_default().clone()
    }
}

#[async_trait]
impl StoreFactory for MemoryStoreFactory {
    async fn open(&self, partition: u32) -> Result<Box<dyn LocalStore>, StoreError> {
        Ok(Box::new(MemoryStore {
            partition,
            entries: self.entries(partition),
            closed: false,
        }))
    }
}

#[derive(Debug)]
pub struct MemoryStore {
    partition: u32,
    entries: Entries,
    closed: bool,
}

impl MemoryStore {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Closed(self.partition));
        }
        Ok(())
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn read(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        self.ensure_open()?;
        Ok(self.entries.get(key).map(|value| value.clone()))
    }

    async fn write(&mut self, key: &[u8], value: Bytes) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.entries.insert(Bytes::copy_from_slice(key), value);
        Ok(())
    }

    async fn write_batch(&mut self, entries: Vec<(Bytes, Bytes)>) -> Result<(), StoreError> {
        self.ensure_open()?;
        for (key, value) in entries {
            self.entries.insert(key, value);
        }
        Ok(())
    }

    async fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_and_write(
        &mut self,
        key: &[u8],
        entries: Vec<(Bytes, Bytes)>,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.entries.remove(key);
        for (key, value) in entries {
            self.entries.insert(key, value);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn data_should_survive_reopening_partition() {
        let factory = MemoryStoreFactory::new();
        let mut store = factory.open(0).await.unwrap();
        store
            .write_batch(vec![
                (Bytes::from_static(b"A"), Bytes::from_static(b"1")),
                (Bytes::from_static(OFFSET_KEY), encode_offset(2)),
            ])
            .await
            .unwrap();
        store.close().await.unwrap();
        assert!(matches!(store.read(b"A").await, Err(StoreError::Closed(0))));

        let store = factory.open(0).await.unwrap();
        assert_eq!(
            store.read(b"A").await.unwrap(),
            Some(Bytes::from_static(b"1"))
        );
        assert_eq!(factory.offset(0), Some(2));
        assert_eq!(factory.entries_count(0), 1);
    }

    #[tokio::test]
    async fn partitions_should_be_isolated() {
        let factory = MemoryStoreFactory::new();
        let mut first = factory.open(0).await.unwrap();
        let second = factory.open(1).await.unwrap();
        first.write(b"A", Bytes::from_static(b"1")).await.unwrap();

        assert_eq!(second.read(b"A").await.unwrap(), None);
        first.delete(b"A").await.unwrap();
        assert_eq!(factory.get(0, b"A"), None);
    }
}
