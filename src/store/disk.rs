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

use crate::store::{LocalStore, StoreError, StoreFactory};
use async_trait::async_trait;
use bytes::Bytes;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use std::path::{Path, PathBuf};
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

/// Opens partition tables inside a single fjall keyspace rooted at the store path.
/// Every assigned partition gets its own keyspace partition named `p{partition}`.
pub struct DiskStoreFactory {
    path: PathBuf,
    keyspace: OnceCell<Keyspace>,
}

impl DiskStoreFactory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            keyspace: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn keyspace(&self) -> Result<&Keyspace, StoreError> {
        self.keyspace
            .get_or_try_init(|| async {
                std::fs::create_dir_all(&self.path).map_err(|error| {
                    error!(
                        "Cannot create table store directory: {}. {error}.",
                        self.path.display()
                    );
                    StoreError::CannotOpenStore(self.path.display().to_string())
                })?;
                let keyspace = fjall::Config::new(&self.path).open()?;
                info!("Opened table keyspace at: {}", self.path.display());
                Ok::<_, StoreError>(keyspace)
            })
            .await
    }
}

impl std::fmt::Debug for DiskStoreFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskStoreFactory")
            .field("path", &self.path)
            .field("opened", &self.keyspace.initialized())
            .finish()
    }
}

#[async_trait]
impl StoreFactory for DiskStoreFactory {
    async fn open(&self, partition: u32) -> Result<Box<dyn LocalStore>, StoreError> {
        let keyspace = self.keyspace().await?.clone();
        let table =
            keyspace.open_partition(&format!("p{partition}"), PartitionCreateOptions::default())?;
        debug!(
            "Opened table store for p{partition} at: {}",
            self.path.display()
        );
        Ok(Box::new(DiskStore {
            partition,
            keyspace,
            table,
            closed: false,
        }))
    }
}

/// Partition table backed by an LSM partition. Writes and deletes go through keyspace
/// batches, so a table entry and the table offset always land together.
pub struct DiskStore {
    partition: u32,
    keyspace: Keyspace,
    table: PartitionHandle,
    closed: bool,
}

impl std::fmt::Debug for DiskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskStore")
            .field("partition", &self.partition)
            .field("closed", &self.closed)
            .finish()
    }
}

impl DiskStore {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Closed(self.partition));
        }
        Ok(())
    }

    fn commit(
        &self,
        deleted: Option<&[u8]>,
        entries: Vec<(Bytes, Bytes)>,
    ) -> Result<(), StoreError> {
        let mut batch = self.keyspace.batch();
        if let Some(key) = deleted {
            batch.remove(&self.table, key);
        }
        for (key, value) in entries {
            batch.insert(&self.table, &key[..], &value[..]);
        }
        batch.commit()?;
        self.keyspace.persist(PersistMode::SyncData)?;
        Ok(())
    }
}

#[async_trait]
impl LocalStore for DiskStore {
    async fn read(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        self.ensure_open()?;
        Ok(self
            .table
            .get(key)?
            .map(|value| Bytes::copy_from_slice(&value)))
    }

    async fn write(&mut self, key: &[u8], value: Bytes) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.commit(None, vec![(Bytes::copy_from_slice(key), value)])
    }

    async fn write_batch(&mut self, entries: Vec<(Bytes, Bytes)>) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.commit(None, entries)
    }

    async fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.commit(Some(key), vec![])
    }

    async fn delete_and_write(
        &mut self,
        key: &[u8],
        entries: Vec<(Bytes, Bytes)>,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.commit(Some(key), entries)
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.keyspace.persist(PersistMode::SyncAll)?;
        debug!("Closed table store for p{}", self.partition);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{encode_offset, read_offset, OFFSET_KEY};

    #[tokio::test]
    async fn entries_should_be_persisted_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let factory = DiskStoreFactory::new(dir.path());
            let mut store = factory.open(4).await.unwrap();
            store
                .write_batch(vec![
                    (Bytes::from_static(b"A"), Bytes::from_static(b"{\"x\":1}")),
                    (Bytes::from_static(OFFSET_KEY), encode_offset(12)),
                ])
                .await
                .unwrap();
            store.write(b"B", Bytes::from_static(b"2")).await.unwrap();
            store.delete(b"B").await.unwrap();
            store.close().await.unwrap();
        }

        let factory = DiskStoreFactory::new(dir.path());
        let store = factory.open(4).await.unwrap();
        assert_eq!(
            store.read(b"A").await.unwrap(),
            Some(Bytes::from_static(b"{\"x\":1}"))
        );
        assert_eq!(store.read(b"B").await.unwrap(), None);
        assert_eq!(read_offset(store.as_ref()).await.unwrap(), Some(12));
    }

    #[tokio::test]
    async fn delete_and_write_should_remove_key_and_advance_offset() {
        let dir = tempfile::tempdir().unwrap();
        let factory = DiskStoreFactory::new(dir.path());
        let mut store = factory.open(0).await.unwrap();
        store
            .write_batch(vec![
                (Bytes::from_static(b"A"), Bytes::from_static(b"1")),
                (Bytes::from_static(OFFSET_KEY), encode_offset(2)),
            ])
            .await
            .unwrap();

        store
            .delete_and_write(
                b"A",
                vec![(Bytes::from_static(OFFSET_KEY), encode_offset(4))],
            )
            .await
            .unwrap();

        assert_eq!(store.read(b"A").await.unwrap(), None);
        assert_eq!(read_offset(store.as_ref()).await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn partitions_should_not_share_tables() {
        let dir = tempfile::tempdir().unwrap();
        let factory = DiskStoreFactory::new(dir.path());
        let mut first = factory.open(0).await.unwrap();
        let second = factory.open(1).await.unwrap();
        first.write(b"A", Bytes::from_static(b"1")).await.unwrap();

        assert_eq!(second.read(b"A").await.unwrap(), None);
        assert_eq!(
            first.read(b"A").await.unwrap(),
            Some(Bytes::from_static(b"1"))
        );
    }

    #[tokio::test]
    async fn closed_store_should_reject_writes() {
        let dir = tempfile::tempdir().unwrap();
        let factory = DiskStoreFactory::new(dir.path());
        let mut store = factory.open(2).await.unwrap();
        store.close().await.unwrap();

        assert!(matches!(
            store.write(b"A", Bytes::from_static(b"1")).await,
            Err(StoreError::Closed(2))
        ));
    }

    #[tokio::test]
    async fn unusable_store_path_should_fail_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tables");
        std::fs::write(&path, b"not a directory").unwrap();

        let factory = DiskStoreFactory::new(&path);
        assert!(matches!(
            factory.open(0).await,
            Err(StoreError::CannotOpenStore(_))
        ));
    }
}
