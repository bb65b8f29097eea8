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

use crate::error::AppError;
use crate::message::OutputRecord;
use crate::store::{encode_offset, read_offset, TableStores, OFFSET_KEY};
use crate::transaction::Transaction;
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use tracing::debug;

/// Every committed table write accounts for the source record and its changelog record.
const OFFSET_STEP: u64 = 2;

/// A staged table mutation. On the changelog an upsert carries the value and a
/// delete is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableValue {
    Upsert(Bytes),
    Delete,
}

impl TableValue {
    fn from_changelog(value: Option<&Bytes>) -> Self {
        match value {
            Some(value) => TableValue::Upsert(value.clone()),
            None => TableValue::Delete,
        }
    }

    fn into_changelog(self) -> Option<Bytes> {
        match self {
            TableValue::Upsert(value) => Some(value),
            TableValue::Delete => None,
        }
    }
}

/// Application logic invoked once per consumed message by `TableApp`.
#[async_trait]
pub trait TableHandler: Send {
    async fn handle(&mut self, transaction: &mut TableTransaction<'_>) -> Result<(), AppError>;
}

/// A `Transaction` with access to the table of its partition.
///
/// Table writes are staged and only reach the local store once the broker transaction
/// carrying the matching changelog record is committed, which keeps the store
/// derivable from the changelog.
pub struct TableTransaction<'a> {
    transaction: Transaction<'a>,
    changelog_topic: &'a str,
    tables: &'a mut TableStores,
    changelog_updated: bool,
    pending_table_write: Option<TableValue>,
}

impl<'a> TableTransaction<'a> {
    pub fn new(
        transaction: Transaction<'a>,
        changelog_topic: &'a str,
        tables: &'a mut TableStores,
    ) -> Self {
        Self {
            transaction,
            changelog_topic,
            tables,
            changelog_updated: false,
            pending_table_write: None,
        }
    }

    pub fn changelog_topic(&self) -> &str {
        self.changelog_topic
    }

    pub fn pending_table_write(&self) -> Option<&TableValue> {
        self.pending_table_write.as_ref()
    }

    pub async fn read_table_entry<T: DeserializeOwned>(&self) -> Result<Option<T>, AppError> {
        let Some(value) = self.read_table_entry_raw().await? else {
            return Ok(None);
        };

        Ok(Some(serde_json::from_slice(&value)?))
    }

    pub async fn read_table_entry_raw(&self) -> Result<Option<Bytes>, AppError> {
        let key = self.table_key()?;
        let partition = self.partition();
        let store = self
            .tables
            .get(partition)
            .ok_or(AppError::TableNotMounted(partition))?;
        let value = store.read(key).await?;
        debug!(
            "Read table entry for p{partition}, present: {}",
            value.is_some()
        );
        Ok(value)
    }

    /// Stages the JSON representation of the value, replacing any previously staged write.
    pub fn update_table_entry<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), AppError> {
        self.table_key()?;
        let value = serde_json::to_vec(value)?;
        self.pending_table_write = Some(TableValue::Upsert(Bytes::from(value)));
        Ok(())
    }

    pub fn update_table_entry_raw(&mut self, value: impl Into<Bytes>) -> Result<(), AppError> {
        self.table_key()?;
        self.pending_table_write = Some(TableValue::Upsert(value.into()));
        Ok(())
    }

    pub fn delete_table_entry(&mut self) -> Result<(), AppError> {
        self.table_key()?;
        self.pending_table_write = Some(TableValue::Delete);
        Ok(())
    }

    /// Produces the staged write to the changelog, commits the broker transaction and
    /// only then applies the write to the local store.
    pub async fn commit(&mut self) -> Result<(), AppError> {
        if let Some(pending) = self.pending_table_write.clone() {
            let partition = self.partition();
            if !self.tables.is_mounted(partition) {
                return Err(AppError::TableNotMounted(partition));
            }

            if !self.changelog_updated {
                self.update_changelog(pending).await?;
            }
        }

        self.transaction.commit_with(false).await?;
        self.changelog_updated = false;
        if self.pending_table_write.is_some() {
            let partition = self.partition();
            let store = self
                .tables
                .get(partition)
                .ok_or(AppError::TableNotMounted(partition))?;
            let offset = read_offset(store).await?.unwrap_or(self.offset()) + OFFSET_STEP;
            self.write_pending_to_store(offset).await?;
        }
        self.transaction.mark_committed();
        Ok(())
    }

    /// Replays the changelog record this transaction is bound to into the local store.
    pub(crate) async fn recover_table_via_changelog(&mut self) -> Result<(), AppError> {
        self.pending_table_write = Some(TableValue::from_changelog(self.value()));
        self.transaction.commit_with(true).await?;
        let offset = self.offset() + OFFSET_STEP;
        self.write_pending_to_store(offset).await?;
        self.transaction.stats().increment_records_recovered();
        Ok(())
    }

    async fn update_changelog(&mut self, pending: TableValue) -> Result<(), AppError> {
        let record = OutputRecord {
            topic: self.changelog_topic.to_owned(),
            partition: Some(self.partition()),
            key: Some(self.table_key()?.clone()),
            value: pending.into_changelog(),
            headers: vec![],
        };
        self.transaction.produce(record).await?;
        self.changelog_updated = true;
        Ok(())
    }

    async fn write_pending_to_store(&mut self, offset: u64) -> Result<(), AppError> {
        let Some(pending) = self.pending_table_write.take() else {
            return Ok(());
        };

        let key = self.table_key()?.clone();
        let partition = self.partition();
        let stats = self.transaction.stats();
        let store = self
            .tables
            .get_mut(partition)
            .ok_or(AppError::TableNotMounted(partition))?;
        match pending {
            TableValue::Upsert(value) => {
                debug!("Finalizing table entry write for p{partition}, offset: {offset}");
                store
                    .write_batch(vec![
                        (key, value),
                        (Bytes::from_static(OFFSET_KEY), encode_offset(offset)),
                    ])
                    .await?;
                stats.increment_table_writes();
            }
            TableValue::Delete => {
                debug!("Finalizing table entry delete for p{partition}, offset: {offset}");
                store
                    .delete_and_write(
                        &key,
                        vec![(Bytes::from_static(OFFSET_KEY), encode_offset(offset))],
                    )
                    .await?;
                stats.increment_table_deletes();
            }
        }
        Ok(())
    }

    fn table_key(&self) -> Result<&Bytes, AppError> {
        let Some(key) = self.key() else {
            return Err(AppError::MissingKey(self.message().topic_partition()));
        };

        if key.as_ref() == OFFSET_KEY {
            return Err(AppError::ReservedTableKey(
                String::from_utf8_lossy(key).into_owned(),
            ));
        }
        Ok(key)
    }
}

impl<'a> Deref for TableTransaction<'a> {
    type Target = Transaction<'a>;

    fn deref(&self) -> &Self::Target {
        &self.transaction
    }
}

impl<'a> DerefMut for TableTransaction<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.transaction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{MemoryBroker, MemoryConsumer, MemoryProducer};
    use crate::broker::Watermarks;
    use crate::message::Message;
    use crate::stats::AppStats;
    use crate::store::memory::MemoryStoreFactory;
    use crate::store::{LocalStore, MockLocalStore, StoreError, StoreFactory};
    use serde_json::{json, Value};
    use std::sync::Arc;

    const CHANGELOG: &str = "app__changelog";

    struct Fixture {
        broker: MemoryBroker,
        producer: MemoryProducer,
        consumer: MemoryConsumer,
        stats: AppStats,
        factory: MemoryStoreFactory,
        tables: TableStores,
    }

    async fn fixture() -> Fixture {
        let broker = MemoryBroker::new();
        let factory = MemoryStoreFactory::new();
        let mut tables = TableStores::new(Arc::new(factory.clone()));
        tables.mount(0).await.unwrap();
        Fixture {
            producer: broker.producer(),
            consumer: broker.consumer("app"),
            broker,
            stats: AppStats::default(),
            factory,
            tables,
        }
    }

    fn message(
        topic: &str,
        offset: u64,
        key: Option<&'static [u8]>,
        value: Option<&'static [u8]>,
    ) -> Message {
        Message {
            topic: topic.to_owned(),
            partition: 0,
            offset,
            key: key.map(Bytes::from_static),
            value: value.map(Bytes::from_static),
            headers: vec![],
        }
    }

    #[tokio::test]
    async fn update_should_write_changelog_then_store() {
        let mut fixture = fixture().await;
        let transaction = Transaction::new(
            message("in", 0, Some(b"A"), Some(b"v")),
            &fixture.producer,
            &fixture.consumer,
            &fixture.stats,
        );
        let mut transaction = TableTransaction::new(transaction, CHANGELOG, &mut fixture.tables);

        assert_eq!(transaction.read_table_entry::<Value>().await.unwrap(), None);
        transaction.update_table_entry(&json!({"x": 1})).unwrap();
        transaction.commit().await.unwrap();
        assert!(transaction.is_committed());
        assert!(transaction.pending_table_write().is_none());
        assert_eq!(
            transaction.read_table_entry::<Value>().await.unwrap(),
            Some(json!({"x": 1}))
        );

        let changelog = fixture.broker.records(CHANGELOG, 0).await;
        assert_eq!(changelog.len(), 1);
        assert_eq!(changelog[0].key.as_deref(), Some(b"A".as_ref()));
        assert_eq!(
            serde_json::from_slice::<Value>(changelog[0].value.as_ref().unwrap()).unwrap(),
            json!({"x": 1})
        );
        assert_eq!(fixture.factory.offset(0), Some(2));
        assert_eq!(fixture.broker.committed_offset("app", "in", 0).await, Some(1));
    }

    #[tokio::test]
    async fn delete_should_produce_tombstone() {
        let mut fixture = fixture().await;
        fixture.factory.set_offset(0, 6);
        fixture
            .tables
            .get_mut(0)
            .unwrap()
            .write(b"A", Bytes::from_static(b"1"))
            .await
            .unwrap();
        let transaction = Transaction::new(
            message("in", 4, Some(b"A"), None),
            &fixture.producer,
            &fixture.consumer,
            &fixture.stats,
        );
        let mut transaction = TableTransaction::new(transaction, CHANGELOG, &mut fixture.tables);

        transaction.delete_table_entry().unwrap();
        transaction.commit().await.unwrap();

        let changelog = fixture.broker.records(CHANGELOG, 0).await;
        assert_eq!(changelog[0].value, None);
        assert_eq!(fixture.factory.get(0, b"A"), None);
        assert_eq!(fixture.factory.offset(0), Some(8));
        assert_eq!(fixture.stats.snapshot().table_deletes, 1);
    }

    #[tokio::test]
    async fn delete_should_remove_entry_and_store_offset_in_one_batch() {
        #[derive(Debug)]
        struct SingleBatchFactory;

        #[async_trait]
        impl StoreFactory for SingleBatchFactory {
            async fn open(&self, _partition: u32) -> Result<Box<dyn LocalStore>, StoreError> {
                let mut store = MockLocalStore::new();
                store
                    .expect_read()
                    .returning(|_| Ok(Some(encode_offset(6))));
                store
                    .expect_delete_and_write()
                    .withf(|key, entries| {
                        key.to_vec() == b"A".to_vec()
                            && entries.len() == 1
                            && entries[0].0 == Bytes::from_static(OFFSET_KEY)
                            && entries[0].1 == encode_offset(8)
                    })
                    .times(1)
                    .returning(|_, _| Ok(()));
                Ok(Box::new(store))
            }
        }

        let broker = MemoryBroker::new();
        let producer = broker.producer();
        let consumer = broker.consumer("app");
        let stats = AppStats::default();
        let mut tables = TableStores::new(Arc::new(SingleBatchFactory));
        tables.mount(0).await.unwrap();
        let transaction = Transaction::new(
            message("in", 4, Some(b"A"), None),
            &producer,
            &consumer,
            &stats,
        );
        let mut transaction = TableTransaction::new(transaction, CHANGELOG, &mut tables);

        transaction.delete_table_entry().unwrap();
        transaction.commit().await.unwrap();
        assert_eq!(stats.snapshot().table_deletes, 1);
    }

    #[tokio::test]
    async fn commit_without_staged_write_should_leave_store_untouched() {
        let mut fixture = fixture().await;
        let transaction = Transaction::new(
            message("in", 0, Some(b"A"), Some(b"v")),
            &fixture.producer,
            &fixture.consumer,
            &fixture.stats,
        );
        let mut transaction = TableTransaction::new(transaction, CHANGELOG, &mut fixture.tables);

        transaction
            .produce(OutputRecord::new("out").partition(0).value("v"))
            .await
            .unwrap();
        transaction.commit().await.unwrap();

        assert!(fixture.broker.records(CHANGELOG, 0).await.is_empty());
        assert_eq!(fixture.broker.records("out", 0).await.len(), 1);
        assert_eq!(fixture.factory.offset(0), None);
    }

    #[tokio::test]
    async fn each_commit_should_produce_its_own_changelog_record() {
        let mut fixture = fixture().await;
        let transaction = Transaction::new(
            message("in", 0, Some(b"A"), Some(b"v")),
            &fixture.producer,
            &fixture.consumer,
            &fixture.stats,
        );
        let mut transaction = TableTransaction::new(transaction, CHANGELOG, &mut fixture.tables);

        transaction.update_table_entry(&1).unwrap();
        transaction.commit().await.unwrap();
        transaction.update_table_entry(&2).unwrap();
        transaction.commit().await.unwrap();

        let changelog = fixture.broker.records(CHANGELOG, 0).await;
        assert_eq!(changelog.len(), 2);
        assert_eq!(changelog[1].value.as_deref(), Some(b"2".as_ref()));
        assert_eq!(fixture.factory.get(0, b"A"), Some(Bytes::from_static(b"2")));
        assert_eq!(fixture.factory.offset(0), Some(4));
        assert_eq!(
            fixture.broker.watermarks(CHANGELOG, 0).await,
            Watermarks::new(0, 4)
        );
    }

    #[tokio::test]
    async fn reserved_and_missing_keys_should_be_rejected() {
        let mut fixture = fixture().await;
        let transaction = Transaction::new(
            message("in", 0, Some(b"offset"), Some(b"v")),
            &fixture.producer,
            &fixture.consumer,
            &fixture.stats,
        );
        let mut transaction = TableTransaction::new(transaction, CHANGELOG, &mut fixture.tables);
        assert!(matches!(
            transaction.update_table_entry_raw("v"),
            Err(AppError::ReservedTableKey(key)) if key == "offset"
        ));
        drop(transaction);

        let transaction = Transaction::new(
            message("in", 0, None, Some(b"v")),
            &fixture.producer,
            &fixture.consumer,
            &fixture.stats,
        );
        let mut transaction = TableTransaction::new(transaction, CHANGELOG, &mut fixture.tables);
        assert!(matches!(
            transaction.delete_table_entry(),
            Err(AppError::MissingKey(_))
        ));
    }

    #[tokio::test]
    async fn replaying_changelog_record_should_be_idempotent() {
        let mut fixture = fixture().await;
        for _ in 0..2 {
            let transaction = Transaction::new(
                message(CHANGELOG, 10, Some(b"A"), Some(b"{\"x\":2}")),
                &fixture.producer,
                &fixture.consumer,
                &fixture.stats,
            );
            let mut transaction =
                TableTransaction::new(transaction, CHANGELOG, &mut fixture.tables);
            transaction.recover_table_via_changelog().await.unwrap();

            assert_eq!(
                fixture.factory.get(0, b"A"),
                Some(Bytes::from_static(b"{\"x\":2}"))
            );
            assert_eq!(fixture.factory.offset(0), Some(12));
        }

        assert!(fixture.broker.transactions().await.is_empty());
        assert_eq!(fixture.stats.snapshot().records_recovered, 2);
    }

    #[tokio::test]
    async fn unmounted_table_should_fail_before_producing() {
        let mut fixture = fixture().await;
        fixture.tables.unmount(&[0]).await;
        let transaction = Transaction::new(
            message("in", 0, Some(b"A"), Some(b"v")),
            &fixture.producer,
            &fixture.consumer,
            &fixture.stats,
        );
        let mut transaction = TableTransaction::new(transaction, CHANGELOG, &mut fixture.tables);

        transaction.update_table_entry("v").unwrap();
        assert!(matches!(
            transaction.commit().await,
            Err(AppError::TableNotMounted(0))
        ));
        assert!(!transaction.has_active_transaction());
    }
}
