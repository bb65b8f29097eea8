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

//! Re-exports the types most applications need.
//!
//! ```
//! use streamtable::prelude::*;
//! ```

pub use crate::app::table::{PartitionState, RecoveryDescriptor, TableApp};
pub use crate::app::{PollOutcome, RebalanceOutcome, ShutdownHandle, TransactionApp};
pub use crate::broker::memory::{MemoryBroker, MemoryConsumer, MemoryProducer};
pub use crate::broker::{
    BrokerError, ConsumerGroupMetadata, Polled, RebalanceEvent, TransactionalConsumer,
    TransactionalProducer, Watermarks,
};
pub use crate::config::AppConfig;
pub use crate::error::AppError;
pub use crate::log::init_logging;
pub use crate::message::{Message, OutputRecord, TopicPartition};
pub use crate::stats::StatsSnapshot;
pub use crate::store::disk::DiskStoreFactory;
pub use crate::store::memory::MemoryStoreFactory;
pub use crate::store::{LocalStore, StoreError, StoreFactory};
pub use crate::table_transaction::{TableHandler, TableTransaction, TableValue};
pub use crate::transaction::{Transaction, TransactionHandler};
