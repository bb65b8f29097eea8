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

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;
use serde::Serialize;
use std::sync::Arc;
use tracing::error;

/// Counters of a single app, registered in their own Prometheus registry.
#[derive(Debug, Clone)]
pub struct AppStats {
    registry: Arc<Registry>,
    messages_consumed: Counter,
    messages_processed: Counter,
    messages_produced: Counter,
    transactions_committed: Counter,
    transactions_aborted: Counter,
    table_writes: Counter,
    table_deletes: Counter,
    records_recovered: Counter,
    rebalances: Counter,
    recoveries: Counter,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub messages_consumed: u64,
    pub messages_processed: u64,
    pub messages_produced: u64,
    pub transactions_committed: u64,
    pub transactions_aborted: u64,
    pub table_writes: u64,
    pub table_deletes: u64,
    pub records_recovered: u64,
    pub rebalances: u64,
    pub recoveries: u64,
}

impl Default for AppStats {
    fn default() -> Self {
        Self::init()
    }
}

impl AppStats {
    pub fn init() -> Self {
        let mut registry = Registry::with_prefix("streamtable");
        let messages_consumed = Counter::default();
        let messages_processed = Counter::default();
        let messages_produced = Counter::default();
        let transactions_committed = Counter::default();
        let transactions_aborted = Counter::default();
        let table_writes = Counter::default();
        let table_deletes = Counter::default();
        let records_recovered = Counter::default();
        let rebalances = Counter::default();
        let recoveries = Counter::default();

        registry.register(
            "messages_consumed",
            "Messages consumed from the source topics",
            messages_consumed.clone(),
        );
        registry.register(
            "messages_processed",
            "Messages handled and committed",
            messages_processed.clone(),
        );
        registry.register(
            "messages_produced",
            "Records produced inside transactions, changelog records included",
            messages_produced.clone(),
        );
        registry.register(
            "transactions_committed",
            "Committed broker transactions",
            transactions_committed.clone(),
        );
        registry.register(
            "transactions_aborted",
            "Aborted broker transactions",
            transactions_aborted.clone(),
        );
        registry.register(
            "table_writes",
            "Table entries written to local stores",
            table_writes.clone(),
        );
        registry.register(
            "table_deletes",
            "Table entries deleted from local stores",
            table_deletes.clone(),
        );
        registry.register(
            "records_recovered",
            "Changelog records replayed into local stores",
            records_recovered.clone(),
        );
        registry.register(
            "rebalances",
            "Rebalance events applied",
            rebalances.clone(),
        );
        registry.register(
            "recoveries",
            "Table recovery attempts",
            recoveries.clone(),
        );

        Self {
            registry: Arc::new(registry),
            messages_consumed,
            messages_processed,
            messages_produced,
            transactions_committed,
            transactions_aborted,
            table_writes,
            table_deletes,
            records_recovered,
            rebalances,
            recoveries,
        }
    }

    /// Renders every counter in the Prometheus text format.
    pub fn get_formatted_output(&self) -> String {
        let mut buffer = String::new();
        if let Err(err) = encode(&mut buffer, &self.registry) {
            error!("Failed to encode stats: {}", err);
        }
        buffer
    }

    pub fn increment_messages_consumed(&self) {
        self.messages_consumed.inc();
    }

    pub fn increment_messages_processed(&self) {
        self.messages_processed.inc();
    }

    pub fn increment_messages_produced(&self) {
        self.messages_produced.inc();
    }

    pub fn increment_transactions_committed(&self) {
        self.transactions_committed.inc();
    }

    pub fn increment_transactions_aborted(&self) {
        self.transactions_aborted.inc();
    }

    pub fn increment_table_writes(&self) {
        self.table_writes.inc();
    }

    pub fn increment_table_deletes(&self) {
        self.table_deletes.inc();
    }

    pub fn increment_records_recovered(&self) {
        self.records_recovered.inc();
    }

    pub fn increment_rebalances(&self) {
        self.rebalances.inc();
    }

    pub fn increment_recoveries(&self) {
        self.recoveries.inc();
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_consumed: self.messages_consumed.get(),
            messages_processed: self.messages_processed.get(),
            messages_produced: self.messages_produced.get(),
            transactions_committed: self.transactions_committed.get(),
            transactions_aborted: self.transactions_aborted.get(),
            table_writes: self.table_writes.get(),
            table_deletes: self.table_deletes.get(),
            records_recovered: self.records_recovered.get(),
            rebalances: self.rebalances.get(),
            recoveries: self.recoveries.get(),
        }
    }
}
