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

use async_trait::async_trait;
use clap::Parser;
use std::collections::BTreeMap;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use streamtable::prelude::*;
use tracing::info;

const APP_NAME: &str = "word-count";
const LINES_TOPIC: &str = "lines";
const COUNTS_TOPIC: &str = "word-counts";

const FIRST_BATCH: &str = "the quick brown fox jumps over the lazy dog";
const SECOND_BATCH: &str = "the dog sleeps while the fox runs";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, default_value = "target/word-count-tables")]
    store_path: PathBuf,

    #[arg(long, default_value = "2")]
    partitions_count: u32,

    /// Keeps the local tables between runs instead of rebuilding them from the changelog.
    #[arg(long, default_value = "false")]
    keep_tables: bool,
}

struct WordCounter;

#[async_trait]
impl TableHandler for WordCounter {
    async fn handle(&mut self, transaction: &mut TableTransaction<'_>) -> Result<(), AppError> {
        let count = transaction.read_table_entry::<u64>().await?.unwrap_or(0) + 1;
        transaction.update_table_entry(&count)?;
        let record = OutputRecord::new(COUNTS_TOPIC)
            .partition(transaction.partition())
            .key(transaction.key().cloned().unwrap_or_default())
            .value(count.to_string());
        transaction.produce(record).await
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logging();

    let broker = MemoryBroker::new();
    broker.create_topic(LINES_TOPIC, args.partitions_count).await;
    if tokio::fs::try_exists(&args.store_path).await? {
        tokio::fs::remove_dir_all(&args.store_path).await?;
    }

    publish_words(&broker, FIRST_BATCH, args.partitions_count).await;
    count_words(&broker, &args).await?;

    if !args.keep_tables {
        info!(
            "Removing local tables at: {}, they will be rebuilt from the changelog.",
            args.store_path.display()
        );
        tokio::fs::remove_dir_all(&args.store_path).await?;
    }

    publish_words(&broker, SECOND_BATCH, args.partitions_count).await;
    count_words(&broker, &args).await?;

    let mut totals = BTreeMap::new();
    for partition in 0..args.partitions_count {
        for record in broker.records(COUNTS_TOPIC, partition).await {
            let (Some(key), Some(value)) = (record.key, record.value) else {
                continue;
            };
            totals.insert(
                String::from_utf8_lossy(&key).into_owned(),
                String::from_utf8_lossy(&value).into_owned(),
            );
        }
    }
    for (word, count) in totals {
        println!("{word}: {count}");
    }
    Ok(())
}

async fn publish_words(broker: &MemoryBroker, text: &str, partitions_count: u32) {
    for word in text.split_whitespace() {
        let partition = crc32fast::hash(word.as_bytes()) % partitions_count;
        broker
            .append(LINES_TOPIC, partition, Some(word.as_bytes()), Some(b"1"))
            .await;
    }
}

/// Runs one app instance until every published word was counted, then shuts it down.
async fn count_words(broker: &MemoryBroker, args: &Args) -> Result<(), AppError> {
    let consumer = broker.consumer(APP_NAME);
    let control = consumer.clone();
    let mut config = AppConfig::new(APP_NAME, &[LINES_TOPIC]);
    config.store.path = args.store_path.display().to_string();
    let store_factory = Arc::new(DiskStoreFactory::new(&config.store.path));
    let mut app = TableApp::new(
        config,
        consumer,
        broker.producer(),
        WordCounter,
        store_factory,
    )
    .await?;

    let partitions = (0..args.partitions_count)
        .map(|partition| TopicPartition::new(LINES_TOPIC, partition))
        .collect::<Vec<_>>();
    control.rebalance(vec![], partitions).await;
    while app.poll_once().await? != PollOutcome::Idle {}

    let stats = app.stats();
    info!(
        "Processed {} words, recovered {} table records.",
        stats.messages_processed, stats.records_recovered
    );
    app.shutdown_handle().shutdown();
    app.run().await
}
