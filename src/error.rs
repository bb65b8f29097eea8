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

use crate::broker::BrokerError;
use crate::message::TopicPartition;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Broker error")]
    Broker(#[from] BrokerError),
    #[error("Table store error")]
    Store(#[from] StoreError),
    #[error("JSON error")]
    Json(#[from] serde_json::Error),
    #[error("IO operation failed with error: {0:?}")]
    Io(#[from] std::io::Error),
    #[error("Message at {0} has no key, table entries require one")]
    MissingKey(TopicPartition),
    #[error("Table key is reserved: {0}")]
    ReservedTableKey(String),
    #[error("Table store for partition: {0} is not mounted")]
    TableNotMounted(u32),
    #[error("Changelog topic: {0} was included in the normal consumption assignment")]
    ChangelogAssignmentLeak(String),
    #[error("Handler failed: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl AppError {
    /// Wraps an error raised by the application handler.
    pub fn handler<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        AppError::Handler(error.into())
    }

    pub fn as_code(&self) -> &'static str {
        match self {
            AppError::InvalidConfiguration(_) => "invalid_configuration",
            AppError::Broker(_) => "broker_error",
            AppError::Store(_) | AppError::TableNotMounted(_) => "table_store_error",
            AppError::MissingKey(_) | AppError::ReservedTableKey(_) => "invalid_table_key",
            AppError::ChangelogAssignmentLeak(_) => "changelog_assignment_leak",
            AppError::Handler(_) => "handler_error",
            _ => "error",
        }
    }
}
