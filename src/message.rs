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

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;

/// `TopicPartition` identifies a single partition of a topic, optionally with an offset.
///
/// The offset is used when assigning a partition at a given position, when seeking,
/// and when registering consumed offsets against a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
    pub offset: Option<u64>,
}

impl TopicPartition {
    pub fn new(topic: &str, partition: u32) -> Self {
        Self {
            topic: topic.to_owned(),
            partition,
            offset: None,
        }
    }

    pub fn with_offset(topic: &str, partition: u32, offset: u64) -> Self {
        Self {
            topic: topic.to_owned(),
            partition,
            offset: Some(offset),
        }
    }

    /// Returns true if both refer to the same topic and partition, ignoring offsets.
    pub fn same_partition(&self, other: &TopicPartition) -> bool {
        self.topic == other.topic && self.partition == other.partition
    }
}

impl Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.offset {
            Some(offset) => write!(f, "{}[{}]@{offset}", self.topic, self.partition),
            None => write!(f, "{}[{}]", self.topic, self.partition),
        }
    }
}

/// A single consumed record. Owned by the transaction it was handed to.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Option<Bytes>,
    /// `None` is a tombstone.
    pub value: Option<Bytes>,
    pub headers: Vec<(String, Bytes)>,
}

impl Message {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(&self.topic, self.partition)
    }

    /// Decodes the raw headers into a map, later entries win on duplicate names.
    pub fn headers_map(&self) -> HashMap<String, String> {
        decode_headers(&self.headers)
    }
}

/// A record to be produced within a broker transaction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OutputRecord {
    pub topic: String,
    /// When not set, the broker picks the partition from the key.
    pub partition: Option<u32>,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<(String, Bytes)>,
}

impl OutputRecord {
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_owned(),
            ..Default::default()
        }
    }

    pub fn partition(self, partition: u32) -> Self {
        Self {
            partition: Some(partition),
            ..self
        }
    }

    pub fn key(self, key: impl Into<Bytes>) -> Self {
        Self {
            key: Some(key.into()),
            ..self
        }
    }

    pub fn value(self, value: impl Into<Bytes>) -> Self {
        Self {
            value: Some(value.into()),
            ..self
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<Bytes>) -> Self {
        self.headers.push((name.to_owned(), value.into()));
        self
    }

    /// Adds the given headers unless a header with the same name is already set.
    pub(crate) fn inherit_headers(&mut self, headers: &[(String, Bytes)]) {
        let inherited = headers
            .iter()
            .filter(|(name, _)| !self.headers.iter().any(|(own, _)| own == name))
            .cloned()
            .collect::<Vec<_>>();
        if inherited.is_empty() {
            return;
        }

        let own = std::mem::take(&mut self.headers);
        self.headers = inherited;
        self.headers.extend(own);
    }
}

pub fn decode_headers(headers: &[(String, Bytes)]) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| (name.clone(), String::from_utf8_lossy(value).into_owned()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_should_be_decoded_into_map() {
        let message = Message {
            topic: "orders".to_owned(),
            partition: 0,
            offset: 7,
            key: Some(Bytes::from_static(b"A")),
            value: None,
            headers: vec![
                ("guid".to_owned(), Bytes::from_static(b"123")),
                ("source".to_owned(), Bytes::from_static(b"crm")),
            ],
        };

        let headers = message.headers_map();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers["guid"], "123");
        assert_eq!(headers["source"], "crm");
    }

    #[test]
    fn inherited_headers_should_not_override_explicit_ones() {
        let mut record = OutputRecord::new("out").header("guid", "explicit");
        record.inherit_headers(&[
            ("guid".to_owned(), Bytes::from_static(b"source")),
            ("trace".to_owned(), Bytes::from_static(b"t1")),
        ]);

        let headers = decode_headers(&record.headers);
        assert_eq!(headers["guid"], "explicit");
        assert_eq!(headers["trace"], "t1");
        assert_eq!(record.headers[0].0, "trace");
    }

    #[test]
    fn topic_partition_should_display_offset_when_present() {
        assert_eq!(TopicPartition::new("t", 3).to_string(), "t[3]");
        assert_eq!(TopicPartition::with_offset("t", 3, 9).to_string(), "t[3]@9");
    }
}
