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
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use serde_with::formats::CommaSeparator;
use serde_with::{serde_as, PickFirst, StringWithSeparator};
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

const CHANGELOG_SUFFIX: &str = "__changelog";
const ENV_PREFIX: &str = "STREAMTABLE_";
const ENV_SEPARATOR: &str = "__";
/// Unprefixed variables kept for deployments that already set them.
const PLAIN_ENV_KEYS: [&str; 2] = ["APP_NAME", "CONSUME_TOPICS"];

#[serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub app_name: String,
    /// Accepts a list or a comma separated string.
    #[serde_as(as = "PickFirst<(_, StringWithSeparator::<CommaSeparator, String>)>")]
    pub consume_topics: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub poll_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub abort_timeout: Duration,
    pub recovery: RecoveryConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RecoveryConfig {
    #[serde(with = "humantime_serde")]
    pub poll_timeout: Duration,
    /// Consecutive empty changelog polls after which recovery stops waiting.
    pub empty_polls: u32,
    /// Throwaway polls allowed while changelog assignments settle before seeking.
    pub seek_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_name: "streamtable".to_owned(),
            consume_topics: vec![],
            poll_timeout: Duration::from_secs(5),
            abort_timeout: Duration::from_secs(10),
            recovery: RecoveryConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(3),
            empty_polls: 3,
            seek_retries: 3,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "local_tables".to_owned(),
        }
    }
}

impl AppConfig {
    pub fn new(app_name: &str, consume_topics: &[&str]) -> Self {
        Self {
            app_name: app_name.to_owned(),
            consume_topics: consume_topics.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Loads the defaults, merges the optional TOML file over them and then the
    /// environment. Nested fields use `__`, e.g. `STREAMTABLE_RECOVERY__EMPTY_POLLS`.
    pub async fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Some(path) = path {
            if path.is_file() {
                info!("Loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            } else {
                warn!(
                    "Configuration file not found at path: {}, using defaults.",
                    path.display()
                );
            }
        }

        let figment = figment
            .merge(Env::raw().only(&PLAIN_ENV_KEYS))
            .merge(Env::prefixed(ENV_PREFIX).split(ENV_SEPARATOR));
        let config = Self::extract(figment)?;
        config.validate()?;
        info!("Using config: {config}");
        Ok(config)
    }

    /// Parses a TOML document over the defaults without consulting the environment.
    pub fn from_toml(content: &str) -> Result<Self, AppError> {
        Self::extract(
            Figment::from(Serialized::defaults(AppConfig::default())).merge(Toml::string(content)),
        )
    }

    fn extract(figment: Figment) -> Result<Self, AppError> {
        figment.extract().map_err(|err| {
            error!("Failed to load config: {err}");
            AppError::InvalidConfiguration(err.to_string())
        })
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.app_name.trim().is_empty() {
            return Err(AppError::InvalidConfiguration(
                "app name cannot be empty".to_owned(),
            ));
        }
        if self.consume_topics.is_empty() {
            return Err(AppError::InvalidConfiguration(
                "at least one topic to consume is required".to_owned(),
            ));
        }
        if self.recovery.empty_polls == 0 {
            return Err(AppError::InvalidConfiguration(
                "recovery empty polls must be greater than 0".to_owned(),
            ));
        }
        let changelog_topic = self.changelog_topic();
        if self.consume_topics.contains(&changelog_topic) {
            return Err(AppError::InvalidConfiguration(format!(
                "changelog topic: {changelog_topic} cannot be consumed directly"
            )));
        }
        Ok(())
    }

    pub fn changelog_topic(&self) -> String {
        format!("{}{CHANGELOG_SUFFIX}", self.app_name)
    }
}

impl Display for AppConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{ app_name: {}, consume_topics: {:?}, poll_timeout: {}, abort_timeout: {}, recovery: {}, store: {} }}",
            self.app_name,
            self.consume_topics,
            humantime::format_duration(self.poll_timeout),
            humantime::format_duration(self.abort_timeout),
            self.recovery,
            self.store
        )
    }
}

impl Display for RecoveryConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{ poll_timeout: {}, empty_polls: {}, seek_retries: {} }}",
            humantime::format_duration(self.poll_timeout),
            self.empty_polls,
            self.seek_retries
        )
    }
}

impl Display for StoreConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{ path: {} }}", self.path)
    }
}
