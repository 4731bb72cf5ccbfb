/*
 * Copyright (C) 2024 The Trustplane Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::trustplane::logger::{log_warn, LogFormat};
use std::env;
use std::str::FromStr;
use std::time::Duration;

const COMPONENT: &str = "config";

/// Tunables read from the environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Config {
    Workers,
    ReconcileTimeout,
    RequeueBaseDelay,
    RequeueMaxDelay,
    ResolverAttempts,
    ResolverBaseDelay,
    ResolverRequestTimeout,
    DeploymentPollInterval,
    ServiceDomain,
    LogFormat,
}

impl Config {
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::Workers => "TRUSTPLANE_WORKERS",
            Config::ReconcileTimeout => "TRUSTPLANE_RECONCILE_TIMEOUT",
            Config::RequeueBaseDelay => "TRUSTPLANE_REQUEUE_BASE_DELAY",
            Config::RequeueMaxDelay => "TRUSTPLANE_REQUEUE_MAX_DELAY",
            Config::ResolverAttempts => "TRUSTPLANE_RESOLVER_ATTEMPTS",
            Config::ResolverBaseDelay => "TRUSTPLANE_RESOLVER_BASE_DELAY",
            Config::ResolverRequestTimeout => "TRUSTPLANE_RESOLVER_REQUEST_TIMEOUT",
            Config::DeploymentPollInterval => "TRUSTPLANE_DEPLOYMENT_POLL_INTERVAL",
            Config::ServiceDomain => "TRUSTPLANE_SERVICE_DOMAIN",
            Config::LogFormat => "TRUSTPLANE_LOG_FORMAT",
        }
    }

    pub fn default_value(&self) -> &'static str {
        match self {
            Config::Workers => "4",
            Config::ReconcileTimeout => "60s",
            Config::RequeueBaseDelay => "1s",
            Config::RequeueMaxDelay => "5m",
            Config::ResolverAttempts => "4",
            Config::ResolverBaseDelay => "1s",
            Config::ResolverRequestTimeout => "10s",
            Config::DeploymentPollInterval => "5s",
            Config::ServiceDomain => "svc",
            Config::LogFormat => "text",
        }
    }

    /// Returns the environment value, or the default when unset or blank.
    pub fn get(&self) -> String {
        match env::var(self.env_var()) {
            Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
            _ => self.default_value().to_string(),
        }
    }

    pub fn get_duration(&self) -> Duration {
        self.parse_or_default(|raw| humantime::parse_duration(raw).map_err(|err| err.to_string()))
    }

    pub fn get_count(&self) -> usize {
        self.parse_or_default(|raw| match raw.parse::<usize>() {
            Ok(0) => Err("must be greater than zero".to_string()),
            Ok(value) => Ok(value),
            Err(err) => Err(err.to_string()),
        })
    }

    fn parse_or_default<T>(&self, parse: impl Fn(&str) -> Result<T, String>) -> T {
        let raw = self.get();
        match parse(&raw) {
            Ok(value) => value,
            Err(reason) => {
                log_warn(
                    COMPONENT,
                    "Ignoring invalid configuration value",
                    &[
                        ("variable", self.env_var()),
                        ("value", raw.as_str()),
                        ("reason", reason.as_str()),
                    ],
                );
                // Defaults are literals above and always parse.
                parse(self.default_value())
                    .unwrap_or_else(|_| panic!("default for {} must parse", self.env_var()))
            }
        }
    }
}

/// Snapshot of the configuration handed to controllers and actions.
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerSettings {
    pub workers: usize,
    pub reconcile_timeout: Duration,
    pub requeue_base_delay: Duration,
    pub requeue_max_delay: Duration,
    pub resolver_attempts: usize,
    pub resolver_base_delay: Duration,
    pub resolver_request_timeout: Duration,
    pub deployment_poll_interval: Duration,
    pub service_domain: String,
    pub log_format: LogFormat,
}

impl ControllerSettings {
    pub fn from_env() -> Self {
        let log_format = LogFormat::from_str(&Config::LogFormat.get()).unwrap_or_else(|reason| {
            log_warn(COMPONENT, "Falling back to text logs", &[("reason", reason.as_str())]);
            LogFormat::Text
        });
        Self {
            workers: Config::Workers.get_count(),
            reconcile_timeout: Config::ReconcileTimeout.get_duration(),
            requeue_base_delay: Config::RequeueBaseDelay.get_duration(),
            requeue_max_delay: Config::RequeueMaxDelay.get_duration(),
            resolver_attempts: Config::ResolverAttempts.get_count(),
            resolver_base_delay: Config::ResolverBaseDelay.get_duration(),
            resolver_request_timeout: Config::ResolverRequestTimeout.get_duration(),
            deployment_poll_interval: Config::DeploymentPollInterval.get_duration(),
            service_domain: Config::ServiceDomain.get(),
            log_format,
        }
    }

    /// In-cluster host name of a service.
    pub fn service_host(&self, service: &str, namespace: &str) -> String {
        format!("{service}.{namespace}.{}", self.service_domain)
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            reconcile_timeout: Duration::from_secs(60),
            requeue_base_delay: Duration::from_secs(1),
            requeue_max_delay: Duration::from_secs(300),
            resolver_attempts: 4,
            resolver_base_delay: Duration::from_secs(1),
            resolver_request_timeout: Duration::from_secs(10),
            deployment_poll_interval: Duration::from_secs(5),
            service_domain: "svc".to_string(),
            log_format: LogFormat::Text,
        }
    }
}
