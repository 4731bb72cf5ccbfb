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

//! Retrieval of values published by dependencies that may not be reachable
//! yet, such as the public key a freshly started server exposes over HTTP.

use crate::trustplane::config::ControllerSettings;
use crate::trustplane::logger::{log_debug, log_warn};
use crate::trustplane::observability::metrics;
use futures_util::future::BoxFuture;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::time::Duration;

const COMPONENT: &str = "resolver";

#[derive(Debug)]
pub enum ResolveError {
    /// The dependency answered with a non-success status.
    Status { url: String, status: u16 },
    /// The request did not complete.
    Transport { url: String, message: String },
    /// Every attempt failed; carries the last failure.
    Exhausted {
        dependency: String,
        attempts: usize,
        last: Box<ResolveError>,
    },
}

impl ResolveError {
    pub fn last(&self) -> &ResolveError {
        match self {
            ResolveError::Exhausted { last, .. } => last.last(),
            other => other,
        }
    }
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::Status { url, status } => {
                write!(f, "unexpected response status {status} from {url}")
            }
            ResolveError::Transport { url, message } => {
                write!(f, "request to {url} failed: {message}")
            }
            ResolveError::Exhausted {
                dependency,
                attempts,
                last,
            } => write!(
                f,
                "{dependency} unavailable after {attempts} attempts: {last}"
            ),
        }
    }
}

impl Error for ResolveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ResolveError::Exhausted { last, .. } => Some(last.as_ref()),
            _ => None,
        }
    }
}

/// Bounded retry with a delay that grows linearly with the attempt number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &ControllerSettings) -> Self {
        Self {
            attempts: settings.resolver_attempts.max(1),
            base_delay: settings.resolver_base_delay,
        }
    }

    /// Delay slept after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: usize) -> Duration {
        let factor = u32::try_from(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&ControllerSettings::default())
    }
}

/// Runs `operation` until it succeeds or the policy is exhausted. The
/// operation receives the 1-based attempt number.
pub async fn resolve_with_retry<T, F, Fut>(
    dependency: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, ResolveError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, ResolveError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                metrics::record_resolver_attempt(dependency, true);
                let attempt_str = attempt.to_string();
                log_debug(
                    COMPONENT,
                    "Dependency resolved",
                    &[("dependency", dependency), ("attempt", attempt_str.as_str())],
                );
                return Ok(value);
            }
            Err(err) => {
                metrics::record_resolver_attempt(dependency, false);
                let attempt_str = attempt.to_string();
                let error = err.to_string();
                log_warn(
                    COMPONENT,
                    "Dependency not resolved",
                    &[
                        ("dependency", dependency),
                        ("attempt", attempt_str.as_str()),
                        ("error", error.as_str()),
                    ],
                );
                if attempt >= attempts {
                    return Err(ResolveError::Exhausted {
                        dependency: dependency.to_string(),
                        attempts,
                        last: Box::new(err),
                    });
                }
                tokio::time::sleep(policy.delay_after(attempt)).await;
                attempt += 1;
            }
        }
    }
}

/// Fetches a public key document from a running server.
pub trait KeyFetcher: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>, ResolveError>>;
}

pub struct HttpKeyFetcher {
    client: reqwest::Client,
}

impl HttpKeyFetcher {
    pub fn new(request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl KeyFetcher for HttpKeyFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>, ResolveError>> {
        Box::pin(async move {
            let transport = |err: reqwest::Error| ResolveError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            };
            let response = self.client.get(url).send().await.map_err(transport)?;
            let status = response.status();
            if !status.is_success() {
                return Err(ResolveError::Status {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }
            let body = response.bytes().await.map_err(transport)?;
            Ok(body.to_vec())
        })
    }
}

/// Public key endpoint of a log-style server reachable at `host`.
pub fn public_key_url(host: &str, api: &str) -> String {
    format!("http://{host}/api/v1/{api}/publicKey")
}
