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

use super::resolver::ResolveError;
use crate::trustplane::cluster::ClusterError;
use crate::trustplane::util::error::BoxError;
use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Failure of a single reconciliation step. None of these are terminal: the
/// resource is retried with backoff until the cause goes away.
#[derive(Debug)]
pub enum ReconcileError {
    Cluster(ClusterError),
    Resolve(ResolveError),
    /// Key or certificate material could not be produced.
    Crypto(BoxError),
    /// The resource asks for something the controller cannot provide.
    InvalidConfiguration(String),
    /// The invocation ran past its deadline.
    Timeout(Duration),
    /// A registered collaborator failed.
    Other(BoxError),
}

impl ReconcileError {
    /// Whether retrying without any change is expected to help.
    pub fn is_transient(&self) -> bool {
        match self {
            ReconcileError::Cluster(err) => !matches!(err, ClusterError::Invalid { .. }),
            ReconcileError::Resolve(_) | ReconcileError::Timeout(_) | ReconcileError::Other(_) => true,
            ReconcileError::Crypto(_) | ReconcileError::InvalidConfiguration(_) => false,
        }
    }
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileError::Cluster(err) => write!(f, "{err}"),
            ReconcileError::Resolve(err) => write!(f, "{err}"),
            ReconcileError::Crypto(err) => write!(f, "key material generation failed: {err}"),
            ReconcileError::InvalidConfiguration(reason) => {
                write!(f, "invalid configuration: {reason}")
            }
            ReconcileError::Timeout(limit) => write!(
                f,
                "reconciliation exceeded {}",
                humantime::format_duration(*limit)
            ),
            ReconcileError::Other(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ReconcileError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReconcileError::Cluster(err) => Some(err),
            ReconcileError::Resolve(err) => Some(err),
            ReconcileError::Crypto(err) | ReconcileError::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<ClusterError> for ReconcileError {
    fn from(err: ClusterError) -> Self {
        ReconcileError::Cluster(err)
    }
}

impl From<ResolveError> for ReconcileError {
    fn from(err: ResolveError) -> Self {
        ReconcileError::Resolve(err)
    }
}

impl From<serde_json::Error> for ReconcileError {
    fn from(err: serde_json::Error) -> Self {
        ReconcileError::Cluster(ClusterError::Serialization(err))
    }
}
