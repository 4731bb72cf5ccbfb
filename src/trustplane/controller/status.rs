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

//! Aggregate readiness and status persistence.

use crate::trustplane::api::conditions::{Condition, ConditionReason, Conditions};
use crate::trustplane::api::Reconcilable;
use crate::trustplane::cluster::{Api, ClusterError};

pub const READY: &str = "Ready";

/// Recomputes the aggregate `Ready` condition from the tracked conditions.
///
/// Ready is True only when every tracked condition is True. Otherwise it
/// carries the most severe reason among the tracked conditions that are not
/// True, with a missing condition counting as Pending.
pub fn recompute_ready(conditions: &mut Conditions, tracked: &[&str]) -> bool {
    let mut worst: Option<(ConditionReason, String)> = None;
    for condition_type in tracked {
        let (reason, message) = match conditions.find(condition_type) {
            Some(condition) if condition.is_true() => continue,
            Some(condition) => (
                condition.reason,
                format!("{}: {}", condition.condition_type, condition.message),
            ),
            None => (
                ConditionReason::Pending,
                format!("{condition_type}: waiting to start"),
            ),
        };
        let replace = worst
            .as_ref()
            .map(|(current, _)| reason.severity() > current.severity())
            .unwrap_or(true);
        if replace {
            worst = Some((reason, message));
        }
    }

    let ready = match worst {
        None => Condition::ready(READY, "All components are ready"),
        Some((ConditionReason::Failure, message)) => Condition::failure(READY, message),
        Some((ConditionReason::Creating, message)) => Condition::creating(READY, message),
        Some((_, message)) => Condition::pending(READY, message),
    };
    conditions.set(ready)
}

/// Outcome of writing a status back.
#[derive(Debug, PartialEq, Eq)]
pub enum StatusWrite {
    Unchanged,
    Written,
    /// Someone else wrote the resource first; re-read and try again.
    Conflict,
    /// The resource disappeared mid-flight.
    Gone,
}

/// Persists the status of `resource` if it differs from `original`.
pub async fn persist_status<R: Reconcilable>(
    api: &Api<R>,
    resource: &mut R,
    original: &R::Status,
) -> Result<StatusWrite, ClusterError> {
    if resource.status() == original {
        return Ok(StatusWrite::Unchanged);
    }
    match api.update_status(resource).await {
        Ok(stored) => {
            *resource = stored;
            Ok(StatusWrite::Written)
        }
        Err(err) if err.is_conflict() => Ok(StatusWrite::Conflict),
        Err(err) if err.is_not_found() => Ok(StatusWrite::Gone),
        Err(err) => Err(err),
    }
}
