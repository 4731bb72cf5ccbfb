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

//! Condition ledger carried in every reconciled resource's status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

/// Reason vocabulary shared by every condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionReason {
    Pending,
    Creating,
    Ready,
    Failure,
}

impl ConditionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionReason::Pending => "Pending",
            ConditionReason::Creating => "Creating",
            ConditionReason::Ready => "Ready",
            ConditionReason::Failure => "Failure",
        }
    }

    /// Higher wins when several non-ready conditions feed an aggregate.
    pub(crate) fn severity(&self) -> u8 {
        match self {
            ConditionReason::Ready => 0,
            ConditionReason::Pending => 1,
            ConditionReason::Creating => 2,
            ConditionReason::Failure => 3,
        }
    }
}

impl fmt::Display for ConditionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    pub reason: ConditionReason,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        condition_type: &str,
        status: ConditionStatus,
        reason: ConditionReason,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status,
            reason,
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    pub fn ready(condition_type: &str, message: impl Into<String>) -> Self {
        Self::new(condition_type, ConditionStatus::True, ConditionReason::Ready, message)
    }

    pub fn pending(condition_type: &str, message: impl Into<String>) -> Self {
        Self::new(condition_type, ConditionStatus::False, ConditionReason::Pending, message)
    }

    pub fn creating(condition_type: &str, message: impl Into<String>) -> Self {
        Self::new(condition_type, ConditionStatus::False, ConditionReason::Creating, message)
    }

    pub fn failure(condition_type: &str, message: impl Into<String>) -> Self {
        Self::new(condition_type, ConditionStatus::False, ConditionReason::Failure, message)
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Ordered set of conditions keyed by type.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    /// Upserts by type. The transition time only moves when the status
    /// changes. Returns whether the ledger changed.
    pub fn set(&mut self, condition: Condition) -> bool {
        match self
            .0
            .iter_mut()
            .find(|existing| existing.condition_type == condition.condition_type)
        {
            Some(existing) if existing.status != condition.status => {
                *existing = condition;
                true
            }
            Some(existing) => {
                let changed =
                    existing.reason != condition.reason || existing.message != condition.message;
                existing.reason = condition.reason;
                existing.message = condition.message;
                changed
            }
            None => {
                self.0.push(condition);
                true
            }
        }
    }

    pub fn find(&self, condition_type: &str) -> Option<&Condition> {
        self.0
            .iter()
            .find(|condition| condition.condition_type == condition_type)
    }

    pub fn is_true(&self, condition_type: &str) -> bool {
        self.find(condition_type)
            .map(Condition::is_true)
            .unwrap_or(false)
    }

    pub fn reason(&self, condition_type: &str) -> Option<ConditionReason> {
        self.find(condition_type).map(|condition| condition.reason)
    }

    pub fn remove(&mut self, condition_type: &str) -> bool {
        let before = self.0.len();
        self.0
            .retain(|condition| condition.condition_type != condition_type);
        before != self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}
