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

use super::meta::{LabelSelector, ObjectMeta};
use super::pod::PodTemplateSpec;
use super::resource::impl_resource;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEPLOYMENT_AVAILABLE: &str = "Available";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub selector: LabelSelector,
    #[serde(default)]
    pub template: PodTemplateSpec,
    /// Rollout strategy, revision limits and anything else left to other writers.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(
        rename = "readyReplicas",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub ready_replicas: Option<i32>,
    #[serde(
        rename = "observedGeneration",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<DeploymentCondition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: DeploymentSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeploymentStatus>,
}

impl_resource!(Deployment, "Deployment", "apps/v1");

impl Deployment {
    /// True once the platform reports the `Available` condition for the
    /// current generation of the spec.
    pub fn is_available(&self) -> bool {
        let Some(status) = self.status.as_ref() else {
            return false;
        };
        if let (Some(observed), Some(generation)) =
            (status.observed_generation, self.metadata.generation)
        {
            if observed < generation {
                return false;
            }
        }
        status.conditions.iter().any(|condition| {
            condition.condition_type == DEPLOYMENT_AVAILABLE && condition.status == "True"
        })
    }
}
