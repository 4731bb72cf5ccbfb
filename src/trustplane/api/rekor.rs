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

use super::common::{LocalObjectReference, SecretKeySelector, API_VERSION};
use super::conditions::Conditions;
use super::Reconcilable;
use crate::trustplane::k8s::meta::ObjectMeta;
use crate::trustplane::k8s::resource::impl_resource;
use serde::{Deserialize, Serialize};

pub const KMS_SECRET: &str = "secret";
pub const KMS_MEMORY: &str = "memory";

/// Signing backend of the transparency log. `kms` is `secret` (key held in a
/// secret), `memory` (ephemeral key) or a KMS URI.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RekorSigner {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kms: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_ref: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_ref: Option<SecretKeySelector>,
}

impl RekorSigner {
    pub fn uses_secret_key(&self) -> bool {
        self.kms.is_empty() || self.kms == KMS_SECRET
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrillianService {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RekorSpec {
    #[serde(default)]
    pub signer: RekorSigner,
    #[serde(rename = "treeID", default, skip_serializing_if = "Option::is_none")]
    pub tree_id: Option<i64>,
    #[serde(default)]
    pub trillian: TrillianService,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RekorStatus {
    #[serde(default)]
    pub signer: RekorSigner,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_config_ref: Option<LocalObjectReference>,
    #[serde(rename = "treeID", default, skip_serializing_if = "Option::is_none")]
    pub tree_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_ref: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub conditions: Conditions,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Rekor {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: RekorSpec,
    #[serde(default)]
    pub status: RekorStatus,
}

impl_resource!(Rekor, "Rekor", API_VERSION);

impl Rekor {
    pub fn new(namespace: &str, name: &str, spec: RekorSpec) -> Self {
        Self {
            metadata: ObjectMeta::named(namespace, name),
            spec,
            status: RekorStatus::default(),
        }
    }
}

impl Reconcilable for Rekor {
    type Status = RekorStatus;

    fn status(&self) -> &RekorStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut RekorStatus {
        &mut self.status
    }

    fn conditions(&self) -> &Conditions {
        &self.status.conditions
    }

    fn conditions_mut(&mut self) -> &mut Conditions {
        &mut self.status.conditions
    }
}
