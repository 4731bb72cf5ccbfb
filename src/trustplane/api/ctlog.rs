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
use super::rekor::TrillianService;
use super::Reconcilable;
use crate::trustplane::k8s::meta::ObjectMeta;
use crate::trustplane::k8s::resource::impl_resource;
use serde::{Deserialize, Serialize};

/// Certificate transparency log. Without `privateKeyRef` the controller
/// generates a signing key; without `rootCertificates` it trusts the CA
/// certificates Fulcio publishes in the namespace.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CTlogSpec {
    #[serde(rename = "treeID", default, skip_serializing_if = "Option::is_none")]
    pub tree_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_ref: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_password_ref: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_ref: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub root_certificates: Vec<SecretKeySelector>,
    #[serde(default)]
    pub trillian: TrillianService,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CTlogStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_ref: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_password_ref: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_ref: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub root_certificates: Vec<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_config_ref: Option<LocalObjectReference>,
    #[serde(rename = "treeID", default, skip_serializing_if = "Option::is_none")]
    pub tree_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub conditions: Conditions,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CTlog {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: CTlogSpec,
    #[serde(default)]
    pub status: CTlogStatus,
}

impl_resource!(CTlog, "CTlog", API_VERSION);

impl CTlog {
    pub fn new(namespace: &str, name: &str, spec: CTlogSpec) -> Self {
        Self {
            metadata: ObjectMeta::named(namespace, name),
            spec,
            status: CTlogStatus::default(),
        }
    }
}

impl Reconcilable for CTlog {
    type Status = CTlogStatus;

    fn status(&self) -> &CTlogStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut CTlogStatus {
        &mut self.status
    }

    fn conditions(&self) -> &Conditions {
        &self.status.conditions
    }

    fn conditions_mut(&mut self) -> &mut Conditions {
        &mut self.status.conditions
    }
}
