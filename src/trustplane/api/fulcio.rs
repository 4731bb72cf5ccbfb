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

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OidcIssuer {
    #[serde(rename = "issuer")]
    pub issuer: String,
    #[serde(rename = "issuerURL")]
    pub issuer_url: String,
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[serde(rename = "type")]
    pub issuer_type: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulcioConfig {
    #[serde(rename = "oidcIssuers", default)]
    pub oidc_issuers: Vec<OidcIssuer>,
}

/// Certificate authority material. Without `privateKeyRef` the controller
/// generates a key and certificate from the subject fields.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FulcioCert {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub organization_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub organization_email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub common_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_ref: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_password_ref: Option<SecretKeySelector>,
    #[serde(rename = "caRef", default, skip_serializing_if = "Option::is_none")]
    pub ca_ref: Option<SecretKeySelector>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FulcioSpec {
    #[serde(default)]
    pub config: FulcioConfig,
    #[serde(default)]
    pub certificate: FulcioCert,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FulcioStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<FulcioCert>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_config_ref: Option<LocalObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub conditions: Conditions,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Fulcio {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: FulcioSpec,
    #[serde(default)]
    pub status: FulcioStatus,
}

impl_resource!(Fulcio, "Fulcio", API_VERSION);

impl Fulcio {
    pub fn new(namespace: &str, name: &str, spec: FulcioSpec) -> Self {
        Self {
            metadata: ObjectMeta::named(namespace, name),
            spec,
            status: FulcioStatus::default(),
        }
    }
}

impl Reconcilable for Fulcio {
    type Status = FulcioStatus;

    fn status(&self) -> &FulcioStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut FulcioStatus {
        &mut self.status
    }

    fn conditions(&self) -> &Conditions {
        &self.status.conditions
    }

    fn conditions_mut(&mut self) -> &mut Conditions {
        &mut self.status.conditions
    }
}
