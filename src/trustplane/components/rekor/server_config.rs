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

use super::COMPONENT_NAME;
use crate::trustplane::api::common::LocalObjectReference;
use crate::trustplane::api::rekor::Rekor;
use crate::trustplane::components::SERVER_AVAILABLE;
use crate::trustplane::controller::{Action, ActionContext, ActionFuture, ActionResult, CheckFuture};
use crate::trustplane::k8s::configmap::ConfigMap;
use crate::trustplane::k8s::meta::{labels_for_component, ObjectMeta};
use crate::trustplane::k8s::resource::Resource;
use std::collections::BTreeMap;

pub const SHARDING_CONFIG_KEY: &str = "sharding-config.yaml";

/// Keeps the log sharding ConfigMap around. Shards are not managed yet, so
/// the document is empty.
pub struct ShardingConfigAction;

impl Action<Rekor> for ShardingConfigAction {
    fn name(&self) -> &'static str {
        "server-config"
    }

    fn condition(&self) -> &'static str {
        SERVER_AVAILABLE
    }

    fn can_handle<'a>(&'a self, ctx: &'a ActionContext, rekor: &'a Rekor) -> CheckFuture<'a> {
        Box::pin(async move {
            let Some(reference) = rekor.status.server_config_ref.as_ref() else {
                return true;
            };
            let api = ctx.api::<ConfigMap>(rekor.metadata.namespace());
            !matches!(api.get_opt(&reference.name).await, Ok(Some(_)))
        })
    }

    fn handle<'a>(&'a self, ctx: &'a ActionContext, rekor: &'a mut Rekor) -> ActionFuture<'a> {
        Box::pin(async move {
            let metadata = ObjectMeta::generated(rekor.metadata.namespace(), "rekor-sharding-config-")
                .with_labels(labels_for_component(COMPONENT_NAME, rekor.metadata.name()))
                .with_owner(rekor.owner_reference());
            let mut data = BTreeMap::new();
            data.insert(SHARDING_CONFIG_KEY.to_string(), String::new());

            let api = ctx.api::<ConfigMap>(rekor.metadata.namespace());
            match api.create(&ConfigMap::new(metadata, data)).await {
                Ok(created) => {
                    rekor.status.server_config_ref =
                        Some(LocalObjectReference::new(created.metadata.name()));
                    ActionResult::StatusChanged
                }
                Err(err) => ActionResult::Failed(err.into()),
            }
        })
    }
}
