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
use crate::trustplane::api::conditions::Condition;
use crate::trustplane::api::fulcio::{Fulcio, FulcioConfig};
use crate::trustplane::cluster::ClusterError;
use crate::trustplane::components::SERVER_AVAILABLE;
use crate::trustplane::controller::{
    Action, ActionContext, ActionFuture, ActionResult, CheckFuture, ReconcileError,
};
use crate::trustplane::events::EventKind;
use crate::trustplane::k8s::configmap::ConfigMap;
use crate::trustplane::k8s::meta::{labels_for_component, selector_for_component, ObjectMeta};
use crate::trustplane::k8s::resource::Resource;
use crate::trustplane::logger::{log_debug, log_info};
use serde::Serialize;
use std::collections::BTreeMap;

const COMPONENT: &str = "fulcio-config";
pub const CONFIG_KEY: &str = "config.json";

#[derive(Serialize)]
struct ServerIssuer<'a> {
    #[serde(rename = "IssuerURL")]
    issuer_url: &'a str,
    #[serde(rename = "ClientID")]
    client_id: &'a str,
    #[serde(rename = "Type")]
    issuer_type: &'a str,
}

#[derive(Serialize)]
struct ServerConfig<'a> {
    #[serde(rename = "OIDCIssuers")]
    oidc_issuers: BTreeMap<&'a str, ServerIssuer<'a>>,
}

/// Renders the server's `config.json`. Issuers are keyed by URL, so the
/// output is stable regardless of the order they are listed in.
pub fn render_config(config: &FulcioConfig) -> Result<String, serde_json::Error> {
    let oidc_issuers = config
        .oidc_issuers
        .iter()
        .map(|issuer| {
            (
                issuer.issuer_url.as_str(),
                ServerIssuer {
                    issuer_url: &issuer.issuer_url,
                    client_id: &issuer.client_id,
                    issuer_type: &issuer.issuer_type,
                },
            )
        })
        .collect();
    serde_json::to_string(&ServerConfig { oidc_issuers })
}

/// ConfigMaps this controller rendered for `fulcio`, found by label and owner.
async fn rendered_config_maps(ctx: &ActionContext, fulcio: &Fulcio) -> Result<Vec<ConfigMap>, ClusterError> {
    let uid = fulcio.metadata.uid.as_deref();
    Ok(ctx
        .api::<ConfigMap>(fulcio.metadata.namespace())
        .list(&selector_for_component(COMPONENT_NAME, fulcio.metadata.name()))
        .await?
        .into_iter()
        .filter(|cm| uid.map_or(true, |uid| cm.metadata.is_owned_by(uid)))
        .collect())
}

/// Publishes the issuer configuration. A content change produces a ConfigMap
/// with a new name so the deployment template changes with it. The replaced
/// ConfigMap stays until [`PruneServerConfigAction`] sees the new server up.
pub struct ServerConfigAction;

impl ServerConfigAction {
    async fn current(ctx: &ActionContext, fulcio: &Fulcio) -> Result<Option<ConfigMap>, ReconcileError> {
        let Some(reference) = fulcio.status.server_config_ref.as_ref() else {
            return Ok(None);
        };
        Ok(ctx
            .api::<ConfigMap>(fulcio.metadata.namespace())
            .get_opt(&reference.name)
            .await?)
    }

    async fn apply(ctx: &ActionContext, fulcio: &mut Fulcio) -> Result<ActionResult, ReconcileError> {
        let rendered = render_config(&fulcio.spec.config)?;
        let current = Self::current(ctx, fulcio).await?;
        if current
            .as_ref()
            .and_then(|cm| cm.data.get(CONFIG_KEY))
            .is_some_and(|data| *data == rendered)
        {
            return Ok(ActionResult::Continue);
        }

        // A ConfigMap with this content may exist from an invocation whose
        // status write was lost.
        let existing = rendered_config_maps(ctx, fulcio)
            .await?
            .into_iter()
            .find(|cm| cm.data.get(CONFIG_KEY) == Some(&rendered));
        let name = match existing {
            Some(cm) => {
                let name = cm.metadata.name().to_string();
                log_debug(COMPONENT, "Reusing rendered server config", &[("configmap", name.as_str())]);
                name
            }
            None => {
                let namespace = fulcio.metadata.namespace().to_string();
                let metadata = ObjectMeta::generated(&namespace, "fulcio-server-config-")
                    .with_labels(labels_for_component(COMPONENT_NAME, fulcio.metadata.name()))
                    .with_owner(fulcio.owner_reference());
                let mut data = BTreeMap::new();
                data.insert(CONFIG_KEY.to_string(), rendered);
                let created = ctx
                    .api::<ConfigMap>(&namespace)
                    .create(&ConfigMap::new(metadata, data))
                    .await?;
                let name = created.metadata.name().to_string();
                ctx.record(
                    &*fulcio,
                    EventKind::Normal,
                    "FulcioConfigUpdated",
                    &format!("Server config created: {name}"),
                );
                name
            }
        };
        fulcio.status.server_config_ref = Some(LocalObjectReference::new(&name));
        fulcio
            .status
            .conditions
            .set(Condition::pending(SERVER_AVAILABLE, "Server config changed"));
        Ok(ActionResult::StatusChanged)
    }
}

impl Action<Fulcio> for ServerConfigAction {
    fn name(&self) -> &'static str {
        "server-config"
    }

    fn condition(&self) -> &'static str {
        SERVER_AVAILABLE
    }

    fn can_handle<'a>(&'a self, ctx: &'a ActionContext, fulcio: &'a Fulcio) -> CheckFuture<'a> {
        Box::pin(async move {
            let Ok(rendered) = render_config(&fulcio.spec.config) else {
                return true;
            };
            match Self::current(ctx, fulcio).await {
                Ok(Some(cm)) => cm.data.get(CONFIG_KEY) != Some(&rendered),
                _ => true,
            }
        })
    }

    fn handle<'a>(&'a self, ctx: &'a ActionContext, fulcio: &'a mut Fulcio) -> ActionFuture<'a> {
        Box::pin(async move { ActionResult::from(Self::apply(ctx, fulcio).await) })
    }
}

/// Deletes replaced server configs once the server runs with the one the
/// status references.
pub struct PruneServerConfigAction;

impl PruneServerConfigAction {
    async fn stale(ctx: &ActionContext, fulcio: &Fulcio) -> Result<Vec<ConfigMap>, ClusterError> {
        let Some(reference) = fulcio.status.server_config_ref.as_ref() else {
            return Ok(Vec::new());
        };
        Ok(rendered_config_maps(ctx, fulcio)
            .await?
            .into_iter()
            .filter(|cm| cm.metadata.name() != reference.name)
            .collect())
    }
}

impl Action<Fulcio> for PruneServerConfigAction {
    fn name(&self) -> &'static str {
        "prune-config"
    }

    fn condition(&self) -> &'static str {
        SERVER_AVAILABLE
    }

    fn can_handle<'a>(&'a self, ctx: &'a ActionContext, fulcio: &'a Fulcio) -> CheckFuture<'a> {
        Box::pin(async move {
            fulcio.status.conditions.is_true(SERVER_AVAILABLE)
                && Self::stale(ctx, fulcio)
                    .await
                    .map_or(true, |stale| !stale.is_empty())
        })
    }

    fn handle<'a>(&'a self, ctx: &'a ActionContext, fulcio: &'a mut Fulcio) -> ActionFuture<'a> {
        Box::pin(async move {
            let stale = match Self::stale(ctx, fulcio).await {
                Ok(stale) => stale,
                Err(err) => return ActionResult::Failed(err.into()),
            };
            let api = ctx.api::<ConfigMap>(fulcio.metadata.namespace());
            for cm in stale {
                match api.delete(cm.metadata.name()).await {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => continue,
                    Err(err) => return ActionResult::Failed(err.into()),
                }
                log_info(
                    COMPONENT,
                    "Removed replaced server config",
                    &[("fulcio", fulcio.metadata.name()), ("configmap", cm.metadata.name())],
                );
            }
            ActionResult::Continue
        })
    }
}
