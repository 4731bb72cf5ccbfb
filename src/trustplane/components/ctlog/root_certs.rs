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


//! Roots of trust accepted by the log: `spec.rootCertificates` when set,
//! or every CA certificate Fulcio publishes in the namespace.

use super::FULCIO_CERT_AVAILABLE;
use crate::trustplane::api::common::SecretKeySelector;
use crate::trustplane::api::conditions::Condition;
use crate::trustplane::api::ctlog::CTlog;
use crate::trustplane::cluster::ClusterError;
use crate::trustplane::components::fulcio::FULCIO_CA_LABEL;
use crate::trustplane::components::shared::missing_secrets;
use crate::trustplane::components::SERVER_AVAILABLE;
use crate::trustplane::controller::{Action, ActionContext, ActionFuture, ActionResult, CheckFuture};
use crate::trustplane::events::EventKind;
use crate::trustplane::k8s::meta::LabelSelector;
use crate::trustplane::k8s::secret::Secret;

/// Published CA certificates in `namespace`, ordered by secret name.
pub async fn discover_fulcio_certificates(
    ctx: &ActionContext,
    namespace: &str,
) -> Result<Vec<SecretKeySelector>, ClusterError> {
    let mut found: Vec<SecretKeySelector> = ctx
        .api::<Secret>(namespace)
        .list(&LabelSelector::everything())
        .await?
        .into_iter()
        .filter_map(|secret| {
            let key = secret.metadata.labels.get(FULCIO_CA_LABEL)?;
            Some(SecretKeySelector::new(secret.metadata.name(), key))
        })
        .collect();
    found.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(found)
}

async fn desired_roots(ctx: &ActionContext, ctlog: &CTlog) -> Result<Vec<SecretKeySelector>, ClusterError> {
    if !ctlog.spec.root_certificates.is_empty() {
        return Ok(ctlog.spec.root_certificates.clone());
    }
    discover_fulcio_certificates(ctx, ctlog.metadata.namespace()).await
}

pub struct HandleFulcioCertAction;

impl HandleFulcioCertAction {
    async fn resolve(ctx: &ActionContext, ctlog: &mut CTlog) -> Result<ActionResult, ClusterError> {
        let namespace = ctlog.metadata.namespace().to_string();
        let roots = desired_roots(ctx, ctlog).await?;
        if roots.is_empty() {
            ctlog.status.conditions.set(Condition::pending(
                FULCIO_CERT_AVAILABLE,
                "Waiting for a Fulcio CA certificate",
            ));
            return Ok(ActionResult::Requeue(ctx.settings.deployment_poll_interval));
        }
        let missing = missing_secrets(ctx, &namespace, &roots.iter().collect::<Vec<_>>()).await?;
        if !missing.is_empty() {
            ctlog.status.conditions.set(Condition::pending(
                FULCIO_CERT_AVAILABLE,
                format!("Waiting for secret {}", missing.join(", ")),
            ));
            return Ok(ActionResult::Requeue(ctx.settings.deployment_poll_interval));
        }

        if ctlog.status.root_certificates != roots {
            let names: Vec<&str> = roots.iter().map(|root| root.name.as_str()).collect();
            ctx.record(
                &*ctlog,
                EventKind::Normal,
                "FulcioCertUpdated",
                &format!("Trusting Fulcio certificates from {}", names.join(", ")),
            );
            ctlog.status.root_certificates = roots;
            ctlog
                .status
                .conditions
                .set(Condition::pending(SERVER_AVAILABLE, "Root certificates changed"));
        }
        ctlog
            .status
            .conditions
            .set(Condition::ready(FULCIO_CERT_AVAILABLE, "Root certificates resolved"));
        Ok(ActionResult::StatusChanged)
    }
}

impl Action<CTlog> for HandleFulcioCertAction {
    fn name(&self) -> &'static str {
        "handle-fulcio-cert"
    }

    fn condition(&self) -> &'static str {
        FULCIO_CERT_AVAILABLE
    }

    fn can_handle<'a>(&'a self, ctx: &'a ActionContext, ctlog: &'a CTlog) -> CheckFuture<'a> {
        Box::pin(async move {
            if !ctlog.status.conditions.is_true(FULCIO_CERT_AVAILABLE) {
                return true;
            }
            match desired_roots(ctx, ctlog).await {
                Ok(roots) if roots == ctlog.status.root_certificates => {}
                _ => return true,
            }
            let references: Vec<&SecretKeySelector> = ctlog.status.root_certificates.iter().collect();
            !matches!(
                missing_secrets(ctx, ctlog.metadata.namespace(), &references).await,
                Ok(missing) if missing.is_empty()
            )
        })
    }

    fn handle<'a>(&'a self, ctx: &'a ActionContext, ctlog: &'a mut CTlog) -> ActionFuture<'a> {
        Box::pin(async move {
            match Self::resolve(ctx, ctlog).await {
                Ok(result) => result,
                Err(err) => ActionResult::Failed(err.into()),
            }
        })
    }
}
