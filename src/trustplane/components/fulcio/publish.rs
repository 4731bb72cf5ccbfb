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


//! Publishes the active CA certificate for components that trust it.

use super::cert::CERT;
use super::{CERT_AVAILABLE, COMPONENT_NAME, FULCIO_CA_LABEL};
use crate::trustplane::api::fulcio::Fulcio;
use crate::trustplane::cluster::ClusterError;
use crate::trustplane::components::shared::secret_value;
use crate::trustplane::controller::{Action, ActionContext, ActionFuture, ActionResult, CheckFuture};
use crate::trustplane::events::EventKind;
use crate::trustplane::k8s::meta::{labels_for_component, LabelSelector, ObjectMeta};
use crate::trustplane::k8s::resource::Resource;
use crate::trustplane::k8s::secret::Secret;
use crate::trustplane::logger::log_info;
use std::collections::BTreeMap;

const COMPONENT: &str = "fulcio-ca";

/// Owned secrets carrying the CA label.
async fn published(ctx: &ActionContext, fulcio: &Fulcio) -> Result<Vec<Secret>, ClusterError> {
    let uid = fulcio.metadata.uid.as_deref();
    Ok(ctx
        .api::<Secret>(fulcio.metadata.namespace())
        .list(&LabelSelector::everything())
        .await?
        .into_iter()
        .filter(|secret| secret.metadata.labels.contains_key(FULCIO_CA_LABEL))
        .filter(|secret| uid.map_or(true, |uid| secret.metadata.is_owned_by(uid)))
        .collect())
}

fn serves(secret: &Secret, cert: &[u8]) -> bool {
    secret
        .metadata
        .labels
        .get(FULCIO_CA_LABEL)
        .and_then(|key| secret.get(key))
        == Some(cert)
}

async fn active_certificate(ctx: &ActionContext, fulcio: &Fulcio) -> Result<Option<Vec<u8>>, ClusterError> {
    let Some(ca_ref) = fulcio
        .status
        .certificate
        .as_ref()
        .and_then(|certificate| certificate.ca_ref.as_ref())
    else {
        return Ok(None);
    };
    secret_value(ctx, fulcio.metadata.namespace(), ca_ref).await
}

/// Keeps exactly one owned secret labelled with [`FULCIO_CA_LABEL`], and it
/// holds the certificate the status references. A generated CA secret is
/// labelled when created; user material is copied into a new secret.
pub struct PublishCaAction;

impl PublishCaAction {
    async fn in_sync(ctx: &ActionContext, fulcio: &Fulcio) -> Result<bool, ClusterError> {
        let Some(cert) = active_certificate(ctx, fulcio).await? else {
            return Ok(true);
        };
        let published = published(ctx, fulcio).await?;
        Ok(published.len() == 1 && serves(&published[0], &cert))
    }

    async fn publish(ctx: &ActionContext, fulcio: &Fulcio) -> Result<ActionResult, ClusterError> {
        let Some(cert) = active_certificate(ctx, fulcio).await? else {
            return Ok(ActionResult::Continue);
        };
        let namespace = fulcio.metadata.namespace();
        let api = ctx.api::<Secret>(namespace);

        let mut kept = false;
        for mut secret in published(ctx, fulcio).await? {
            if !kept && serves(&secret, &cert) {
                kept = true;
                continue;
            }
            secret.metadata.labels.remove(FULCIO_CA_LABEL);
            api.update(&secret).await?;
            log_info(
                COMPONENT,
                "Withdrew superseded CA certificate",
                &[("fulcio", fulcio.metadata.name()), ("secret", secret.metadata.name())],
            );
        }
        if kept {
            return Ok(ActionResult::Continue);
        }

        let mut labels = labels_for_component(COMPONENT_NAME, fulcio.metadata.name());
        labels.insert(FULCIO_CA_LABEL.to_string(), CERT.to_string());
        let metadata = ObjectMeta::generated(namespace, &format!("fulcio-ca-{}-", fulcio.metadata.name()))
            .with_labels(labels)
            .with_owner(fulcio.owner_reference());
        let mut data = BTreeMap::new();
        data.insert(CERT.to_string(), cert);
        let created = api.create(&Secret::new(metadata, data)).await?;
        ctx.record(
            fulcio,
            EventKind::Normal,
            "FulcioCAPublished",
            &format!("CA certificate published in secret {}", created.metadata.name()),
        );
        Ok(ActionResult::Continue)
    }
}

impl Action<Fulcio> for PublishCaAction {
    fn name(&self) -> &'static str {
        "publish-ca"
    }

    fn condition(&self) -> &'static str {
        CERT_AVAILABLE
    }

    fn can_handle<'a>(&'a self, ctx: &'a ActionContext, fulcio: &'a Fulcio) -> CheckFuture<'a> {
        Box::pin(async move {
            fulcio.status.conditions.is_true(CERT_AVAILABLE)
                && !Self::in_sync(ctx, fulcio).await.unwrap_or(false)
        })
    }

    fn handle<'a>(&'a self, ctx: &'a ActionContext, fulcio: &'a mut Fulcio) -> ActionFuture<'a> {
        Box::pin(async move {
            match Self::publish(ctx, fulcio).await {
                Ok(result) => result,
                Err(err) => ActionResult::Failed(err.into()),
            }
        })
    }
}
