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

//! Publishes the log's public key as an immutable secret once the server
//! is up.

use super::signer::{generated_signer_secrets, PRIVATE_KEY, PUBLIC_KEY};
use super::{COMPONENT_NAME, DEPLOYMENT_NAME, PUBLIC_KEY_AVAILABLE, PUBLIC_KEY_LABEL};
use crate::trustplane::api::common::SecretKeySelector;
use crate::trustplane::api::conditions::Condition;
use crate::trustplane::api::rekor::Rekor;
use crate::trustplane::components::SERVER_AVAILABLE;
use crate::trustplane::controller::resolver::{
    public_key_url, resolve_with_retry, HttpKeyFetcher, KeyFetcher, ResolveError, RetryPolicy,
};
use crate::trustplane::controller::{
    Action, ActionContext, ActionFuture, ActionResult, CheckFuture, ReconcileError,
};
use crate::trustplane::events::EventKind;
use crate::trustplane::k8s::meta::{labels_for_component, selector_for_component, ObjectMeta};
use crate::trustplane::k8s::resource::Resource;
use crate::trustplane::k8s::secret::Secret;
use crate::trustplane::logger::log_info;
use std::collections::BTreeMap;
use std::sync::Arc;

const COMPONENT: &str = "rekor-public-key";

pub struct ResolvePublicKeyAction;

impl ResolvePublicKeyAction {
    fn fetcher(ctx: &ActionContext) -> Result<Arc<dyn KeyFetcher>, ReconcileError> {
        if let Some(fetcher) = ctx.dependency::<dyn KeyFetcher>() {
            return Ok(fetcher);
        }
        let fetcher = HttpKeyFetcher::new(ctx.settings.resolver_request_timeout).map_err(|err| {
            ReconcileError::Resolve(ResolveError::Transport {
                url: String::new(),
                message: err.to_string(),
            })
        })?;
        Ok(Arc::new(fetcher))
    }

    async fn fetch(ctx: &ActionContext, rekor: &Rekor) -> Result<Vec<u8>, ReconcileError> {
        let fetcher = Self::fetcher(ctx)?;
        let fetcher: &dyn KeyFetcher = fetcher.as_ref();
        let host = ctx
            .settings
            .service_host(DEPLOYMENT_NAME, rekor.metadata.namespace());
        let url = public_key_url(&host, "log");
        let url = url.as_str();
        let policy = RetryPolicy::from_settings(&ctx.settings);
        Ok(resolve_with_retry(COMPONENT, &policy, move |_| fetcher.fetch(url)).await?)
    }

    /// Deletes generated signer keys other than the active one. Runs only
    /// once the server is up with the active signer mounted.
    async fn prune_superseded_signers(
        ctx: &ActionContext,
        rekor: &Rekor,
        active: Option<&str>,
    ) -> Result<(), ReconcileError> {
        let api = ctx.api::<Secret>(rekor.metadata.namespace());
        for secret in generated_signer_secrets(ctx, rekor).await? {
            let name = secret.metadata.name();
            if Some(name) == active {
                continue;
            }
            match api.delete(name).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err.into()),
            }
            ctx.record(
                rekor,
                EventKind::Normal,
                "SignerKeyDeleted",
                &format!("Superseded signer key deleted: {name}"),
            );
        }
        Ok(())
    }

    async fn resolve(ctx: &ActionContext, rekor: &Rekor) -> Result<SecretKeySelector, ReconcileError> {
        let namespace = rekor.metadata.namespace();
        let api = ctx.api::<Secret>(namespace);
        let labelled: Vec<Secret> = api
            .list(&selector_for_component(COMPONENT_NAME, rekor.metadata.name()))
            .await?
            .into_iter()
            .filter(|secret| secret.metadata.labels.contains_key(PUBLIC_KEY_LABEL))
            .collect();
        let signer_secret = rekor
            .status
            .signer
            .key_ref
            .as_ref()
            .map(|key_ref| key_ref.name.as_str());
        Self::prune_superseded_signers(ctx, rekor, signer_secret).await?;

        // The signer secret carries its own public key.
        if let Some(secret) = labelled
            .iter()
            .find(|secret| Some(secret.metadata.name()) == signer_secret)
        {
            let key = &secret.metadata.labels[PUBLIC_KEY_LABEL];
            return Ok(SecretKeySelector::new(secret.metadata.name(), key));
        }

        let public_key = Self::fetch(ctx, rekor).await?;
        let mut current = None;
        // Only published copies are candidates; signer keys were handled above.
        for secret in labelled.iter().filter(|secret| secret.get(PRIVATE_KEY).is_none()) {
            let key = &secret.metadata.labels[PUBLIC_KEY_LABEL];
            if secret.get(key) == Some(public_key.as_slice()) {
                current = Some(SecretKeySelector::new(secret.metadata.name(), key));
                continue;
            }
            let name = secret.metadata.name();
            match api.delete(name).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err.into()),
            }
            ctx.record(
                rekor,
                EventKind::Normal,
                "PublicKeySecretDeleted",
                &format!("Secret with public key deleted: {name}"),
            );
        }
        if let Some(current) = current {
            return Ok(current);
        }

        let mut labels = labels_for_component(COMPONENT_NAME, rekor.metadata.name());
        labels.insert(PUBLIC_KEY_LABEL.to_string(), PUBLIC_KEY.to_string());
        let metadata = ObjectMeta::generated(namespace, &format!("rekor-public-{}-", rekor.metadata.name()))
            .with_labels(labels)
            .with_owner(rekor.owner_reference());
        let mut data = BTreeMap::new();
        data.insert(PUBLIC_KEY.to_string(), public_key);
        let created = api.create(&Secret::new(metadata, data).immutable()).await?;
        let name = created.metadata.name();
        log_info(
            COMPONENT,
            "Published log public key",
            &[("rekor", rekor.metadata.name()), ("secret", name)],
        );
        ctx.record(
            rekor,
            EventKind::Normal,
            "PublicKeySecretCreated",
            &format!("New Rekor public key created: {name}"),
        );
        Ok(SecretKeySelector::new(name, PUBLIC_KEY))
    }
}

impl Action<Rekor> for ResolvePublicKeyAction {
    fn name(&self) -> &'static str {
        "resolve-public-key"
    }

    fn condition(&self) -> &'static str {
        PUBLIC_KEY_AVAILABLE
    }

    fn can_handle<'a>(&'a self, _ctx: &'a ActionContext, rekor: &'a Rekor) -> CheckFuture<'a> {
        Box::pin(async move {
            rekor.status.conditions.is_true(SERVER_AVAILABLE)
                && (rekor.status.public_key_ref.is_none()
                    || !rekor.status.conditions.is_true(PUBLIC_KEY_AVAILABLE))
        })
    }

    fn handle<'a>(&'a self, ctx: &'a ActionContext, rekor: &'a mut Rekor) -> ActionFuture<'a> {
        Box::pin(async move {
            if let Some(existing) = rekor.status.public_key_ref.clone() {
                let api = ctx.api::<Secret>(rekor.metadata.namespace());
                match api.get_opt(&existing.name).await {
                    Ok(Some(_)) => {
                        rekor.status.conditions.set(Condition::ready(
                            PUBLIC_KEY_AVAILABLE,
                            "Public key published",
                        ));
                        return ActionResult::StatusChanged;
                    }
                    Ok(None) => rekor.status.public_key_ref = None,
                    Err(err) => return ActionResult::Failed(err.into()),
                }
            }
            match Self::resolve(ctx, rekor).await {
                Ok(reference) => {
                    rekor.status.public_key_ref = Some(reference);
                    rekor
                        .status
                        .conditions
                        .set(Condition::ready(PUBLIC_KEY_AVAILABLE, "Public key published"));
                    ActionResult::StatusChanged
                }
                Err(err) => ActionResult::Failed(err),
            }
        })
    }
}
