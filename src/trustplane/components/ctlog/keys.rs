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


//! Signing key of the log: the user's key pair, or a generated one.

use super::{COMPONENT_NAME, KEYS_AVAILABLE, SECRET_ROLE_LABEL};
use crate::trustplane::api::common::SecretKeySelector;
use crate::trustplane::api::conditions::Condition;
use crate::trustplane::api::ctlog::{CTlog, CTlogSpec, CTlogStatus};
use crate::trustplane::cluster::ClusterError;
use crate::trustplane::components::shared::missing_secrets;
use crate::trustplane::components::SERVER_AVAILABLE;
use crate::trustplane::controller::{
    Action, ActionContext, ActionFuture, ActionResult, CheckFuture, ReconcileError,
};
use crate::trustplane::events::EventKind;
use crate::trustplane::k8s::meta::{labels_for_component, selector_for_component, ObjectMeta};
use crate::trustplane::k8s::resource::Resource;
use crate::trustplane::k8s::secret::Secret;
use crate::trustplane::logger::log_info;
use crate::trustplane::util::keys::generate_key_pair;
use std::collections::BTreeMap;

const COMPONENT: &str = "ctlog-keys";
pub const PRIVATE_KEY: &str = "private";
pub const PUBLIC_KEY: &str = "public";
const KEYS_ROLE: &str = "keys";

/// Key references recorded in the status.
#[derive(Clone, Debug, Default, PartialEq)]
struct KeyRefs {
    private: Option<SecretKeySelector>,
    password: Option<SecretKeySelector>,
    public: Option<SecretKeySelector>,
}

impl KeyRefs {
    fn of_status(status: &CTlogStatus) -> Self {
        Self {
            private: status.private_key_ref.clone(),
            password: status.private_key_password_ref.clone(),
            public: status.public_key_ref.clone(),
        }
    }

    fn of_spec(spec: &CTlogSpec) -> Self {
        Self {
            private: spec.private_key_ref.clone(),
            password: spec.private_key_password_ref.clone(),
            public: spec.public_key_ref.clone(),
        }
    }

    fn generated(secret: &str) -> Self {
        Self {
            private: Some(SecretKeySelector::new(secret, PRIVATE_KEY)),
            password: None,
            public: Some(SecretKeySelector::new(secret, PUBLIC_KEY)),
        }
    }

    fn references(&self) -> Vec<&SecretKeySelector> {
        self.private
            .iter()
            .chain(self.password.iter())
            .chain(self.public.iter())
            .collect()
    }

    fn record(self, status: &mut CTlogStatus) {
        status.private_key_ref = self.private;
        status.private_key_password_ref = self.password;
        status.public_key_ref = self.public;
    }
}

/// Whether the keys recorded in the status satisfy the spec.
fn keys_resolved(spec: &CTlogSpec, status: &CTlogStatus) -> bool {
    let current = KeyRefs::of_status(status);
    if spec.private_key_ref.is_some() {
        return current == KeyRefs::of_spec(spec);
    }
    match &current.private {
        Some(private) => current.password.is_none() && current == KeyRefs::generated(&private.name),
        None => false,
    }
}

/// Key pairs generated for this log, sorted by name.
async fn generated_key_secrets(ctx: &ActionContext, ctlog: &CTlog) -> Result<Vec<Secret>, ClusterError> {
    let selector = selector_for_component(COMPONENT_NAME, ctlog.metadata.name()).with(SECRET_ROLE_LABEL, KEYS_ROLE);
    let uid = ctlog.metadata.uid.as_deref();
    let mut secrets: Vec<Secret> = ctx
        .api::<Secret>(ctlog.metadata.namespace())
        .list(&selector)
        .await?
        .into_iter()
        .filter(|secret| secret.get(PRIVATE_KEY).is_some() && secret.get(PUBLIC_KEY).is_some())
        .filter(|secret| uid.map_or(true, |uid| secret.metadata.is_owned_by(uid)))
        .collect();
    secrets.sort_by(|a, b| a.metadata.name().cmp(b.metadata.name()));
    Ok(secrets)
}

pub struct HandleKeysAction;

impl HandleKeysAction {
    /// The recorded generated pair if it still exists, else one left by an
    /// attempt whose status write was lost, else a new one.
    async fn generated_keys(ctx: &ActionContext, ctlog: &CTlog) -> Result<KeyRefs, ReconcileError> {
        let secrets = generated_key_secrets(ctx, ctlog).await?;
        let recorded = ctlog.status.private_key_ref.as_ref().map(|key| key.name.as_str());
        let reusable = secrets
            .iter()
            .find(|secret| Some(secret.metadata.name()) == recorded)
            .or_else(|| secrets.first());
        if let Some(secret) = reusable {
            return Ok(KeyRefs::generated(secret.metadata.name()));
        }

        let pair = generate_key_pair().map_err(ReconcileError::Crypto)?;
        let mut labels = labels_for_component(COMPONENT_NAME, ctlog.metadata.name());
        labels.insert(SECRET_ROLE_LABEL.to_string(), KEYS_ROLE.to_string());
        let metadata = ObjectMeta::generated(
            ctlog.metadata.namespace(),
            &format!("ctlog-keys-{}-", ctlog.metadata.name()),
        )
        .with_labels(labels)
        .with_owner(ctlog.owner_reference());
        let mut data = BTreeMap::new();
        data.insert(PRIVATE_KEY.to_string(), pair.private_pem);
        data.insert(PUBLIC_KEY.to_string(), pair.public_pem);
        let created = ctx
            .api::<Secret>(ctlog.metadata.namespace())
            .create(&Secret::new(metadata, data))
            .await?;
        let name = created.metadata.name();
        log_info(
            COMPONENT,
            "Generated log signing key",
            &[("ctlog", ctlog.metadata.name()), ("secret", name)],
        );
        ctx.record(
            ctlog,
            EventKind::Normal,
            "CTlogKeysCreated",
            &format!("Signing key secret created: {name}"),
        );
        Ok(KeyRefs::generated(name))
    }

    async fn resolve(ctx: &ActionContext, ctlog: &mut CTlog) -> Result<ActionResult, ReconcileError> {
        let spec = &ctlog.spec;
        let desired = if spec.private_key_ref.is_some() {
            let desired = KeyRefs::of_spec(spec);
            let missing = missing_secrets(ctx, ctlog.metadata.namespace(), &desired.references()).await?;
            if !missing.is_empty() {
                ctlog.status.conditions.set(Condition::pending(
                    KEYS_AVAILABLE,
                    format!("Waiting for secret {}", missing.join(", ")),
                ));
                return Ok(ActionResult::Requeue(ctx.settings.deployment_poll_interval));
            }
            desired
        } else if spec.private_key_password_ref.is_some() || spec.public_key_ref.is_some() {
            return Err(ReconcileError::InvalidConfiguration(
                "privateKeyPasswordRef and publicKeyRef require privateKeyRef".into(),
            ));
        } else {
            Self::generated_keys(ctx, ctlog).await?
        };

        let conditions_changed = !ctlog.status.conditions.is_true(KEYS_AVAILABLE);
        if KeyRefs::of_status(&ctlog.status) != desired {
            desired.record(&mut ctlog.status);
            ctlog
                .status
                .conditions
                .set(Condition::pending(SERVER_AVAILABLE, "Keys changed"));
        } else if !conditions_changed {
            return Ok(ActionResult::Continue);
        }
        ctlog
            .status
            .conditions
            .set(Condition::ready(KEYS_AVAILABLE, "Keys resolved"));
        Ok(ActionResult::StatusChanged)
    }
}

impl Action<CTlog> for HandleKeysAction {
    fn name(&self) -> &'static str {
        "handle-keys"
    }

    fn condition(&self) -> &'static str {
        KEYS_AVAILABLE
    }

    fn can_handle<'a>(&'a self, ctx: &'a ActionContext, ctlog: &'a CTlog) -> CheckFuture<'a> {
        Box::pin(async move {
            if !ctlog.status.conditions.is_true(KEYS_AVAILABLE)
                || !keys_resolved(&ctlog.spec, &ctlog.status)
            {
                return true;
            }
            let current = KeyRefs::of_status(&ctlog.status);
            !matches!(
                missing_secrets(ctx, ctlog.metadata.namespace(), &current.references()).await,
                Ok(missing) if missing.is_empty()
            )
        })
    }

    fn handle<'a>(&'a self, ctx: &'a ActionContext, ctlog: &'a mut CTlog) -> ActionFuture<'a> {
        Box::pin(async move { ActionResult::from(Self::resolve(ctx, ctlog).await) })
    }
}
