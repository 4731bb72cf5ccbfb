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

use super::{PUBLIC_KEY_AVAILABLE, PUBLIC_KEY_LABEL, SIGNER_AVAILABLE, COMPONENT_NAME};
use crate::trustplane::api::common::SecretKeySelector;
use crate::trustplane::api::conditions::Condition;
use crate::trustplane::api::rekor::{Rekor, RekorSigner};
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

const COMPONENT: &str = "rekor-signer";
pub const PRIVATE_KEY: &str = "private";
pub const PUBLIC_KEY: &str = "public";

/// Whether the signer recorded in the status satisfies the spec.
fn signer_resolved(spec: &RekorSigner, status: &RekorSigner) -> bool {
    if !spec.uses_secret_key() {
        return spec == status;
    }
    if spec.kms != status.kms {
        return false;
    }
    match &spec.key_ref {
        Some(key_ref) => {
            status.key_ref.as_ref() == Some(key_ref) && status.password_ref == spec.password_ref
        }
        None => status.key_ref.is_some(),
    }
}

fn signer_references(signer: &RekorSigner) -> Vec<&SecretKeySelector> {
    signer.key_ref.iter().chain(signer.password_ref.iter()).collect()
}

/// Key pairs generated for this log, found by label and owner and sorted by
/// name. The status reference is only a cache of one of them.
pub(super) async fn generated_signer_secrets(
    ctx: &ActionContext,
    rekor: &Rekor,
) -> Result<Vec<Secret>, ClusterError> {
    let selector = selector_for_component(COMPONENT_NAME, rekor.metadata.name())
        .with(PUBLIC_KEY_LABEL, PUBLIC_KEY);
    let uid = rekor.metadata.uid.as_deref();
    let mut secrets: Vec<Secret> = ctx
        .api::<Secret>(rekor.metadata.namespace())
        .list(&selector)
        .await?
        .into_iter()
        .filter(|secret| secret.get(PRIVATE_KEY).is_some())
        .filter(|secret| uid.map_or(true, |uid| secret.metadata.is_owned_by(uid)))
        .collect();
    secrets.sort_by(|a, b| a.metadata.name().cmp(b.metadata.name()));
    Ok(secrets)
}

/// Makes sure the log has signing material: the referenced key, an external
/// KMS, or a generated key pair.
pub struct GenerateSignerAction;

impl GenerateSignerAction {
    /// The generated key recorded in the status if it still exists, else one
    /// left behind by an attempt whose status write was lost, else a new one.
    async fn generated_signer(ctx: &ActionContext, rekor: &Rekor) -> Result<RekorSigner, ReconcileError> {
        let kms = rekor.spec.signer.kms.clone();
        let secrets = generated_signer_secrets(ctx, rekor).await?;
        let recorded = rekor
            .status
            .signer
            .key_ref
            .as_ref()
            .filter(|_| rekor.status.signer.kms == kms)
            .map(|key_ref| key_ref.name.as_str());
        let reusable = secrets
            .iter()
            .find(|secret| Some(secret.metadata.name()) == recorded)
            .or_else(|| secrets.first());
        if let Some(secret) = reusable {
            let name = secret.metadata.name();
            if Some(name) != recorded {
                log_info(
                    COMPONENT,
                    "Recovered signer key by label",
                    &[("rekor", rekor.metadata.name()), ("secret", name)],
                );
            }
            return Ok(RekorSigner {
                kms,
                password_ref: None,
                key_ref: Some(SecretKeySelector::new(name, PRIVATE_KEY)),
            });
        }
        Self::generate(ctx, rekor).await
    }

    async fn generate(ctx: &ActionContext, rekor: &Rekor) -> Result<RekorSigner, ReconcileError> {
        let pair = generate_key_pair().map_err(ReconcileError::Crypto)?;
        let mut labels = labels_for_component(COMPONENT_NAME, rekor.metadata.name());
        labels.insert(PUBLIC_KEY_LABEL.to_string(), PUBLIC_KEY.to_string());
        let metadata = ObjectMeta::generated(
            rekor.metadata.namespace(),
            &format!("rekor-signer-{}-", rekor.metadata.name()),
        )
        .with_labels(labels)
        .with_owner(rekor.owner_reference());
        let mut data = BTreeMap::new();
        data.insert(PRIVATE_KEY.to_string(), pair.private_pem);
        data.insert(PUBLIC_KEY.to_string(), pair.public_pem);

        let api = ctx.api::<Secret>(rekor.metadata.namespace());
        let created = api.create(&Secret::new(metadata, data)).await?;
        let name = created.metadata.name().to_string();
        log_info(
            COMPONENT,
            "Generated signer key",
            &[("rekor", rekor.metadata.name()), ("secret", name.as_str())],
        );
        ctx.record(
            rekor,
            EventKind::Normal,
            "SignerKeyCreated",
            &format!("Signer private key created: {name}"),
        );
        Ok(RekorSigner {
            kms: rekor.spec.signer.kms.clone(),
            password_ref: None,
            key_ref: Some(SecretKeySelector::new(&name, PRIVATE_KEY)),
        })
    }
}

impl Action<Rekor> for GenerateSignerAction {
    fn name(&self) -> &'static str {
        "generate-signer"
    }

    fn condition(&self) -> &'static str {
        SIGNER_AVAILABLE
    }

    fn can_handle<'a>(&'a self, ctx: &'a ActionContext, rekor: &'a Rekor) -> CheckFuture<'a> {
        Box::pin(async move {
            if !rekor.status.conditions.is_true(SIGNER_AVAILABLE)
                || !signer_resolved(&rekor.spec.signer, &rekor.status.signer)
            {
                return true;
            }
            // A key secret deleted after resolution sends the signer back
            // through handle.
            let references = signer_references(&rekor.status.signer);
            !matches!(
                missing_secrets(ctx, rekor.metadata.namespace(), &references).await,
                Ok(missing) if missing.is_empty()
            )
        })
    }

    fn handle<'a>(&'a self, ctx: &'a ActionContext, rekor: &'a mut Rekor) -> ActionFuture<'a> {
        Box::pin(async move {
            let spec = rekor.spec.signer.clone();
            let signer = if !spec.uses_secret_key() {
                spec
            } else if spec.key_ref.is_some() {
                let references = signer_references(&spec);
                let missing =
                    match missing_secrets(ctx, rekor.metadata.namespace(), &references).await {
                        Ok(missing) => missing,
                        Err(err) => return ActionResult::Failed(err.into()),
                    };
                if !missing.is_empty() {
                    rekor.status.conditions.set(Condition::pending(
                        SIGNER_AVAILABLE,
                        format!("Waiting for secret {}", missing.join(", ")),
                    ));
                    return ActionResult::Requeue(ctx.settings.deployment_poll_interval);
                }
                spec
            } else {
                match Self::generated_signer(ctx, rekor).await {
                    Ok(signer) => signer,
                    Err(err) => return ActionResult::Failed(err),
                }
            };

            let conditions = &mut rekor.status.conditions;
            if rekor.status.signer != signer {
                rekor.status.public_key_ref = None;
                conditions.set(Condition::pending(
                    PUBLIC_KEY_AVAILABLE,
                    "Waiting for the server to publish the new key",
                ));
                conditions.set(Condition::pending(SERVER_AVAILABLE, "Signer changed"));
                rekor.status.signer = signer;
            }
            conditions.set(Condition::ready(SIGNER_AVAILABLE, "Signer resolved"));
            ActionResult::StatusChanged
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trustplane::api::rekor::{RekorSpec, KMS_MEMORY};
    use crate::trustplane::test_support::Fixture;

    fn with_signer(signer: RekorSigner) -> Rekor {
        let mut rekor = Rekor::new(
            "ns",
            "rekor",
            RekorSpec {
                signer,
                ..Default::default()
            },
        );
        rekor.metadata.uid = Some("uid-rekor".into());
        rekor
    }

    #[test]
    fn resolution_rules() {
        let key = SecretKeySelector::new("secret", "private");
        let user = RekorSigner {
            key_ref: Some(key.clone()),
            ..Default::default()
        };
        assert!(signer_resolved(&user, &user));
        assert!(!signer_resolved(&user, &RekorSigner::default()));

        let generated = RekorSigner {
            key_ref: Some(SecretKeySelector::new("rekor-signer-rekor-abcde", "private")),
            ..Default::default()
        };
        assert!(signer_resolved(&RekorSigner::default(), &generated));
        assert!(!signer_resolved(&RekorSigner::default(), &RekorSigner::default()));

        let kms = RekorSigner {
            kms: "awskms://key".into(),
            ..Default::default()
        };
        assert!(!signer_resolved(&kms, &generated));
        assert!(signer_resolved(&kms, &kms));
    }

    #[tokio::test]
    async fn generates_key_when_none_referenced() {
        let fixture = Fixture::new();
        let ctx = fixture.context();
        let mut rekor = with_signer(RekorSigner::default());

        assert!(GenerateSignerAction.can_handle(&ctx, &rekor).await);
        let result = GenerateSignerAction.handle(&ctx, &mut rekor).await;
        assert!(matches!(result, ActionResult::StatusChanged));

        let key_ref = rekor.status.signer.key_ref.clone().expect("key ref");
        assert!(key_ref.name.starts_with("rekor-signer-rekor-"));
        assert_eq!(key_ref.key, PRIVATE_KEY);
        assert!(rekor.status.signer.password_ref.is_none());
        assert!(rekor.status.conditions.is_true(SIGNER_AVAILABLE));
        assert!(!rekor.status.conditions.is_true(SERVER_AVAILABLE));

        let secret = fixture
            .api::<Secret>("ns")
            .get(&key_ref.name)
            .await
            .expect("signer secret");
        assert_eq!(secret.metadata.labels.get(PUBLIC_KEY_LABEL).map(String::as_str), Some(PUBLIC_KEY));
        assert!(secret.get(PRIVATE_KEY).is_some());
        assert!(!GenerateSignerAction.can_handle(&ctx, &rekor).await);
        assert_eq!(fixture.recorder.reasons(), vec!["SignerKeyCreated"]);
    }

    #[tokio::test]
    async fn waits_for_referenced_secret() {
        let fixture = Fixture::new();
        let ctx = fixture.context();
        let mut rekor = with_signer(RekorSigner {
            key_ref: Some(SecretKeySelector::new("my-key", "private")),
            ..Default::default()
        });

        let result = GenerateSignerAction.handle(&ctx, &mut rekor).await;
        assert!(matches!(result, ActionResult::Requeue(_)));
        let condition = rekor.status.conditions.find(SIGNER_AVAILABLE).expect("condition");
        assert!(condition.message.contains("my-key/private"));

        fixture.secret("ns", "my-key", &[("private", "pem")]).await;
        let result = GenerateSignerAction.handle(&ctx, &mut rekor).await;
        assert!(matches!(result, ActionResult::StatusChanged));
        assert_eq!(rekor.status.signer, rekor.spec.signer);
        assert!(rekor.status.conditions.is_true(SIGNER_AVAILABLE));
    }

    #[tokio::test]
    async fn key_change_clears_public_key() {
        let fixture = Fixture::new();
        let ctx = fixture.context();
        fixture.secret("ns", "new-key", &[("private", "pem")]).await;
        let mut rekor = with_signer(RekorSigner {
            key_ref: Some(SecretKeySelector::new("new-key", "private")),
            ..Default::default()
        });
        rekor.status.signer.key_ref = Some(SecretKeySelector::new("old-key", "private"));
        rekor.status.public_key_ref = Some(SecretKeySelector::new("rekor-public-x", "public"));
        rekor.status.conditions.set(Condition::ready(SIGNER_AVAILABLE, "ok"));

        assert!(GenerateSignerAction.can_handle(&ctx, &rekor).await);
        GenerateSignerAction.handle(&ctx, &mut rekor).await;
        assert!(rekor.status.public_key_ref.is_none());
        assert_eq!(
            rekor.status.signer.key_ref.as_ref().map(|key| key.name.as_str()),
            Some("new-key")
        );
    }

    #[tokio::test]
    async fn memory_signer_needs_no_secret() {
        let fixture = Fixture::new();
        let ctx = fixture.context();
        let mut rekor = with_signer(RekorSigner {
            kms: KMS_MEMORY.into(),
            ..Default::default()
        });
        let result = GenerateSignerAction.handle(&ctx, &mut rekor).await;
        assert!(matches!(result, ActionResult::StatusChanged));
        assert_eq!(rekor.status.signer.kms, KMS_MEMORY);
        assert!(rekor.status.signer.key_ref.is_none());
        assert!(fixture.recorder.reasons().is_empty());
    }

    #[tokio::test]
    async fn deleted_key_secret_reopens_signer() {
        let fixture = Fixture::new();
        let ctx = fixture.context();
        fixture.secret("ns", "my-key", &[("private", "pem")]).await;
        let mut rekor = with_signer(RekorSigner {
            key_ref: Some(SecretKeySelector::new("my-key", "private")),
            ..Default::default()
        });
        GenerateSignerAction.handle(&ctx, &mut rekor).await;
        assert!(rekor.status.conditions.is_true(SIGNER_AVAILABLE));
        assert!(!GenerateSignerAction.can_handle(&ctx, &rekor).await);

        fixture
            .api::<Secret>("ns")
            .delete("my-key")
            .await
            .expect("delete key");
        assert!(GenerateSignerAction.can_handle(&ctx, &rekor).await);
        let result = GenerateSignerAction.handle(&ctx, &mut rekor).await;
        assert!(matches!(result, ActionResult::Requeue(_)));
        let condition = rekor.status.conditions.find(SIGNER_AVAILABLE).expect("condition");
        assert!(!condition.is_true());
        assert!(condition.message.contains("my-key/private"));
    }

    #[tokio::test]
    async fn lost_status_reference_is_recovered_by_label() {
        let fixture = Fixture::new();
        let ctx = fixture.context();
        let mut rekor = with_signer(RekorSigner::default());
        GenerateSignerAction.handle(&ctx, &mut rekor).await;
        let generated = rekor.status.signer.key_ref.clone().expect("key ref");

        let mut fresh = with_signer(RekorSigner::default());
        assert!(GenerateSignerAction.can_handle(&ctx, &fresh).await);
        let result = GenerateSignerAction.handle(&ctx, &mut fresh).await;
        assert!(matches!(result, ActionResult::StatusChanged));
        assert_eq!(fresh.status.signer.key_ref, Some(generated));
        assert_eq!(fixture.recorder.reasons(), vec!["SignerKeyCreated"]);
        let secrets = generated_signer_secrets(&ctx, &fresh).await.expect("list");
        assert_eq!(secrets.len(), 1);
    }

    #[tokio::test]
    async fn deleted_generated_key_is_replaced() {
        let fixture = Fixture::new();
        let ctx = fixture.context();
        let mut rekor = with_signer(RekorSigner::default());
        GenerateSignerAction.handle(&ctx, &mut rekor).await;
        let first = rekor.status.signer.key_ref.clone().expect("key ref");
        rekor.status.conditions.set(Condition::ready(SERVER_AVAILABLE, "up"));

        fixture
            .api::<Secret>("ns")
            .delete(&first.name)
            .await
            .expect("delete key");
        assert!(GenerateSignerAction.can_handle(&ctx, &rekor).await);
        GenerateSignerAction.handle(&ctx, &mut rekor).await;
        let second = rekor.status.signer.key_ref.clone().expect("key ref");
        assert_ne!(first.name, second.name);
        assert!(!rekor.status.conditions.is_true(SERVER_AVAILABLE));
        assert_eq!(
            fixture.recorder.reasons(),
            vec!["SignerKeyCreated", "SignerKeyCreated"]
        );
    }
}
