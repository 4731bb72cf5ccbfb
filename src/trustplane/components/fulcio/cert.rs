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

//! Certificate authority material for the CA server: either the user's key,
//! password and certificate, or a generated self-signed CA.

use super::{CERT_AVAILABLE, COMPONENT_NAME, FULCIO_CA_LABEL};
use crate::trustplane::api::common::SecretKeySelector;
use crate::trustplane::api::conditions::Condition;
use crate::trustplane::api::fulcio::{Fulcio, FulcioCert};
use crate::trustplane::components::shared::{missing_secrets, secret_value};
use crate::trustplane::components::SERVER_AVAILABLE;
use crate::trustplane::controller::{
    Action, ActionContext, ActionFuture, ActionResult, CheckFuture, ReconcileError,
};
use crate::trustplane::events::EventKind;
use crate::trustplane::k8s::meta::{labels_for_component, ObjectMeta};
use crate::trustplane::k8s::resource::Resource;
use crate::trustplane::k8s::secret::Secret;
use crate::trustplane::logger::log_info;
use crate::trustplane::util::keys::{generate_certificate_authority, random_password, CaSubject};
use std::collections::BTreeMap;

const COMPONENT: &str = "fulcio-cert";
pub const PRIVATE_KEY: &str = "private";
pub const PUBLIC_KEY: &str = "public";
pub const CERT: &str = "cert";
pub const PASSWORD: &str = "password";
const GENERATED_PASSWORD_LENGTH: usize = 24;

fn same_subject(a: &FulcioCert, b: &FulcioCert) -> bool {
    a.organization_name == b.organization_name
        && a.organization_email == b.organization_email
        && a.common_name == b.common_name
}

/// Whether the certificate recorded in the status satisfies the spec.
fn certificate_resolved(spec: &FulcioCert, current: &FulcioCert) -> bool {
    if spec.private_key_ref.is_some() {
        return spec == current;
    }
    if current.private_key_ref.is_none() || !same_subject(spec, current) {
        return false;
    }
    match &spec.private_key_password_ref {
        Some(password_ref) => current.private_key_password_ref.as_ref() == Some(password_ref),
        // A generated key keeps its password next to it.
        None => {
            current.private_key_password_ref.as_ref().map(|p| &p.name)
                == current.private_key_ref.as_ref().map(|k| &k.name)
        }
    }
}

fn certificate_references(certificate: &FulcioCert) -> Vec<&SecretKeySelector> {
    certificate
        .private_key_ref
        .iter()
        .chain(certificate.private_key_password_ref.iter())
        .chain(certificate.ca_ref.iter())
        .collect()
}

pub struct HandleCertAction;

impl HandleCertAction {
    async fn generate(
        ctx: &ActionContext,
        fulcio: &Fulcio,
        password: Option<Vec<u8>>,
    ) -> Result<FulcioCert, ReconcileError> {
        let spec = &fulcio.spec.certificate;
        let generated_password = password.is_none();
        let password = password
            .unwrap_or_else(|| random_password(GENERATED_PASSWORD_LENGTH).into_bytes());
        let subject = CaSubject {
            common_name: &spec.common_name,
            organization: &spec.organization_name,
            email: &spec.organization_email,
        };
        let ca = generate_certificate_authority(&subject, &password).map_err(ReconcileError::Crypto)?;

        let mut data = BTreeMap::new();
        data.insert(PRIVATE_KEY.to_string(), ca.private_pem);
        data.insert(PUBLIC_KEY.to_string(), ca.public_pem);
        data.insert(CERT.to_string(), ca.cert_pem);
        if generated_password {
            data.insert(PASSWORD.to_string(), password);
        }
        let namespace = fulcio.metadata.namespace();
        let mut labels = labels_for_component(COMPONENT_NAME, fulcio.metadata.name());
        labels.insert(FULCIO_CA_LABEL.to_string(), CERT.to_string());
        let metadata = ObjectMeta::generated(namespace, &format!("fulcio-cert-{}-", fulcio.metadata.name()))
            .with_labels(labels)
            .with_owner(fulcio.owner_reference());
        let created = ctx
            .api::<Secret>(namespace)
            .create(&Secret::new(metadata, data))
            .await?;
        let name = created.metadata.name();
        log_info(
            COMPONENT,
            "Generated certificate authority",
            &[("fulcio", fulcio.metadata.name()), ("secret", name)],
        );
        ctx.record(
            fulcio,
            EventKind::Normal,
            "FulcioCertUpdated",
            &format!("Fulcio certificate secret created: {name}"),
        );

        let password_ref = match &spec.private_key_password_ref {
            Some(reference) if !generated_password => reference.clone(),
            _ => SecretKeySelector::new(name, PASSWORD),
        };
        Ok(FulcioCert {
            private_key_ref: Some(SecretKeySelector::new(name, PRIVATE_KEY)),
            private_key_password_ref: Some(password_ref),
            ca_ref: Some(SecretKeySelector::new(name, CERT)),
            ..spec.clone()
        })
    }

    async fn resolve(ctx: &ActionContext, fulcio: &mut Fulcio) -> ActionResult {
        let namespace = fulcio.metadata.namespace().to_string();
        let spec = fulcio.spec.certificate.clone();

        let mut required: Vec<&SecretKeySelector> = Vec::new();
        if let Some(key_ref) = spec.private_key_ref.as_ref() {
            required.push(key_ref);
            match spec.ca_ref.as_ref() {
                Some(ca_ref) => required.push(ca_ref),
                None => {
                    return ActionResult::Failed(ReconcileError::InvalidConfiguration(
                        "caRef is required when privateKeyRef is set".into(),
                    ))
                }
            }
        }
        required.extend(spec.private_key_password_ref.as_ref());
        let missing = match missing_secrets(ctx, &namespace, &required).await {
            Ok(missing) => missing,
            Err(err) => return ActionResult::Failed(err.into()),
        };
        if !missing.is_empty() {
            fulcio.status.conditions.set(Condition::pending(
                CERT_AVAILABLE,
                format!("Waiting for secret {}", missing.join(", ")),
            ));
            return ActionResult::Requeue(ctx.settings.deployment_poll_interval);
        }

        let certificate = if spec.private_key_ref.is_some() {
            spec
        } else {
            let password = match spec.private_key_password_ref.as_ref() {
                Some(selector) => match secret_value(ctx, &namespace, selector).await {
                    Ok(value) => value,
                    Err(err) => return ActionResult::Failed(err.into()),
                },
                None => None,
            };
            match Self::generate(ctx, fulcio, password).await {
                Ok(certificate) => certificate,
                Err(err) => return ActionResult::Failed(err),
            }
        };

        fulcio.status.certificate = Some(certificate);
        let conditions = &mut fulcio.status.conditions;
        conditions.set(Condition::ready(CERT_AVAILABLE, "Certificate resolved"));
        conditions.set(Condition::pending(SERVER_AVAILABLE, "Certificate changed"));
        ActionResult::StatusChanged
    }
}

impl Action<Fulcio> for HandleCertAction {
    fn name(&self) -> &'static str {
        "handle-cert"
    }

    fn condition(&self) -> &'static str {
        CERT_AVAILABLE
    }

    fn can_handle<'a>(&'a self, ctx: &'a ActionContext, fulcio: &'a Fulcio) -> CheckFuture<'a> {
        Box::pin(async move {
            let Some(current) = fulcio.status.certificate.as_ref() else {
                return true;
            };
            if !fulcio.status.conditions.is_true(CERT_AVAILABLE)
                || !certificate_resolved(&fulcio.spec.certificate, current)
            {
                return true;
            }
            let references = certificate_references(current);
            !matches!(
                missing_secrets(ctx, fulcio.metadata.namespace(), &references).await,
                Ok(missing) if missing.is_empty()
            )
        })
    }

    fn handle<'a>(&'a self, ctx: &'a ActionContext, fulcio: &'a mut Fulcio) -> ActionFuture<'a> {
        Box::pin(Self::resolve(ctx, fulcio))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trustplane::api::fulcio::FulcioSpec;
    use crate::trustplane::test_support::Fixture;

    fn fulcio(certificate: FulcioCert) -> Fulcio {
        let mut fulcio = Fulcio::new(
            "ns",
            "fulcio",
            FulcioSpec {
                certificate,
                ..Default::default()
            },
        );
        fulcio.metadata.uid = Some("uid-fulcio".into());
        fulcio
    }

    fn subject() -> FulcioCert {
        FulcioCert {
            organization_name: "MyOrg".into(),
            organization_email: "my@email.com".into(),
            common_name: "local".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn generates_ca_with_generated_password() {
        let fixture = Fixture::new();
        let ctx = fixture.context();
        let mut fulcio = fulcio(subject());

        assert!(HandleCertAction.can_handle(&ctx, &fulcio).await);
        let result = HandleCertAction.handle(&ctx, &mut fulcio).await;
        assert!(matches!(result, ActionResult::StatusChanged));

        let current = fulcio.status.certificate.clone().expect("certificate");
        let key_ref = current.private_key_ref.clone().expect("key");
        assert!(key_ref.name.starts_with("fulcio-cert-fulcio-"));
        assert_eq!(current.private_key_password_ref, Some(SecretKeySelector::new(&key_ref.name, PASSWORD)));
        assert_eq!(current.organization_name, "MyOrg");

        let secret = fixture.api::<Secret>("ns").get(&key_ref.name).await.expect("secret");
        for key in [PRIVATE_KEY, PUBLIC_KEY, CERT, PASSWORD] {
            assert!(secret.get(key).is_some(), "missing {key}");
        }
        assert!(fulcio.status.conditions.is_true(CERT_AVAILABLE));
        assert!(!HandleCertAction.can_handle(&ctx, &fulcio).await);
    }

    #[tokio::test]
    async fn password_reference_must_resolve() {
        let fixture = Fixture::new();
        let ctx = fixture.context();
        let mut fulcio = fulcio(subject());
        HandleCertAction.handle(&ctx, &mut fulcio).await;

        fulcio.spec.certificate.private_key_password_ref =
            Some(SecretKeySelector::new("password-secret", "password"));
        assert!(HandleCertAction.can_handle(&ctx, &fulcio).await);
        let result = HandleCertAction.handle(&ctx, &mut fulcio).await;
        assert!(matches!(result, ActionResult::Requeue(_)));
        assert!(!fulcio.status.conditions.is_true(CERT_AVAILABLE));

        fixture.secret("ns", "password-secret", &[("password", "secret")]).await;
        let result = HandleCertAction.handle(&ctx, &mut fulcio).await;
        assert!(matches!(result, ActionResult::StatusChanged));
        let current = fulcio.status.certificate.clone().expect("certificate");
        assert_eq!(
            current.private_key_password_ref,
            Some(SecretKeySelector::new("password-secret", "password"))
        );
        let generated = fixture
            .api::<Secret>("ns")
            .get(&current.private_key_ref.expect("key").name)
            .await
            .expect("secret");
        assert!(generated.get(PASSWORD).is_none());
        assert!(!HandleCertAction.can_handle(&ctx, &fulcio).await);
    }

    #[tokio::test]
    async fn user_key_requires_ca_reference() {
        let fixture = Fixture::new();
        let ctx = fixture.context();
        let mut fulcio = fulcio(FulcioCert {
            private_key_ref: Some(SecretKeySelector::new("ca", "key")),
            ..subject()
        });
        match HandleCertAction.handle(&ctx, &mut fulcio).await {
            ActionResult::Failed(ReconcileError::InvalidConfiguration(_)) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn user_material_is_copied_once_present() {
        let fixture = Fixture::new();
        let ctx = fixture.context();
        let certificate = FulcioCert {
            private_key_ref: Some(SecretKeySelector::new("ca", "key")),
            private_key_password_ref: Some(SecretKeySelector::new("ca", "password")),
            ca_ref: Some(SecretKeySelector::new("ca", "cert")),
            ..subject()
        };
        let mut fulcio = fulcio(certificate.clone());
        fixture
            .secret("ns", "ca", &[("key", "k"), ("password", "p"), ("cert", "c")])
            .await;
        let result = HandleCertAction.handle(&ctx, &mut fulcio).await;
        assert!(matches!(result, ActionResult::StatusChanged));
        assert_eq!(fulcio.status.certificate, Some(certificate));
        assert!(fixture.recorder.reasons().is_empty());
    }

    #[tokio::test]
    async fn deleted_user_material_reopens_certificate() {
        let fixture = Fixture::new();
        let ctx = fixture.context();
        let mut fulcio = fulcio(FulcioCert {
            private_key_ref: Some(SecretKeySelector::new("ca", "key")),
            ca_ref: Some(SecretKeySelector::new("ca-cert", "cert")),
            ..subject()
        });
        fixture.secret("ns", "ca", &[("key", "k")]).await;
        fixture.secret("ns", "ca-cert", &[("cert", "c")]).await;
        HandleCertAction.handle(&ctx, &mut fulcio).await;
        assert!(!HandleCertAction.can_handle(&ctx, &fulcio).await);

        fixture
            .api::<Secret>("ns")
            .delete("ca-cert")
            .await
            .expect("delete ca");
        assert!(HandleCertAction.can_handle(&ctx, &fulcio).await);
        let result = HandleCertAction.handle(&ctx, &mut fulcio).await;
        assert!(matches!(result, ActionResult::Requeue(_)));
        let condition = fulcio.status.conditions.find(CERT_AVAILABLE).expect("condition");
        assert!(!condition.is_true());
        assert!(condition.message.contains("ca-cert/cert"));
    }

    #[tokio::test]
    async fn deleted_generated_ca_is_regenerated() {
        let fixture = Fixture::new();
        let ctx = fixture.context();
        let mut fulcio = fulcio(subject());
        HandleCertAction.handle(&ctx, &mut fulcio).await;
        let first = fulcio
            .status
            .certificate
            .clone()
            .and_then(|current| current.private_key_ref)
            .expect("key");

        fixture
            .api::<Secret>("ns")
            .delete(&first.name)
            .await
            .expect("delete generated");
        assert!(HandleCertAction.can_handle(&ctx, &fulcio).await);
        let result = HandleCertAction.handle(&ctx, &mut fulcio).await;
        assert!(matches!(result, ActionResult::StatusChanged));
        let second = fulcio
            .status
            .certificate
            .clone()
            .and_then(|current| current.private_key_ref)
            .expect("key");
        assert_ne!(first.name, second.name);
        assert!(!HandleCertAction.can_handle(&ctx, &fulcio).await);
    }
}
