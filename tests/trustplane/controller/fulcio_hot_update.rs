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

use trustplane::trustplane::api::common::SecretKeySelector;
use trustplane::trustplane::cluster::memory::Operation;
use trustplane::trustplane::cluster::ClusterError;
use trustplane::trustplane::api::conditions::ConditionReason;
use trustplane::trustplane::api::fulcio::{Fulcio, FulcioCert, FulcioConfig, FulcioSpec, OidcIssuer};
use trustplane::trustplane::components::fulcio::server_config::CONFIG_KEY;
use trustplane::trustplane::components::fulcio::{self, CERT_AVAILABLE, DEPLOYMENT_NAME};
use trustplane::trustplane::controller::status::READY;
use trustplane::trustplane::controller::{Controller, ReconcileAction};
use trustplane::trustplane::k8s::configmap::ConfigMap;
use trustplane::trustplane::k8s::deployment::Deployment;
use trustplane::trustplane::k8s::meta::{selector_for_component, ObjectKey};
use trustplane::trustplane::k8s::pod::Volume;
use trustplane::trustplane::k8s::resource::Resource;
use trustplane::trustplane::test_support::Fixture;

const NAMESPACE: &str = "tas";
const NAME: &str = "fulcio";

fn issuer(url: &str) -> OidcIssuer {
    OidcIssuer {
        issuer: url.into(),
        issuer_url: url.into(),
        client_id: url.into(),
        issuer_type: "email".into(),
    }
}

fn spec() -> FulcioSpec {
    FulcioSpec {
        config: FulcioConfig {
            oidc_issuers: vec![issuer("test")],
        },
        certificate: FulcioCert {
            organization_name: "MyOrg".into(),
            organization_email: "my@email.com".into(),
            common_name: "local".into(),
            ..Default::default()
        },
    }
}

struct Harness {
    fixture: Fixture,
    controller: Controller<Fulcio>,
    key: ObjectKey,
}

impl Harness {
    async fn ready() -> Self {
        let fixture = Fixture::new();
        let controller = fulcio::controller(fixture.context());
        fixture
            .api::<Fulcio>(NAMESPACE)
            .create(&Fulcio::new(NAMESPACE, NAME, spec()))
            .await
            .expect("create fulcio");
        let harness = Self {
            fixture,
            controller,
            key: ObjectKey::new(Fulcio::KIND, NAMESPACE, NAME),
        };
        assert!(matches!(harness.settle().await, ReconcileAction::RequeueAfter(_)));
        harness.available().await;
        assert!(harness.fulcio().await.status.conditions.is_true(READY));
        harness
    }

    async fn settle(&self) -> ReconcileAction {
        self.fixture
            .settle(&self.controller, &self.key)
            .await
            .expect("settle")
    }

    async fn available(&self) {
        self.fixture
            .mark_available(NAMESPACE, DEPLOYMENT_NAME)
            .await
            .expect("mark available");
        assert_eq!(self.settle().await, ReconcileAction::Done);
    }

    async fn fulcio(&self) -> Fulcio {
        self.fixture
            .api::<Fulcio>(NAMESPACE)
            .get(NAME)
            .await
            .expect("get fulcio")
    }

    async fn edit(&self, change: impl FnOnce(&mut Fulcio)) {
        let mut fulcio = self.fulcio().await;
        change(&mut fulcio);
        self.fixture
            .api::<Fulcio>(NAMESPACE)
            .update(&fulcio)
            .await
            .expect("update fulcio");
    }

    /// Names of the rendered server ConfigMaps, sorted.
    async fn config_maps(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .fixture
            .api::<ConfigMap>(NAMESPACE)
            .list(&selector_for_component(fulcio::COMPONENT_NAME, NAME))
            .await
            .expect("list configmaps")
            .into_iter()
            .map(|cm| cm.metadata.name().to_string())
            .collect();
        names.sort();
        names
    }

    async fn volumes(&self) -> Vec<Volume> {
        self.fixture
            .api::<Deployment>(NAMESPACE)
            .get(DEPLOYMENT_NAME)
            .await
            .expect("deployment")
            .spec
            .template
            .spec
            .volumes
    }
}

#[tokio::test]
async fn password_rotation_waits_for_secret_then_redeploys() {
    let harness = Harness::ready().await;
    let initial_volumes = harness.volumes().await;

    harness
        .edit(|fulcio| {
            fulcio.spec.certificate.private_key_password_ref =
                Some(SecretKeySelector::new("password-secret", "password"));
        })
        .await;
    assert!(matches!(harness.settle().await, ReconcileAction::RequeueAfter(_)));
    let pending = harness.fulcio().await;
    assert_eq!(pending.status.conditions.reason(READY), Some(ConditionReason::Pending));
    assert_eq!(
        pending.status.conditions.reason(CERT_AVAILABLE),
        Some(ConditionReason::Pending)
    );
    assert_eq!(harness.volumes().await, initial_volumes);

    harness
        .fixture
        .secret(NAMESPACE, "password-secret", &[("password", "secret")])
        .await;
    assert!(matches!(harness.settle().await, ReconcileAction::RequeueAfter(_)));
    let rotated = harness.fulcio().await;
    let certificate = rotated.status.certificate.clone().expect("certificate");
    assert_eq!(
        certificate.private_key_password_ref.map(|selector| selector.name),
        Some("password-secret".to_string())
    );
    assert!(rotated.status.conditions.is_true(CERT_AVAILABLE));
    assert_ne!(harness.volumes().await, initial_volumes);

    harness.available().await;
    assert!(harness.fulcio().await.status.conditions.is_true(READY));
}

#[tokio::test]
async fn issuer_edit_swaps_config_map() {
    let harness = Harness::ready().await;
    let before = harness.fulcio().await;
    let old_config = before.status.server_config_ref.clone().expect("config ref");
    let initial_volumes = harness.volumes().await;

    harness
        .edit(|fulcio| fulcio.spec.config.oidc_issuers[0] = issuer("fake"))
        .await;
    assert!(matches!(harness.settle().await, ReconcileAction::RequeueAfter(_)));

    let updated = harness.fulcio().await;
    let new_config = updated.status.server_config_ref.clone().expect("config ref");
    assert_ne!(new_config, old_config);
    let api = harness.fixture.api::<ConfigMap>(NAMESPACE);
    // Pods of the previous rollout still mount the old config.
    assert!(api.get_opt(&old_config.name).await.expect("get").is_some());
    let config: serde_json::Value = serde_json::from_str(
        &api.get(&new_config.name).await.expect("configmap").data[CONFIG_KEY],
    )
    .expect("config json");
    assert!(config["OIDCIssuers"].get("fake").is_some());
    assert!(config["OIDCIssuers"].get("test").is_none());

    let volumes = harness.volumes().await;
    assert_ne!(volumes, initial_volumes);
    assert!(volumes.iter().any(|volume| volume
        .config_map
        .as_ref()
        .is_some_and(|source| source.name == new_config.name)));
    assert_eq!(
        updated.status.certificate, before.status.certificate,
        "certificate untouched by config edits"
    );

    harness.available().await;
    assert!(api.get_opt(&old_config.name).await.expect("get").is_none());
    assert_eq!(harness.config_maps().await, vec![new_config.name]);
}

#[tokio::test]
async fn config_swap_survives_lost_status_write() {
    let harness = Harness::ready().await;
    let old_config = harness
        .fulcio()
        .await
        .status
        .server_config_ref
        .expect("config ref");

    harness
        .edit(|fulcio| fulcio.spec.config.oidc_issuers[0] = issuer("fake"))
        .await;
    harness.fixture.cluster.inject_fault(
        Operation::UpdateStatus,
        Fulcio::KIND,
        ClusterError::Unavailable("apiserver restarting".into()),
    );
    assert!(harness.controller.reconcile(&harness.key).await.is_err());

    // The status still names the old config, and it still exists.
    let stale = harness.fulcio().await;
    assert_eq!(stale.status.server_config_ref.as_ref(), Some(&old_config));
    let api = harness.fixture.api::<ConfigMap>(NAMESPACE);
    assert!(api.get_opt(&old_config.name).await.expect("get").is_some());
    let rendered = harness.config_maps().await;
    assert_eq!(rendered.len(), 2);

    assert!(matches!(harness.settle().await, ReconcileAction::RequeueAfter(_)));
    let recovered = harness.fulcio().await;
    let new_config = recovered.status.server_config_ref.clone().expect("config ref");
    assert_ne!(new_config, old_config);
    assert_eq!(harness.config_maps().await, rendered);
    let created = harness
        .fixture
        .recorder
        .reasons()
        .into_iter()
        .filter(|reason| reason == "FulcioConfigUpdated")
        .count();
    assert_eq!(created, 2);

    harness.available().await;
    assert_eq!(harness.config_maps().await, vec![new_config.name]);
    assert!(harness.fulcio().await.status.conditions.is_true(READY));
}
