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


use futures_util::future::BoxFuture;
use std::sync::Arc;
use trustplane::trustplane::api::common::SecretKeySelector;
use trustplane::trustplane::api::ctlog::{CTlog, CTlogSpec};
use trustplane::trustplane::api::fulcio::{Fulcio, FulcioCert, FulcioSpec};
use trustplane::trustplane::cluster::{WatchEvent, WatchEventType};
use trustplane::trustplane::components::ctlog::server_config::CONFIG_KEY;
use trustplane::trustplane::components::ctlog::{self, FULCIO_CERT_AVAILABLE, KEYS_AVAILABLE};
use trustplane::trustplane::components::fulcio::{self, FULCIO_CA_LABEL};
use trustplane::trustplane::components::tree::TreeAllocator;
use trustplane::trustplane::controller::status::READY;
use trustplane::trustplane::controller::watch::{keys_for_event, WatchSource};
use trustplane::trustplane::controller::{Controller, ReconcileAction};
use trustplane::trustplane::k8s::deployment::Deployment;
use trustplane::trustplane::k8s::meta::ObjectKey;
use trustplane::trustplane::k8s::pod::Volume;
use trustplane::trustplane::k8s::resource::Resource;
use trustplane::trustplane::k8s::secret::Secret;
use trustplane::trustplane::test_support::Fixture;
use trustplane::trustplane::util::error::BoxError;

const NAMESPACE: &str = "tas";
const FULCIO: &str = "fulcio";
const CTLOG: &str = "securesign";

struct FixedTree;

impl TreeAllocator for FixedTree {
    fn create_tree<'a>(
        &'a self,
        _namespace: &'a str,
        _display_name: &'a str,
    ) -> BoxFuture<'a, Result<i64, BoxError>> {
        Box::pin(async { Ok(4_242) })
    }
}

struct Harness {
    fixture: Fixture,
    fulcio: Controller<Fulcio>,
    ctlog: Controller<CTlog>,
}

impl Harness {
    async fn new() -> Self {
        let fixture = Fixture::new();
        fixture
            .dependencies
            .insert::<dyn TreeAllocator>(Arc::new(FixedTree));
        let fulcio = fulcio::controller(fixture.context());
        let ctlog = ctlog::controller(fixture.context());
        fixture
            .api::<Fulcio>(NAMESPACE)
            .create(&Fulcio::new(
                NAMESPACE,
                FULCIO,
                FulcioSpec {
                    certificate: FulcioCert {
                        organization_name: "MyOrg".into(),
                        common_name: "local".into(),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            ))
            .await
            .expect("create fulcio");
        fixture
            .api::<CTlog>(NAMESPACE)
            .create(&CTlog::new(NAMESPACE, CTLOG, CTlogSpec::default()))
            .await
            .expect("create ctlog");
        Self {
            fixture,
            fulcio,
            ctlog,
        }
    }

    /// Both servers deployed and available.
    async fn ready() -> Self {
        let harness = Self::new().await;
        assert!(matches!(harness.settle_fulcio().await, ReconcileAction::RequeueAfter(_)));
        harness.fulcio_available().await;
        assert!(matches!(harness.settle_ctlog().await, ReconcileAction::RequeueAfter(_)));
        harness.ctlog_available().await;
        assert!(harness.ctlog().await.status.conditions.is_true(READY));
        harness
    }

    async fn settle_fulcio(&self) -> ReconcileAction {
        let key = ObjectKey::new(Fulcio::KIND, NAMESPACE, FULCIO);
        self.fixture.settle(&self.fulcio, &key).await.expect("settle fulcio")
    }

    async fn settle_ctlog(&self) -> ReconcileAction {
        let key = ObjectKey::new(CTlog::KIND, NAMESPACE, CTLOG);
        self.fixture.settle(&self.ctlog, &key).await.expect("settle ctlog")
    }

    async fn fulcio_available(&self) {
        self.fixture
            .mark_available(NAMESPACE, fulcio::DEPLOYMENT_NAME)
            .await
            .expect("mark fulcio available");
        assert_eq!(self.settle_fulcio().await, ReconcileAction::Done);
    }

    async fn ctlog_available(&self) {
        self.fixture
            .mark_available(NAMESPACE, ctlog::DEPLOYMENT_NAME)
            .await
            .expect("mark ctlog available");
        assert_eq!(self.settle_ctlog().await, ReconcileAction::Done);
    }

    async fn ctlog(&self) -> CTlog {
        self.fixture
            .api::<CTlog>(NAMESPACE)
            .get(CTLOG)
            .await
            .expect("get ctlog")
    }

    async fn volumes(&self) -> Vec<Volume> {
        self.fixture
            .api::<Deployment>(NAMESPACE)
            .get(ctlog::DEPLOYMENT_NAME)
            .await
            .expect("ctlog deployment")
            .spec
            .template
            .spec
            .volumes
    }

    async fn server_config(&self) -> Secret {
        let name = self
            .ctlog()
            .await
            .status
            .server_config_ref
            .expect("config ref")
            .name;
        self.fixture
            .api::<Secret>(NAMESPACE)
            .get(&name)
            .await
            .expect("config secret")
    }

    /// The keys volume mounts the config secret named in the status.
    async fn assert_keys_volume_follows_status(&self) {
        let expected = self.ctlog().await.status.server_config_ref.expect("config ref").name;
        let volumes = self.volumes().await;
        let keys = volumes
            .iter()
            .find(|volume| volume.name == "keys")
            .and_then(|volume| volume.secret.as_ref())
            .expect("keys volume");
        assert_eq!(keys.secret_name, expected);
    }

    async fn edit_fulcio(&self, change: impl FnOnce(&mut Fulcio)) {
        let api = self.fixture.api::<Fulcio>(NAMESPACE);
        let mut fulcio = api.get(FULCIO).await.expect("get fulcio");
        change(&mut fulcio);
        api.update(&fulcio).await.expect("update fulcio");
    }

    async fn edit_ctlog(&self, change: impl FnOnce(&mut CTlog)) {
        let mut ctlog = self.ctlog().await;
        change(&mut ctlog);
        self.fixture
            .api::<CTlog>(NAMESPACE)
            .update(&ctlog)
            .await
            .expect("update ctlog");
    }
}

#[tokio::test]
async fn log_waits_for_a_published_ca() {
    let harness = Harness::new().await;
    assert!(matches!(harness.settle_ctlog().await, ReconcileAction::RequeueAfter(_)));
    let waiting = harness.ctlog().await;
    assert!(!waiting.status.conditions.is_true(FULCIO_CERT_AVAILABLE));
    assert!(waiting.status.server_config_ref.is_none());

    assert!(matches!(harness.settle_fulcio().await, ReconcileAction::RequeueAfter(_)));
    assert!(matches!(harness.settle_ctlog().await, ReconcileAction::RequeueAfter(_)));
    let discovered = harness.ctlog().await;
    assert!(discovered.status.conditions.is_true(FULCIO_CERT_AVAILABLE));
    assert_eq!(discovered.status.root_certificates.len(), 1);
    assert!(discovered.status.root_certificates[0].name.starts_with("fulcio-cert-fulcio-"));
    assert_eq!(discovered.status.tree_id, Some(4_242));
    harness.assert_keys_volume_follows_status().await;
}

#[tokio::test]
async fn injected_fulcio_ca_rolls_the_log() {
    let harness = Harness::ready().await;
    let before = harness.ctlog().await;
    let old_config = before.status.server_config_ref.clone().expect("config ref");
    let initial_volumes = harness.volumes().await;

    harness
        .edit_fulcio(|fulcio| {
            fulcio.spec.certificate = FulcioCert {
                private_key_ref: Some(SecretKeySelector::new("my-fulcio-secret", "private")),
                private_key_password_ref: Some(SecretKeySelector::new("my-fulcio-secret", "password")),
                ca_ref: Some(SecretKeySelector::new("my-fulcio-secret", "cert")),
                ..Default::default()
            };
        })
        .await;
    assert!(matches!(harness.settle_fulcio().await, ReconcileAction::RequeueAfter(_)));
    // Until the new CA exists the log keeps trusting the old one.
    assert_eq!(harness.settle_ctlog().await, ReconcileAction::Done);
    assert_eq!(harness.volumes().await, initial_volumes);

    harness
        .fixture
        .secret(
            NAMESPACE,
            "my-fulcio-secret",
            &[("private", "user-key"), ("password", "pw"), ("cert", "USER-CA")],
        )
        .await;
    assert!(matches!(harness.settle_fulcio().await, ReconcileAction::RequeueAfter(_)));

    // The published secret reaches the log through the label fan-out.
    let published: Vec<Secret> = harness
        .fixture
        .api::<Secret>(NAMESPACE)
        .list(&Default::default())
        .await
        .expect("list secrets")
        .into_iter()
        .filter(|secret| secret.metadata.labels.contains_key(FULCIO_CA_LABEL))
        .collect();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].get("cert"), Some(&b"USER-CA"[..]));
    let event = WatchEvent {
        event_type: WatchEventType::Added,
        kind: Secret::KIND.to_string(),
        object: serde_json::to_value(&published[0]).expect("secret json"),
    };
    let keys = keys_for_event(
        &WatchSource::LabelledSecrets(FULCIO_CA_LABEL),
        CTlog::KIND,
        &event,
        harness.fixture.cluster.as_ref(),
    )
    .await;
    assert_eq!(keys, vec![ObjectKey::new(CTlog::KIND, NAMESPACE, CTLOG)]);

    assert!(matches!(harness.settle_ctlog().await, ReconcileAction::RequeueAfter(_)));
    let updated = harness.ctlog().await;
    assert_eq!(
        updated.status.root_certificates,
        vec![SecretKeySelector::new(published[0].metadata.name(), "cert")]
    );
    let new_config = updated.status.server_config_ref.clone().expect("config ref");
    assert_ne!(new_config, old_config);
    assert_eq!(harness.server_config().await.get("fulcio-0"), Some(&b"USER-CA"[..]));
    assert_eq!(updated.status.private_key_ref, before.status.private_key_ref);
    assert_eq!(updated.status.tree_id, before.status.tree_id);
    assert_ne!(harness.volumes().await, initial_volumes);
    harness.assert_keys_volume_follows_status().await;
    assert!(harness.fixture.recorder.reasons().contains(&"FulcioCertUpdated".to_string()));

    let secrets = harness.fixture.api::<Secret>(NAMESPACE);
    assert!(secrets.get_opt(&old_config.name).await.expect("get").is_some());
    harness.ctlog_available().await;
    assert!(secrets.get_opt(&old_config.name).await.expect("get").is_none());
    assert!(harness.ctlog().await.status.conditions.is_true(READY));
}

#[tokio::test]
async fn injected_signing_key_rolls_the_log() {
    let harness = Harness::ready().await;
    let initial_volumes = harness.volumes().await;

    harness
        .edit_ctlog(|ctlog| {
            ctlog.spec.private_key_ref = Some(SecretKeySelector::new("my-ctlog-secret", "private"));
            ctlog.spec.public_key_ref = Some(SecretKeySelector::new("my-ctlog-secret", "public"));
        })
        .await;
    assert!(matches!(harness.settle_ctlog().await, ReconcileAction::RequeueAfter(_)));
    let waiting = harness.ctlog().await;
    assert!(!waiting.status.conditions.is_true(KEYS_AVAILABLE));
    assert!(!waiting.status.conditions.is_true(READY));
    assert_eq!(harness.volumes().await, initial_volumes);

    harness
        .fixture
        .secret(
            NAMESPACE,
            "my-ctlog-secret",
            &[("private", "USER-PRIVATE"), ("public", "USER-PUBLIC")],
        )
        .await;
    assert!(matches!(harness.settle_ctlog().await, ReconcileAction::RequeueAfter(_)));
    let config = harness.server_config().await;
    assert_eq!(config.get("private"), Some(&b"USER-PRIVATE"[..]));
    assert_eq!(config.get("public"), Some(&b"USER-PUBLIC"[..]));
    let text = String::from_utf8(config.get(CONFIG_KEY).expect("config").to_vec()).expect("utf8");
    assert!(text.contains("log_id:4242"));
    assert_ne!(harness.volumes().await, initial_volumes);
    harness.assert_keys_volume_follows_status().await;

    harness.ctlog_available().await;
    assert!(harness.ctlog().await.status.conditions.is_true(READY));
}
