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
use trustplane::trustplane::cluster::memory::Operation;
use trustplane::trustplane::cluster::ClusterError;
use trustplane::trustplane::api::common::SecretKeySelector;
use trustplane::trustplane::api::conditions::ConditionReason;
use trustplane::trustplane::api::rekor::{Rekor, RekorSigner, RekorSpec};
use trustplane::trustplane::components::rekor::{
    self, DEPLOYMENT_NAME, PUBLIC_KEY_AVAILABLE, PUBLIC_KEY_LABEL, SIGNER_AVAILABLE,
};
use trustplane::trustplane::components::tree::TreeAllocator;
use trustplane::trustplane::components::SERVER_AVAILABLE;
use trustplane::trustplane::controller::resolver::KeyFetcher;
use trustplane::trustplane::controller::status::READY;
use trustplane::trustplane::controller::{Controller, ReconcileAction};
use trustplane::trustplane::k8s::deployment::Deployment;
use trustplane::trustplane::k8s::meta::{selector_for_component, ObjectKey};
use trustplane::trustplane::k8s::resource::Resource;
use trustplane::trustplane::k8s::secret::Secret;
use trustplane::trustplane::k8s::service::Service;
use trustplane::trustplane::test_support::{Fixture, StaticKeyFetcher};
use trustplane::trustplane::util::error::BoxError;

const NAMESPACE: &str = "tas";
const NAME: &str = "rekor";

struct FixedTree;

impl TreeAllocator for FixedTree {
    fn create_tree<'a>(
        &'a self,
        _namespace: &'a str,
        _display_name: &'a str,
    ) -> BoxFuture<'a, Result<i64, BoxError>> {
        Box::pin(async { Ok(7_001) })
    }
}

struct Harness {
    fixture: Fixture,
    controller: Controller<Rekor>,
    key: ObjectKey,
}

impl Harness {
    async fn new() -> Self {
        Self::with_spec(RekorSpec::default()).await
    }

    async fn with_spec(spec: RekorSpec) -> Self {
        let fixture = Fixture::new();
        fixture
            .dependencies
            .insert::<dyn TreeAllocator>(Arc::new(FixedTree));
        fixture
            .dependencies
            .insert::<dyn KeyFetcher>(Arc::new(StaticKeyFetcher::new(b"USER-PUBLIC".to_vec())));
        let controller = rekor::controller(fixture.context());
        fixture
            .api::<Rekor>(NAMESPACE)
            .create(&Rekor::new(NAMESPACE, NAME, spec))
            .await
            .expect("create rekor");
        Self {
            fixture,
            controller,
            key: ObjectKey::new(Rekor::KIND, NAMESPACE, NAME),
        }
    }

    async fn settle(&self) -> ReconcileAction {
        self.fixture
            .settle(&self.controller, &self.key)
            .await
            .expect("settle")
    }

    async fn rekor(&self) -> Rekor {
        self.fixture
            .api::<Rekor>(NAMESPACE)
            .get(NAME)
            .await
            .expect("get rekor")
    }

    async fn deployment(&self) -> Deployment {
        self.fixture
            .api::<Deployment>(NAMESPACE)
            .get(DEPLOYMENT_NAME)
            .await
            .expect("deployment")
    }

    async fn bring_up(&self) -> Rekor {
        assert!(matches!(self.settle().await, ReconcileAction::RequeueAfter(_)));
        self.fixture
            .mark_available(NAMESPACE, DEPLOYMENT_NAME)
            .await
            .expect("mark available");
        assert_eq!(self.settle().await, ReconcileAction::Done);
        self.rekor().await
    }
}

fn assert_ready_consistent(rekor: &Rekor) {
    let conditions = &rekor.status.conditions;
    let all_tracked = rekor::TRACKED_CONDITIONS
        .iter()
        .all(|condition| conditions.is_true(condition));
    assert_eq!(conditions.is_true(READY), all_tracked, "{conditions:?}");
}

#[tokio::test]
async fn generated_signer_reaches_ready() {
    let harness = Harness::new().await;

    assert!(matches!(harness.settle().await, ReconcileAction::RequeueAfter(_)));
    let waiting = harness.rekor().await;
    assert!(waiting.status.conditions.is_true(SIGNER_AVAILABLE));
    assert_eq!(
        waiting.status.conditions.reason(SERVER_AVAILABLE),
        Some(ConditionReason::Creating)
    );
    assert_eq!(waiting.status.conditions.reason(READY), Some(ConditionReason::Creating));
    assert_eq!(waiting.status.tree_id, Some(7_001));
    assert_ready_consistent(&waiting);

    harness
        .fixture
        .mark_available(NAMESPACE, DEPLOYMENT_NAME)
        .await
        .expect("mark available");
    assert_eq!(harness.settle().await, ReconcileAction::Done);

    let ready = harness.rekor().await;
    assert!(ready.status.conditions.is_true(READY));
    assert!(ready.status.conditions.is_true(PUBLIC_KEY_AVAILABLE));
    assert_ready_consistent(&ready);
    let signer = ready.status.signer.key_ref.clone().expect("signer");
    assert!(signer.name.starts_with("rekor-signer-rekor-"));
    // The generated signer secret publishes its own public key.
    assert_eq!(
        ready.status.public_key_ref,
        Some(SecretKeySelector::new(&signer.name, "public"))
    );
    assert_eq!(ready.status.url.as_deref(), Some("http://rekor-server.tas.svc"));
    harness
        .fixture
        .api::<Service>(NAMESPACE)
        .get(DEPLOYMENT_NAME)
        .await
        .expect("service");

    let reasons = harness.fixture.recorder.reasons();
    for reason in ["SignerKeyCreated", "TreeCreated", "DeploymentCreated", "ServiceCreated"] {
        assert!(reasons.iter().any(|r| r == reason), "missing {reason} in {reasons:?}");
    }
}

#[tokio::test]
async fn converged_invocation_writes_nothing() {
    let harness = Harness::new().await;
    harness.bring_up().await;

    let writes = harness.fixture.cluster.write_count();
    for _ in 0..3 {
        let directive = harness
            .controller
            .reconcile(&harness.key)
            .await
            .expect("reconcile");
        assert_eq!(directive, ReconcileAction::Done);
    }
    assert_eq!(harness.fixture.cluster.write_count(), writes);
}

#[tokio::test]
async fn signer_reference_change_redeploys() {
    let harness = Harness::new().await;
    let before = harness.bring_up().await;
    let generated = before.status.signer.key_ref.clone().expect("signer");
    let first_template = harness.deployment().await.spec.template;

    let mut edited = before.clone();
    edited.spec.signer.key_ref = Some(SecretKeySelector::new("user-signer", "private"));
    harness
        .fixture
        .api::<Rekor>(NAMESPACE)
        .update(&edited)
        .await
        .expect("update spec");

    // The referenced secret does not exist yet.
    assert!(matches!(harness.settle().await, ReconcileAction::RequeueAfter(_)));
    let pending = harness.rekor().await;
    assert_eq!(
        pending.status.conditions.reason(SIGNER_AVAILABLE),
        Some(ConditionReason::Pending)
    );
    assert_eq!(pending.status.conditions.reason(READY), Some(ConditionReason::Pending));
    assert_eq!(pending.status.signer.key_ref, Some(generated.clone()));

    harness
        .fixture
        .secret(NAMESPACE, "user-signer", &[("private", "user-pem")])
        .await;
    assert!(matches!(harness.settle().await, ReconcileAction::RequeueAfter(_)));
    let redeploying = harness.rekor().await;
    assert_eq!(
        redeploying.status.signer.key_ref,
        Some(SecretKeySelector::new("user-signer", "private"))
    );
    assert!(!redeploying.status.conditions.is_true(SERVER_AVAILABLE));
    assert!(redeploying.status.public_key_ref.is_none());
    let template = harness.deployment().await.spec.template;
    assert_ne!(template, first_template);
    assert!(template.spec.volumes.iter().any(|volume| volume
        .secret
        .as_ref()
        .is_some_and(|source| source.secret_name == "user-signer")));

    harness
        .fixture
        .mark_available(NAMESPACE, DEPLOYMENT_NAME)
        .await
        .expect("mark available");
    assert_eq!(harness.settle().await, ReconcileAction::Done);

    let ready = harness.rekor().await;
    assert!(ready.status.conditions.is_true(READY));
    let public_ref = ready.status.public_key_ref.clone().expect("public key");
    assert!(public_ref.name.starts_with("rekor-public-rekor-"));
    let public = harness
        .fixture
        .api::<Secret>(NAMESPACE)
        .get(&public_ref.name)
        .await
        .expect("public key secret");
    assert!(public.is_immutable());
    assert_eq!(public.get(&public_ref.key), Some(&b"USER-PUBLIC"[..]));

    // The superseded generated key is pruned once the new server runs, so
    // only the freshly fetched key keeps the discovery label.
    let labelled: Vec<String> = harness
        .fixture
        .api::<Secret>(NAMESPACE)
        .list(&selector_for_component(rekor::COMPONENT_NAME, NAME))
        .await
        .expect("list")
        .into_iter()
        .filter(|secret| secret.metadata.labels.contains_key(PUBLIC_KEY_LABEL))
        .map(|secret| secret.metadata.name().to_string())
        .collect();
    assert_eq!(labelled, vec![public_ref.name.clone()]);
    let reasons = harness.fixture.recorder.reasons();
    assert!(reasons.iter().any(|r| r == "SignerKeyDeleted"));
    assert!(!reasons.iter().any(|r| r == "PublicKeySecretDeleted"));
    assert!(reasons.iter().any(|r| r == "PublicKeySecretCreated"));
}

#[tokio::test]
async fn removed_mount_is_restored() {
    let harness = Harness::new().await;
    harness.bring_up().await;
    let desired = harness.deployment().await;

    let mut edited = desired.clone();
    edited.spec.template.spec.containers[0]
        .volume_mounts
        .retain(|mount| mount.mount_path != "/key");
    let mut foreign = edited.spec.template.spec.containers[0].clone();
    foreign.name = "log-shipper".into();
    foreign.env.clear();
    edited.spec.template.spec.containers.push(foreign);
    harness
        .fixture
        .api::<Deployment>(NAMESPACE)
        .update(&edited)
        .await
        .expect("edit deployment");

    let writes = harness.fixture.cluster.write_count();
    harness
        .controller
        .reconcile(&harness.key)
        .await
        .expect("reconcile");
    let restored = harness.deployment().await;
    // One deployment update plus the status write.
    assert_eq!(harness.fixture.cluster.write_count(), writes + 2);

    let server = &restored.spec.template.spec.containers[0];
    assert!(server.volume_mounts.iter().any(|mount| mount.mount_path == "/key"));
    assert_eq!(server, &desired.spec.template.spec.containers[0]);
    assert!(restored
        .spec
        .template
        .spec
        .containers
        .iter()
        .any(|container| container.name == "log-shipper"));
    assert!(harness
        .fixture
        .recorder
        .reasons()
        .iter()
        .any(|reason| reason == "DeploymentUpdated"));
}

#[tokio::test]
async fn deleted_signer_secret_drops_ready_until_restored() {
    let spec = RekorSpec {
        signer: RekorSigner {
            key_ref: Some(SecretKeySelector::new("user-key", "private")),
            ..Default::default()
        },
        ..Default::default()
    };
    let harness = Harness::with_spec(spec).await;
    harness
        .fixture
        .secret(NAMESPACE, "user-key", &[("private", "user-pem")])
        .await;
    let ready = harness.bring_up().await;
    assert!(ready.status.conditions.is_true(READY));

    let secrets = harness.fixture.api::<Secret>(NAMESPACE);
    secrets.delete("user-key").await.expect("delete signer secret");
    assert!(matches!(harness.settle().await, ReconcileAction::RequeueAfter(_)));
    let waiting = harness.rekor().await;
    assert_eq!(
        waiting.status.conditions.reason(SIGNER_AVAILABLE),
        Some(ConditionReason::Pending)
    );
    assert_eq!(waiting.status.conditions.reason(READY), Some(ConditionReason::Pending));
    assert_ready_consistent(&waiting);

    harness
        .fixture
        .secret(NAMESPACE, "user-key", &[("private", "user-pem")])
        .await;
    assert_eq!(harness.settle().await, ReconcileAction::Done);
    let restored = harness.rekor().await;
    assert!(restored.status.conditions.is_true(READY));
    assert_ready_consistent(&restored);
}

#[tokio::test]
async fn lost_signer_status_write_reuses_generated_key() {
    let harness = Harness::new().await;
    // Seeds the ledger.
    harness
        .controller
        .reconcile(&harness.key)
        .await
        .expect("first invocation");

    harness.fixture.cluster.inject_fault(
        Operation::UpdateStatus,
        Rekor::KIND,
        ClusterError::Unavailable("apiserver restarting".into()),
    );
    assert!(harness.controller.reconcile(&harness.key).await.is_err());
    assert!(harness.rekor().await.status.signer.key_ref.is_none());

    assert!(matches!(harness.settle().await, ReconcileAction::RequeueAfter(_)));
    let signers: Vec<String> = harness
        .fixture
        .api::<Secret>(NAMESPACE)
        .list(&selector_for_component(rekor::COMPONENT_NAME, NAME))
        .await
        .expect("list")
        .into_iter()
        .map(|secret| secret.metadata.name().to_string())
        .filter(|name| name.starts_with("rekor-signer-"))
        .collect();
    assert_eq!(signers.len(), 1, "{signers:?}");
    let rekor = harness.rekor().await;
    assert_eq!(
        rekor.status.signer.key_ref.map(|key_ref| key_ref.name),
        Some(signers[0].clone())
    );
    let created = harness
        .fixture
        .recorder
        .reasons()
        .into_iter()
        .filter(|reason| reason == "SignerKeyCreated")
        .count();
    assert_eq!(created, 1);
}
