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

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use trustplane::trustplane::api::conditions::{Condition, ConditionReason};
use trustplane::trustplane::api::rekor::{Rekor, RekorSigner, RekorSpec, KMS_MEMORY};
use trustplane::trustplane::cluster::memory::Operation;
use trustplane::trustplane::cluster::ClusterError;
use trustplane::trustplane::components::rekor::{self, DEPLOYMENT_NAME, SIGNER_AVAILABLE};
use trustplane::trustplane::config::ControllerSettings;
use trustplane::trustplane::controller::resolver::KeyFetcher;
use trustplane::trustplane::controller::status::READY;
use trustplane::trustplane::controller::{
    Action, ActionContext, ActionFuture, ActionResult, CheckFuture, Controller, Pipeline,
    ReconcileAction, ReconcileError,
};
use trustplane::trustplane::k8s::deployment::Deployment;
use trustplane::trustplane::k8s::meta::ObjectKey;
use trustplane::trustplane::k8s::resource::Resource;
use trustplane::trustplane::test_support::{Fixture, StaticKeyFetcher};

const NAMESPACE: &str = "tas";
const NAME: &str = "log";

/// Marks the signer as available once, counting invocations.
struct MarkSigner {
    handled: Arc<AtomicUsize>,
}

impl Action<Rekor> for MarkSigner {
    fn name(&self) -> &'static str {
        "mark-signer"
    }

    fn condition(&self) -> &'static str {
        SIGNER_AVAILABLE
    }

    fn can_handle<'a>(&'a self, _ctx: &'a ActionContext, rekor: &'a Rekor) -> CheckFuture<'a> {
        Box::pin(async move { !rekor.status.conditions.is_true(SIGNER_AVAILABLE) })
    }

    fn handle<'a>(&'a self, _ctx: &'a ActionContext, rekor: &'a mut Rekor) -> ActionFuture<'a> {
        Box::pin(async move {
            self.handled.fetch_add(1, Ordering::SeqCst);
            rekor
                .status
                .conditions
                .set(Condition::ready(SIGNER_AVAILABLE, "marked"));
            ActionResult::StatusChanged
        })
    }
}

struct Broken {
    transient: bool,
}

impl Action<Rekor> for Broken {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn condition(&self) -> &'static str {
        SIGNER_AVAILABLE
    }

    fn can_handle<'a>(&'a self, _ctx: &'a ActionContext, _rekor: &'a Rekor) -> CheckFuture<'a> {
        Box::pin(async { true })
    }

    fn handle<'a>(&'a self, _ctx: &'a ActionContext, _rekor: &'a mut Rekor) -> ActionFuture<'a> {
        Box::pin(async move {
            let err = if self.transient {
                ReconcileError::Other("backend briefly unavailable".into())
            } else {
                ReconcileError::InvalidConfiguration("signer kms is not supported".into())
            };
            ActionResult::Failed(err)
        })
    }
}

async fn seed(fixture: &Fixture, spec: RekorSpec) -> ObjectKey {
    fixture
        .api::<Rekor>(NAMESPACE)
        .create(&Rekor::new(NAMESPACE, NAME, spec))
        .await
        .expect("create rekor");
    ObjectKey::new(Rekor::KIND, NAMESPACE, NAME)
}

async fn stored(fixture: &Fixture) -> Rekor {
    fixture
        .api::<Rekor>(NAMESPACE)
        .get(NAME)
        .await
        .expect("get rekor")
}

#[tokio::test]
async fn missing_resource_is_done() {
    let fixture = Fixture::new();
    let controller = rekor::controller(fixture.context());
    let key = ObjectKey::new(Rekor::KIND, NAMESPACE, "absent");
    assert_eq!(
        controller.reconcile(&key).await.expect("reconcile"),
        ReconcileAction::Done
    );
    assert_eq!(fixture.cluster.write_count(), 0);
}

#[tokio::test]
async fn one_action_per_invocation_then_converged() {
    let fixture = Fixture::new();
    let key = seed(&fixture, RekorSpec::default()).await;
    let handled = Arc::new(AtomicUsize::new(0));
    let pipeline = Pipeline::new("scripted")
        .with_action(MarkSigner {
            handled: handled.clone(),
        })
        .tracking(&[SIGNER_AVAILABLE]);
    let controller = Controller::new(pipeline, fixture.context());

    assert_eq!(controller.reconcile(&key).await.expect("first"), ReconcileAction::Done);
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    let rekor = stored(&fixture).await;
    assert!(rekor.status.conditions.is_true(SIGNER_AVAILABLE));
    assert!(rekor.status.conditions.is_true(READY));

    let writes = fixture.cluster.write_count();
    assert_eq!(controller.reconcile(&key).await.expect("second"), ReconcileAction::Done);
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.cluster.write_count(), writes);
}

#[tokio::test]
async fn failure_is_recorded_before_surfacing() {
    let fixture = Fixture::new();
    let key = seed(&fixture, RekorSpec::default()).await;
    let pipeline = Pipeline::new("broken")
        .with_action(Broken { transient: false })
        .tracking(&[SIGNER_AVAILABLE]);
    let controller = Controller::new(pipeline, fixture.context());

    let err = controller.reconcile(&key).await.expect_err("failed action");
    assert!(matches!(err, ReconcileError::InvalidConfiguration(_)));
    assert!(!err.is_transient());

    let rekor = stored(&fixture).await;
    let signer = rekor
        .status
        .conditions
        .find(SIGNER_AVAILABLE)
        .expect("signer condition");
    assert_eq!(signer.reason, ConditionReason::Failure);
    assert!(signer.message.contains("not supported"));
    let ready = rekor.status.conditions.find(READY).expect("ready");
    assert_eq!(ready.reason, ConditionReason::Failure);
    assert!(!ready.is_true());
}

#[tokio::test]
async fn status_conflict_requeues_immediately() {
    let fixture = Fixture::new();
    let key = seed(&fixture, RekorSpec::default()).await;
    let pipeline = Pipeline::new("scripted")
        .with_action(MarkSigner {
            handled: Arc::new(AtomicUsize::new(0)),
        })
        .tracking(&[SIGNER_AVAILABLE]);
    let controller = Controller::new(pipeline, fixture.context());

    fixture.cluster.inject_fault(
        Operation::UpdateStatus,
        Rekor::KIND,
        ClusterError::Conflict {
            key: key.clone(),
            expected: "1".into(),
            actual: "2".into(),
        },
    );
    assert_eq!(
        controller.reconcile(&key).await.expect("conflict is not an error"),
        ReconcileAction::RequeueAfter(Duration::ZERO)
    );
    assert!(stored(&fixture).await.status.conditions.is_empty());

    assert_eq!(controller.reconcile(&key).await.expect("retry"), ReconcileAction::Done);
    assert!(stored(&fixture).await.status.conditions.is_true(SIGNER_AVAILABLE));
}

#[tokio::test(start_paused = true)]
async fn failed_key_is_retried_with_backoff() {
    let fixture = Fixture::with_settings(ControllerSettings {
        requeue_base_delay: Duration::from_secs(2),
        requeue_max_delay: Duration::from_secs(60),
        ..Default::default()
    });
    let key = seed(&fixture, RekorSpec::default()).await;
    let pipeline = Pipeline::new("broken")
        .with_action(Broken { transient: true })
        .tracking(&[SIGNER_AVAILABLE]);
    let controller = Controller::new(pipeline, fixture.context());
    let queue = controller.queue();

    queue.add(key.clone());
    let next = queue.next().await;
    controller.process(next).await;
    assert!(queue.is_empty());

    tokio::time::sleep(Duration::from_millis(1_900)).await;
    assert!(queue.is_empty());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(queue.len(), 1);

    // The second failure doubles the delay.
    let next = queue.next().await;
    controller.process(next).await;
    tokio::time::sleep(Duration::from_millis(3_900)).await;
    assert!(queue.is_empty());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(queue.len(), 1);
}

async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn running_controller_follows_watch_events() {
    let fixture = Fixture::with_settings(ControllerSettings {
        workers: 2,
        deployment_poll_interval: Duration::from_millis(50),
        ..Default::default()
    });
    fixture
        .dependencies
        .insert::<dyn KeyFetcher>(Arc::new(StaticKeyFetcher::new(b"LOG-KEY".to_vec())));
    let controller = Arc::new(rekor::controller(fixture.context()).in_namespace(NAMESPACE));
    let cancel = CancellationToken::new();
    let running = tokio::spawn(controller.clone().run(cancel.clone()));

    seed(
        &fixture,
        RekorSpec {
            signer: RekorSigner {
                kms: KMS_MEMORY.into(),
                ..Default::default()
            },
            tree_id: Some(11),
            ..Default::default()
        },
    )
    .await;

    let deployments = fixture.api::<Deployment>(NAMESPACE);
    wait_for(|| {
        let deployments = deployments.clone();
        async move { matches!(deployments.get_opt(DEPLOYMENT_NAME).await, Ok(Some(_))) }
    })
    .await;

    fixture
        .mark_available(NAMESPACE, DEPLOYMENT_NAME)
        .await
        .expect("mark available");
    // The deployment status change reaches the controller through its watch.
    wait_for(|| async { stored(&fixture).await.status.conditions.is_true(READY) }).await;
    let rekor = stored(&fixture).await;
    assert_eq!(rekor.status.tree_id, Some(11));
    assert!(rekor.status.public_key_ref.is_some());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("controller stops")
        .expect("join")
        .expect("run");
}
