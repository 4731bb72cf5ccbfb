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

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use futures_util::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use trustplane::trustplane::api::rekor::{Rekor, RekorSigner, RekorSpec, KMS_MEMORY};
use trustplane::trustplane::components::rekor::{self, DEPLOYMENT_NAME, PUBLIC_KEY_AVAILABLE, PUBLIC_KEY_LABEL};
use trustplane::trustplane::config::ControllerSettings;
use trustplane::trustplane::controller::resolver::{
    public_key_url, resolve_with_retry, HttpKeyFetcher, KeyFetcher, ResolveError, RetryPolicy,
};
use trustplane::trustplane::controller::status::READY;
use trustplane::trustplane::controller::ReconcileAction;
use trustplane::trustplane::k8s::meta::{labels_for_component, ObjectKey, ObjectMeta};
use trustplane::trustplane::k8s::resource::Resource;
use trustplane::trustplane::k8s::secret::Secret;
use trustplane::trustplane::test_support::Fixture;

const PUBLIC_KEY: &[u8] = b"-----BEGIN PUBLIC KEY-----\nlog\n-----END PUBLIC KEY-----\n";

#[derive(Clone)]
struct KeyServer {
    hits: Arc<AtomicUsize>,
    failures: usize,
}

async fn public_key(State(server): State<KeyServer>) -> (StatusCode, Vec<u8>) {
    let hit = server.hits.fetch_add(1, Ordering::SeqCst) + 1;
    if hit <= server.failures {
        (StatusCode::SERVICE_UNAVAILABLE, b"starting".to_vec())
    } else {
        (StatusCode::OK, PUBLIC_KEY.to_vec())
    }
}

/// Serves the log's public key, failing the first `failures` requests.
async fn spawn_key_server(failures: usize) -> (SocketAddr, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/api/v1/log/publicKey", get(public_key))
        .with_state(KeyServer {
            hits: hits.clone(),
            failures,
        });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, hits)
}

fn fetcher() -> HttpKeyFetcher {
    HttpKeyFetcher::new(Duration::from_secs(2)).expect("http client")
}

#[tokio::test]
async fn flaky_endpoint_resolves_on_fourth_attempt() {
    let (addr, hits) = spawn_key_server(3).await;
    let fetcher = fetcher();
    let url = public_key_url(&addr.to_string(), "log");
    let policy = RetryPolicy {
        attempts: 4,
        base_delay: Duration::from_millis(40),
    };

    let mut started = Vec::new();
    let key = resolve_with_retry("rekor", &policy, |attempt| {
        started.push((attempt, Instant::now()));
        fetcher.fetch(&url)
    })
    .await
    .expect("resolved");

    assert_eq!(key, PUBLIC_KEY);
    assert_eq!(hits.load(Ordering::SeqCst), 4);
    assert_eq!(
        started.iter().map(|(attempt, _)| *attempt).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );
    let gaps: Vec<Duration> = started
        .windows(2)
        .map(|pair| pair[1].1 - pair[0].1)
        .collect();
    for (index, gap) in gaps.iter().enumerate() {
        assert!(*gap >= policy.delay_after(index + 1), "gap {index} too short: {gap:?}");
    }
}

#[tokio::test]
async fn permanent_failure_exhausts_budget() {
    let (addr, hits) = spawn_key_server(usize::MAX).await;
    let fetcher = fetcher();
    let url = public_key_url(&addr.to_string(), "log");
    let policy = RetryPolicy {
        attempts: 4,
        base_delay: Duration::from_millis(5),
    };

    let err = resolve_with_retry("rekor", &policy, |_| fetcher.fetch(&url))
        .await
        .expect_err("never resolves");
    match &err {
        ResolveError::Exhausted { attempts, .. } => assert_eq!(*attempts, 4),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(err.last(), ResolveError::Status { status: 503, .. }));
    assert_eq!(hits.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn unreachable_endpoint_is_a_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let fetcher = fetcher();
    let url = public_key_url(&addr.to_string(), "log");
    let policy = RetryPolicy {
        attempts: 2,
        base_delay: Duration::from_millis(1),
    };
    let err = resolve_with_retry("rekor", &policy, |_| fetcher.fetch(&url))
        .await
        .expect_err("nothing listening");
    assert!(matches!(err.last(), ResolveError::Transport { .. }));
}

/// Sends in-cluster service URLs to a local server, keeping the path.
struct LocalRoute {
    inner: HttpKeyFetcher,
    base: String,
    requested: Mutex<Vec<String>>,
}

impl KeyFetcher for LocalRoute {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>, ResolveError>> {
        self.requested
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(url.to_string());
        Box::pin(async move {
            let path = url.splitn(4, '/').nth(3).unwrap_or_default();
            let local = format!("{}/{path}", self.base);
            self.inner.fetch(&local).await
        })
    }
}

#[tokio::test]
async fn controller_publishes_fetched_key_immutably() {
    let (addr, hits) = spawn_key_server(3).await;
    let fixture = Fixture::with_settings(ControllerSettings {
        resolver_attempts: 4,
        resolver_base_delay: Duration::from_millis(10),
        ..Default::default()
    });
    let route = Arc::new(LocalRoute {
        inner: fetcher(),
        base: format!("http://{addr}"),
        requested: Mutex::new(Vec::new()),
    });
    fixture
        .dependencies
        .insert::<dyn KeyFetcher>(route.clone());

    let mut labels = labels_for_component(rekor::COMPONENT_NAME, "log");
    labels.insert(PUBLIC_KEY_LABEL.to_string(), "public".to_string());
    fixture
        .api::<Secret>("tas")
        .create(&Secret::new(
            ObjectMeta::named("tas", "stale-public-key").with_labels(labels),
            [("public".to_string(), b"OLD".to_vec())].into_iter().collect(),
        ))
        .await
        .expect("stale secret");

    let controller = rekor::controller(fixture.context());
    fixture
        .api::<Rekor>("tas")
        .create(&Rekor::new(
            "tas",
            "log",
            RekorSpec {
                signer: RekorSigner {
                    kms: KMS_MEMORY.into(),
                    ..Default::default()
                },
                tree_id: Some(1),
                ..Default::default()
            },
        ))
        .await
        .expect("create rekor");
    let key = ObjectKey::new(Rekor::KIND, "tas", "log");

    let directive = fixture.settle(&controller, &key).await.expect("settle");
    assert!(matches!(directive, ReconcileAction::RequeueAfter(_)));
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    fixture
        .mark_available("tas", DEPLOYMENT_NAME)
        .await
        .expect("mark available");
    let directive = fixture.settle(&controller, &key).await.expect("settle");
    assert_eq!(directive, ReconcileAction::Done);
    assert_eq!(hits.load(Ordering::SeqCst), 4);

    let rekor = fixture.api::<Rekor>("tas").get("log").await.expect("rekor");
    assert!(rekor.status.conditions.is_true(PUBLIC_KEY_AVAILABLE));
    assert!(rekor.status.conditions.is_true(READY));
    let reference = rekor.status.public_key_ref.clone().expect("public key ref");

    let secrets = fixture.api::<Secret>("tas");
    assert!(secrets
        .get_opt("stale-public-key")
        .await
        .expect("get")
        .is_none());
    let published = secrets.get(&reference.name).await.expect("published");
    assert!(published.is_immutable());
    assert_eq!(published.get(&reference.key), Some(PUBLIC_KEY));

    let requested = route
        .requested
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();
    assert!(requested
        .iter()
        .all(|url| url == "http://rekor-server.tas.svc/api/v1/log/publicKey"));
    let reasons = fixture.recorder.reasons();
    assert!(reasons.iter().any(|r| r == "PublicKeySecretDeleted"));
    assert!(reasons.iter().any(|r| r == "PublicKeySecretCreated"));
}
