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

//! In-process fixtures used by the unit and integration tests.

use crate::trustplane::cluster::memory::InMemoryCluster;
use crate::trustplane::cluster::{Api, ClusterError};
use crate::trustplane::config::ControllerSettings;
use crate::trustplane::controller::resolver::{KeyFetcher, ResolveError};
use crate::trustplane::controller::runtime::DependencyRegistry;
use crate::trustplane::api::Reconcilable;
use crate::trustplane::controller::{ActionContext, Controller, ReconcileAction, ReconcileError};
use crate::trustplane::events::in_memory::InMemoryEventRecorder;
use crate::trustplane::k8s::deployment::{
    Deployment, DeploymentCondition, DeploymentStatus, DEPLOYMENT_AVAILABLE,
};
use crate::trustplane::k8s::meta::{ObjectKey, ObjectMeta};
use crate::trustplane::k8s::resource::Resource;
use crate::trustplane::k8s::secret::Secret;
use futures_util::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const SETTLE_LIMIT: usize = 32;

pub struct Fixture {
    pub cluster: Arc<InMemoryCluster>,
    pub recorder: Arc<InMemoryEventRecorder>,
    pub settings: Arc<ControllerSettings>,
    pub dependencies: Arc<DependencyRegistry>,
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_settings(ControllerSettings::default())
    }

    pub fn with_settings(settings: ControllerSettings) -> Self {
        Self {
            cluster: Arc::new(InMemoryCluster::new()),
            recorder: Arc::new(InMemoryEventRecorder::default()),
            settings: Arc::new(settings),
            dependencies: Arc::new(DependencyRegistry::new()),
        }
    }

    /// Context sharing this fixture's cluster, recorder and dependencies.
    pub fn context(&self) -> ActionContext {
        ActionContext::new(
            self.cluster.clone(),
            self.recorder.clone(),
            self.settings.clone(),
        )
        .with_dependencies(self.dependencies.clone())
    }

    pub fn api<T: Resource>(&self, namespace: &str) -> Api<T> {
        Api::namespaced(self.cluster.clone(), namespace)
    }

    pub async fn secret(&self, namespace: &str, name: &str, data: &[(&str, &str)]) -> Secret {
        let data: BTreeMap<String, Vec<u8>> = data
            .iter()
            .map(|(key, value)| (key.to_string(), value.as_bytes().to_vec()))
            .collect();
        self.api::<Secret>(namespace)
            .create(&Secret::new(ObjectMeta::named(namespace, name), data))
            .await
            .expect("create secret")
    }

    /// Reports the deployment as available for its current generation, the
    /// way the platform's deployment controller would.
    pub async fn mark_available(&self, namespace: &str, name: &str) -> Result<Deployment, ClusterError> {
        let api = self.api::<Deployment>(namespace);
        let mut deployment = api.get(name).await?;
        deployment.status = Some(DeploymentStatus {
            replicas: Some(1),
            ready_replicas: Some(1),
            observed_generation: deployment.metadata.generation,
            conditions: vec![DeploymentCondition {
                condition_type: DEPLOYMENT_AVAILABLE.to_string(),
                status: "True".to_string(),
                reason: Some("MinimumReplicasAvailable".to_string()),
                message: None,
            }],
        });
        api.update_status(&deployment).await
    }

    /// Reconciles `key` until an invocation leaves the cluster untouched and
    /// returns that invocation's directive.
    pub async fn settle<R: Reconcilable>(
        &self,
        controller: &Controller<R>,
        key: &ObjectKey,
    ) -> Result<ReconcileAction, ReconcileError> {
        for _ in 0..SETTLE_LIMIT {
            let writes = self.cluster.write_count();
            let directive = controller.reconcile(key).await?;
            if self.cluster.write_count() == writes {
                return Ok(directive);
            }
        }
        Err(ReconcileError::Other(
            format!("{key} still writing after {SETTLE_LIMIT} invocations").into(),
        ))
    }
}

/// Key fetcher answering every request with the same outcome.
pub struct StaticKeyFetcher {
    outcome: Result<Vec<u8>, u16>,
    calls: AtomicUsize,
}

impl StaticKeyFetcher {
    pub fn new(key: Vec<u8>) -> Self {
        Self {
            outcome: Ok(key),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(status: u16) -> Self {
        Self {
            outcome: Err(status),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl KeyFetcher for StaticKeyFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>, ResolveError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = match &self.outcome {
            Ok(key) => Ok(key.clone()),
            Err(status) => Err(ResolveError::Status {
                url: url.to_string(),
                status: *status,
            }),
        };
        Box::pin(async move { outcome })
    }
}
