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

//! The unit of reconciliation work. A pipeline asks each action in turn
//! whether it applies to the current state and runs at most one of them.

use super::error::ReconcileError;
use super::runtime::DependencyRegistry;
use crate::trustplane::cluster::{Api, ClusterClient};
use crate::trustplane::config::ControllerSettings;
use crate::trustplane::events::{EventKind, EventRecorder};
use crate::trustplane::k8s::resource::Resource;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

pub type CheckFuture<'a> = BoxFuture<'a, bool>;
pub type ActionFuture<'a> = BoxFuture<'a, ActionResult>;

#[derive(Debug)]
pub enum ActionResult {
    /// Nothing visible changed; the next action may run.
    Continue,
    /// The resource status changed and must be persisted before anything
    /// else runs.
    StatusChanged,
    /// Come back after the given delay.
    Requeue(Duration),
    Failed(ReconcileError),
}

impl ActionResult {
    pub fn label(&self) -> &'static str {
        match self {
            ActionResult::Continue => "continue",
            ActionResult::StatusChanged => "status_changed",
            ActionResult::Requeue(_) => "requeue",
            ActionResult::Failed(_) => "failed",
        }
    }
}

impl<E: Into<ReconcileError>> From<Result<ActionResult, E>> for ActionResult {
    fn from(result: Result<ActionResult, E>) -> Self {
        result.unwrap_or_else(|err| ActionResult::Failed(err.into()))
    }
}

/// Collaborators available to every action invocation.
#[derive(Clone)]
pub struct ActionContext {
    pub client: Arc<dyn ClusterClient>,
    pub recorder: Arc<dyn EventRecorder>,
    pub settings: Arc<ControllerSettings>,
    pub dependencies: Arc<DependencyRegistry>,
}

impl ActionContext {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        recorder: Arc<dyn EventRecorder>,
        settings: Arc<ControllerSettings>,
    ) -> Self {
        Self {
            client,
            recorder,
            settings,
            dependencies: Arc::new(DependencyRegistry::new()),
        }
    }

    pub fn with_dependencies(mut self, dependencies: Arc<DependencyRegistry>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn api<T: Resource>(&self, namespace: &str) -> Api<T> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn dependency<T>(&self) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.dependencies.get::<T>()
    }

    pub fn record<R: Resource>(&self, resource: &R, kind: EventKind, reason: &str, message: &str) {
        self.recorder
            .record(&resource.object_reference(), kind, reason, message);
    }
}

/// One step of a pipeline over resources of type `R`.
///
/// `can_handle` must not mutate anything; it may read the cluster. `handle`
/// is only called after `can_handle` returned true in the same invocation.
pub trait Action<R>: Send + Sync {
    fn name(&self) -> &'static str;

    /// Condition set to `Failure` when `handle` fails.
    fn condition(&self) -> &'static str;

    fn can_handle<'a>(&'a self, ctx: &'a ActionContext, resource: &'a R) -> CheckFuture<'a>;

    fn handle<'a>(&'a self, ctx: &'a ActionContext, resource: &'a mut R) -> ActionFuture<'a>;
}
