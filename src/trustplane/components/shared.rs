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

//! Actions shared by every server-backed component.

use super::{ManagedComponent, SERVER_AVAILABLE};
use crate::trustplane::api::common::SecretKeySelector;
use crate::trustplane::api::conditions::{Condition, ConditionReason};
use crate::trustplane::cluster::ClusterError;
use crate::trustplane::controller::drift::{ensure_deployment, needs_write, DriftOutcome};
use crate::trustplane::controller::status::READY;
use crate::trustplane::controller::{Action, ActionContext, ActionFuture, ActionResult, CheckFuture};
use crate::trustplane::events::EventKind;
use crate::trustplane::k8s::deployment::Deployment;
use crate::trustplane::k8s::meta::{labels_for_component, selector_for_component, ObjectMeta};
use crate::trustplane::k8s::resource::Resource;
use crate::trustplane::k8s::secret::Secret;
use crate::trustplane::k8s::service::{Service, ServiceSpec};
use std::marker::PhantomData;

/// Seeds the ledger on first sight of a resource.
pub struct PendingAction<R> {
    tracked: &'static [&'static str],
    _marker: PhantomData<fn(R)>,
}

impl<R> PendingAction<R> {
    pub fn new(tracked: &'static [&'static str]) -> Self {
        Self {
            tracked,
            _marker: PhantomData,
        }
    }
}

impl<R: ManagedComponent> Action<R> for PendingAction<R> {
    fn name(&self) -> &'static str {
        "pending"
    }

    fn condition(&self) -> &'static str {
        READY
    }

    fn can_handle<'a>(&'a self, _ctx: &'a ActionContext, resource: &'a R) -> CheckFuture<'a> {
        Box::pin(async move { resource.conditions().find(READY).is_none() })
    }

    fn handle<'a>(&'a self, _ctx: &'a ActionContext, resource: &'a mut R) -> ActionFuture<'a> {
        Box::pin(async move {
            let conditions = resource.conditions_mut();
            for condition_type in self.tracked {
                if conditions.find(condition_type).is_none() {
                    conditions.set(Condition::pending(condition_type, "Waiting to start"));
                }
            }
            conditions.set(Condition::pending(READY, "Waiting for components"));
            ActionResult::StatusChanged
        })
    }
}

/// Creates the server Deployment and keeps its owned fields in line with
/// the current status.
pub struct DeployAction<R> {
    _marker: PhantomData<fn(R)>,
}

impl<R> Default for DeployAction<R> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<R: ManagedComponent> Action<R> for DeployAction<R> {
    fn name(&self) -> &'static str {
        "deploy"
    }

    fn condition(&self) -> &'static str {
        SERVER_AVAILABLE
    }

    fn can_handle<'a>(&'a self, ctx: &'a ActionContext, resource: &'a R) -> CheckFuture<'a> {
        Box::pin(async move {
            match resource.desired_deployment(&ctx.settings) {
                Ok(Some(desired)) => needs_write(ctx, &desired).await.unwrap_or(true),
                Ok(None) => false,
                // Surface the synthesis error through handle.
                Err(_) => true,
            }
        })
    }

    fn handle<'a>(&'a self, ctx: &'a ActionContext, resource: &'a mut R) -> ActionFuture<'a> {
        Box::pin(async move {
            let desired = match resource.desired_deployment(&ctx.settings) {
                Ok(Some(desired)) => desired,
                Ok(None) => return ActionResult::Continue,
                Err(err) => return ActionResult::Failed(err),
            };
            let outcome = match ensure_deployment(ctx, R::COMPONENT, desired).await {
                Ok(outcome) => outcome,
                Err(err) => return ActionResult::Failed(err.into()),
            };
            let (reason, message) = match outcome {
                DriftOutcome::Created => ("DeploymentCreated", "Deployment created"),
                DriftOutcome::Updated => ("DeploymentUpdated", "Deployment updated"),
                DriftOutcome::InSync => return ActionResult::Continue,
            };
            ctx.record(&*resource, EventKind::Normal, reason, &format!("{message}: {}", R::DEPLOYMENT_NAME));
            resource
                .conditions_mut()
                .set(Condition::creating(SERVER_AVAILABLE, message));
            ActionResult::StatusChanged
        })
    }
}

/// Exposes the server and records its in-cluster URL.
pub struct ServiceAction<R> {
    _marker: PhantomData<fn(R)>,
}

impl<R> Default for ServiceAction<R> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<R: ManagedComponent> ServiceAction<R> {
    fn desired(resource: &R) -> Service {
        let meta = resource.metadata();
        Service {
            metadata: ObjectMeta::named(meta.namespace(), R::SERVICE_NAME)
                .with_labels(labels_for_component(R::COMPONENT, meta.name()))
                .with_owner(resource.owner_reference()),
            spec: ServiceSpec {
                selector: selector_for_component(R::COMPONENT, meta.name()).match_labels,
                ports: R::service_ports(),
            },
        }
    }

    fn url(ctx: &ActionContext, resource: &R) -> String {
        let host = ctx
            .settings
            .service_host(R::SERVICE_NAME, resource.metadata().namespace());
        format!("http://{host}")
    }
}

impl<R: ManagedComponent> Action<R> for ServiceAction<R> {
    fn name(&self) -> &'static str {
        "service"
    }

    fn condition(&self) -> &'static str {
        SERVER_AVAILABLE
    }

    fn can_handle<'a>(&'a self, ctx: &'a ActionContext, resource: &'a R) -> CheckFuture<'a> {
        Box::pin(async move {
            if resource.url() != Some(Self::url(ctx, resource).as_str()) {
                return true;
            }
            let api = ctx.api::<Service>(resource.metadata().namespace());
            !matches!(api.get_opt(R::SERVICE_NAME).await, Ok(Some(_)))
        })
    }

    fn handle<'a>(&'a self, ctx: &'a ActionContext, resource: &'a mut R) -> ActionFuture<'a> {
        Box::pin(async move {
            let api = ctx.api::<Service>(resource.metadata().namespace());
            match api.get_opt(R::SERVICE_NAME).await {
                Ok(Some(_)) => {}
                Ok(None) => match api.create(&Self::desired(resource)).await {
                    Ok(created) => ctx.record(
                        &*resource,
                        EventKind::Normal,
                        "ServiceCreated",
                        &format!("Service created: {}", created.metadata.name()),
                    ),
                    Err(err) if err.is_already_exists() => {}
                    Err(err) => return ActionResult::Failed(err.into()),
                },
                Err(err) => return ActionResult::Failed(err.into()),
            }
            let url = Self::url(ctx, resource);
            if resource.url() == Some(url.as_str()) {
                return ActionResult::Continue;
            }
            resource.set_url(url);
            ActionResult::StatusChanged
        })
    }
}

/// Waits for the server Deployment to report availability.
pub struct WaitForServerAction<R> {
    _marker: PhantomData<fn(R)>,
}

impl<R> Default for WaitForServerAction<R> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<R: ManagedComponent> Action<R> for WaitForServerAction<R> {
    fn name(&self) -> &'static str {
        "wait-server"
    }

    fn condition(&self) -> &'static str {
        SERVER_AVAILABLE
    }

    fn can_handle<'a>(&'a self, ctx: &'a ActionContext, resource: &'a R) -> CheckFuture<'a> {
        Box::pin(async move {
            if resource.conditions().is_true(SERVER_AVAILABLE) {
                return false;
            }
            let api = ctx.api::<Deployment>(resource.metadata().namespace());
            !matches!(api.get_opt(R::DEPLOYMENT_NAME).await, Ok(None))
        })
    }

    fn handle<'a>(&'a self, ctx: &'a ActionContext, resource: &'a mut R) -> ActionFuture<'a> {
        Box::pin(async move {
            let api = ctx.api::<Deployment>(resource.metadata().namespace());
            let deployment = match api.get_opt(R::DEPLOYMENT_NAME).await {
                Ok(Some(deployment)) => deployment,
                Ok(None) => return ActionResult::Continue,
                Err(err) => return ActionResult::Failed(err.into()),
            };
            let conditions = resource.conditions_mut();
            if deployment.is_available() {
                conditions.set(Condition::ready(SERVER_AVAILABLE, "Server is available"));
                return ActionResult::StatusChanged;
            }
            let changed = conditions.reason(SERVER_AVAILABLE) != Some(ConditionReason::Creating)
                && conditions.set(Condition::creating(
                    SERVER_AVAILABLE,
                    "Waiting for deployment to become available",
                ));
            if changed {
                ActionResult::StatusChanged
            } else {
                ActionResult::Requeue(ctx.settings.deployment_poll_interval)
            }
        })
    }
}

/// Value stored under a referenced secret key; `None` when the secret or
/// the key does not exist yet.
pub async fn secret_value(
    ctx: &ActionContext,
    namespace: &str,
    selector: &SecretKeySelector,
) -> Result<Option<Vec<u8>>, ClusterError> {
    let api = ctx.api::<Secret>(namespace);
    Ok(api
        .get_opt(&selector.name)
        .await?
        .and_then(|secret| secret.get(&selector.key).map(<[u8]>::to_vec)))
}

/// `name/key` of every selector that does not resolve to a value.
pub async fn missing_secrets(
    ctx: &ActionContext,
    namespace: &str,
    selectors: &[&SecretKeySelector],
) -> Result<Vec<String>, ClusterError> {
    let mut missing = Vec::new();
    for selector in selectors {
        if secret_value(ctx, namespace, selector).await?.is_none() {
            missing.push(format!("{}/{}", selector.name, selector.key));
        }
    }
    Ok(missing)
}
