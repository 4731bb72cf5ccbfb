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

//! Reconciliation loop: pulls keys from the work queue, runs the pipeline
//! against the freshly read resource, maintains `Ready` and writes the
//! status back.

use super::action::{ActionContext, ActionResult};
use super::error::ReconcileError;
use super::pipeline::{Pipeline, PipelineOutcome};
use super::runtime::WorkQueue;
use super::status::{persist_status, recompute_ready, StatusWrite, READY};
use super::watch::{feed, WatchSource};
use crate::trustplane::api::conditions::Condition;
use crate::trustplane::api::Reconcilable;
use crate::trustplane::cluster::{object_meta, Api, ListParams};
use crate::trustplane::k8s::meta::ObjectKey;
use crate::trustplane::logger::{log_debug, log_error, log_info, log_warn};
use crate::trustplane::observability::metrics::{self, ReconcileResult};
use crate::trustplane::observability::tracing::with_span;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "controller";

/// What the loop should do with a key after an invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Wait for the next change notification.
    Done,
    RequeueAfter(Duration),
}

pub struct Controller<R: Reconcilable> {
    pipeline: Pipeline<R>,
    context: ActionContext,
    queue: WorkQueue<ObjectKey>,
    sources: Vec<WatchSource>,
    namespace: Option<String>,
}

impl<R: Reconcilable> Controller<R> {
    pub fn new(pipeline: Pipeline<R>, context: ActionContext) -> Self {
        Self {
            pipeline,
            context,
            queue: WorkQueue::new(),
            sources: vec![WatchSource::Primary],
            namespace: None,
        }
    }

    pub fn watches(mut self, source: WatchSource) -> Self {
        if !self.sources.contains(&source) {
            self.sources.push(source);
        }
        self
    }

    /// Restricts watches and the initial listing to one namespace.
    pub fn in_namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    pub fn name(&self) -> &'static str {
        self.pipeline.controller()
    }

    pub fn queue(&self) -> WorkQueue<ObjectKey> {
        self.queue.clone()
    }

    pub fn context(&self) -> &ActionContext {
        &self.context
    }

    /// Runs one invocation for the resource named by `key`.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction, ReconcileError> {
        let started = std::time::Instant::now();
        let span_name = format!("reconcile {key}");
        let result = with_span(COMPONENT, span_name, self.reconcile_inner(key)).await;
        let label = match &result {
            Ok(ReconcileAction::Done) => ReconcileResult::Converged,
            Ok(ReconcileAction::RequeueAfter(delay)) if delay.is_zero() => ReconcileResult::Progressed,
            Ok(ReconcileAction::RequeueAfter(_)) => ReconcileResult::Requeued,
            Err(_) => ReconcileResult::Error,
        };
        metrics::record_reconcile(self.name(), label, started.elapsed());
        result
    }

    async fn reconcile_inner(&self, key: &ObjectKey) -> Result<ReconcileAction, ReconcileError> {
        let api: Api<R> = self.context.api(&key.namespace);
        let Some(mut resource) = api.get_opt(&key.name).await? else {
            log_debug(COMPONENT, "Resource gone; nothing to do", &[("key", key.to_string().as_str())]);
            return Ok(ReconcileAction::Done);
        };
        let original = resource.status().clone();
        let deadline = Instant::now() + self.context.settings.reconcile_timeout;

        let outcome = self.pipeline.run(&self.context, &mut resource, deadline).await;
        let mut status_changed = false;
        let (directive, failure) = match outcome {
            PipelineOutcome::Converged => (ReconcileAction::Done, None),
            PipelineOutcome::Executed {
                action,
                condition,
                result,
            } => match result {
                ActionResult::Continue => (ReconcileAction::Done, None),
                ActionResult::StatusChanged => {
                    status_changed = true;
                    (ReconcileAction::Done, None)
                }
                ActionResult::Requeue(delay) => (ReconcileAction::RequeueAfter(delay), None),
                ActionResult::Failed(err) => {
                    let message = err.to_string();
                    if condition != READY {
                        resource
                            .conditions_mut()
                            .set(Condition::failure(condition, message.as_str()));
                    }
                    log_warn(
                        COMPONENT,
                        "Action failed",
                        &[
                            ("key", key.to_string().as_str()),
                            ("action", action),
                            ("error", message.as_str()),
                        ],
                    );
                    (ReconcileAction::Done, Some((condition, err)))
                }
            },
        };

        recompute_ready(resource.conditions_mut(), self.pipeline.tracked_conditions());
        if let Some((condition, err)) = &failure {
            if *condition == READY {
                resource
                    .conditions_mut()
                    .set(Condition::failure(READY, err.to_string()));
            }
        }

        let written = persist_status(&api, &mut resource, &original).await?;
        if let Some((_, err)) = failure {
            return Err(err);
        }
        match written {
            StatusWrite::Conflict => {
                log_debug(
                    COMPONENT,
                    "Status write conflicted; retrying",
                    &[("key", key.to_string().as_str())],
                );
                Ok(ReconcileAction::RequeueAfter(Duration::ZERO))
            }
            StatusWrite::Gone => Ok(ReconcileAction::Done),
            // A written status comes back through the watch. Progress that
            // left the status untouched has nothing to trigger on.
            StatusWrite::Unchanged if status_changed => {
                Ok(ReconcileAction::RequeueAfter(Duration::ZERO))
            }
            _ => Ok(directive),
        }
    }

    /// Processes one key end to end, scheduling a retry when needed.
    pub async fn process(&self, key: ObjectKey) {
        let outcome = self.reconcile(&key).await;
        let key_str = key.to_string();
        match outcome {
            Ok(ReconcileAction::Done) => self.queue.forget(&key),
            Ok(ReconcileAction::RequeueAfter(delay)) => {
                self.queue.forget(&key);
                self.queue.add_after(key.clone(), delay);
            }
            Err(err) => {
                let settings = &self.context.settings;
                let delay =
                    self.queue
                        .backoff(&key, settings.requeue_base_delay, settings.requeue_max_delay);
                let error = err.to_string();
                let delay_str = humantime::format_duration(delay).to_string();
                let log = if err.is_transient() { log_warn } else { log_error };
                log(
                    COMPONENT,
                    "Reconciliation failed; backing off",
                    &[
                        ("key", key_str.as_str()),
                        ("error", error.as_str()),
                        ("retry_in", delay_str.as_str()),
                    ],
                );
                self.queue.add_after(key.clone(), delay);
            }
        }
        self.queue.done(&key);
    }

    /// Queues every existing instance of the primary kind.
    pub async fn enqueue_existing(&self) -> Result<usize, ReconcileError> {
        let params = ListParams {
            namespace: self.namespace.clone(),
            ..Default::default()
        };
        let objects = self.context.client.list(R::KIND, &params).await?;
        for object in &objects {
            let meta = object_meta(object);
            self.queue
                .add(ObjectKey::new(R::KIND, meta.namespace(), meta.name()));
        }
        Ok(objects.len())
    }

    /// Runs watch feeders and workers until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), ReconcileError> {
        let mut tasks = JoinSet::new();
        for source in &self.sources {
            tasks.spawn(feed(
                source.clone(),
                R::KIND,
                self.context.client.clone(),
                self.namespace.clone(),
                self.queue.clone(),
                cancel.clone(),
            ));
        }
        let existing = self.enqueue_existing().await?;

        let workers = self.context.settings.workers.max(1);
        for _ in 0..workers {
            let controller = Arc::clone(&self);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        key = controller.queue.next() => controller.process(key).await,
                    }
                }
            });
        }
        let existing_str = existing.to_string();
        let workers_str = workers.to_string();
        log_info(
            COMPONENT,
            "Controller started",
            &[
                ("controller", self.name()),
                ("existing", existing_str.as_str()),
                ("workers", workers_str.as_str()),
            ],
        );

        cancel.cancelled().await;
        tasks.shutdown().await;
        log_info(COMPONENT, "Controller stopped", &[("controller", self.name())]);
        Ok(())
    }
}
