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

//! Ordered action list evaluated once per reconciliation invocation.

use super::action::{Action, ActionContext, ActionResult};
use super::error::ReconcileError;
use crate::trustplane::api::Reconcilable;
use crate::trustplane::logger::log_debug;
use crate::trustplane::observability::metrics;
use crate::trustplane::observability::tracing::with_span;
use tokio::time::{timeout_at, Instant};

const COMPONENT: &str = "pipeline";

#[derive(Debug)]
pub enum PipelineOutcome {
    /// No action applied.
    Converged,
    /// An action ran and ended the invocation.
    Executed {
        action: &'static str,
        condition: &'static str,
        result: ActionResult,
    },
}

pub struct Pipeline<R> {
    controller: &'static str,
    actions: Vec<Box<dyn Action<R>>>,
    tracked: Vec<&'static str>,
}

impl<R: Reconcilable> Pipeline<R> {
    pub fn new(controller: &'static str) -> Self {
        Self {
            controller,
            actions: Vec::new(),
            tracked: Vec::new(),
        }
    }

    pub fn with_action(mut self, action: impl Action<R> + 'static) -> Self {
        self.actions.push(Box::new(action));
        self
    }

    /// Conditions that feed the aggregate `Ready` condition.
    pub fn tracking(mut self, conditions: &[&'static str]) -> Self {
        self.tracked = conditions.to_vec();
        self
    }

    pub fn controller(&self) -> &'static str {
        self.controller
    }

    pub fn tracked_conditions(&self) -> &[&'static str] {
        &self.tracked
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.actions.iter().map(|action| action.name()).collect()
    }

    /// Runs the first applicable action. Actions returning
    /// [`ActionResult::Continue`] let evaluation move on to the next one.
    pub async fn run(&self, ctx: &ActionContext, resource: &mut R, deadline: Instant) -> PipelineOutcome {
        let limit = ctx.settings.reconcile_timeout;
        for action in &self.actions {
            let applies = match timeout_at(deadline, action.can_handle(ctx, resource)).await {
                Ok(applies) => applies,
                Err(_) => {
                    return PipelineOutcome::Executed {
                        action: action.name(),
                        condition: action.condition(),
                        result: ActionResult::Failed(ReconcileError::Timeout(limit)),
                    }
                }
            };
            if !applies {
                continue;
            }

            log_debug(
                COMPONENT,
                "Running action",
                &[("controller", self.controller), ("action", action.name())],
            );
            let handled = with_span(COMPONENT, action.name(), async {
                timeout_at(deadline, action.handle(ctx, resource)).await
            })
            .await;
            let result =
                handled.unwrap_or_else(|_| ActionResult::Failed(ReconcileError::Timeout(limit)));
            metrics::record_action(self.controller, action.name(), result.label());

            if matches!(result, ActionResult::Continue) {
                continue;
            }
            return PipelineOutcome::Executed {
                action: action.name(),
                condition: action.condition(),
                result,
            };
        }
        PipelineOutcome::Converged
    }
}
