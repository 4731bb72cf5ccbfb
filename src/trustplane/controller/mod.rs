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

//! Generic reconciliation engine shared by every component controller.

pub mod action;
pub mod drift;
pub mod error;
pub mod manager;
pub mod pipeline;
pub mod resolver;
pub mod runtime;
pub mod status;
pub mod watch;

pub use action::{Action, ActionContext, ActionFuture, ActionResult, CheckFuture};
pub use error::ReconcileError;
pub use manager::{Controller, ReconcileAction};
pub use pipeline::{Pipeline, PipelineOutcome};
