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

//! Component controllers built on the reconciliation engine.

pub mod ctlog;
pub mod fulcio;
pub mod rekor;
pub mod shared;
pub mod tree;

use crate::trustplane::api::Reconcilable;
use crate::trustplane::config::ControllerSettings;
use crate::trustplane::controller::ReconcileError;
use crate::trustplane::k8s::deployment::Deployment;
use crate::trustplane::k8s::service::ServicePort;

/// Condition every server-backed component reports for its Deployment.
pub const SERVER_AVAILABLE: &str = "ServerAvailable";

/// A resource that runs a server Deployment behind a Service.
pub trait ManagedComponent: Reconcilable {
    /// Value of the component label on every child.
    const COMPONENT: &'static str;
    const DEPLOYMENT_NAME: &'static str;
    const SERVICE_NAME: &'static str;

    fn service_ports() -> Vec<ServicePort>;

    /// Desired server Deployment, or `None` while its inputs are not yet
    /// recorded in the status.
    fn desired_deployment(
        &self,
        settings: &ControllerSettings,
    ) -> Result<Option<Deployment>, ReconcileError>;

    fn url(&self) -> Option<&str>;

    fn set_url(&mut self, url: String);
}
