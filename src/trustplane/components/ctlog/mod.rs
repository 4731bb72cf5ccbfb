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


//! Certificate transparency log controller.

pub mod deployment;
pub mod keys;
pub mod root_certs;
pub mod server_config;

use super::fulcio::FULCIO_CA_LABEL;
use super::shared::{DeployAction, PendingAction, ServiceAction, WaitForServerAction};
use super::tree::{ResolveTreeAction, TreeBacked};
use super::{ManagedComponent, SERVER_AVAILABLE};
use crate::trustplane::api::ctlog::CTlog;
use crate::trustplane::config::ControllerSettings;
use crate::trustplane::controller::watch::WatchSource;
use crate::trustplane::controller::{ActionContext, Controller, Pipeline, ReconcileError};
use crate::trustplane::k8s::deployment::Deployment;
use crate::trustplane::k8s::service::ServicePort;

pub const CONTROLLER_NAME: &str = "ctlog";
pub const COMPONENT_NAME: &str = "ctlog";
pub const DEPLOYMENT_NAME: &str = "ctlog";
pub const FULCIO_CERT_AVAILABLE: &str = "FulcioCertAvailable";
pub const KEYS_AVAILABLE: &str = "KeysAvailable";
/// Distinguishes the secrets this controller writes: `keys` or `config`.
pub const SECRET_ROLE_LABEL: &str = "trustplane.dev/ctlog-secret";
pub const SERVER_PORT: u16 = 6962;

pub const TRACKED_CONDITIONS: &[&str] = &[FULCIO_CERT_AVAILABLE, KEYS_AVAILABLE, SERVER_AVAILABLE];

impl ManagedComponent for CTlog {
    const COMPONENT: &'static str = COMPONENT_NAME;
    const DEPLOYMENT_NAME: &'static str = DEPLOYMENT_NAME;
    const SERVICE_NAME: &'static str = DEPLOYMENT_NAME;

    fn service_ports() -> Vec<ServicePort> {
        vec![ServicePort::tcp("http", 80, SERVER_PORT)]
    }

    fn desired_deployment(
        &self,
        settings: &ControllerSettings,
    ) -> Result<Option<Deployment>, ReconcileError> {
        deployment::desired_deployment(self, settings)
    }

    fn url(&self) -> Option<&str> {
        self.status.url.as_deref()
    }

    fn set_url(&mut self, url: String) {
        self.status.url = Some(url);
    }
}

impl TreeBacked for CTlog {
    fn desired_tree(&self) -> Option<i64> {
        self.spec.tree_id
    }

    fn tree_id(&self) -> Option<i64> {
        self.status.tree_id
    }

    fn set_tree_id(&mut self, tree_id: i64) {
        self.status.tree_id = Some(tree_id);
    }
}

pub fn pipeline() -> Pipeline<CTlog> {
    Pipeline::new(CONTROLLER_NAME)
        .with_action(PendingAction::new(TRACKED_CONDITIONS))
        .with_action(root_certs::HandleFulcioCertAction)
        .with_action(keys::HandleKeysAction)
        .with_action(ResolveTreeAction::default())
        .with_action(server_config::ServerConfigAction)
        .with_action(DeployAction::default())
        .with_action(ServiceAction::default())
        .with_action(WaitForServerAction::default())
        .with_action(server_config::PruneServerConfigAction)
        .tracking(TRACKED_CONDITIONS)
}

/// The published Fulcio CA lives in secrets owned by Fulcio instances, so
/// its label fans out to every log in the namespace.
pub fn controller(context: ActionContext) -> Controller<CTlog> {
    Controller::new(pipeline(), context)
        .watches(WatchSource::Owned("Deployment"))
        .watches(WatchSource::Owned("Service"))
        .watches(WatchSource::Secrets)
        .watches(WatchSource::LabelledSecrets(FULCIO_CA_LABEL))
}
