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

//! Transparency log server controller.

pub mod deployment;
pub mod public_key;
pub mod server_config;
pub mod signer;

use super::shared::{DeployAction, PendingAction, ServiceAction, WaitForServerAction};
use super::tree::{ResolveTreeAction, TreeBacked};
use super::{ManagedComponent, SERVER_AVAILABLE};
use crate::trustplane::api::rekor::Rekor;
use crate::trustplane::config::ControllerSettings;
use crate::trustplane::controller::watch::WatchSource;
use crate::trustplane::controller::{ActionContext, Controller, Pipeline, ReconcileError};
use crate::trustplane::k8s::deployment::Deployment;
use crate::trustplane::k8s::service::ServicePort;

pub const CONTROLLER_NAME: &str = "rekor";
pub const COMPONENT_NAME: &str = "rekor";
pub const DEPLOYMENT_NAME: &str = "rekor-server";
pub const SIGNER_AVAILABLE: &str = "SignerAvailable";
pub const PUBLIC_KEY_AVAILABLE: &str = "PublicKeyAvailable";
/// Label marking a secret that holds a log public key; the value names the
/// data key holding it.
pub const PUBLIC_KEY_LABEL: &str = "trustplane.dev/rekor.pub";
pub const SERVER_PORT: u16 = 3000;

pub const TRACKED_CONDITIONS: &[&str] = &[SIGNER_AVAILABLE, SERVER_AVAILABLE, PUBLIC_KEY_AVAILABLE];

impl ManagedComponent for Rekor {
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

impl TreeBacked for Rekor {
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

/// Actions in evaluation order.
pub fn pipeline() -> Pipeline<Rekor> {
    Pipeline::new(CONTROLLER_NAME)
        .with_action(PendingAction::new(TRACKED_CONDITIONS))
        .with_action(signer::GenerateSignerAction)
        .with_action(ResolveTreeAction::default())
        .with_action(server_config::ShardingConfigAction)
        .with_action(DeployAction::default())
        .with_action(ServiceAction::default())
        .with_action(WaitForServerAction::default())
        .with_action(public_key::ResolvePublicKeyAction)
        .tracking(TRACKED_CONDITIONS)
}

pub fn controller(context: ActionContext) -> Controller<Rekor> {
    Controller::new(pipeline(), context)
        .watches(WatchSource::Owned("Deployment"))
        .watches(WatchSource::Owned("ConfigMap"))
        .watches(WatchSource::Owned("Service"))
        .watches(WatchSource::Secrets)
}
