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

//! Certificate authority server controller.

pub mod cert;
pub mod deployment;
pub mod publish;
pub mod server_config;

use super::shared::{DeployAction, PendingAction, ServiceAction, WaitForServerAction};
use super::{ManagedComponent, SERVER_AVAILABLE};
use crate::trustplane::api::fulcio::Fulcio;
use crate::trustplane::config::ControllerSettings;
use crate::trustplane::controller::watch::WatchSource;
use crate::trustplane::controller::{ActionContext, Controller, Pipeline, ReconcileError};
use crate::trustplane::k8s::deployment::Deployment;
use crate::trustplane::k8s::service::ServicePort;

pub const CONTROLLER_NAME: &str = "fulcio";
pub const COMPONENT_NAME: &str = "fulcio";
pub const DEPLOYMENT_NAME: &str = "fulcio-server";
pub const CERT_AVAILABLE: &str = "FulcioCertAvailable";
/// Label marking the secret that publishes the active CA certificate; the
/// value names the data key holding it.
pub const FULCIO_CA_LABEL: &str = "trustplane.dev/fulcio_v1.crt.pem";
pub const HTTP_PORT: u16 = 5555;
pub const GRPC_PORT: u16 = 5554;

pub const TRACKED_CONDITIONS: &[&str] = &[CERT_AVAILABLE, SERVER_AVAILABLE];

impl ManagedComponent for Fulcio {
    const COMPONENT: &'static str = COMPONENT_NAME;
    const DEPLOYMENT_NAME: &'static str = DEPLOYMENT_NAME;
    const SERVICE_NAME: &'static str = DEPLOYMENT_NAME;

    fn service_ports() -> Vec<ServicePort> {
        vec![
            ServicePort::tcp("http", 80, HTTP_PORT),
            ServicePort::tcp("grpc", GRPC_PORT, GRPC_PORT),
        ]
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

pub fn pipeline() -> Pipeline<Fulcio> {
    Pipeline::new(CONTROLLER_NAME)
        .with_action(PendingAction::new(TRACKED_CONDITIONS))
        .with_action(cert::HandleCertAction)
        .with_action(publish::PublishCaAction)
        .with_action(server_config::ServerConfigAction)
        .with_action(DeployAction::default())
        .with_action(ServiceAction::default())
        .with_action(WaitForServerAction::default())
        .with_action(server_config::PruneServerConfigAction)
        .tracking(TRACKED_CONDITIONS)
}

pub fn controller(context: ActionContext) -> Controller<Fulcio> {
    Controller::new(pipeline(), context)
        .watches(WatchSource::Owned("Deployment"))
        .watches(WatchSource::Owned("ConfigMap"))
        .watches(WatchSource::Owned("Service"))
        .watches(WatchSource::Secrets)
}
