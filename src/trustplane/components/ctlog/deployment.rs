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


//! Desired state of the log server Deployment.

use super::server_config::{CONFIG_KEY, KEYS_MOUNT};
use super::{COMPONENT_NAME, DEPLOYMENT_NAME, SERVER_PORT};
use crate::trustplane::api::ctlog::CTlog;
use crate::trustplane::config::ControllerSettings;
use crate::trustplane::controller::drift::stamp_template_hash;
use crate::trustplane::controller::ReconcileError;
use crate::trustplane::k8s::deployment::{Deployment, DeploymentSpec};
use crate::trustplane::k8s::meta::{labels_for_component, selector_for_component, ObjectMeta};
use crate::trustplane::k8s::pod::{ContainerPort, ContainerSpec, PodSpec, PodTemplateSpec, Volume, VolumeMount};
use crate::trustplane::k8s::resource::Resource;

pub const SERVER_IMAGE: &str = "ghcr.io/sigstore/scaffolding/ct_server:v0.7.6";
pub const KEYS_VOLUME: &str = "keys";
const METRICS_PORT: u16 = 6963;

/// Builds the server Deployment around the config secret in the status.
/// Returns `None` until that secret is known.
pub fn desired_deployment(
    ctlog: &CTlog,
    _settings: &ControllerSettings,
) -> Result<Option<Deployment>, ReconcileError> {
    let Some(server_config) = ctlog.status.server_config_ref.as_ref() else {
        return Ok(None);
    };
    let namespace = ctlog.metadata.namespace();
    let labels = labels_for_component(COMPONENT_NAME, ctlog.metadata.name());
    let mut deployment = Deployment {
        metadata: ObjectMeta::named(namespace, DEPLOYMENT_NAME)
            .with_labels(labels.clone())
            .with_owner(ctlog.owner_reference()),
        spec: DeploymentSpec {
            replicas: Some(1),
            selector: selector_for_component(COMPONENT_NAME, ctlog.metadata.name()),
            template: PodTemplateSpec {
                metadata: ObjectMeta::default().with_labels(labels),
                spec: PodSpec {
                    containers: vec![ContainerSpec {
                        name: DEPLOYMENT_NAME.to_string(),
                        image: Some(SERVER_IMAGE.to_string()),
                        args: vec![
                            format!("--http_endpoint=0.0.0.0:{SERVER_PORT}"),
                            format!("--metrics_endpoint=0.0.0.0:{METRICS_PORT}"),
                            format!("--log_config={KEYS_MOUNT}/{CONFIG_KEY}"),
                            "--alsologtostderr".to_string(),
                        ],
                        ports: vec![
                            ContainerPort::tcp("http", SERVER_PORT),
                            ContainerPort::tcp("metrics", METRICS_PORT),
                        ],
                        volume_mounts: vec![VolumeMount::new(KEYS_VOLUME, KEYS_MOUNT, true)],
                        ..Default::default()
                    }],
                    volumes: vec![Volume::secret(KEYS_VOLUME, &server_config.name, Vec::new())],
                    ..Default::default()
                },
            },
            ..Default::default()
        },
        status: None,
    };
    stamp_template_hash(&mut deployment)?;
    Ok(Some(deployment))
}
