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

use super::cert::PASSWORD;
use super::server_config::CONFIG_KEY;
use super::{CERT_AVAILABLE, COMPONENT_NAME, DEPLOYMENT_NAME, GRPC_PORT, HTTP_PORT};
use crate::trustplane::api::fulcio::Fulcio;
use crate::trustplane::config::ControllerSettings;
use crate::trustplane::controller::drift::stamp_template_hash;
use crate::trustplane::controller::ReconcileError;
use crate::trustplane::k8s::deployment::{Deployment, DeploymentSpec};
use crate::trustplane::k8s::meta::{labels_for_component, selector_for_component, ObjectMeta};
use crate::trustplane::k8s::pod::{
    ContainerPort, ContainerSpec, EnvVar, KeyToPath, PodSpec, PodTemplateSpec, SecretProjection,
    Volume, VolumeMount,
};
use crate::trustplane::k8s::resource::Resource;

pub const SERVER_IMAGE: &str = "ghcr.io/sigstore/fulcio:v1.4.5";
pub const CONFIG_VOLUME: &str = "fulcio-config";
pub const CERT_VOLUME: &str = "fulcio-cert";
const CONFIG_PATH: &str = "/etc/fulcio-config";
const SECRETS_PATH: &str = "/var/run/fulcio-secrets";

/// Builds the CA server Deployment. Returns `None` until the certificate and
/// server config have been resolved into the status.
pub fn desired_deployment(
    fulcio: &Fulcio,
    _settings: &ControllerSettings,
) -> Result<Option<Deployment>, ReconcileError> {
    let status = &fulcio.status;
    if !status.conditions.is_true(CERT_AVAILABLE) {
        return Ok(None);
    }
    let (Some(certificate), Some(server_config)) =
        (status.certificate.as_ref(), status.server_config_ref.as_ref())
    else {
        return Ok(None);
    };
    let (Some(key_ref), Some(ca_ref)) = (
        certificate.private_key_ref.as_ref(),
        certificate.ca_ref.as_ref(),
    ) else {
        return Ok(None);
    };

    let mut args = vec![
        "serve".to_string(),
        format!("--port={HTTP_PORT}"),
        format!("--grpc-port={GRPC_PORT}"),
        "--ca=fileca".to_string(),
        format!("--fileca-key={SECRETS_PATH}/key.pem"),
        format!("--fileca-cert={SECRETS_PATH}/cert.pem"),
    ];
    let mut env = Vec::new();
    if let Some(password_ref) = certificate.private_key_password_ref.as_ref() {
        args.push(format!("--fileca-key-passwd=$({})", PASSWORD.to_uppercase()));
        env.push(EnvVar::from_secret(
            &PASSWORD.to_uppercase(),
            &password_ref.name,
            &password_ref.key,
        ));
    }
    args.push(format!("--config-path={CONFIG_PATH}/{CONFIG_KEY}"));

    let volumes = vec![
        Volume::config_map(CONFIG_VOLUME, &server_config.name),
        Volume::projected(
            CERT_VOLUME,
            vec![
                SecretProjection {
                    name: key_ref.name.clone(),
                    items: vec![KeyToPath::new(&key_ref.key, "key.pem")],
                },
                SecretProjection {
                    name: ca_ref.name.clone(),
                    items: vec![KeyToPath::new(&ca_ref.key, "cert.pem")],
                },
            ],
        ),
    ];
    let mounts = vec![
        VolumeMount::new(CONFIG_VOLUME, CONFIG_PATH, false),
        VolumeMount::new(CERT_VOLUME, SECRETS_PATH, true),
    ];

    let namespace = fulcio.metadata.namespace();
    let labels = labels_for_component(COMPONENT_NAME, fulcio.metadata.name());
    let mut deployment = Deployment {
        metadata: ObjectMeta::named(namespace, DEPLOYMENT_NAME)
            .with_labels(labels.clone())
            .with_owner(fulcio.owner_reference()),
        spec: DeploymentSpec {
            replicas: Some(1),
            selector: selector_for_component(COMPONENT_NAME, fulcio.metadata.name()),
            template: PodTemplateSpec {
                metadata: ObjectMeta::default().with_labels(labels),
                spec: PodSpec {
                    containers: vec![ContainerSpec {
                        name: DEPLOYMENT_NAME.to_string(),
                        image: Some(SERVER_IMAGE.to_string()),
                        args,
                        env,
                        ports: vec![
                            ContainerPort::tcp("http", HTTP_PORT),
                            ContainerPort::tcp("grpc", GRPC_PORT),
                        ],
                        volume_mounts: mounts,
                        ..Default::default()
                    }],
                    volumes,
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
