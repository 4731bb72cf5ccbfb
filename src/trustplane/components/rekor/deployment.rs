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

use super::{COMPONENT_NAME, DEPLOYMENT_NAME, SERVER_PORT, SIGNER_AVAILABLE};
use crate::trustplane::api::rekor::{Rekor, KMS_MEMORY};
use crate::trustplane::components::rekor::server_config::SHARDING_CONFIG_KEY;
use crate::trustplane::config::ControllerSettings;
use crate::trustplane::controller::drift::stamp_template_hash;
use crate::trustplane::controller::ReconcileError;
use crate::trustplane::k8s::deployment::{Deployment, DeploymentSpec};
use crate::trustplane::k8s::meta::{labels_for_component, selector_for_component, ObjectMeta};
use crate::trustplane::k8s::pod::{
    ContainerPort, ContainerSpec, EnvVar, KeyToPath, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use crate::trustplane::k8s::resource::Resource;

pub const SERVER_IMAGE: &str = "ghcr.io/sigstore/rekor-server:v1.3.6";
pub const SHARDING_VOLUME: &str = "rekor-sharding-config";
pub const PRIVATE_KEY_VOLUME: &str = "rekor-private-key-volume";
const DEFAULT_TRILLIAN_PORT: u16 = 8091;
const REDIS_PORT: u16 = 6379;
const METRICS_PORT: u16 = 2112;

/// Builds the server Deployment from the resolved status. Returns `None`
/// until the signer, tree and sharding config are all known.
pub fn desired_deployment(
    rekor: &Rekor,
    settings: &ControllerSettings,
) -> Result<Option<Deployment>, ReconcileError> {
    let status = &rekor.status;
    if !status.conditions.is_true(SIGNER_AVAILABLE) {
        return Ok(None);
    }
    let (Some(tree_id), Some(server_config)) = (status.tree_id, status.server_config_ref.as_ref())
    else {
        return Ok(None);
    };
    let namespace = rekor.metadata.namespace();
    let signer = &status.signer;

    let trillian_address = rekor
        .spec
        .trillian
        .address
        .clone()
        .unwrap_or_else(|| settings.service_host("trillian-logserver", namespace));
    let trillian_port = rekor.spec.trillian.port.unwrap_or(DEFAULT_TRILLIAN_PORT);

    let mut args = vec![
        "serve".to_string(),
        format!("--trillian_log_server.address={trillian_address}"),
        format!("--trillian_log_server.port={trillian_port}"),
        format!("--trillian_log_server.sharding_config=/sharding/{SHARDING_CONFIG_KEY}"),
        format!(
            "--redis_server.address={}",
            settings.service_host("rekor-redis", namespace)
        ),
        format!("--redis_server.port={REDIS_PORT}"),
        "--rekor_server.address=0.0.0.0".to_string(),
        "--enable_retrieve_api=true".to_string(),
        format!("--trillian_log_server.tlog_id={tree_id}"),
    ];
    let mut env = Vec::new();
    let mut volumes = vec![Volume::config_map(SHARDING_VOLUME, &server_config.name)];
    let mut mounts = vec![VolumeMount::new(SHARDING_VOLUME, "/sharding", false)];

    if signer.kms == KMS_MEMORY {
        args.push("--rekor_server.signer=memory".to_string());
    } else if signer.uses_secret_key() {
        let Some(key_ref) = signer.key_ref.as_ref() else {
            return Ok(None);
        };
        args.push("--rekor_server.signer=/key/private".to_string());
        volumes.push(Volume::secret(
            PRIVATE_KEY_VOLUME,
            &key_ref.name,
            vec![KeyToPath::new(&key_ref.key, "private")],
        ));
        mounts.push(VolumeMount::new(PRIVATE_KEY_VOLUME, "/key", true));
        if let Some(password_ref) = signer.password_ref.as_ref() {
            args.push("--rekor_server.signer-passwd=$(SIGNER_PASSWORD)".to_string());
            env.push(EnvVar::from_secret(
                "SIGNER_PASSWORD",
                &password_ref.name,
                &password_ref.key,
            ));
        }
    } else {
        args.push(format!("--rekor_server.signer={}", signer.kms));
    }

    let labels = labels_for_component(COMPONENT_NAME, rekor.metadata.name());
    let mut deployment = Deployment {
        metadata: ObjectMeta::named(namespace, DEPLOYMENT_NAME)
            .with_labels(labels.clone())
            .with_owner(rekor.owner_reference()),
        spec: DeploymentSpec {
            replicas: Some(1),
            selector: selector_for_component(COMPONENT_NAME, rekor.metadata.name()),
            template: PodTemplateSpec {
                metadata: ObjectMeta::default().with_labels(labels),
                spec: PodSpec {
                    containers: vec![ContainerSpec {
                        name: DEPLOYMENT_NAME.to_string(),
                        image: Some(SERVER_IMAGE.to_string()),
                        args,
                        env,
                        ports: vec![
                            ContainerPort::tcp(DEPLOYMENT_NAME, SERVER_PORT),
                            ContainerPort::tcp("metrics", METRICS_PORT),
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
