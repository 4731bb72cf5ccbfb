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

//! Detects and corrects divergence between the desired shape of a managed
//! Deployment and the live object, touching only the fields the controller
//! owns. Foreign containers, volumes, env entries, labels and annotations
//! survive, and so does every field the typed model does not carry.

use super::action::ActionContext;
use crate::trustplane::cluster::ClusterError;
use crate::trustplane::k8s::deployment::Deployment;
use crate::trustplane::k8s::meta::MANAGED_BY_VALUE;
use crate::trustplane::k8s::ownership::{env_pointer, volume_pointer, FieldOwnership};
use crate::trustplane::k8s::pod::{ContainerSpec, PodTemplateSpec};
use crate::trustplane::logger::{log_debug, log_info};
use crate::trustplane::observability::metrics;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

const COMPONENT: &str = "drift";
const UPDATE_ATTEMPTS: usize = 3;

/// Pod template annotation carrying a digest of everything the controller
/// renders into the template. A change rolls the pods.
pub const TEMPLATE_HASH_ANNOTATION: &str = "trustplane.dev/template-hash";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriftOutcome {
    Created,
    Updated,
    InSync,
}

pub fn content_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let encoded = serde_json::to_vec(value)?;
    Ok(hex::encode(Sha256::digest(&encoded)))
}

/// Stamps the template hash onto the pod template of `desired`.
pub fn stamp_template_hash(desired: &mut Deployment) -> Result<(), serde_json::Error> {
    let template = &mut desired.spec.template;
    template.metadata.annotations.remove(TEMPLATE_HASH_ANNOTATION);
    let hash = content_hash(template)?;
    template
        .metadata
        .annotations
        .insert(TEMPLATE_HASH_ANNOTATION.to_string(), hash);
    Ok(())
}

fn is_subset(desired: &BTreeMap<String, String>, live: &BTreeMap<String, String>) -> bool {
    desired
        .iter()
        .all(|(key, value)| live.get(key) == Some(value))
}

fn is_ours(ownership: &FieldOwnership, pointer: &str) -> bool {
    ownership.manager_for(pointer) == Some(MANAGED_BY_VALUE)
}

fn container_matches(wanted: &ContainerSpec, live: &ContainerSpec, ownership: &FieldOwnership) -> bool {
    let image_matches = wanted.image.is_none() || wanted.image == live.image;
    let stale_env = live.env.iter().any(|var| {
        is_ours(ownership, &env_pointer(&live.name, &var.name))
            && !wanted.env.iter().any(|entry| entry.name == var.name)
    });
    image_matches
        && wanted.command == live.command
        && wanted.args == live.args
        && wanted.ports == live.ports
        && wanted.volume_mounts == live.volume_mounts
        && wanted.env.iter().all(|var| live.env.contains(var))
        && !stale_env
}

/// Writes the owned fields of `wanted` into `existing`. Env entries the
/// controller never set are left alone.
fn merge_container(wanted: &ContainerSpec, existing: &mut ContainerSpec, ownership: &mut FieldOwnership) {
    if wanted.image.is_some() {
        existing.image = wanted.image.clone();
    }
    existing.command = wanted.command.clone();
    existing.args = wanted.args.clone();
    existing.ports = wanted.ports.clone();
    existing.volume_mounts = wanted.volume_mounts.clone();

    let mut released = Vec::new();
    existing.env.retain(|var| {
        let pointer = env_pointer(&wanted.name, &var.name);
        let stale = is_ours(ownership, &pointer)
            && !wanted.env.iter().any(|entry| entry.name == var.name);
        if stale {
            released.push(pointer);
        }
        !stale
    });
    for pointer in released {
        ownership.release(&pointer);
    }
    for var in &wanted.env {
        match existing.env.iter_mut().find(|entry| entry.name == var.name) {
            Some(entry) => *entry = var.clone(),
            None => existing.env.push(var.clone()),
        }
        ownership.set_owner(&env_pointer(&wanted.name, &var.name), MANAGED_BY_VALUE);
    }
}

fn template_matches(desired: &PodTemplateSpec, live: &PodTemplateSpec, ownership: &FieldOwnership) -> bool {
    if !is_subset(&desired.metadata.labels, &live.metadata.labels)
        || !is_subset(&desired.metadata.annotations, &live.metadata.annotations)
    {
        return false;
    }
    let containers_match = desired.spec.containers.iter().all(|wanted| {
        live.spec
            .containers
            .iter()
            .find(|container| container.name == wanted.name)
            .is_some_and(|container| container_matches(wanted, container, ownership))
    });
    if !containers_match {
        return false;
    }
    let volumes_match = desired
        .spec
        .volumes
        .iter()
        .all(|wanted| live.spec.volumes.iter().any(|volume| volume == wanted));
    if !volumes_match {
        return false;
    }
    // Volumes applied earlier but no longer desired must be pruned.
    let stale = live.spec.volumes.iter().any(|volume| {
        is_ours(ownership, &volume_pointer(&volume.name))
            && !desired
                .spec
                .volumes
                .iter()
                .any(|wanted| wanted.name == volume.name)
    });
    if stale {
        return false;
    }
    desired.spec.service_account_name.is_none()
        || desired.spec.service_account_name == live.spec.service_account_name
}

/// True when every owned field of `live` matches `desired`.
pub fn owned_fields_match(desired: &Deployment, live: &Deployment) -> bool {
    let ownership = FieldOwnership::from_annotations(&live.metadata.annotations);
    is_subset(&desired.metadata.labels, &live.metadata.labels)
        && (desired.spec.replicas.is_none() || desired.spec.replicas == live.spec.replicas)
        && template_matches(&desired.spec.template, &live.spec.template, &ownership)
}

/// Overwrites the owned fields of `live` with those of `desired`.
pub fn apply_owned_fields(desired: &Deployment, live: &mut Deployment) -> Result<(), serde_json::Error> {
    let mut ownership = FieldOwnership::from_annotations(&live.metadata.annotations);
    live.metadata
        .labels
        .extend(desired.metadata.labels.clone());
    if desired.spec.replicas.is_some() {
        live.spec.replicas = desired.spec.replicas;
    }

    let wanted = &desired.spec.template;
    let template = &mut live.spec.template;
    template
        .metadata
        .labels
        .extend(wanted.metadata.labels.clone());
    template
        .metadata
        .annotations
        .extend(wanted.metadata.annotations.clone());

    for container in &wanted.spec.containers {
        match template
            .spec
            .containers
            .iter_mut()
            .find(|existing| existing.name == container.name)
        {
            Some(existing) => merge_container(container, existing, &mut ownership),
            None => {
                claim_env(container, &mut ownership);
                template.spec.containers.push(container.clone());
            }
        }
    }

    let mut pruned = Vec::new();
    template.spec.volumes.retain(|volume| {
        let pointer = volume_pointer(&volume.name);
        let ours = is_ours(&ownership, &pointer);
        let keep = !ours || wanted.spec.volumes.iter().any(|v| v.name == volume.name);
        if !keep {
            pruned.push(pointer);
        }
        keep
    });
    for pointer in pruned {
        ownership.release(&pointer);
    }
    for volume in &wanted.spec.volumes {
        match template
            .spec
            .volumes
            .iter_mut()
            .find(|existing| existing.name == volume.name)
        {
            Some(existing) => *existing = volume.clone(),
            None => template.spec.volumes.push(volume.clone()),
        }
        ownership.set_owner(&volume_pointer(&volume.name), MANAGED_BY_VALUE);
    }
    if wanted.spec.service_account_name.is_some() {
        template.spec.service_account_name = wanted.spec.service_account_name.clone();
    }
    ownership.store(&mut live.metadata.annotations)
}

fn claim_env(container: &ContainerSpec, ownership: &mut FieldOwnership) {
    for var in &container.env {
        ownership.set_owner(&env_pointer(&container.name, &var.name), MANAGED_BY_VALUE);
    }
}

/// Records ownership of every volume and env entry in a Deployment about to
/// be created.
fn claim_owned_fields(desired: &mut Deployment) -> Result<(), serde_json::Error> {
    let mut ownership = FieldOwnership::from_annotations(&desired.metadata.annotations);
    for volume in &desired.spec.template.spec.volumes {
        ownership.set_owner(&volume_pointer(&volume.name), MANAGED_BY_VALUE);
    }
    for container in &desired.spec.template.spec.containers {
        claim_env(container, &mut ownership);
    }
    ownership.store(&mut desired.metadata.annotations)
}

/// Whether the live Deployment is missing or has drifted.
pub async fn needs_write(ctx: &ActionContext, desired: &Deployment) -> Result<bool, ClusterError> {
    let api = ctx.api::<Deployment>(desired.metadata.namespace());
    match api.get_opt(desired.metadata.name()).await? {
        Some(live) => Ok(!owned_fields_match(desired, &live)),
        None => Ok(true),
    }
}

/// Creates the Deployment or corrects drift in its owned fields. Retries a
/// bounded number of times when the live object moves underneath.
pub async fn ensure_deployment(
    ctx: &ActionContext,
    controller: &str,
    mut desired: Deployment,
) -> Result<DriftOutcome, ClusterError> {
    let api = ctx.api::<Deployment>(desired.metadata.namespace());
    let name = desired.metadata.name().to_string();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let Some(mut live) = api.get_opt(&name).await? else {
            claim_owned_fields(&mut desired)?;
            match api.create(&desired).await {
                Ok(_) => {
                    log_info(
                        COMPONENT,
                        "Created deployment",
                        &[("deployment", name.as_str()), ("controller", controller)],
                    );
                    return Ok(DriftOutcome::Created);
                }
                Err(err) if err.is_already_exists() && attempt < UPDATE_ATTEMPTS => continue,
                Err(err) => return Err(err),
            }
        };
        if owned_fields_match(&desired, &live) {
            log_debug(
                COMPONENT,
                "Deployment in sync",
                &[("deployment", name.as_str())],
            );
            return Ok(DriftOutcome::InSync);
        }
        apply_owned_fields(&desired, &mut live)?;
        match api.update(&live).await {
            Ok(_) => {
                metrics::record_drift_correction(controller, "Deployment");
                log_info(
                    COMPONENT,
                    "Corrected deployment drift",
                    &[("deployment", name.as_str()), ("controller", controller)],
                );
                return Ok(DriftOutcome::Updated);
            }
            Err(err) if err.is_conflict() && attempt < UPDATE_ATTEMPTS => continue,
            Err(err) => return Err(err),
        }
    }
}
