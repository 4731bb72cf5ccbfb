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

//! Turns change notifications on watched kinds into work-queue keys for the
//! primary kind.

use super::runtime::WorkQueue;
use crate::trustplane::cluster::{object_meta, ClusterClient, ListParams, WatchEvent};
use crate::trustplane::k8s::meta::{ObjectKey, LABEL_INSTANCE};
use crate::trustplane::logger::{log_debug, log_warn};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "watch";
const BACKOFF_INITIAL_MS: u64 = 200;
const BACKOFF_MAX_MS: u64 = 10_000;

/// Where change notifications come from and how they map back to the
/// primary resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchSource {
    /// The primary kind itself.
    Primary,
    /// Children whose controller owner is of the primary kind.
    Owned(&'static str),
    /// Secrets referenced by instances. A secret naming an instance through
    /// its instance label maps to that instance; any other secret maps to
    /// every instance in its namespace.
    Secrets,
    /// Secrets carrying the given label, published by another component.
    /// Each maps to every instance in its namespace; others are ignored.
    LabelledSecrets(&'static str),
}

impl WatchSource {
    pub fn kind<'a>(&'a self, primary_kind: &'a str) -> &'a str {
        match self {
            WatchSource::Primary => primary_kind,
            WatchSource::Owned(kind) => kind,
            WatchSource::Secrets | WatchSource::LabelledSecrets(_) => "Secret",
        }
    }
}

/// Keys of the primary kind affected by `event`. Only secret fan-out needs
/// the cluster.
pub async fn keys_for_event(
    source: &WatchSource,
    primary_kind: &str,
    event: &WatchEvent,
    client: &dyn ClusterClient,
) -> Vec<ObjectKey> {
    let meta = event.metadata();
    let namespace = meta.namespace().to_string();
    match source {
        WatchSource::Primary => vec![ObjectKey::new(primary_kind, &namespace, meta.name())],
        WatchSource::Owned(_) => meta
            .owner_references
            .iter()
            .filter(|owner| owner.controller == Some(true) && owner.kind == primary_kind)
            .map(|owner| ObjectKey::new(primary_kind, &namespace, &owner.name))
            .collect(),
        WatchSource::Secrets => {
            if let Some(instance) = meta.labels.get(LABEL_INSTANCE) {
                return vec![ObjectKey::new(primary_kind, &namespace, instance)];
            }
            instances_in(primary_kind, &namespace, client).await
        }
        WatchSource::LabelledSecrets(label) => {
            if !meta.labels.contains_key(*label) {
                return Vec::new();
            }
            instances_in(primary_kind, &namespace, client).await
        }
    }
}

async fn instances_in(primary_kind: &str, namespace: &str, client: &dyn ClusterClient) -> Vec<ObjectKey> {
    let params = ListParams {
        namespace: Some(namespace.to_string()),
        ..Default::default()
    };
    match client.list(primary_kind, &params).await {
        Ok(objects) => objects
            .iter()
            .map(|object| {
                let meta = object_meta(object);
                ObjectKey::new(primary_kind, namespace, meta.name())
            })
            .collect(),
        Err(err) => {
            let error = err.to_string();
            log_warn(
                COMPONENT,
                "Failed to list instances for secret change",
                &[("kind", primary_kind), ("error", error.as_str())],
            );
            Vec::new()
        }
    }
}

/// Feeds `queue` from one watch source until cancelled, re-establishing the
/// stream with backoff whenever it ends.
pub async fn feed(
    source: WatchSource,
    primary_kind: &'static str,
    client: Arc<dyn ClusterClient>,
    namespace: Option<String>,
    queue: WorkQueue<ObjectKey>,
    cancel: CancellationToken,
) {
    let kind = source.kind(primary_kind).to_string();
    let mut backoff = Duration::from_millis(BACKOFF_INITIAL_MS);
    loop {
        let mut stream = client.watch(&kind, namespace.as_deref());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = stream.next() => match event {
                    Some(event) => {
                        backoff = Duration::from_millis(BACKOFF_INITIAL_MS);
                        for key in keys_for_event(&source, primary_kind, &event, client.as_ref()).await {
                            let key_str = key.to_string();
                            log_debug(
                                COMPONENT,
                                "Enqueue from watch",
                                &[
                                    ("source", kind.as_str()),
                                    ("event", event.event_type.as_str()),
                                    ("key", key_str.as_str()),
                                ],
                            );
                            queue.add(key);
                        }
                    }
                    None => break,
                }
            }
        }

        log_warn(COMPONENT, "Watch stream ended; reconnecting", &[("kind", kind.as_str())]);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(Duration::from_millis(BACKOFF_MAX_MS));
    }
}
