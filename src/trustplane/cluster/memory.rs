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

//! Standalone control plane kept in process memory.
//!
//! Objects are stored as JSON keyed by [`ObjectKey`]. Every accepted write
//! bumps a global resource version and is broadcast to watchers. Deleting an
//! object sweeps every object whose owner references point at it.

use super::{object_meta, ClusterClient, ClusterError, ClusterFuture, ListParams, WatchEvent,
    WatchEventType, WatchStream};
use crate::trustplane::k8s::meta::ObjectKey;
use crate::trustplane::logger::log_warn;
use crate::trustplane::util::keys::random_name_suffix;
use futures_util::future::{ready, FutureExt};
use futures_util::StreamExt;
use rand::{rngs::OsRng, RngCore};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

const COMPONENT: &str = "memory-cluster";
const WATCH_BUFFER_SIZE: usize = 1024;
const GENERATED_SUFFIX_LEN: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    UpdateStatus,
    Patch,
    Delete,
}

pub struct InMemoryCluster {
    objects: Mutex<BTreeMap<ObjectKey, Value>>,
    faults: Mutex<VecDeque<(Operation, String, ClusterError)>>,
    events: broadcast::Sender<WatchEvent>,
    resource_counter: AtomicU64,
    writes: AtomicU64,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER_SIZE);
        Self {
            objects: Mutex::new(BTreeMap::new()),
            faults: Mutex::new(VecDeque::new()),
            events,
            resource_counter: AtomicU64::new(1),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of accepted writes since construction.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Makes the next matching call fail with `error`.
    pub fn inject_fault(&self, operation: Operation, kind: &str, error: ClusterError) {
        self.faults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back((operation, kind.to_string(), error));
    }

    fn take_fault(&self, operation: Operation, kind: &str) -> Option<ClusterError> {
        let mut faults = self
            .faults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let index = faults
            .iter()
            .position(|(op, fault_kind, _)| *op == operation && fault_kind == kind)?;
        faults.remove(index).map(|(_, _, error)| error)
    }

    fn lock_objects(&self) -> std::sync::MutexGuard<'_, BTreeMap<ObjectKey, Value>> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_resource_version(&self) -> String {
        self.resource_counter
            .fetch_add(1, Ordering::SeqCst)
            .to_string()
    }

    fn publish(&self, event_type: WatchEventType, kind: &str, object: &Value) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        // No receivers is not an error.
        let _ = self.events.send(WatchEvent {
            event_type,
            kind: kind.to_string(),
            object: object.clone(),
        });
    }

    fn create_object(&self, kind: &str, mut object: Value) -> Result<Value, ClusterError> {
        let meta = object_meta(&object);
        let namespace = meta.namespace().to_string();
        let mut objects = self.lock_objects();

        let name = match (meta.name.as_deref(), meta.generate_name.as_deref()) {
            (Some(name), _) if !name.is_empty() => name.to_string(),
            (_, Some(prefix)) if !prefix.is_empty() => loop {
                let candidate = format!("{prefix}{}", random_name_suffix(GENERATED_SUFFIX_LEN));
                if !objects.contains_key(&ObjectKey::new(kind, &namespace, &candidate)) {
                    break candidate;
                }
            },
            _ => {
                return Err(ClusterError::Invalid {
                    key: ObjectKey::new(kind, &namespace, ""),
                    reason: "metadata.name or metadata.generateName is required".into(),
                })
            }
        };

        let key = ObjectKey::new(kind, &namespace, &name);
        if objects.contains_key(&key) {
            return Err(ClusterError::AlreadyExists(key));
        }

        let mut uid = [0u8; 16];
        OsRng.fill_bytes(&mut uid);
        let meta_map = metadata_map(&mut object);
        meta_map.insert("name".into(), Value::String(name));
        meta_map.insert("namespace".into(), Value::String(namespace));
        meta_map.insert("uid".into(), Value::String(hex::encode(uid)));
        meta_map.insert("generation".into(), Value::from(1));
        meta_map.insert(
            "resourceVersion".into(),
            Value::String(self.next_resource_version()),
        );

        objects.insert(key, object.clone());
        drop(objects);
        self.publish(WatchEventType::Added, kind, &object);
        Ok(object)
    }

    fn replace_object(
        &self,
        kind: &str,
        mut object: Value,
        status_only: bool,
    ) -> Result<Value, ClusterError> {
        let meta = object_meta(&object);
        let key = ObjectKey::new(kind, meta.namespace(), meta.name());
        let mut objects = self.lock_objects();
        let stored = objects
            .get(&key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(key.clone()))?;
        let stored_meta = object_meta(&stored);

        let expected = meta.resource_version.clone().ok_or_else(|| ClusterError::Invalid {
            key: key.clone(),
            reason: "metadata.resourceVersion is required for updates".into(),
        })?;
        let actual = stored_meta.resource_version.clone().unwrap_or_default();
        if expected != actual {
            return Err(ClusterError::Conflict {
                key,
                expected,
                actual,
            });
        }

        let mut candidate = if status_only {
            let mut candidate = stored.clone();
            set_field(&mut candidate, "status", object.get("status").cloned());
            candidate
        } else {
            set_field(&mut object, "status", stored.get("status").cloned());
            let meta_map = metadata_map(&mut object);
            for field in ["uid", "generation"] {
                match stored_meta_field(&stored, field) {
                    Some(value) => meta_map.insert(field.into(), value),
                    None => meta_map.remove(field),
                };
            }
            object
        };

        if candidate == stored {
            return Ok(stored);
        }
        validate_transition(kind, &key, &stored, &candidate)?;

        if !status_only && candidate.get("spec") != stored.get("spec") {
            let generation = stored_meta.generation.unwrap_or(1) + 1;
            metadata_map(&mut candidate).insert("generation".into(), Value::from(generation));
        }
        metadata_map(&mut candidate).insert(
            "resourceVersion".into(),
            Value::String(self.next_resource_version()),
        );

        objects.insert(key, candidate.clone());
        drop(objects);
        self.publish(WatchEventType::Modified, kind, &candidate);
        Ok(candidate)
    }

    fn patch_object(&self, key: &ObjectKey, patch: Value) -> Result<Value, ClusterError> {
        let mut objects = self.lock_objects();
        let stored = objects
            .get(key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(key.clone()))?;

        let mut candidate = stored.clone();
        merge_patch(&mut candidate, &patch);
        let meta_map = metadata_map(&mut candidate);
        for field in ["name", "namespace", "uid", "resourceVersion"] {
            match stored_meta_field(&stored, field) {
                Some(value) => meta_map.insert(field.into(), value),
                None => meta_map.remove(field),
            };
        }
        if candidate == stored {
            return Ok(stored);
        }
        validate_transition(&key.kind, key, &stored, &candidate)?;
        metadata_map(&mut candidate).insert(
            "resourceVersion".into(),
            Value::String(self.next_resource_version()),
        );

        objects.insert(key.clone(), candidate.clone());
        drop(objects);
        self.publish(WatchEventType::Modified, &key.kind, &candidate);
        Ok(candidate)
    }

    fn delete_object(&self, key: &ObjectKey) -> Result<(), ClusterError> {
        let mut objects = self.lock_objects();
        let removed = objects
            .remove(key)
            .ok_or_else(|| ClusterError::NotFound(key.clone()))?;

        let mut deleted = vec![(key.kind.clone(), removed)];
        let mut pending: VecDeque<String> = object_meta(&deleted[0].1).uid.into_iter().collect();
        let mut swept: HashSet<String> = HashSet::new();
        while let Some(owner_uid) = pending.pop_front() {
            if !swept.insert(owner_uid.clone()) {
                continue;
            }
            let dependents: Vec<ObjectKey> = objects
                .iter()
                .filter(|(_, value)| object_meta(value).is_owned_by(&owner_uid))
                .map(|(key, _)| key.clone())
                .collect();
            for dependent in dependents {
                if let Some(value) = objects.remove(&dependent) {
                    pending.extend(object_meta(&value).uid);
                    deleted.push((dependent.kind.clone(), value));
                }
            }
        }
        drop(objects);

        for (kind, value) in &deleted {
            self.publish(WatchEventType::Deleted, kind, value);
        }
        Ok(())
    }
}

impl ClusterClient for InMemoryCluster {
    fn get<'a>(&'a self, key: &'a ObjectKey) -> ClusterFuture<'a, Value> {
        let result = self
            .lock_objects()
            .get(key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(key.clone()));
        ready(result).boxed()
    }

    fn list<'a>(&'a self, kind: &'a str, params: &'a ListParams) -> ClusterFuture<'a, Vec<Value>> {
        let items = self
            .lock_objects()
            .iter()
            .filter(|(key, value)| key.kind == kind && params.matches(&object_meta(value)))
            .map(|(_, value)| value.clone())
            .collect();
        ready(Ok(items)).boxed()
    }

    fn create<'a>(&'a self, kind: &'a str, object: Value) -> ClusterFuture<'a, Value> {
        let result = match self.take_fault(Operation::Create, kind) {
            Some(error) => Err(error),
            None => self.create_object(kind, object),
        };
        ready(result).boxed()
    }

    fn update<'a>(&'a self, kind: &'a str, object: Value) -> ClusterFuture<'a, Value> {
        let result = match self.take_fault(Operation::Update, kind) {
            Some(error) => Err(error),
            None => self.replace_object(kind, object, false),
        };
        ready(result).boxed()
    }

    fn update_status<'a>(&'a self, kind: &'a str, object: Value) -> ClusterFuture<'a, Value> {
        let result = match self.take_fault(Operation::UpdateStatus, kind) {
            Some(error) => Err(error),
            None => self.replace_object(kind, object, true),
        };
        ready(result).boxed()
    }

    fn patch<'a>(&'a self, key: &'a ObjectKey, patch: Value) -> ClusterFuture<'a, Value> {
        let result = match self.take_fault(Operation::Patch, &key.kind) {
            Some(error) => Err(error),
            None => self.patch_object(key, patch),
        };
        ready(result).boxed()
    }

    fn delete<'a>(&'a self, key: &'a ObjectKey) -> ClusterFuture<'a, ()> {
        let result = match self.take_fault(Operation::Delete, &key.kind) {
            Some(error) => Err(error),
            None => self.delete_object(key),
        };
        ready(result).boxed()
    }

    fn watch(&self, kind: &str, namespace: Option<&str>) -> WatchStream {
        let kind = kind.to_string();
        let namespace = namespace.map(str::to_string);
        BroadcastStream::new(self.events.subscribe())
            .filter_map(move |item| {
                let event = match item {
                    Ok(event) => event,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        let skipped = skipped.to_string();
                        log_warn(
                            COMPONENT,
                            "Watch subscriber lagged; events dropped",
                            &[("kind", kind.as_str()), ("skipped", skipped.as_str())],
                        );
                        return ready(None);
                    }
                };
                let matches = event.kind == kind
                    && namespace
                        .as_deref()
                        .map(|ns| event.metadata().namespace() == ns)
                        .unwrap_or(true);
                ready(matches.then_some(event))
            })
            .boxed()
    }
}

fn metadata_map(object: &mut Value) -> &mut Map<String, Value> {
    if !object.is_object() {
        *object = Value::Object(Map::new());
    }
    let root = match object {
        Value::Object(map) => map,
        _ => unreachable!("object was normalised above"),
    };
    let meta = root
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    if !meta.is_object() {
        *meta = Value::Object(Map::new());
    }
    match meta {
        Value::Object(map) => map,
        _ => unreachable!("metadata was normalised above"),
    }
}

fn stored_meta_field(stored: &Value, field: &str) -> Option<Value> {
    stored.get("metadata").and_then(|meta| meta.get(field)).cloned()
}

fn set_field(object: &mut Value, field: &str, value: Option<Value>) {
    if let Value::Object(map) = object {
        match value {
            Some(value) => map.insert(field.to_string(), value),
            None => map.remove(field),
        };
    }
}

/// Rejects data changes to immutable secrets and config maps.
fn validate_transition(
    kind: &str,
    key: &ObjectKey,
    stored: &Value,
    candidate: &Value,
) -> Result<(), ClusterError> {
    if kind != "Secret" && kind != "ConfigMap" {
        return Ok(());
    }
    let immutable = stored.get("immutable").and_then(Value::as_bool).unwrap_or(false);
    if immutable
        && (stored.get("data") != candidate.get("data")
            || stored.get("immutable") != candidate.get("immutable"))
    {
        return Err(ClusterError::Invalid {
            key: key.clone(),
            reason: "field is immutable when `immutable` is set".into(),
        });
    }
    Ok(())
}

/// RFC 7386 JSON merge patch.
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(
                    target_map.entry(key.clone()).or_insert(Value::Null),
                    value,
                );
            }
        }
    }
}
