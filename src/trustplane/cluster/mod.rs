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

//! Control-plane access. [`ClusterClient`] is the object-safe contract the
//! engine consumes; [`Api`] adds typed access on top of it.

pub mod memory;

use crate::trustplane::k8s::meta::{LabelSelector, ObjectKey, ObjectMeta};
use crate::trustplane::k8s::resource::Resource;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use serde_json::Value;
use std::error::Error;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

pub type ClusterFuture<'a, T> = BoxFuture<'a, Result<T, ClusterError>>;
pub type WatchStream = BoxStream<'static, WatchEvent>;

#[derive(Debug)]
pub enum ClusterError {
    NotFound(ObjectKey),
    AlreadyExists(ObjectKey),
    /// The write was based on a stale `resourceVersion`.
    Conflict {
        key: ObjectKey,
        expected: String,
        actual: String,
    },
    Invalid {
        key: ObjectKey,
        reason: String,
    },
    Serialization(serde_json::Error),
    Unavailable(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists(_))
    }
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterError::NotFound(key) => write!(f, "{key} not found"),
            ClusterError::AlreadyExists(key) => write!(f, "{key} already exists"),
            ClusterError::Conflict {
                key,
                expected,
                actual,
            } => write!(
                f,
                "conflict writing {key}: resourceVersion {expected} is stale (current {actual})"
            ),
            ClusterError::Invalid { key, reason } => write!(f, "{key} is invalid: {reason}"),
            ClusterError::Serialization(err) => write!(f, "object serialization failed: {err}"),
            ClusterError::Unavailable(reason) => write!(f, "control plane unavailable: {reason}"),
        }
    }
}

impl Error for ClusterError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ClusterError::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Serialization(err)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

impl WatchEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchEventType::Added => "ADDED",
            WatchEventType::Modified => "MODIFIED",
            WatchEventType::Deleted => "DELETED",
        }
    }
}

#[derive(Clone, Debug)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub kind: String,
    pub object: Value,
}

impl WatchEvent {
    pub fn metadata(&self) -> ObjectMeta {
        object_meta(&self.object)
    }
}

/// Filters applied by [`ClusterClient::list`].
#[derive(Clone, Debug, Default)]
pub struct ListParams {
    pub namespace: Option<String>,
    pub selector: LabelSelector,
    pub owner_uid: Option<String>,
}

impl ListParams {
    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        if let Some(namespace) = self.namespace.as_deref() {
            if meta.namespace() != namespace {
                return false;
            }
        }
        if let Some(uid) = self.owner_uid.as_deref() {
            if !meta.is_owned_by(uid) {
                return false;
            }
        }
        self.selector.matches(&meta.labels)
    }
}

/// Object-safe control-plane contract over JSON objects. Every mutating
/// call is subject to optimistic concurrency on `metadata.resourceVersion`,
/// except `patch`.
pub trait ClusterClient: Send + Sync {
    fn get<'a>(&'a self, key: &'a ObjectKey) -> ClusterFuture<'a, Value>;

    fn list<'a>(&'a self, kind: &'a str, params: &'a ListParams) -> ClusterFuture<'a, Vec<Value>>;

    fn create<'a>(&'a self, kind: &'a str, object: Value) -> ClusterFuture<'a, Value>;

    /// Replaces everything but `status`.
    fn update<'a>(&'a self, kind: &'a str, object: Value) -> ClusterFuture<'a, Value>;

    /// Replaces only `status`.
    fn update_status<'a>(&'a self, kind: &'a str, object: Value) -> ClusterFuture<'a, Value>;

    /// Applies a JSON merge patch.
    fn patch<'a>(&'a self, key: &'a ObjectKey, patch: Value) -> ClusterFuture<'a, Value>;

    fn delete<'a>(&'a self, key: &'a ObjectKey) -> ClusterFuture<'a, ()>;

    fn watch(&self, kind: &str, namespace: Option<&str>) -> WatchStream;
}

pub(crate) fn object_meta(object: &Value) -> ObjectMeta {
    object
        .get("metadata")
        .cloned()
        .and_then(|meta| serde_json::from_value(meta).ok())
        .unwrap_or_default()
}

/// Typed, namespaced view over a [`ClusterClient`].
pub struct Api<T> {
    client: Arc<dyn ClusterClient>,
    namespace: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Api<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            namespace: self.namespace.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Resource> Api<T> {
    pub fn namespaced(client: Arc<dyn ClusterClient>, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            _marker: PhantomData,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(&self, name: &str) -> ObjectKey {
        ObjectKey::new(T::KIND, &self.namespace, name)
    }

    fn encode(&self, object: &T) -> Result<Value, ClusterError> {
        let mut value = serde_json::to_value(object)?;
        if let Value::Object(map) = &mut value {
            map.insert("apiVersion".into(), Value::String(T::API_VERSION.into()));
            map.insert("kind".into(), Value::String(T::KIND.into()));
            let meta = map
                .entry("metadata")
                .or_insert_with(|| Value::Object(Default::default()));
            if let Value::Object(meta) = meta {
                meta.entry("namespace")
                    .or_insert_with(|| Value::String(self.namespace.clone()));
            }
        }
        Ok(value)
    }

    fn decode(value: Value) -> Result<T, ClusterError> {
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get(&self, name: &str) -> Result<T, ClusterError> {
        let key = self.key(name);
        Self::decode(self.client.get(&key).await?)
    }

    /// Like [`Api::get`] but maps `NotFound` to `None`.
    pub async fn get_opt(&self, name: &str) -> Result<Option<T>, ClusterError> {
        match self.get(name).await {
            Ok(object) => Ok(Some(object)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn list(&self, selector: &LabelSelector) -> Result<Vec<T>, ClusterError> {
        let params = ListParams {
            namespace: Some(self.namespace.clone()),
            selector: selector.clone(),
            owner_uid: None,
        };
        self.list_with(&params).await
    }

    pub async fn list_owned(&self, owner_uid: &str) -> Result<Vec<T>, ClusterError> {
        let params = ListParams {
            namespace: Some(self.namespace.clone()),
            selector: LabelSelector::everything(),
            owner_uid: Some(owner_uid.to_string()),
        };
        self.list_with(&params).await
    }

    async fn list_with(&self, params: &ListParams) -> Result<Vec<T>, ClusterError> {
        self.client
            .list(T::KIND, params)
            .await?
            .into_iter()
            .map(Self::decode)
            .collect()
    }

    pub async fn create(&self, object: &T) -> Result<T, ClusterError> {
        let value = self.encode(object)?;
        Self::decode(self.client.create(T::KIND, value).await?)
    }

    pub async fn update(&self, object: &T) -> Result<T, ClusterError> {
        let value = self.encode(object)?;
        Self::decode(self.client.update(T::KIND, value).await?)
    }

    pub async fn update_status(&self, object: &T) -> Result<T, ClusterError> {
        let value = self.encode(object)?;
        Self::decode(self.client.update_status(T::KIND, value).await?)
    }

    pub async fn patch(&self, name: &str, patch: &Value) -> Result<T, ClusterError> {
        let key = self.key(name);
        Self::decode(self.client.patch(&key, patch.clone()).await?)
    }

    pub async fn delete(&self, name: &str) -> Result<(), ClusterError> {
        let key = self.key(name);
        self.client.delete(&key).await
    }
}
