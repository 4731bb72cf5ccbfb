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

//! Event sink used by actions to surface notable transitions on a resource.
//! Recording is fire-and-forget: callers never wait on or observe delivery.

pub mod cluster;
pub mod in_memory;

use crate::trustplane::k8s::event::Event;
use crate::trustplane::k8s::meta::{ObjectMeta, ObjectReference};
use chrono::{SecondsFormat, Utc};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Normal => "Normal",
            EventKind::Warning => "Warning",
        }
    }
}

pub trait EventRecorder: Send + Sync {
    fn record(&self, object: &ObjectReference, kind: EventKind, reason: &str, message: &str);
}

pub(crate) fn build_event(
    component: &str,
    object: &ObjectReference,
    kind: EventKind,
    reason: &str,
    message: &str,
) -> Event {
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let involved = object.name.as_deref().unwrap_or("object");
    let namespace = object.namespace.as_deref().unwrap_or("default");
    Event {
        metadata: ObjectMeta::generated(namespace, &format!("{involved}.")),
        involved_object: object.clone(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        event_type: Some(kind.as_str().to_string()),
        first_timestamp: Some(now.clone()),
        last_timestamp: Some(now),
        count: Some(1),
        reporting_component: Some(component.to_string()),
    }
}
