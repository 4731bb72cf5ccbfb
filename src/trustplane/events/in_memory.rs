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

use super::{build_event, EventKind, EventRecorder};
use crate::trustplane::k8s::event::Event;
use crate::trustplane::k8s::meta::ObjectReference;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;

const DEFAULT_EVENT_RETENTION: usize = 1024;

/// Keeps the most recent events in memory and mirrors them on a broadcast
/// feed.
pub struct InMemoryEventRecorder {
    records: Mutex<VecDeque<Event>>,
    capacity: usize,
    feed: broadcast::Sender<Event>,
}

impl Default for InMemoryEventRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_RETENTION)
    }
}

impl InMemoryEventRecorder {
    pub fn new(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(capacity.max(1));
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            feed,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.feed.subscribe()
    }

    pub fn events(&self) -> Vec<Event> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| event.reason)
            .collect()
    }
}

impl EventRecorder for InMemoryEventRecorder {
    fn record(&self, object: &ObjectReference, kind: EventKind, reason: &str, message: &str) {
        let event = build_event("in-memory", object, kind, reason, message);
        {
            let mut records = self
                .records
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if records.len() == self.capacity {
                records.pop_front();
            }
            records.push_back(event.clone());
        }
        let _ = self.feed.send(event);
    }
}
