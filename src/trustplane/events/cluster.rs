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
use crate::trustplane::cluster::{Api, ClusterClient};
use crate::trustplane::k8s::event::Event;
use crate::trustplane::k8s::meta::ObjectReference;
use crate::trustplane::logger::{log_debug, log_warn};
use std::sync::Arc;
use tokio::runtime::Handle;

const COMPONENT: &str = "event-recorder";

/// Publishes events as `Event` objects through the control plane.
pub struct ClusterEventRecorder {
    client: Arc<dyn ClusterClient>,
    reporting_component: String,
}

impl ClusterEventRecorder {
    pub fn new(client: Arc<dyn ClusterClient>, reporting_component: &str) -> Self {
        Self {
            client,
            reporting_component: reporting_component.to_string(),
        }
    }
}

impl EventRecorder for ClusterEventRecorder {
    fn record(&self, object: &ObjectReference, kind: EventKind, reason: &str, message: &str) {
        let event = build_event(&self.reporting_component, object, kind, reason, message);
        let Ok(handle) = Handle::try_current() else {
            log_warn(
                COMPONENT,
                "Dropping event recorded outside of a runtime",
                &[("reason", reason)],
            );
            return;
        };
        let api: Api<Event> = Api::namespaced(self.client.clone(), event.metadata.namespace());
        handle.spawn(async move {
            let reason = event.reason.clone().unwrap_or_default();
            match api.create(&event).await {
                Ok(created) => log_debug(
                    COMPONENT,
                    "Recorded event",
                    &[("event", created.metadata.name()), ("reason", reason.as_str())],
                ),
                Err(err) => {
                    let error = err.to_string();
                    log_warn(
                        COMPONENT,
                        "Failed to record event",
                        &[("reason", reason.as_str()), ("error", error.as_str())],
                    );
                }
            }
        });
    }
}
