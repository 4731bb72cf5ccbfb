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

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Annotation holding the serialized [`FieldOwnership`] of a child object.
pub const OWNERSHIP_ANNOTATION: &str = "trustplane.dev/managed-fields";

/// Records which manager last applied a given JSON pointer on a child.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldOwnership {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    entries: BTreeMap<String, String>,
}

impl FieldOwnership {
    /// Reads the ownership record; a missing or unreadable annotation yields an empty record.
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        annotations
            .get(OWNERSHIP_ANNOTATION)
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    pub fn store(&self, annotations: &mut BTreeMap<String, String>) -> Result<(), serde_json::Error> {
        if self.entries.is_empty() {
            annotations.remove(OWNERSHIP_ANNOTATION);
        } else {
            annotations.insert(OWNERSHIP_ANNOTATION.to_string(), serde_json::to_string(self)?);
        }
        Ok(())
    }

    pub fn set_owner(&mut self, pointer: &str, manager: &str) {
        self.entries
            .insert(pointer.trim().to_string(), manager.trim().to_string());
    }

    pub fn manager_for(&self, pointer: &str) -> Option<&str> {
        self.entries.get(pointer.trim()).map(|value| value.as_str())
    }

    pub fn release(&mut self, pointer: &str) {
        self.entries.remove(pointer.trim());
    }

    pub fn owned_by<'a>(&'a self, manager: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(_, owner)| owner.as_str() == manager)
            .map(|(pointer, _)| pointer.as_str())
    }
}

pub fn volume_pointer(name: &str) -> String {
    format!("/spec/template/spec/volumes/{name}")
}

pub fn env_pointer(container: &str, name: &str) -> String {
    format!("/spec/template/spec/containers/{container}/env/{name}")
}
