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

use super::meta::{ObjectKey, ObjectMeta, ObjectReference, OwnerReference};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Typed object stored in the control plane.
pub trait Resource: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: &'static str;
    const API_VERSION: &'static str;

    fn metadata(&self) -> &ObjectMeta;

    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    fn key(&self) -> ObjectKey {
        let meta = self.metadata();
        ObjectKey::new(Self::KIND, meta.namespace(), meta.name())
    }

    fn object_reference(&self) -> ObjectReference {
        let meta = self.metadata();
        ObjectReference {
            api_version: Some(Self::API_VERSION.to_string()),
            kind: Some(Self::KIND.to_string()),
            name: meta.name.clone(),
            namespace: meta.namespace.clone(),
            uid: meta.uid.clone(),
            resource_version: meta.resource_version.clone(),
        }
    }

    /// Controller owner reference pointing at this object.
    fn owner_reference(&self) -> OwnerReference {
        let meta = self.metadata();
        OwnerReference {
            api_version: Self::API_VERSION.to_string(),
            kind: Self::KIND.to_string(),
            name: meta.name().to_string(),
            uid: meta.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }
}

macro_rules! impl_resource {
    ($ty:ty, $kind:expr, $api_version:expr) => {
        impl $crate::trustplane::k8s::resource::Resource for $ty {
            const KIND: &'static str = $kind;
            const API_VERSION: &'static str = $api_version;

            fn metadata(&self) -> &$crate::trustplane::k8s::meta::ObjectMeta {
                &self.metadata
            }

            fn metadata_mut(&mut self) -> &mut $crate::trustplane::k8s::meta::ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

pub(crate) use impl_resource;
