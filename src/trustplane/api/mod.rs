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

//! Declarative resources reconciled by the controllers and the status
//! surface they publish.

pub mod common;
pub mod conditions;
pub mod ctlog;
pub mod fulcio;
pub mod rekor;

use crate::trustplane::k8s::resource::Resource;
use conditions::Conditions;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A resource with a status block owned by a reconciliation pipeline.
pub trait Reconcilable: Resource {
    type Status: Clone + Default + PartialEq + Serialize + DeserializeOwned + Send + Sync;

    fn status(&self) -> &Self::Status;

    fn status_mut(&mut self) -> &mut Self::Status;

    fn conditions(&self) -> &Conditions;

    fn conditions_mut(&mut self) -> &mut Conditions;
}
