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

//! Observability primitives for the reconciliation engine.
//!
//! Metric names follow the Prometheus conventions used by Kubernetes
//! controllers: snake_case, prefixed with `trustplane`, counters ending with
//! `_total` and durations with `_seconds`.

pub mod metrics;
pub mod tracing;
