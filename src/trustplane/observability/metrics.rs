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

use std::error::Error;
use std::sync::OnceLock;
use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static CONTROLLER_RECONCILES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static CONTROLLER_RECONCILE_DURATION: OnceLock<HistogramVec> = OnceLock::new();
static ACTION_EXECUTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static RESOLVER_ATTEMPTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static DRIFT_CORRECTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        Registry::new_custom(Some("trustplane".to_string()), None)
            .expect("failed to initialise trustplane metrics registry")
    })
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register trustplane metric collector");
    collector
}

fn counter(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)
        .unwrap_or_else(|err| panic!("failed to build counter {name}: {err}"));
    register_collector(counter)
}

fn controller_reconciles_total() -> &'static IntCounterVec {
    CONTROLLER_RECONCILES_TOTAL.get_or_init(|| {
        counter(
            "controller_reconciles_total",
            "Reconciliation invocations grouped by controller and result",
            &["controller", "result"],
        )
    })
}

fn controller_reconcile_duration() -> &'static HistogramVec {
    CONTROLLER_RECONCILE_DURATION.get_or_init(|| {
        let opts = HistogramOpts::new(
            "controller_reconcile_duration_seconds",
            "Latency of a single reconciliation invocation",
        )
        .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]);
        let histogram = HistogramVec::new(opts, &["controller"])
            .expect("failed to build reconcile duration histogram");
        register_collector(histogram)
    })
}

fn action_executions_total() -> &'static IntCounterVec {
    ACTION_EXECUTIONS_TOTAL.get_or_init(|| {
        counter(
            "action_executions_total",
            "Pipeline action executions grouped by outcome",
            &["controller", "action", "result"],
        )
    })
}

fn resolver_attempts_total() -> &'static IntCounterVec {
    RESOLVER_ATTEMPTS_TOTAL.get_or_init(|| {
        counter(
            "resolver_attempts_total",
            "Dependency resolution attempts grouped by dependency and result",
            &["dependency", "result"],
        )
    })
}

fn drift_corrections_total() -> &'static IntCounterVec {
    DRIFT_CORRECTIONS_TOTAL.get_or_init(|| {
        counter(
            "drift_corrections_total",
            "Child objects created or corrected by drift detection",
            &["controller", "kind"],
        )
    })
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReconcileResult {
    Converged,
    Progressed,
    Requeued,
    Error,
}

impl ReconcileResult {
    fn as_label(self) -> &'static str {
        match self {
            ReconcileResult::Converged => "converged",
            ReconcileResult::Progressed => "progressed",
            ReconcileResult::Requeued => "requeued",
            ReconcileResult::Error => "error",
        }
    }
}

pub fn record_reconcile(controller: &str, result: ReconcileResult, elapsed: Duration) {
    controller_reconciles_total()
        .with_label_values(&[controller, result.as_label()])
        .inc();
    controller_reconcile_duration()
        .with_label_values(&[controller])
        .observe(elapsed.as_secs_f64());
}

pub fn record_action(controller: &str, action: &str, result: &str) {
    action_executions_total()
        .with_label_values(&[controller, action, result])
        .inc();
}

pub fn record_resolver_attempt(dependency: &str, success: bool) {
    let result = if success { "success" } else { "failure" };
    resolver_attempts_total()
        .with_label_values(&[dependency, result])
        .inc();
}

pub fn record_drift_correction(controller: &str, kind: &str) {
    drift_corrections_total()
        .with_label_values(&[controller, kind])
        .inc();
}

/// Encodes all registered metrics using the Prometheus text exposition
/// format.
pub fn gather() -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&metric_families, &mut buffer)
        .map_err(|err| Box::new(err) as Box<dyn Error + Send + Sync>)?;
    Ok(buffer)
}
