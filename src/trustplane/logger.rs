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

use crate::trustplane::observability::tracing;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
#[cfg(not(test))]
use std::io::{self, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
#[cfg(test)]
use std::sync::{Mutex, OnceLock};

const SERVICE_NAME: &str = "trustplane";

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogFormat {
    Text = 0,
    Json = 1,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unsupported log format '{other}'")),
        }
    }
}

static LOG_FORMAT: AtomicU8 = AtomicU8::new(LogFormat::Text as u8);

pub fn set_log_format(format: LogFormat) {
    LOG_FORMAT.store(format as u8, Ordering::Relaxed);
}

pub fn current_log_format() -> LogFormat {
    match LOG_FORMAT.load(Ordering::Relaxed) {
        1 => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    #[cfg_attr(test, allow(dead_code))]
    fn is_stderr(self) -> bool {
        matches!(self, LogLevel::Warn | LogLevel::Error)
    }
}

fn quote_if_needed(value: &str) -> String {
    let plain = !value.is_empty()
        && !value.chars().any(|c| {
            c.is_whitespace() || matches!(c, '"' | '\\' | '=' | '[' | ']' | '{' | '}' | ',')
        });
    if plain {
        return value.to_string();
    }
    // Debug formatting escapes quotes, backslashes and control characters.
    format!("{value:?}")
}

fn render_text(fields: &Map<String, Value>) -> String {
    fields
        .iter()
        .map(|(key, value)| {
            let raw = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
            format!("{key}={}", quote_if_needed(&raw))
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn log_event(level: LogLevel, component: &str, message: &str, metadata: &[(&str, &str)]) {
    let mut fields = Map::new();
    fields.insert(
        "ts".into(),
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true).into(),
    );
    fields.insert("level".into(), level.as_str().into());
    fields.insert("service".into(), SERVICE_NAME.into());
    fields.insert("component".into(), component.into());
    fields.insert("pid".into(), std::process::id().to_string().into());
    fields.insert("msg".into(), message.into());
    if let Some(ctx) = tracing::current_context() {
        fields.insert("trace_id".into(), ctx.trace_id().into());
        fields.insert("span_id".into(), ctx.span_id().into());
    }
    for (key, value) in metadata.iter().filter(|(key, _)| !key.is_empty()) {
        fields.insert((*key).to_string(), (*value).into());
    }

    let line = match current_log_format() {
        LogFormat::Text => render_text(&fields),
        LogFormat::Json => Value::Object(fields).to_string(),
    };
    write_line(level, &line);
}

pub fn log_debug(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Debug, component, message, metadata);
}

pub fn log_info(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Info, component, message, metadata);
}

pub fn log_warn(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Warn, component, message, metadata);
}

pub fn log_error(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Error, component, message, metadata);
}

#[cfg(not(test))]
fn write_line(level: LogLevel, line: &str) {
    let result = if level.is_stderr() {
        writeln!(io::stderr().lock(), "{line}")
    } else {
        writeln!(io::stdout().lock(), "{line}")
    };
    if let Err(error) = result {
        let _ = writeln!(
            io::stderr().lock(),
            "trustplane: failed to write log line: {error} (original: {line})"
        );
    }
}

#[cfg(test)]
fn write_line(level: LogLevel, line: &str) {
    let mut guard = test_log_store()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.push((level, line.to_string()));
}

#[cfg(test)]
fn test_log_store() -> &'static Mutex<Vec<(LogLevel, String)>> {
    static STORE: OnceLock<Mutex<Vec<(LogLevel, String)>>> = OnceLock::new();
    STORE.get_or_init(|| Mutex::new(Vec::new()))
}

/// Drains captured log lines. Only lines emitted by the calling test's
/// component should be inspected since tests run in parallel.
#[cfg(test)]
pub(crate) fn take_test_logs() -> Vec<(LogLevel, String)> {
    let mut guard = test_log_store()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.drain(..).collect()
}
