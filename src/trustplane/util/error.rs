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
use std::fmt;

pub type BoxError = Box<dyn Error + Send + Sync>;

#[derive(Debug)]
struct ContextError {
    context: String,
    source: BoxError,
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.source)
    }
}

impl Error for ContextError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.source.as_ref())
    }
}

#[derive(Debug)]
struct MessageError(String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for MessageError {}

pub fn with_context<E>(error: E, context: impl Into<String>) -> BoxError
where
    E: Into<BoxError>,
{
    Box::new(ContextError {
        context: context.into(),
        source: error.into(),
    })
}

pub fn new_error(message: impl Into<String>) -> BoxError {
    Box::new(MessageError(message.into()))
}

/// Attaches a human readable context to the error side of a `Result`.
pub trait ResultContext<T> {
    fn context(self, context: &str) -> Result<T, BoxError>;
}

impl<T, E> ResultContext<T> for Result<T, E>
where
    E: Into<BoxError>,
{
    fn context(self, context: &str) -> Result<T, BoxError> {
        self.map_err(|err| with_context(err, context))
    }
}
