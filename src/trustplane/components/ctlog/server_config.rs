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


//! The log server's configuration secret: the text-proto log config next to
//! the signing key and root certificates it points at.

use super::keys::{PRIVATE_KEY, PUBLIC_KEY};
use super::{COMPONENT_NAME, FULCIO_CERT_AVAILABLE, KEYS_AVAILABLE, SECRET_ROLE_LABEL};
use crate::trustplane::api::common::{LocalObjectReference, SecretKeySelector};
use crate::trustplane::api::conditions::Condition;
use crate::trustplane::api::ctlog::CTlog;
use crate::trustplane::cluster::ClusterError;
use crate::trustplane::components::shared::secret_value;
use crate::trustplane::components::SERVER_AVAILABLE;
use crate::trustplane::config::ControllerSettings;
use crate::trustplane::controller::{
    Action, ActionContext, ActionFuture, ActionResult, CheckFuture, ReconcileError,
};
use crate::trustplane::events::EventKind;
use crate::trustplane::k8s::meta::{labels_for_component, selector_for_component, ObjectMeta};
use crate::trustplane::k8s::resource::Resource;
use crate::trustplane::k8s::secret::Secret;
use crate::trustplane::logger::{log_debug, log_info};
use crate::trustplane::util::keys::public_key_from_private;
use std::collections::BTreeMap;

const COMPONENT: &str = "ctlog-config";
const CONFIG_ROLE: &str = "config";
pub const CONFIG_KEY: &str = "config";
pub const KEYS_MOUNT: &str = "/ctfe-keys";
pub const LOG_PREFIX: &str = "trusty";
const DEFAULT_TRILLIAN_PORT: u16 = 8091;

type SecretData = BTreeMap<String, Vec<u8>>;

fn root_key(index: usize) -> String {
    format!("fulcio-{index}")
}

fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Inputs of the log config text.
pub struct LogConfig<'a> {
    pub tree_id: i64,
    pub backend: &'a str,
    pub roots: usize,
    pub password: Option<&'a str>,
}

/// Renders the multi-log text-proto config served from [`KEYS_MOUNT`].
pub fn render_log_config(config: &LogConfig<'_>) -> String {
    let mut private_key = format!("path:\"{KEYS_MOUNT}/{PRIVATE_KEY}\"");
    if let Some(password) = config.password {
        private_key.push_str(&format!(" password:{}", quote(password)));
    }
    let mut lines = vec![
        "backends:{".to_string(),
        "  backend:{".to_string(),
        "    name:\"trillian\"".to_string(),
        format!("    backend_spec:{}", quote(config.backend)),
        "  }".to_string(),
        "}".to_string(),
        "log_configs:{".to_string(),
        "  config:{".to_string(),
        format!("    log_id:{}", config.tree_id),
        format!("    prefix:{}", quote(LOG_PREFIX)),
    ];
    lines.extend((0..config.roots).map(|index| format!("    roots_pem_file:\"{KEYS_MOUNT}/{}\"", root_key(index))));
    lines.extend([
        format!("    private_key:{{[type.googleapis.com/keyspb.PEMKeyFile]:{{{private_key}}}}}"),
        "    ext_key_usages:\"CodeSigning\"".to_string(),
        "    log_backend_name:\"trillian\"".to_string(),
        "  }".to_string(),
        "}".to_string(),
    ]);
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn backend_address(ctlog: &CTlog, settings: &ControllerSettings) -> String {
    let trillian = &ctlog.spec.trillian;
    let address = trillian
        .address
        .clone()
        .unwrap_or_else(|| settings.service_host("trillian-logserver", ctlog.metadata.namespace()));
    format!("{address}:{}", trillian.port.unwrap_or(DEFAULT_TRILLIAN_PORT))
}

/// Secret data the server should run with, or `None` while the keys, roots
/// or tree are not settled.
pub async fn render(ctx: &ActionContext, ctlog: &CTlog) -> Result<Option<SecretData>, ReconcileError> {
    let status = &ctlog.status;
    let conditions = &status.conditions;
    if !conditions.is_true(KEYS_AVAILABLE) || !conditions.is_true(FULCIO_CERT_AVAILABLE) {
        return Ok(None);
    }
    let (Some(tree_id), Some(private_ref)) = (status.tree_id, status.private_key_ref.as_ref()) else {
        return Ok(None);
    };
    if status.root_certificates.is_empty() {
        return Ok(None);
    }
    let namespace = ctlog.metadata.namespace();

    let Some(private) = secret_value(ctx, namespace, private_ref).await? else {
        return Ok(None);
    };
    let password = match status.private_key_password_ref.as_ref() {
        Some(selector) => match secret_value(ctx, namespace, selector).await? {
            Some(value) => Some(String::from_utf8(value).map_err(|_| {
                ReconcileError::InvalidConfiguration(format!(
                    "password in {}/{} is not UTF-8",
                    selector.name, selector.key
                ))
            })?),
            None => return Ok(None),
        },
        None => None,
    };
    let public = match status.public_key_ref.as_ref() {
        Some(selector) => match secret_value(ctx, namespace, selector).await? {
            Some(value) => value,
            None => return Ok(None),
        },
        None => public_key_from_private(&private, password.as_deref().map(str::as_bytes)).map_err(|err| {
            ReconcileError::InvalidConfiguration(format!(
                "private key {}/{} is unreadable: {err}",
                private_ref.name, private_ref.key
            ))
        })?,
    };

    let mut data = SecretData::new();
    for (index, root) in status.root_certificates.iter().enumerate() {
        let Some(cert) = secret_value(ctx, namespace, root).await? else {
            return Ok(None);
        };
        data.insert(root_key(index), cert);
    }
    let backend = backend_address(ctlog, &ctx.settings);
    let config = render_log_config(&LogConfig {
        tree_id,
        backend: &backend,
        roots: status.root_certificates.len(),
        password: password.as_deref(),
    });
    data.insert(CONFIG_KEY.to_string(), config.into_bytes());
    data.insert(PRIVATE_KEY.to_string(), private);
    data.insert(PUBLIC_KEY.to_string(), public);
    Ok(Some(data))
}

/// Config secrets this controller rendered for `ctlog`.
async fn rendered_secrets(ctx: &ActionContext, ctlog: &CTlog) -> Result<Vec<Secret>, ClusterError> {
    let selector =
        selector_for_component(COMPONENT_NAME, ctlog.metadata.name()).with(SECRET_ROLE_LABEL, CONFIG_ROLE);
    let uid = ctlog.metadata.uid.as_deref();
    Ok(ctx
        .api::<Secret>(ctlog.metadata.namespace())
        .list(&selector)
        .await?
        .into_iter()
        .filter(|secret| uid.map_or(true, |uid| secret.metadata.is_owned_by(uid)))
        .collect())
}

/// Publishes the server config. Any change produces a secret with a new
/// name so the deployment rolls; the replaced one stays until
/// [`PruneServerConfigAction`] sees the new server up.
pub struct ServerConfigAction;

impl ServerConfigAction {
    async fn current(ctx: &ActionContext, ctlog: &CTlog) -> Result<Option<Secret>, ClusterError> {
        let Some(reference) = ctlog.status.server_config_ref.as_ref() else {
            return Ok(None);
        };
        ctx.api::<Secret>(ctlog.metadata.namespace())
            .get_opt(&reference.name)
            .await
    }

    async fn apply(ctx: &ActionContext, ctlog: &mut CTlog) -> Result<ActionResult, ReconcileError> {
        let Some(rendered) = render(ctx, ctlog).await? else {
            return Ok(ActionResult::Continue);
        };
        if Self::current(ctx, ctlog)
            .await?
            .is_some_and(|secret| secret.data == rendered)
        {
            return Ok(ActionResult::Continue);
        }

        let existing = rendered_secrets(ctx, ctlog)
            .await?
            .into_iter()
            .find(|secret| secret.data == rendered);
        let name = match existing {
            Some(secret) => {
                let name = secret.metadata.name().to_string();
                log_debug(COMPONENT, "Reusing rendered server config", &[("secret", name.as_str())]);
                name
            }
            None => {
                let namespace = ctlog.metadata.namespace().to_string();
                let mut labels = labels_for_component(COMPONENT_NAME, ctlog.metadata.name());
                labels.insert(SECRET_ROLE_LABEL.to_string(), CONFIG_ROLE.to_string());
                let metadata = ObjectMeta::generated(&namespace, &format!("ctlog-config-{}-", ctlog.metadata.name()))
                    .with_labels(labels)
                    .with_owner(ctlog.owner_reference());
                let created = ctx
                    .api::<Secret>(&namespace)
                    .create(&Secret::new(metadata, rendered))
                    .await?;
                let name = created.metadata.name().to_string();
                ctx.record(
                    &*ctlog,
                    EventKind::Normal,
                    "CTlogConfigUpdated",
                    &format!("Server config created: {name}"),
                );
                name
            }
        };
        ctlog.status.server_config_ref = Some(LocalObjectReference::new(&name));
        ctlog
            .status
            .conditions
            .set(Condition::pending(SERVER_AVAILABLE, "Server config changed"));
        Ok(ActionResult::StatusChanged)
    }
}

impl Action<CTlog> for ServerConfigAction {
    fn name(&self) -> &'static str {
        "server-config"
    }

    fn condition(&self) -> &'static str {
        SERVER_AVAILABLE
    }

    fn can_handle<'a>(&'a self, ctx: &'a ActionContext, ctlog: &'a CTlog) -> CheckFuture<'a> {
        Box::pin(async move {
            let rendered = match render(ctx, ctlog).await {
                Ok(Some(rendered)) => rendered,
                Ok(None) => return false,
                Err(_) => return true,
            };
            match Self::current(ctx, ctlog).await {
                Ok(Some(secret)) => secret.data != rendered,
                _ => true,
            }
        })
    }

    fn handle<'a>(&'a self, ctx: &'a ActionContext, ctlog: &'a mut CTlog) -> ActionFuture<'a> {
        Box::pin(async move { ActionResult::from(Self::apply(ctx, ctlog).await) })
    }
}

/// Deletes replaced config secrets once the server runs with the one the
/// status references.
pub struct PruneServerConfigAction;

impl PruneServerConfigAction {
    async fn stale(ctx: &ActionContext, ctlog: &CTlog) -> Result<Vec<Secret>, ClusterError> {
        let Some(reference) = ctlog.status.server_config_ref.as_ref() else {
            return Ok(Vec::new());
        };
        Ok(rendered_secrets(ctx, ctlog)
            .await?
            .into_iter()
            .filter(|secret| secret.metadata.name() != reference.name)
            .collect())
    }
}

impl Action<CTlog> for PruneServerConfigAction {
    fn name(&self) -> &'static str {
        "prune-config"
    }

    fn condition(&self) -> &'static str {
        SERVER_AVAILABLE
    }

    fn can_handle<'a>(&'a self, ctx: &'a ActionContext, ctlog: &'a CTlog) -> CheckFuture<'a> {
        Box::pin(async move {
            ctlog.status.conditions.is_true(SERVER_AVAILABLE)
                && Self::stale(ctx, ctlog)
                    .await
                    .map_or(true, |stale| !stale.is_empty())
        })
    }

    fn handle<'a>(&'a self, ctx: &'a ActionContext, ctlog: &'a mut CTlog) -> ActionFuture<'a> {
        Box::pin(async move {
            let stale = match Self::stale(ctx, ctlog).await {
                Ok(stale) => stale,
                Err(err) => return ActionResult::Failed(err.into()),
            };
            let api = ctx.api::<Secret>(ctlog.metadata.namespace());
            for secret in stale {
                match api.delete(secret.metadata.name()).await {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => continue,
                    Err(err) => return ActionResult::Failed(err.into()),
                }
                log_info(
                    COMPONENT,
                    "Removed replaced server config",
                    &[("ctlog", ctlog.metadata.name()), ("secret", secret.metadata.name())],
                );
            }
            ActionResult::Continue
        })
    }
}
