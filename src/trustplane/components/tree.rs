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

//! Merkle tree selection for components backed by the log backend.

use super::{ManagedComponent, SERVER_AVAILABLE};
use crate::trustplane::api::conditions::Condition;
use crate::trustplane::controller::{
    Action, ActionContext, ActionFuture, ActionResult, CheckFuture, ReconcileError,
};
use crate::trustplane::events::EventKind;
use crate::trustplane::util::error::BoxError;
use futures_util::future::BoxFuture;
use std::marker::PhantomData;

/// Creates Merkle trees in the log backend.
pub trait TreeAllocator: Send + Sync {
    fn create_tree<'a>(
        &'a self,
        namespace: &'a str,
        display_name: &'a str,
    ) -> BoxFuture<'a, Result<i64, BoxError>>;
}

/// A component whose server writes to one Merkle tree.
pub trait TreeBacked: ManagedComponent {
    fn desired_tree(&self) -> Option<i64>;

    fn tree_id(&self) -> Option<i64>;

    fn set_tree_id(&mut self, tree_id: i64);
}

/// Settles the tree the server writes to: `spec.treeID` when set, or a
/// new one from the registered [`TreeAllocator`].
pub struct ResolveTreeAction<R> {
    _marker: PhantomData<fn(R)>,
}

impl<R> Default for ResolveTreeAction<R> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<R: TreeBacked> ResolveTreeAction<R> {
    async fn allocate(ctx: &ActionContext, resource: &R) -> Result<i64, ReconcileError> {
        let allocator = ctx.dependency::<dyn TreeAllocator>().ok_or_else(|| {
            ReconcileError::InvalidConfiguration(
                "treeID is not set and no tree allocator is registered".into(),
            )
        })?;
        let meta = resource.metadata();
        let display_name = format!("{}-{}", R::COMPONENT, meta.name());
        let tree_id = allocator
            .create_tree(meta.namespace(), &display_name)
            .await
            .map_err(ReconcileError::Other)?;
        ctx.record(
            resource,
            EventKind::Normal,
            "TreeCreated",
            &format!("New Merkle tree created: {tree_id}"),
        );
        Ok(tree_id)
    }
}

impl<R: TreeBacked> Action<R> for ResolveTreeAction<R> {
    fn name(&self) -> &'static str {
        "resolve-tree"
    }

    fn condition(&self) -> &'static str {
        SERVER_AVAILABLE
    }

    fn can_handle<'a>(&'a self, _ctx: &'a ActionContext, resource: &'a R) -> CheckFuture<'a> {
        Box::pin(async move {
            match resource.desired_tree() {
                Some(tree_id) => resource.tree_id() != Some(tree_id),
                None => resource.tree_id().is_none(),
            }
        })
    }

    fn handle<'a>(&'a self, ctx: &'a ActionContext, resource: &'a mut R) -> ActionFuture<'a> {
        Box::pin(async move {
            let tree_id = match resource.desired_tree() {
                Some(tree_id) => tree_id,
                None => match Self::allocate(ctx, resource).await {
                    Ok(tree_id) => tree_id,
                    Err(err) => return ActionResult::Failed(err),
                },
            };
            resource.set_tree_id(tree_id);
            resource
                .conditions_mut()
                .set(Condition::pending(SERVER_AVAILABLE, "Tree changed"));
            ActionResult::StatusChanged
        })
    }
}
