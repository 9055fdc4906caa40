//! Habitat reconciler
//!
//! Converges one Habitat key towards its desired state: a StatefulSet, a peer
//! registry and an up-to-date status. Every step reads the caches first and
//! writes only when the observed state differs, so reconciling an unchanged
//! Habitat twice performs no writes.
//!
//! ## Deletion Handling
//!
//! No finalizers are used. When a Habitat disappears from the cache its
//! StatefulSet is left to the garbage collector via the owner reference, or
//! deleted explicitly when `WorkloadCleanup::Explicit` is configured.

use k8s_openapi::api::apps::v1::StatefulSet;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::client::ClientError;
use crate::config::{UpdateStrategy, WorkloadCleanup};
use crate::events::{reasons, EventType};
use crate::habitat::{annotations, Habitat, HabitatState, HabitatStatus};
use crate::key::ReconcileKey;
use crate::scheme::SchemeError;

use super::peers::sync_peer_registry;
use super::statefulset::{
    desired_stateful_set, hash_annotation, member_selector, stateful_set_drifted, template_drifted,
    WorkloadError,
};
use super::validation::{validate, ValidationError};
use super::ControllerContext;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("invalid Habitat spec: {0}")]
    Validation(#[from] ValidationError),
    #[error("secret {name} referenced by the Habitat does not exist")]
    MissingSecret { name: String },
    #[error("Kubernetes API error: {0}")]
    Client(#[from] ClientError),
    #[error("failed to build StatefulSet: {0}")]
    Workload(#[from] WorkloadError),
    #[error(transparent)]
    Scheme(#[from] SchemeError),
}

/// Result of a successful reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Converged; backoff for the key can be reset
    Synced,
    /// Not ours to handle; backoff is left untouched
    Skipped,
}

/// Reconcile the Habitat identified by `key`
#[instrument(skip(ctx, key), fields(key = %key))]
pub async fn reconcile(
    ctx: &ControllerContext,
    key: &ReconcileKey,
) -> Result<Outcome, ReconcileError> {
    let Some(habitat) = ctx.caches.habitats.get(key) else {
        return handle_deleted(ctx, key).await;
    };

    if habitat.custom_version() != Some(ctx.settings.custom_version.as_str()) {
        debug!(
            custom_version = ?habitat.custom_version(),
            expected = %ctx.settings.custom_version,
            "Skipping Habitat with foreign version marker"
        );
        return Ok(Outcome::Skipped);
    }

    info!(count = habitat.spec.count, "Reconciling Habitat");

    let validated = match validate(&habitat.spec) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "Habitat failed validation");
            ctx.recorder
                .publish(
                    &habitat,
                    EventType::Warning,
                    reasons::VALIDATION_FAILED,
                    &e.to_string(),
                )
                .await;
            if let Err(status_err) =
                update_status(ctx, &habitat, HabitatState::Failed, Some(e.to_string())).await
            {
                warn!(error = %status_err, "Failed to record validation failure in status");
            }
            return Err(e.into());
        }
    };

    check_secrets(ctx, &habitat).await?;

    let owner = ctx.scheme.owner_reference(&habitat)?;
    let desired =
        desired_stateful_set(&habitat, &validated, owner, ctx.settings.update_strategy)?;
    upsert_stateful_set(ctx, &habitat, desired).await?;

    sync_peer_registry(ctx, &habitat).await?;

    update_status(ctx, &habitat, HabitatState::Processed, None).await?;

    Ok(Outcome::Synced)
}

async fn handle_deleted(
    ctx: &ControllerContext,
    key: &ReconcileKey,
) -> Result<Outcome, ReconcileError> {
    match ctx.settings.workload_cleanup {
        WorkloadCleanup::OwnerReference => {
            debug!("Habitat deleted, owned resources are garbage collected");
        }
        WorkloadCleanup::Explicit => {
            match ctx
                .client
                .delete_stateful_set(key.namespace(), key.name())
                .await
            {
                Ok(()) => info!("Habitat deleted, deleted its StatefulSet"),
                Err(e) if e.is_not_found() => debug!("Habitat deleted, StatefulSet already gone"),
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(Outcome::Synced)
}

/// Every Secret the Habitat references must exist before pods can mount it
async fn check_secrets(ctx: &ControllerContext, habitat: &Habitat) -> Result<(), ReconcileError> {
    let namespace = habitat.metadata.namespace.as_deref().unwrap_or_default();
    let service = &habitat.spec.service;

    for name in [
        &service.config_secret_name,
        &service.ring_secret_name,
        &service.files_secret_name,
    ]
    .into_iter()
    .flatten()
    {
        if !ctx.client.secret_exists(namespace, name).await? {
            warn!(secret = %name, "Referenced secret not found");
            return Err(ReconcileError::MissingSecret { name: name.clone() });
        }
    }
    Ok(())
}

async fn upsert_stateful_set(
    ctx: &ControllerContext,
    habitat: &Habitat,
    desired: StatefulSet,
) -> Result<(), ReconcileError> {
    let namespace = habitat.metadata.namespace.as_deref().unwrap_or_default();
    let name = habitat.metadata.name.as_deref().unwrap_or_default();

    if let Some(existing) = ctx
        .caches
        .stateful_sets
        .get(&ReconcileKey::new(namespace, name))
    {
        return update_stateful_set(ctx, habitat, &existing, desired).await;
    }

    match ctx.client.create_stateful_set(namespace, &desired).await {
        Ok(_) => {
            info!(replicas = habitat.spec.count, "Created StatefulSet");
            ctx.recorder
                .publish(
                    habitat,
                    EventType::Normal,
                    reasons::STATEFUL_SET_CREATED,
                    "Created StatefulSet",
                )
                .await;
            Ok(())
        }
        Err(e) if e.is_already_exists() => {
            debug!("StatefulSet exists but is not cached yet, updating");
            let live = ctx
                .client
                .get_stateful_set(namespace, name)
                .await?
                .ok_or_else(|| ClientError::NotFound(format!("{namespace}/{name}")))?;
            update_stateful_set(ctx, habitat, &live, desired).await
        }
        Err(e) => {
            ctx.recorder
                .publish(
                    habitat,
                    EventType::Warning,
                    reasons::STATEFUL_SET_CREATION_FAILED,
                    &format!("Failed to create StatefulSet: {e}"),
                )
                .await;
            Err(e.into())
        }
    }
}

async fn update_stateful_set(
    ctx: &ControllerContext,
    habitat: &Habitat,
    existing: &StatefulSet,
    mut desired: StatefulSet,
) -> Result<(), ReconcileError> {
    let namespace = habitat.metadata.namespace.as_deref().unwrap_or_default();
    let name = habitat.metadata.name.as_deref().unwrap_or_default();

    let current_hash = hash_annotation(existing, annotations::SPEC_HASH);
    let hash_matches =
        current_hash.is_some() && current_hash == hash_annotation(&desired, annotations::SPEC_HASH);
    if hash_matches && !stateful_set_drifted(existing, &desired) {
        debug!("StatefulSet up to date");
        return Ok(());
    }
    if hash_matches {
        info!("StatefulSet was modified outside the operator, restoring it");
    }

    let template_changed = hash_annotation(existing, annotations::TEMPLATE_HASH)
        != hash_annotation(&desired, annotations::TEMPLATE_HASH)
        || template_drifted(existing, &desired);

    desired.metadata.resource_version = existing.metadata.resource_version.clone();
    ctx.client.replace_stateful_set(namespace, &desired).await?;
    info!(
        replicas = habitat.spec.count,
        template_changed, "Updated StatefulSet"
    );
    ctx.recorder
        .publish(
            habitat,
            EventType::Normal,
            reasons::STATEFUL_SET_UPDATED,
            "Updated StatefulSet",
        )
        .await;

    if template_changed && ctx.settings.update_strategy == UpdateStrategy::OnDelete {
        info!("Pod template changed, deleting pods for OnDelete update");
        ctx.client
            .delete_pods(namespace, &member_selector(name))
            .await?;
    }

    Ok(())
}

/// Patch the status subresource if it differs from what is cached
async fn update_status(
    ctx: &ControllerContext,
    habitat: &Habitat,
    state: HabitatState,
    message: Option<String>,
) -> Result<(), ClientError> {
    let status = HabitatStatus {
        state: Some(state),
        message,
        observed_generation: habitat.metadata.generation,
    };
    if habitat.status.as_ref() == Some(&status) {
        return Ok(());
    }

    let namespace = habitat.metadata.namespace.as_deref().unwrap_or_default();
    let name = habitat.metadata.name.as_deref().unwrap_or_default();
    ctx.client
        .patch_habitat_status(namespace, name, &status)
        .await?;
    debug!(state = ?state, "Updated Habitat status");
    Ok(())
}
