//! Peer registry: the ConfigMap holding member addresses for the supervisors
//!
//! Each Habitat gets one registry, mounted into its pods as the supervisor's
//! peer-watch file. The file lists up to a bounded number of running member
//! addresses, one per line, ordered by pod name so the content is stable
//! while membership is.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info, instrument, warn};

use crate::client::ClientError;
use crate::config::{PeerSelection, RegistryOwnership};
use crate::events::{reasons, EventType};
use crate::habitat::Habitat;
use crate::key::ReconcileKey;

use super::statefulset::{member_selector, owned_labels};
use super::ControllerContext;

/// Data key of the peer-watch file in the registry
pub const PEER_FILE_KEY: &str = "peer-watch-file";

/// What a registry sync did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryWrite {
    Created,
    Updated,
    Unchanged,
}

/// Name of the registry belonging to `habitat_name`
pub fn registry_name(habitat_name: &str) -> String {
    format!("{habitat_name}-{PEER_FILE_KEY}")
}

/// Peer-watch file content for a set of running pods
pub fn peer_addresses(pods: &[Pod], selection: PeerSelection) -> String {
    let mut members: Vec<(&str, &str)> = pods
        .iter()
        .filter_map(|pod| {
            let name = pod.metadata.name.as_deref()?;
            let ip = pod.status.as_ref()?.pod_ip.as_deref()?;
            (!ip.is_empty()).then_some((name, ip))
        })
        .collect();
    members.sort_by(|a, b| a.0.cmp(b.0));

    members
        .into_iter()
        .take(selection.limit())
        .map(|(_, ip)| ip)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Current peer-watch file content of a registry
pub fn registry_value(cm: &ConfigMap) -> Option<&str> {
    cm.data
        .as_ref()
        .and_then(|d| d.get(PEER_FILE_KEY))
        .map(String::as_str)
}

fn new_registry(ctx: &ControllerContext, habitat: &Habitat, name: &str, value: &str) -> ConfigMap {
    let habitat_name = habitat.metadata.name.as_deref().unwrap_or_default();
    let owner_references = match ctx.settings.registry_ownership {
        RegistryOwnership::Shared => None,
        RegistryOwnership::Owned => match ctx.scheme.owner_reference(habitat) {
            Ok(owner) => Some(vec![owner]),
            Err(e) => {
                warn!(error = %e, "Creating peer registry without owner reference");
                None
            }
        },
    };

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: habitat.metadata.namespace.clone(),
            labels: Some(owned_labels(habitat_name)),
            owner_references,
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            PEER_FILE_KEY.to_string(),
            value.to_string(),
        )])),
        ..Default::default()
    }
}

/// Bring the Habitat's peer registry in line with its running members
#[instrument(skip(ctx, habitat), fields(habitat = habitat.metadata.name.as_deref().unwrap_or_default()))]
pub async fn sync_peer_registry(
    ctx: &ControllerContext,
    habitat: &Habitat,
) -> Result<RegistryWrite, ClientError> {
    let habitat_name = habitat.metadata.name.as_deref().unwrap_or_default();
    let namespace = habitat.metadata.namespace.as_deref().unwrap_or_default();
    let name = registry_name(habitat_name);

    let pods = ctx
        .client
        .list_running_pods(namespace, &member_selector(habitat_name))
        .await?;
    let value = peer_addresses(&pods, ctx.settings.peer_selection);

    let cached = ctx
        .caches
        .config_maps
        .get(&ReconcileKey::new(namespace, name.as_str()));

    let existing = match cached {
        Some(cm) => (*cm).clone(),
        None => {
            let registry = new_registry(ctx, habitat, &name, &value);
            match ctx.client.create_config_map(namespace, &registry).await {
                Ok(_) => {
                    info!(name = %name, peers = %value.replace('\n', ","), "Created peer registry");
                    ctx.recorder
                        .publish(
                            habitat,
                            EventType::Normal,
                            reasons::CONFIG_MAP_CREATED,
                            "Created peer registry ConfigMap",
                        )
                        .await;
                    return Ok(RegistryWrite::Created);
                }
                Err(e) if e.is_already_exists() => {
                    debug!(name = %name, "Peer registry already exists, updating");
                    fetch_existing(ctx, namespace, &name).await?
                }
                Err(e) => {
                    ctx.recorder
                        .publish(
                            habitat,
                            EventType::Warning,
                            reasons::CONFIG_MAP_CREATION_FAILED,
                            &format!("Failed to create peer registry: {e}"),
                        )
                        .await;
                    return Err(e);
                }
            }
        }
    };

    match write_value(ctx, habitat, existing, &value).await {
        Err(e) if e.is_conflict() => {
            debug!(name = %name, "Peer registry changed underneath us, retrying once");
            let live = ctx
                .client
                .get_config_map(namespace, &name)
                .await?
                .ok_or_else(|| ClientError::NotFound(format!("{namespace}/{name}")))?;
            write_value(ctx, habitat, live, &value).await
        }
        result => result,
    }
}

/// Re-read a registry that already existed on create, cache first
async fn fetch_existing(
    ctx: &ControllerContext,
    namespace: &str,
    name: &str,
) -> Result<ConfigMap, ClientError> {
    if let Some(cm) = ctx.caches.config_maps.get(&ReconcileKey::new(namespace, name)) {
        return Ok((*cm).clone());
    }
    ctx.client
        .get_config_map(namespace, name)
        .await?
        .ok_or_else(|| ClientError::NotFound(format!("{namespace}/{name}")))
}

async fn write_value(
    ctx: &ControllerContext,
    habitat: &Habitat,
    mut registry: ConfigMap,
    value: &str,
) -> Result<RegistryWrite, ClientError> {
    let namespace = habitat.metadata.namespace.as_deref().unwrap_or_default();

    if registry_value(&registry) == Some(value) {
        debug!(peers = %value.replace('\n', ","), "Running members have not changed");
        return Ok(RegistryWrite::Unchanged);
    }

    registry
        .data
        .get_or_insert_with(BTreeMap::new)
        .insert(PEER_FILE_KEY.to_string(), value.to_string());
    ctx.client.replace_config_map(namespace, &registry).await?;

    let message = if value.is_empty() {
        "Removed peer addresses from peer registry"
    } else {
        "Updated peer addresses in peer registry"
    };
    info!(peers = %value.replace('\n', ","), "{message}");
    ctx.recorder
        .publish(habitat, EventType::Normal, reasons::CONFIG_MAP_UPDATED, message)
        .await;

    Ok(RegistryWrite::Updated)
}
