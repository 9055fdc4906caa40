//! Desired StatefulSet for a Habitat
//!
//! The workload is a pure function of the Habitat, its validated facts and the
//! operator settings. Hashes of the spec and pod template are stored as
//! annotations so later reconciles can tell whether an update is needed
//! without comparing server-defaulted fields.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, KeyToPath, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, SecretVolumeSource, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::UpdateStrategy;
use crate::habitat::{annotations, labels, Habitat};

use super::peers::{registry_name, PEER_FILE_KEY};
use super::validation::ValidatedSpec;

pub const CONTAINER_NAME: &str = "habitat-service";

/// Directory holding the peer-watch file inside the container
pub const PEER_DIR: &str = "/habitat-operator";
pub const PEER_FILENAME: &str = "peer-ip";

const CONFIG_VOLUME: &str = "config";
const USER_CONFIG_VOLUME: &str = "user-config";
const USER_TOML_FILE: &str = "user.toml";
const FILES_VOLUME: &str = "files";
const RING_SECRET_KEY: &str = "ring-key";
const RING_KEY_FILE_EXT: &str = "sym.key";
const RING_KEY_DIR: &str = "/hab/cache/keys";
const PERSISTENT_VOLUME: &str = "persistent";

#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("failed to hash desired state: {0}")]
    Hash(#[from] serde_json::Error),
}

/// Path of the peer-watch file as seen by the supervisor
pub fn peer_file_path() -> String {
    format!("{PEER_DIR}/{PEER_FILENAME}")
}

/// Label selector matching every member pod of `habitat_name`
pub fn member_selector(habitat_name: &str) -> String {
    format!("{}={}", labels::HABITAT_NAME, habitat_name)
}

/// Labels carried by every object owned by `habitat_name`
pub fn owned_labels(habitat_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::HABITAT.to_string(), "true".to_string()),
        (labels::HABITAT_NAME.to_string(), habitat_name.to_string()),
    ])
}

/// Supervisor arguments
fn supervisor_args(habitat: &Habitat, validated: &ValidatedSpec) -> Vec<String> {
    let service = &habitat.spec.service;
    let mut args = Vec::new();

    if let Some(group) = service.group.as_deref().filter(|g| !g.is_empty()) {
        args.extend(["--group".to_string(), group.to_string()]);
    }
    args.extend([
        "--topology".to_string(),
        validated.topology.to_string(),
        "--peer-watch-file".to_string(),
        peer_file_path(),
    ]);
    if let Some(channel) = service.channel.as_deref().filter(|c| !c.is_empty()) {
        args.extend(["--channel".to_string(), channel.to_string()]);
    }
    for bind in &service.bind {
        args.extend(["--bind".to_string(), bind.to_arg()]);
    }
    if let Some(ring) = &validated.ring_name {
        args.extend(["--ring".to_string(), ring.clone()]);
    }

    args
}

fn secret_volume(volume: &str, secret: &str, items: Option<Vec<KeyToPath>>) -> Volume {
    Volume {
        name: volume.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            items,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(volume: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: volume.to_string(),
        mount_path: path.to_string(),
        read_only: Some(read_only),
        ..Default::default()
    }
}

fn key_to_path(key: &str, path: &str) -> KeyToPath {
    KeyToPath {
        key: key.to_string(),
        path: path.to_string(),
        ..Default::default()
    }
}

fn pod_template(name: &str, habitat: &Habitat, validated: &ValidatedSpec) -> PodTemplateSpec {
    let service = &habitat.spec.service;

    let mut pod_labels = owned_labels(name);
    pod_labels.insert(
        labels::TOPOLOGY.to_string(),
        validated.topology.as_str().to_string(),
    );

    let mut volumes = vec![Volume {
        name: CONFIG_VOLUME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: registry_name(name).into(),
            items: Some(vec![key_to_path(PEER_FILE_KEY, PEER_FILENAME)]),
            ..Default::default()
        }),
        ..Default::default()
    }];
    let mut mounts = vec![mount(CONFIG_VOLUME, PEER_DIR, true)];

    if let Some(secret) = &service.config_secret_name {
        volumes.push(secret_volume(
            USER_CONFIG_VOLUME,
            secret,
            Some(vec![key_to_path(USER_TOML_FILE, USER_TOML_FILE)]),
        ));
        // The supervisor picks up user.toml from /hab/user/<service>/config
        mounts.push(mount(
            USER_CONFIG_VOLUME,
            &format!("/hab/user/{}/config", service.name),
            false,
        ));
    }

    if let Some(secret) = &service.files_secret_name {
        volumes.push(secret_volume(FILES_VOLUME, secret, None));
        mounts.push(mount(
            FILES_VOLUME,
            &format!("/hab/svc/{}/files", service.name),
            false,
        ));
    }

    if let Some(secret) = &service.ring_secret_name {
        let key_file = format!("{secret}.{RING_KEY_FILE_EXT}");
        volumes.push(secret_volume(
            secret,
            secret,
            Some(vec![key_to_path(RING_SECRET_KEY, &key_file)]),
        ));
        // Writable: the supervisor stores other keys here too
        mounts.push(mount(secret, RING_KEY_DIR, false));
    }

    if let Some(storage) = &habitat.spec.persistent_storage {
        mounts.push(mount(PERSISTENT_VOLUME, &storage.mount_path, false));
    }

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(pod_labels),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            service_account_name: habitat.spec.service_account_name.clone(),
            containers: vec![Container {
                name: CONTAINER_NAME.to_string(),
                image: Some(habitat.spec.image.clone()),
                args: Some(supervisor_args(habitat, validated)),
                env: (!habitat.spec.env.is_empty()).then(|| habitat.spec.env.clone()),
                volume_mounts: Some(mounts),
                ..Default::default()
            }],
            volumes: Some(volumes),
            ..Default::default()
        }),
    }
}

fn volume_claim_templates(name: &str, habitat: &Habitat) -> Option<Vec<PersistentVolumeClaim>> {
    let storage = habitat.spec.persistent_storage.as_ref()?;

    Some(vec![PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(PERSISTENT_VOLUME.to_string()),
            labels: Some(owned_labels(name)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: Some(storage.storage_class_name.clone()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(storage.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }])
}

/// SHA-256 of the JSON form of `value`
pub fn content_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(value)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Build the StatefulSet a Habitat should be realized as
pub fn desired_stateful_set(
    habitat: &Habitat,
    validated: &ValidatedSpec,
    owner: OwnerReference,
    update_strategy: UpdateStrategy,
) -> Result<StatefulSet, WorkloadError> {
    let name = habitat
        .metadata
        .name
        .as_deref()
        .ok_or(WorkloadError::MissingField("metadata.name"))?;
    let namespace = habitat
        .metadata
        .namespace
        .as_deref()
        .ok_or(WorkloadError::MissingField("metadata.namespace"))?;

    let template = pod_template(name, habitat, validated);
    let template_hash = content_hash(&template)?;

    let spec = StatefulSetSpec {
        replicas: Some(habitat.spec.count),
        selector: LabelSelector {
            match_labels: Some(BTreeMap::from([(
                labels::HABITAT_NAME.to_string(),
                name.to_string(),
            )])),
            ..Default::default()
        },
        pod_management_policy: Some("Parallel".to_string()),
        template,
        update_strategy: Some(StatefulSetUpdateStrategy {
            type_: Some(update_strategy.as_str().to_string()),
            ..Default::default()
        }),
        volume_claim_templates: volume_claim_templates(name, habitat),
        ..Default::default()
    };
    let spec_hash = content_hash(&spec)?;

    Ok(StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(owned_labels(name)),
            annotations: Some(BTreeMap::from([
                (annotations::SPEC_HASH.to_string(), spec_hash),
                (annotations::TEMPLATE_HASH.to_string(), template_hash),
            ])),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    })
}

/// Value of a hash annotation on an existing workload
pub fn hash_annotation<'a>(sts: &'a StatefulSet, annotation: &str) -> Option<&'a str> {
    sts.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(annotation))
        .map(String::as_str)
}

fn pod_spec(sts: &StatefulSet) -> Option<&PodSpec> {
    sts.spec.as_ref()?.template.spec.as_ref()
}

fn service_container(pod: &PodSpec) -> Option<&Container> {
    pod.containers.iter().find(|c| c.name == CONTAINER_NAME)
}

/// Name plus the referenced ConfigMap or Secret of each volume
fn volume_sources(pod: &PodSpec) -> Vec<(&str, Option<&str>, Option<&str>)> {
    pod.volumes
        .iter()
        .flatten()
        .map(|v| {
            (
                v.name.as_str(),
                v.config_map.as_ref().map(|c| c.name.as_str()),
                v.secret.as_ref().and_then(|s| s.secret_name.as_deref()),
            )
        })
        .collect()
}

fn env_pairs(container: &Container) -> Vec<(&str, Option<&str>)> {
    container
        .env
        .iter()
        .flatten()
        .map(|e| (e.name.as_str(), e.value.as_deref()))
        .collect()
}

/// True when a field the operator sets on the pod template differs live
pub fn template_drifted(existing: &StatefulSet, desired: &StatefulSet) -> bool {
    let (Some(live_pod), Some(want_pod)) = (pod_spec(existing), pod_spec(desired)) else {
        return true;
    };
    let (Some(live), Some(want)) = (service_container(live_pod), service_container(want_pod))
    else {
        return true;
    };

    live.image != want.image
        || live.args != want.args
        || env_pairs(live) != env_pairs(want)
        || live_pod.service_account_name != want_pod.service_account_name
        || volume_sources(live_pod) != volume_sources(want_pod)
}

/// True when a field the operator owns differs between the live workload and
/// the desired one, even though the recorded hashes match
pub fn stateful_set_drifted(existing: &StatefulSet, desired: &StatefulSet) -> bool {
    let (Some(live), Some(want)) = (existing.spec.as_ref(), desired.spec.as_ref()) else {
        return true;
    };
    let strategy =
        |s: &StatefulSetSpec| s.update_strategy.as_ref().and_then(|u| u.type_.clone());

    live.replicas != want.replicas
        || strategy(live) != strategy(want)
        || template_drifted(existing, desired)
}
