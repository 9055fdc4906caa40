//! Habitat spec validation

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::habitat::{HabitatSpec, Topology};

/// Leader topology needs a quorum
pub const LEADER_MIN_COUNT: i32 = 3;

/// Ring secrets are named `<ring>-<YYYYMMDDhhmmss>`
static RING_SECRET_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([\w_-]+)-\d{14}$").expect("valid ring secret regex"));

/// Kubernetes resource quantity, e.g. `10Gi`, `500M`, `1e3`
static QUANTITY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[+]?([0-9]+(\.[0-9]*)?|\.[0-9]+)(([KMGTPE]i)|[numkMGTPE]|([eE][-+]?[0-9]+))?$")
        .expect("valid quantity regex")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unknown topology {0:?}, expected \"standalone\" or \"leader\"")]
    UnknownTopology(String),
    #[error("leader topology requires a count of at least {min}, got {count}")]
    LeaderCountTooLow { count: i32, min: i32 },
    #[error("count cannot be negative, got {0}")]
    NegativeCount(i32),
    #[error("image cannot be empty")]
    EmptyImage,
    #[error("service name cannot be empty")]
    EmptyServiceName,
    #[error("ring secret name {0:?} must match <ring>-<14 digit revision>")]
    InvalidRingSecretName(String),
    #[error("persistent storage size {0:?} is not a valid quantity")]
    InvalidStorageSize(String),
    #[error("persistent storage mount path cannot be empty")]
    EmptyMountPath,
}

/// Facts extracted from a spec that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSpec {
    pub topology: Topology,
    /// Ring name without its revision suffix
    pub ring_name: Option<String>,
}

/// Validate a Habitat spec
pub fn validate(spec: &HabitatSpec) -> Result<ValidatedSpec, ValidationError> {
    let topology: Topology = spec
        .service
        .topology
        .parse()
        .map_err(ValidationError::UnknownTopology)?;

    if spec.count < 0 {
        return Err(ValidationError::NegativeCount(spec.count));
    }
    if topology == Topology::Leader && spec.count < LEADER_MIN_COUNT {
        return Err(ValidationError::LeaderCountTooLow {
            count: spec.count,
            min: LEADER_MIN_COUNT,
        });
    }
    if spec.image.trim().is_empty() {
        return Err(ValidationError::EmptyImage);
    }
    if spec.service.name.trim().is_empty() {
        return Err(ValidationError::EmptyServiceName);
    }

    let ring_name = spec
        .service
        .ring_secret_name
        .as_deref()
        .map(ring_name)
        .transpose()?;

    if let Some(storage) = &spec.persistent_storage {
        if !QUANTITY_REGEX.is_match(&storage.size) {
            return Err(ValidationError::InvalidStorageSize(storage.size.clone()));
        }
        if storage.mount_path.trim().is_empty() {
            return Err(ValidationError::EmptyMountPath);
        }
    }

    Ok(ValidatedSpec {
        topology,
        ring_name,
    })
}

/// Extract the bare ring name from a ring secret name
pub fn ring_name(secret_name: &str) -> Result<String, ValidationError> {
    RING_SECRET_REGEX
        .captures(secret_name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| ValidationError::InvalidRingSecretName(secret_name.to_string()))
}
