//! Work queue keys and owner resolution for labeled resources

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use thiserror::Error;

use crate::habitat::labels;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("object {object} has no {label} label")]
    MissingLabel { object: String, label: &'static str },
    #[error("object {object} has an empty {label} label")]
    EmptyLabel { object: String, label: &'static str },
}

/// Identity of a Habitat in the work queue: `namespace/name`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReconcileKey {
    namespace: String,
    name: String,
}

impl ReconcileKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of the object described by `meta`. Unnamed objects have no key.
    pub fn from_meta(meta: &ObjectMeta) -> Option<Self> {
        let name = meta.name.as_deref()?;
        Some(Self::new(meta.namespace.as_deref().unwrap_or_default(), name))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Derive the owning Habitat's key from a subordinate object's labels.
///
/// The owner lives in the same namespace as the object and is named by the
/// `habitat-name` label.
pub fn key_from_labels(
    namespace: &str,
    object: &str,
    labels: Option<&BTreeMap<String, String>>,
) -> Result<ReconcileKey, KeyError> {
    let owner = labels
        .and_then(|l| l.get(labels::HABITAT_NAME))
        .ok_or_else(|| KeyError::MissingLabel {
            object: format!("{namespace}/{object}"),
            label: labels::HABITAT_NAME,
        })?;

    if owner.is_empty() {
        return Err(KeyError::EmptyLabel {
            object: format!("{namespace}/{object}"),
            label: labels::HABITAT_NAME,
        });
    }

    Ok(ReconcileKey::new(namespace, owner.as_str()))
}

/// Owner key for an object's metadata
pub fn owner_key(meta: &ObjectMeta) -> Result<ReconcileKey, KeyError> {
    key_from_labels(
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default(),
        meta.labels.as_ref(),
    )
}
