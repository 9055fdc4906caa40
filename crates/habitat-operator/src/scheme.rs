//! Registry of the resource kinds the operator reads and writes
//!
//! Built once at startup and shared by `Arc`. Owner and event references are
//! derived from the registered type metadata rather than from global state.

use std::collections::HashMap;
use std::fmt;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::discovery::ApiResource;
use thiserror::Error;

use crate::habitat::Habitat;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemeError {
    #[error("kind {0} is not registered")]
    Unregistered(Kind),
    #[error("object {0} has no uid")]
    MissingUid(String),
}

/// Kinds known to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Habitat,
    StatefulSet,
    ConfigMap,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub struct Scheme {
    resources: HashMap<Kind, ApiResource>,
}

impl Default for Scheme {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheme {
    pub fn new() -> Self {
        let resources = HashMap::from([
            (Kind::Habitat, ApiResource::erase::<Habitat>(&())),
            (Kind::StatefulSet, ApiResource::erase::<StatefulSet>(&())),
            (Kind::ConfigMap, ApiResource::erase::<ConfigMap>(&())),
        ]);
        Self { resources }
    }

    pub fn api_resource(&self, kind: Kind) -> Result<&ApiResource, SchemeError> {
        self.resources
            .get(&kind)
            .ok_or(SchemeError::Unregistered(kind))
    }

    /// Controller owner reference pointing at `habitat`
    pub fn owner_reference(&self, habitat: &Habitat) -> Result<OwnerReference, SchemeError> {
        let ar = self.api_resource(Kind::Habitat)?;
        let name = habitat.metadata.name.clone().unwrap_or_default();
        let uid = habitat
            .metadata
            .uid
            .clone()
            .ok_or_else(|| SchemeError::MissingUid(name.clone()))?;

        Ok(OwnerReference {
            api_version: ar.api_version.clone(),
            kind: ar.kind.clone(),
            name,
            uid,
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }

    /// Reference used as the involved object of recorded events
    pub fn object_reference(&self, habitat: &Habitat) -> Result<ObjectReference, SchemeError> {
        let ar = self.api_resource(Kind::Habitat)?;
        Ok(ObjectReference {
            api_version: Some(ar.api_version.clone()),
            kind: Some(ar.kind.clone()),
            name: habitat.metadata.name.clone(),
            namespace: habitat.metadata.namespace.clone(),
            uid: habitat.metadata.uid.clone(),
            resource_version: habitat.metadata.resource_version.clone(),
            ..Default::default()
        })
    }
}
