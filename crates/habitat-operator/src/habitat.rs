//! Habitat CRD: a Habitat service run as a StatefulSet

use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::EnvVar;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::key::ReconcileKey;

/// Habitat spec
#[derive(CustomResource, Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "habitat.sh",
    version = "v1beta1",
    kind = "Habitat",
    plural = "habitats",
    shortname = "hab",
    namespaced = true,
    status = "HabitatStatus",
    printcolumn = r#"{"name":"Count", "type":"integer", "jsonPath":".spec.count"}"#,
    printcolumn = r#"{"name":"Topology", "type":"string", "jsonPath":".spec.service.topology"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HabitatSpec {
    /// Version marker; objects carrying a different marker belong to another controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_version: Option<String>,
    /// Number of desired supervisor pods
    #[serde(default = "default_count")]
    pub count: i32,
    /// Container image of the Habitat service
    pub image: String,
    /// ServiceAccount the pods run as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    pub service: ServiceSpec,
    /// Environment passed to the service container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_storage: Option<PersistentStorage>,
}

fn default_count() -> i32 {
    1
}

/// Habitat service settings passed to the supervisor
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Service name, used for the user config mount path
    pub name: String,
    /// Supervisor topology: "standalone" or "leader"
    #[serde(default = "default_topology")]
    pub topology: String,
    /// Service group; the supervisor uses "default" when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Update channel for the service package
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Secret holding a `user.toml` for the service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_secret_name: Option<String>,
    /// Secret holding the ring key, named `<ring>-<14 digit revision>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ring_secret_name: Option<String>,
    /// Secret whose keys are mounted as service files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_secret_name: Option<String>,
    /// Runtime bindings to other services
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bind: Vec<Bind>,
}

fn default_topology() -> String {
    Topology::Standalone.to_string()
}

/// Runtime binding to another service group
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Bind {
    /// Bind name as declared by the consuming package
    pub name: String,
    /// Service providing the bind
    pub service: String,
    /// Group of the providing service
    pub group: String,
}

impl Bind {
    /// Render as a supervisor `--bind` argument
    pub fn to_arg(&self) -> String {
        format!("{}:{}.{}", self.name, self.service, self.group)
    }
}

/// Persistent volume request for each pod
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PersistentStorage {
    /// Storage quantity, e.g. "10Gi"
    pub size: String,
    /// Where the volume is mounted in the container
    pub mount_path: String,
    pub storage_class_name: String,
}

/// Habitat status
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HabitatStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<HabitatState>,
    /// Human-readable explanation of the state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Generation of the spec last acted upon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum HabitatState {
    Processed,
    Failed,
}

/// Supervisor topology
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Topology {
    Standalone,
    Leader,
}

impl Topology {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topology::Standalone => "standalone",
            Topology::Leader => "leader",
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topology {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standalone" => Ok(Topology::Standalone),
            "leader" => Ok(Topology::Leader),
            other => Err(other.to_string()),
        }
    }
}

impl Habitat {
    /// Queue key of this object, if it has a name
    pub fn key(&self) -> Option<ReconcileKey> {
        ReconcileKey::from_meta(&self.metadata)
    }

    pub fn custom_version(&self) -> Option<&str> {
        self.spec.custom_version.as_deref()
    }
}

/// Labels placed on every object the operator manages
pub mod labels {
    /// Marks an object as belonging to some Habitat
    pub const HABITAT: &str = "habitat";
    /// Name of the owning Habitat
    pub const HABITAT_NAME: &str = "habitat-name";
    /// Supervisor topology of a pod
    pub const TOPOLOGY: &str = "topology";
    /// Selector used by every subordinate watch
    pub const MANAGED_SELECTOR: &str = "habitat=true";
}

/// Annotations used for change detection on managed workloads
pub mod annotations {
    /// Hash of the desired StatefulSet spec
    pub const SPEC_HASH: &str = "habitat.sh/spec-hash";
    /// Hash of the desired pod template
    pub const TEMPLATE_HASH: &str = "habitat.sh/template-hash";
}
