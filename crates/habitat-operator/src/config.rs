//! Command line flags and environment tunables

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tracing::warn;

use crate::controllers::retry::{DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};
use crate::health::DEFAULT_HEALTH_PORT;

/// Version marker handled by this controller
pub const DEFAULT_CUSTOM_VERSION: &str = "v1beta2";

/// Peer addresses written to a registry by default
pub const DEFAULT_MAX_PEERS: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {field}")]
    InvalidValue { field: &'static str, value: String },
    #[error("{0}")]
    Invalid(String),
}

/// Kubernetes operator for Habitat services
#[derive(Debug, Parser)]
#[command(name = "habitat-operator", version, about)]
pub struct Cli {
    /// Path to a kubeconfig; in-cluster configuration is used when omitted
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Namespace to watch; all namespaces when empty
    #[arg(long, default_value = "")]
    pub namespace: String,

    /// Skip creating the Habitat CRD
    #[arg(long)]
    pub assume_crd_registered: bool,

    /// Number of reconcile workers (defaults to available CPUs)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Port for the health probe server
    #[arg(long, default_value_t = DEFAULT_HEALTH_PORT)]
    pub health_port: u16,
}

impl Cli {
    /// Namespace scope, `None` for cluster-wide
    pub fn watch_namespace(&self) -> Option<&str> {
        match self.namespace.as_str() {
            "" => None,
            ns => Some(ns),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers
            .filter(|w| *w > 0)
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()))
    }
}

/// How member addresses are chosen for the peer registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSelection {
    /// First `n` running members by pod name
    FirstN(usize),
    /// Only the first running member
    Leader,
}

impl PeerSelection {
    pub fn limit(&self) -> usize {
        match self {
            PeerSelection::FirstN(n) => *n,
            PeerSelection::Leader => 1,
        }
    }
}

/// What happens to a StatefulSet once its Habitat is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadCleanup {
    /// Garbage collector follows the owner reference
    OwnerReference,
    /// Controller deletes it with background propagation
    Explicit,
}

impl FromStr for WorkloadCleanup {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner-reference" => Ok(Self::OwnerReference),
            "explicit" => Ok(Self::Explicit),
            other => Err(ConfigError::InvalidValue {
                field: "workload cleanup",
                value: other.to_string(),
            }),
        }
    }
}

/// Whether the peer registry is owned by its Habitat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryOwnership {
    /// No owner reference; the registry outlives the Habitat
    Shared,
    /// Owner reference; deleted together with the Habitat
    Owned,
}

impl FromStr for RegistryOwnership {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shared" => Ok(Self::Shared),
            "owned" => Ok(Self::Owned),
            other => Err(ConfigError::InvalidValue {
                field: "registry ownership",
                value: other.to_string(),
            }),
        }
    }
}

/// StatefulSet update strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStrategy {
    RollingUpdate,
    /// Pods are deleted by the controller when the template changes
    OnDelete,
}

impl UpdateStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStrategy::RollingUpdate => "RollingUpdate",
            UpdateStrategy::OnDelete => "OnDelete",
        }
    }
}

impl FromStr for UpdateStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rolling-update" => Ok(Self::RollingUpdate),
            "on-delete" => Ok(Self::OnDelete),
            other => Err(ConfigError::InvalidValue {
                field: "update strategy",
                value: other.to_string(),
            }),
        }
    }
}

/// Controller behaviour tunables.
///
/// Environment variables:
/// - `HABITAT_CUSTOM_VERSION`: version marker to handle (default: v1beta2)
/// - `HABITAT_PEER_SELECTION`: `first-n` or `leader` (default: first-n)
/// - `HABITAT_MAX_PEERS`: addresses written with `first-n` (default: 5)
/// - `HABITAT_WORKLOAD_CLEANUP`: `owner-reference` or `explicit`
/// - `HABITAT_REGISTRY_OWNERSHIP`: `shared` or `owned`
/// - `HABITAT_UPDATE_STRATEGY`: `rolling-update` or `on-delete`
/// - `HABITAT_BACKOFF_BASE_MS`: first retry delay in milliseconds (default: 5)
/// - `HABITAT_BACKOFF_MAX_SECS`: retry delay cap in seconds (default: 1000)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorSettings {
    pub custom_version: String,
    pub peer_selection: PeerSelection,
    pub workload_cleanup: WorkloadCleanup,
    pub registry_ownership: RegistryOwnership,
    pub update_strategy: UpdateStrategy,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for OperatorSettings {
    fn default() -> Self {
        Self {
            custom_version: DEFAULT_CUSTOM_VERSION.to_string(),
            peer_selection: PeerSelection::FirstN(DEFAULT_MAX_PEERS),
            workload_cleanup: WorkloadCleanup::OwnerReference,
            registry_ownership: RegistryOwnership::Shared,
            update_strategy: UpdateStrategy::RollingUpdate,
            backoff_base: DEFAULT_BASE_DELAY,
            backoff_max: DEFAULT_MAX_DELAY,
        }
    }
}

impl OperatorSettings {
    /// Load settings from the environment, falling back to defaults on bad values
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_peers = parse_env("HABITAT_MAX_PEERS", DEFAULT_MAX_PEERS);
        let peer_selection = match std::env::var("HABITAT_PEER_SELECTION").as_deref() {
            Ok("leader") => PeerSelection::Leader,
            Ok("first-n") | Err(_) => PeerSelection::FirstN(max_peers),
            Ok(other) => {
                return Err(ConfigError::InvalidValue {
                    field: "peer selection",
                    value: other.to_string(),
                })
            }
        };

        let settings = Self {
            custom_version: std::env::var("HABITAT_CUSTOM_VERSION")
                .unwrap_or(defaults.custom_version),
            peer_selection,
            workload_cleanup: parse_env("HABITAT_WORKLOAD_CLEANUP", defaults.workload_cleanup),
            registry_ownership: parse_env(
                "HABITAT_REGISTRY_OWNERSHIP",
                defaults.registry_ownership,
            ),
            update_strategy: parse_env("HABITAT_UPDATE_STRATEGY", defaults.update_strategy),
            backoff_base: Duration::from_millis(parse_env(
                "HABITAT_BACKOFF_BASE_MS",
                defaults.backoff_base.as_millis() as u64,
            )),
            backoff_max: Duration::from_secs(parse_env(
                "HABITAT_BACKOFF_MAX_SECS",
                defaults.backoff_max.as_secs(),
            )),
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.custom_version.is_empty() {
            return Err(ConfigError::Invalid(
                "custom version cannot be empty".to_string(),
            ));
        }
        if self.peer_selection.limit() == 0 {
            return Err(ConfigError::Invalid(
                "at least one peer address must be written".to_string(),
            ));
        }
        if self.backoff_base.is_zero() || self.backoff_base > self.backoff_max {
            return Err(ConfigError::Invalid(format!(
                "backoff base ({:?}) must be non-zero and not exceed max ({:?})",
                self.backoff_base, self.backoff_max
            )));
        }
        Ok(())
    }
}

/// Parse an environment variable, logging and using `default` on failure
fn parse_env<T>(var_name: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
    T::Err: std::fmt::Display,
{
    match std::env::var(var_name) {
        Ok(v) => match v.parse::<T>() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    env_var = var_name,
                    value = %v,
                    error = %e,
                    default = ?default,
                    "Failed to parse env var, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}
