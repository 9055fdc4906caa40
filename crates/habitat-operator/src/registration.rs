//! Habitat CRD registration at startup

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, CustomResourceExt, ResourceExt};
use thiserror::Error;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::client::ClientError;
use crate::habitat::Habitat;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("failed to create CRD {name}: {source}")]
    Create {
        name: String,
        #[source]
        source: ClientError,
    },
    #[error("failed to read CRD {name}: {source}")]
    Read {
        name: String,
        #[source]
        source: ClientError,
    },
    #[error("CRD {name} not established after {}s", .timeout.as_secs())]
    NotEstablished { name: String, timeout: Duration },
}

/// CRD calls made during registration
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CrdClient: Send + Sync {
    async fn create(&self, crd: &CustomResourceDefinition) -> Result<(), ClientError>;
    async fn get(&self, name: &str) -> Result<Option<CustomResourceDefinition>, ClientError>;
    async fn delete(&self, name: &str) -> Result<(), ClientError>;
}

/// [`CrdClient`] backed by the Kubernetes API
pub struct KubeCrdClient {
    api: Api<CustomResourceDefinition>,
}

impl KubeCrdClient {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl CrdClient for KubeCrdClient {
    async fn create(&self, crd: &CustomResourceDefinition) -> Result<(), ClientError> {
        self.api.create(&PostParams::default(), crd).await?;
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<CustomResourceDefinition>, ClientError> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn delete(&self, name: &str) -> Result<(), ClientError> {
        self.api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

/// True once the API server reports the CRD as `Established`
pub fn is_established(crd: &CustomResourceDefinition) -> bool {
    crd.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Established" && c.status == "True")
        })
}

/// Register the Habitat CRD with the cluster
pub async fn ensure_crd(client: Client) -> Result<(), RegistrationError> {
    register(&KubeCrdClient::new(client), POLL_INTERVAL, ESTABLISH_TIMEOUT).await
}

/// Create the Habitat CRD and wait for it to become established.
///
/// A CRD that already exists is left alone and accepted as is. Only a CRD
/// created by this call is deleted again when it does not become established
/// within `timeout`.
#[instrument(skip(api))]
pub async fn register(
    api: &dyn CrdClient,
    poll: Duration,
    timeout: Duration,
) -> Result<(), RegistrationError> {
    let crd = Habitat::crd();
    let name = crd.name_any();

    match api.create(&crd).await {
        Ok(()) => info!(crd = %name, "Created CRD"),
        Err(e) if e.is_already_exists() => {
            info!(crd = %name, "CRD already registered");
            return Ok(());
        }
        Err(source) => return Err(RegistrationError::Create { name, source }),
    }

    let deadline = Instant::now() + timeout;
    let mut ticker = interval(poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while Instant::now() < deadline {
        ticker.tick().await;
        let current = api
            .get(&name)
            .await
            .map_err(|source| RegistrationError::Read {
                name: name.clone(),
                source,
            })?;
        if current.as_ref().is_some_and(is_established) {
            info!(crd = %name, "CRD established");
            return Ok(());
        }
        debug!(crd = %name, "Waiting for CRD to be established");
    }

    warn!(crd = %name, "CRD not established in time, deleting it");
    if let Err(e) = api.delete(&name).await {
        warn!(crd = %name, error = %e, "Failed to delete unestablished CRD");
    }
    Err(RegistrationError::NotEstablished { name, timeout })
}
