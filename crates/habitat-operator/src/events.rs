//! Kubernetes Events attached to Habitat objects

use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, EventSource};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use tracing::{debug, warn};

use crate::client::ClusterClient;
use crate::habitat::Habitat;
use crate::scheme::Scheme;

/// Component name reported on events
pub const REPORTING_COMPONENT: &str = "habitat-operator";

/// Event reasons
pub mod reasons {
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    pub const STATEFUL_SET_CREATED: &str = "StatefulSetCreated";
    pub const STATEFUL_SET_UPDATED: &str = "StatefulSetUpdated";
    pub const STATEFUL_SET_CREATION_FAILED: &str = "StatefulSetCreationFailed";
    pub const CONFIG_MAP_CREATED: &str = "ConfigMapCreated";
    pub const CONFIG_MAP_UPDATED: &str = "ConfigMapUpdated";
    pub const CONFIG_MAP_CREATION_FAILED: &str = "ConfigMapCreationFailed";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

/// Publishes events about Habitats. Failures are logged and never returned.
#[derive(Clone)]
pub struct EventRecorder {
    client: Arc<dyn ClusterClient>,
    scheme: Arc<Scheme>,
}

impl EventRecorder {
    pub fn new(client: Arc<dyn ClusterClient>, scheme: Arc<Scheme>) -> Self {
        Self { client, scheme }
    }

    pub async fn publish(
        &self,
        habitat: &Habitat,
        type_: EventType,
        reason: &str,
        message: &str,
    ) {
        let event = match self.build(habitat, type_, reason, message) {
            Some(event) => event,
            None => return,
        };
        let namespace = habitat.metadata.namespace.as_deref().unwrap_or_default();

        match self.client.create_event(namespace, &event).await {
            Ok(()) => debug!(reason, message, "Recorded event"),
            Err(e) => warn!(reason, error = %e, "Failed to record event"),
        }
    }

    fn build(
        &self,
        habitat: &Habitat,
        type_: EventType,
        reason: &str,
        message: &str,
    ) -> Option<Event> {
        let involved_object = match self.scheme.object_reference(habitat) {
            Ok(r) => r,
            Err(e) => {
                warn!(reason, error = %e, "Cannot reference Habitat in event");
                return None;
            }
        };
        let now = Time(Utc::now());
        let name = habitat.metadata.name.as_deref().unwrap_or("habitat");

        Some(Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{name}.")),
                namespace: habitat.metadata.namespace.clone(),
                ..Default::default()
            },
            involved_object,
            type_: Some(type_.as_str().to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            count: Some(1),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            source: Some(EventSource {
                component: Some(REPORTING_COMPONENT.to_string()),
                host: None,
            }),
            reporting_component: Some(REPORTING_COMPONENT.to_string()),
            ..Default::default()
        })
    }
}
