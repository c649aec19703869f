//! Pod model.
//!
//! A pod is a first-class group of containers sharing an infra container's
//! namespaces. The pod record owns member IDs; containers carry a
//! back-reference pod ID used only for lookup, never a pointer cycle. Pod
//! state is always derived from member states on read, never stored.

mod coordinator;

pub use coordinator::{PodCoordinator, PodCreateOptions};

use crate::container::config::SharedNamespace;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Infra container settings for a pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfraConfig {
    /// Whether the pod runs an infra container at all. Without one the pod
    /// cannot share namespaces.
    pub enabled: bool,
    /// Command the infra container parks on.
    pub command: Vec<String>,
    /// Ports published on behalf of the whole pod.
    #[serde(default)]
    pub ports: Vec<crate::container::config::PortMapping>,
    #[serde(default)]
    pub dns_servers: Vec<String>,
    #[serde(default)]
    pub add_hosts: Vec<String>,
}

impl Default for InfraConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: vec!["/pause".to_string()],
            ports: Vec::new(),
            dns_servers: Vec::new(),
            add_hosts: Vec::new(),
        }
    }
}

/// Immutable pod configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodConfig {
    pub id: String,
    pub name: String,
    /// Namespaces shared through the infra container.
    pub shared_namespaces: Vec<SharedNamespace>,
    pub infra: InfraConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroup_parent: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}
