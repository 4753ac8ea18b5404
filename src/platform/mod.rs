use async_trait::async_trait;
use serde::Deserialize;

use crate::error::PlatformResult;
use crate::types::LifecycleState;

pub mod cloud;
pub use cloud::CloudApi;

/// Query filters passed through to list endpoints as query parameters.
pub type Filters<'a> = &'a [(&'a str, &'a str)];

/// Read-only view of the orchestration platform.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    async fn list_services(&self, filters: Filters<'_>) -> PlatformResult<Vec<ServiceRecord>>;

    async fn get_service(&self, id: &str) -> PlatformResult<ServiceRecord>;

    async fn get_container(&self, id: &str) -> PlatformResult<ContainerRecord>;

    async fn list_nodes(&self, filters: Filters<'_>) -> PlatformResult<Vec<NodeRecord>>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceRecord {
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    pub state: LifecycleState,
    #[serde(default)]
    pub container_ports: Vec<PortRecord>,
    /// Container resource URIs, e.g. `/api/app/v1/container/<uuid>/`.
    #[serde(default)]
    pub containers: Vec<String>,
}

impl ServiceRecord {
    /// Publishes at least one port named `http` or `https`.
    pub fn is_http(&self) -> bool {
        self.container_ports
            .iter()
            .filter_map(|p| p.port_name.as_deref())
            .any(is_http_role)
    }
}

pub fn is_http_role(name: &str) -> bool {
    name == "http" || name == "https"
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortRecord {
    #[serde(default)]
    pub port_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerRecord {
    pub uuid: String,
    #[serde(default)]
    pub private_ip: Option<String>,
    pub state: LifecycleState,
    #[serde(default)]
    pub container_envvars: Vec<EnvVar>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvVar {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeRecord {
    #[serde(default)]
    pub external_fqdn: Option<String>,
    /// `None` for bring-your-own nodes.
    #[serde(default)]
    pub region: Option<String>,
}

impl ContainerRecord {
    /// Value of a declared environment variable, if set.
    pub fn env(&self, key: &str) -> Option<&str> {
        self.container_envvars
            .iter()
            .find(|e| e.key == key)
            .and_then(|e| e.value.as_deref())
    }
}

/// Extract the identifier from a resource URI (its last path segment).
pub fn id_from_uri(uri: &str) -> &str {
    uri.trim_end_matches('/').rsplit('/').next().unwrap_or(uri)
}
