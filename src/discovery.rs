//! Discovery model.
//!
//! Builds an immutable snapshot of the HTTP services currently reachable
//! from this proxy.  A snapshot is never updated in place: every rebuild
//! queries the platform from scratch and replaces the previous one, so a
//! failed query leaves the last rendered configuration untouched.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::PlatformResult;
use crate::platform::{id_from_uri, is_http_role, ContainerRecord, PlatformApi, ServiceRecord};
use crate::types::LifecycleState;

const DEFAULT_PORT: &str = "80";
const DEFAULT_BODY_SIZE: &str = "1m";

/// Which containers count as reachable from this proxy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestrictMode {
    /// Every eligible container.
    #[default]
    None,
    /// Only containers on the same node as this proxy.
    Node,
    /// Only containers whose node is in the same region as this proxy's node.
    Region,
}

impl fmt::Display for RestrictMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Node => f.write_str("node"),
            Self::Region => f.write_str("region"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TopologyFilter {
    pub mode: RestrictMode,
    /// This proxy's node fqdn.
    pub node: Option<String>,
}

/// A filter resolved for one rebuild.  The region table is fetched at most
/// once here and dropped with the scope, since topology can change between
/// rebuilds.
struct Scope<'a> {
    filter: &'a TopologyFilter,
    regions: HashMap<String, Option<String>>,
}

impl<'a> Scope<'a> {
    async fn resolve(filter: &'a TopologyFilter, api: &dyn PlatformApi) -> PlatformResult<Scope<'a>> {
        let regions = match filter.mode {
            RestrictMode::Region => api
                .list_nodes(&[])
                .await?
                .into_iter()
                .filter_map(|n| n.external_fqdn.map(|fqdn| (fqdn, n.region)))
                .collect(),
            _ => HashMap::new(),
        };
        Ok(Scope { filter, regions })
    }

    fn region_of(&self, node: Option<&str>) -> Option<&str> {
        node.and_then(|n| self.regions.get(n))
            .and_then(|r| r.as_deref())
    }

    fn includes(&self, container: &Container) -> bool {
        let local = self.filter.node.as_deref();
        match self.filter.mode {
            RestrictMode::None => true,
            RestrictMode::Node => container.node.as_deref() == local,
            RestrictMode::Region => {
                self.region_of(local) == self.region_of(container.node.as_deref())
            }
        }
    }
}

/// A single container, reduced to what routing needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub id: String,
    pub ip: Option<String>,
    pub state: LifecycleState,
    pub host: Option<String>,
    pub port: Option<String>,
    pub force_ssl: bool,
    pub node: Option<String>,
    pub client_max_body_size: Option<String>,
}

impl Container {
    pub fn from_record(record: &ContainerRecord) -> Self {
        let owned = |key: &str| record.env(key).map(str::to_string);
        Self {
            id: record.uuid.clone(),
            ip: record.private_ip.clone().filter(|ip| !ip.is_empty()),
            state: record.state,
            host: owned("VIRTUAL_HOST"),
            port: owned("VIRTUAL_PORT"),
            force_ssl: record.env("FORCE_SSL").map_or(false, |v| !v.is_empty()),
            node: owned("DOCKERCLOUD_NODE_FQDN"),
            client_max_body_size: owned("NGINX_CLIENT_MAX_BODY_SIZE"),
        }
    }

    /// Only starting or running containers with an address receive traffic.
    pub fn is_eligible(&self) -> bool {
        self.state.is_container_eligible() && self.ip.is_some()
    }
}

/// A service and the containers this proxy may route to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub state: LifecycleState,
    pub port_roles: Vec<String>,
    containers: Vec<Container>,
    addresses: Vec<String>,
}

impl Service {
    /// Build a service from its record and the containers that already
    /// passed eligibility and topology filtering.
    pub fn new(record: ServiceRecord, containers: Vec<Container>) -> Self {
        let mut addresses: Vec<String> = containers.iter().filter_map(|c| c.ip.clone()).collect();
        addresses.sort_by_cached_key(|ip| (ip.parse::<IpAddr>().ok(), ip.clone()));

        Self {
            id: record.uuid,
            name: record.name,
            state: record.state,
            port_roles: record
                .container_ports
                .into_iter()
                .filter_map(|p| p.port_name)
                .collect(),
            containers,
            addresses,
        }
    }

    pub fn is_http(&self) -> bool {
        self.port_roles.iter().map(String::as_str).any(is_http_role)
    }

    pub fn is_running(&self) -> bool {
        self.state.is_service_running()
    }

    /// HTTP-capable, running, and at least one reachable container.
    pub fn is_routable(&self) -> bool {
        self.is_http() && self.is_running() && !self.containers.is_empty()
    }

    fn primary(&self) -> Option<&Container> {
        self.containers.first()
    }

    pub fn host(&self) -> Option<&str> {
        self.primary().and_then(|c| c.host.as_deref())
    }

    pub fn port(&self) -> &str {
        self.primary()
            .and_then(|c| c.port.as_deref())
            .unwrap_or(DEFAULT_PORT)
    }

    pub fn force_ssl(&self) -> bool {
        self.primary().map_or(false, |c| c.force_ssl)
    }

    pub fn client_max_body_size(&self) -> &str {
        self.primary()
            .and_then(|c| c.client_max_body_size.as_deref())
            .unwrap_or(DEFAULT_BODY_SIZE)
    }

    /// Container addresses in ascending order.
    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }
}

/// Query the platform and return the routable services, in the order the
/// platform lists them.  Any query failure fails the whole rebuild.
pub async fn rebuild(api: &dyn PlatformApi, filter: &TopologyFilter) -> PlatformResult<Vec<Service>> {
    let listed = api.list_services(&[]).await?;
    let scope = Scope::resolve(filter, api).await?;
    let mut services = Vec::new();

    for summary in listed {
        // List entries may be abbreviated; refresh the full record.
        let record = api.get_service(&summary.uuid).await?;
        if !record.is_http() || !record.state.is_service_running() {
            debug!("Skipping service {} ({})", record.name, record.state);
            continue;
        }

        let mut containers = Vec::with_capacity(record.containers.len());
        for uri in &record.containers {
            let container = Container::from_record(&api.get_container(id_from_uri(uri)).await?);
            if container.is_eligible() && scope.includes(&container) {
                containers.push(container);
            } else {
                debug!("Excluding container {} ({}) of {}", container.id, container.state, record.name);
            }
        }

        let service = Service::new(record, containers);
        if service.is_routable() {
            services.push(service);
        } else {
            debug!("Skipping service {}: no reachable containers", service.name);
        }
    }

    Ok(services)
}
