use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{ContainerRecord, Filters, NodeRecord, PlatformApi, ServiceRecord};
use crate::error::{PlatformError, PlatformResult};

/// REST client for the platform's application API.
///
/// Every request carries the configured credential verbatim in the
/// `Authorization` header.  Transport timeouts are enforced here so a
/// rebuild can never hang the controller loop indefinitely.
pub struct CloudApi {
    client: reqwest::Client,
    base: Url,
    auth: String,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default)]
    meta: Option<Meta>,
    #[serde(default = "Vec::new")]
    objects: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Meta {
    #[serde(default)]
    next: Option<String>,
}

impl CloudApi {
    pub fn new(base_url: &str, auth: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let base = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))
            .map_err(|e| anyhow::anyhow!("Invalid api_url {}: {}", base_url, e))?;
        Ok(Self {
            client,
            base,
            auth: auth.to_string(),
        })
    }

    /// `resource` is relative to the base, e.g. `service/` or `container/<id>/`.
    fn endpoint(&self, resource: &str) -> PlatformResult<Url> {
        self.base
            .join(resource)
            .map_err(|_| PlatformError::Url(resource.to_string()))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        filters: Filters<'_>,
    ) -> PlatformResult<T> {
        debug!("GET {}", url);
        let response = self
            .client
            .get(url.clone())
            .header(AUTHORIZATION, self.auth.as_str())
            .header(ACCEPT, "application/json")
            .query(filters)
            .send()
            .await
            .map_err(|source| PlatformError::Http {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PlatformError::Status {
                url: url.to_string(),
                status,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|source| PlatformError::Decode {
                url: url.to_string(),
                source,
            })
    }

    /// Fetch every page of a list endpoint, following `meta.next`.
    async fn list<T: DeserializeOwned>(
        &self,
        resource: &str,
        filters: Filters<'_>,
    ) -> PlatformResult<Vec<T>> {
        let mut url = self.endpoint(resource)?;
        let mut query = filters;
        let mut objects = Vec::new();

        loop {
            let page: Page<T> = self.get_json(url.clone(), query).await?;
            objects.extend(page.objects);

            let next = match page.meta.and_then(|m| m.next) {
                Some(next) if !next.is_empty() => self
                    .base
                    .join(&next)
                    .map_err(|_| PlatformError::Url(next.clone()))?,
                _ => break,
            };
            if next == url {
                break;
            }
            // The next link already carries the filters.
            url = next;
            query = &[];
        }

        Ok(objects)
    }
}

#[async_trait]
impl PlatformApi for CloudApi {
    async fn list_services(&self, filters: Filters<'_>) -> PlatformResult<Vec<ServiceRecord>> {
        self.list("service/", filters).await
    }

    async fn get_service(&self, id: &str) -> PlatformResult<ServiceRecord> {
        let url = self.endpoint(&format!("service/{}/", id))?;
        self.get_json(url, &[]).await
    }

    async fn get_container(&self, id: &str) -> PlatformResult<ContainerRecord> {
        let url = self.endpoint(&format!("container/{}/", id))?;
        self.get_json(url, &[]).await
    }

    async fn list_nodes(&self, filters: Filters<'_>) -> PlatformResult<Vec<NodeRecord>> {
        self.list("node/", filters).await
    }
}
