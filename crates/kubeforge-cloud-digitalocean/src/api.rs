//! DigitalOcean v2 API client
//!
//! Only the droplet and tag endpoints used for cluster provisioning.

use crate::error::{DigitalOceanError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const DIGITALOCEAN_API_BASE: &str = "https://api.digitalocean.com/v2";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkV4 {
    pub ip_address: String,
    #[serde(rename = "type")]
    pub network_type: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Networks {
    #[serde(default)]
    pub v4: Vec<NetworkV4>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Droplet {
    pub id: u64,
    pub name: String,
    /// RFC 3339 creation time
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub networks: Networks,
}

impl Droplet {
    pub fn public_ipv4(&self) -> Option<&str> {
        self.networks
            .v4
            .iter()
            .find(|n| n.network_type == "public")
            .map(|n| n.ip_address.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateDropletRequest {
    pub name: String,
    pub region: String,
    pub size: String,
    pub image: String,
    /// SSH key fingerprints
    pub ssh_keys: Vec<String>,
    pub private_networking: bool,
    pub user_data: String,
}

/// Droplet and tag operations for one account
#[async_trait]
pub trait DropletApi: Send + Sync {
    async fn list_droplets(&self) -> Result<Vec<Droplet>>;

    async fn create_tag(&self, name: &str) -> Result<()>;

    async fn create_droplet(&self, request: &CreateDropletRequest) -> Result<Droplet>;

    async fn tag_droplet(&self, tag: &str, droplet_id: u64) -> Result<()>;

    async fn get_droplet(&self, id: u64) -> Result<Droplet>;

    async fn delete_droplet(&self, id: u64) -> Result<()>;
}

/// Builds an API client for an account token
pub trait DropletConnector: Send + Sync {
    fn connect(&self, token: &str) -> Arc<dyn DropletApi>;
}

/// Connector sharing one `reqwest::Client` across all accounts
#[derive(Clone)]
pub struct HttpDropletConnector {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDropletConnector {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: DIGITALOCEAN_API_BASE.to_string(),
        }
    }

    /// Point at a different API root (e.g. a mock server)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

impl DropletConnector for HttpDropletConnector {
    fn connect(&self, token: &str) -> Arc<dyn DropletApi> {
        Arc::new(HttpDropletApi {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: token.to_string(),
        })
    }
}

pub struct HttpDropletApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Deserialize)]
struct DropletEnvelope {
    droplet: Droplet,
}

#[derive(Deserialize)]
struct DropletsEnvelope {
    #[serde(default)]
    droplets: Vec<Droplet>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Serialize)]
struct TagResource {
    resource_id: String,
    resource_type: &'static str,
}

#[derive(Serialize)]
struct TagResourcesRequest {
    resources: Vec<TagResource>,
}

impl HttpDropletApi {
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// `tags/{tag}/resources` with the tag percent-encoded as one segment
    fn tag_resources_url(&self, tag: &str) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| DigitalOceanError::InvalidUrl(format!("{}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| DigitalOceanError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(["tags", tag, "resources"]);
        Ok(url)
    }

    /// Turn a non-2xx response into an `Api` error carrying the API's message
    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .map(|e| e.message)
            .unwrap_or(body);
        Err(DigitalOceanError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl DropletApi for HttpDropletApi {
    async fn list_droplets(&self) -> Result<Vec<Droplet>> {
        let response = self
            .client
            .get(self.url("droplets?per_page=1"))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let envelope: DropletsEnvelope = Self::check(response).await?.json().await?;
        Ok(envelope.droplets)
    }

    async fn create_tag(&self, name: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url("tags"))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn create_droplet(&self, request: &CreateDropletRequest) -> Result<Droplet> {
        let response = self
            .client
            .post(self.url("droplets"))
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await?;
        let envelope: DropletEnvelope = Self::check(response).await?.json().await?;
        tracing::debug!("Created droplet {} ({})", envelope.droplet.name, envelope.droplet.id);
        Ok(envelope.droplet)
    }

    async fn tag_droplet(&self, tag: &str, droplet_id: u64) -> Result<()> {
        let body = TagResourcesRequest {
            resources: vec![TagResource {
                resource_id: droplet_id.to_string(),
                resource_type: "droplet",
            }],
        };
        let response = self
            .client
            .post(self.tag_resources_url(tag)?)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn get_droplet(&self, id: u64) -> Result<Droplet> {
        let response = self
            .client
            .get(self.url(&format!("droplets/{}", id)))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let envelope: DropletEnvelope = Self::check(response).await?.json().await?;
        Ok(envelope.droplet)
    }

    async fn delete_droplet(&self, id: u64) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("droplets/{}", id)))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::check(response).await?;
        tracing::debug!("Deleted droplet {}", id);
        Ok(())
    }
}
