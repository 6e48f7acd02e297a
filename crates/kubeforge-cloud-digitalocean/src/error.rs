//! DigitalOcean provider error types

use kubeforge_cloud::CloudError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DigitalOceanError {
    #[error("DigitalOcean API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid droplet id: {0}")]
    InvalidDropletId(String),

    #[error("Droplet {0} has no public IPv4 address")]
    NoPublicIp(u64),

    #[error("Invalid API URL: {0}")]
    InvalidUrl(String),

    #[error("Kube has no node sizes configured")]
    NoNodeSizes,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DigitalOceanError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DigitalOceanError::Api { status: 404, .. })
    }
}

impl From<DigitalOceanError> for CloudError {
    fn from(err: DigitalOceanError) -> Self {
        CloudError::Provider(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DigitalOceanError>;
