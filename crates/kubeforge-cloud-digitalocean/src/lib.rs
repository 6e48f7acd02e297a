//! DigitalOcean provider for KubeForge
//!
//! Provisions Kubernetes masters and minions as CoreOS droplets through the
//! DigitalOcean v2 REST API.

pub mod api;
pub mod error;
pub mod provider;

pub use api::{
    CreateDropletRequest, Droplet, DropletApi, DropletConnector, HttpDropletApi,
    HttpDropletConnector,
};
pub use error::{DigitalOceanError, Result};
pub use provider::{DigitalOceanProvider, UserData};
