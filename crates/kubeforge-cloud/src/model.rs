//! Persisted resource models
//!
//! Every model embeds an optional [`ActionStatus`] describing the last action
//! that ran against it. Record ids are assigned by the store and are not part
//! of the serialized body.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::provider::ProviderKind;

/// A record stored in a [`Collection`](crate::collection::Collection)
pub trait Model: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Store namespace, e.g. `/kubes`
    const NAMESPACE: &'static str;

    fn id(&self) -> &str;

    fn set_id(&mut self, id: String);

    /// Identity used to serialize actions against this resource
    fn uuid(&self) -> &str;

    fn action_status(&self) -> Option<&ActionStatus>;

    fn set_action_status(&mut self, status: Option<ActionStatus>);

    /// Full store key of this record
    fn key(&self) -> String {
        format!("{}/{}", Self::NAMESPACE, self.id())
    }
}

/// Lifecycle state of an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl std::fmt::Display for ActionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionState::Running => write!(f, "running"),
            ActionState::Succeeded => write!(f, "succeeded"),
            ActionState::Failed => write!(f, "failed"),
            ActionState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Status of the last action run against a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStatus {
    /// Label of the operation, e.g. "provisioning"
    pub description: String,

    /// Advisory cap on operator-driven retries
    pub max_retries: u32,

    /// Number of failed runs so far
    #[serde(default)]
    pub retries: u32,

    pub state: ActionState,

    /// Last failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionStatus {
    pub fn new(description: impl Into<String>, max_retries: u32) -> Self {
        Self {
            description: description.into(),
            max_retries,
            retries: 0,
            state: ActionState::Running,
            error: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == ActionState::Running
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == ActionState::Cancelled
    }

    /// Whether an operator may re-run the failed action
    pub fn can_retry(&self) -> bool {
        self.state == ActionState::Failed && self.retries < self.max_retries
    }
}

macro_rules! impl_model {
    ($ty:ty, $ns:literal) => {
        impl Model for $ty {
            const NAMESPACE: &'static str = $ns;

            fn id(&self) -> &str {
                &self.id
            }

            fn set_id(&mut self, id: String) {
                self.id = id;
            }

            fn uuid(&self) -> &str {
                &self.uuid
            }

            fn action_status(&self) -> Option<&ActionStatus> {
                self.action_status.as_ref()
            }

            fn set_action_status(&mut self, status: Option<ActionStatus>) {
                self.action_status = status;
            }
        }
    };
}

fn new_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Credentials for one provider account
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudAccount {
    #[serde(skip)]
    pub id: String,

    #[serde(default = "new_uuid")]
    pub uuid: String,

    pub name: String,

    pub provider: ProviderKind,

    /// Provider API token
    #[serde(default)]
    pub token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_status: Option<ActionStatus>,
}

impl_model!(CloudAccount, "/cloud_accounts");

impl CloudAccount {
    pub fn new(name: impl Into<String>, provider: ProviderKind, token: impl Into<String>) -> Self {
        Self {
            uuid: new_uuid(),
            name: name.into(),
            provider,
            token: token.into(),
            ..Default::default()
        }
    }
}

/// A Kubernetes cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Kube {
    #[serde(skip)]
    pub id: String,

    #[serde(default = "new_uuid")]
    pub uuid: String,

    pub name: String,

    /// Id of the owning [`CloudAccount`]
    pub cloud_account_id: String,

    pub region: String,

    #[serde(default)]
    pub ssh_key_fingerprint: String,

    pub master_node_size: String,

    /// Sizes offered for worker nodes; the first one is used for the initial node
    #[serde(default)]
    pub node_sizes: Vec<String>,

    /// Provider id of the master machine, 0 when not created
    #[serde(default)]
    pub master_id: u64,

    #[serde(default)]
    pub master_public_ip: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub ready: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_status: Option<ActionStatus>,
}

impl_model!(Kube, "/kubes");

impl Kube {
    pub fn new(name: impl Into<String>, cloud_account_id: impl Into<String>) -> Self {
        Self {
            uuid: new_uuid(),
            name: name.into(),
            cloud_account_id: cloud_account_id.into(),
            ..Default::default()
        }
    }
}

/// A worker node of a kube
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Node {
    #[serde(skip)]
    pub id: String,

    #[serde(default = "new_uuid")]
    pub uuid: String,

    pub kube_id: String,

    #[serde(default)]
    pub name: String,

    pub size: String,

    /// Provider-side machine id, empty until created
    #[serde(default)]
    pub provider_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_creation_timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub external_ip: String,

    #[serde(default)]
    pub out_of_disk: bool,

    /// Millicores
    #[serde(default)]
    pub cpu_usage: i64,

    /// Bytes
    #[serde(default)]
    pub ram_usage: i64,

    #[serde(default)]
    pub cpu_limit: i64,

    #[serde(default)]
    pub ram_limit: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_status: Option<ActionStatus>,
}

impl_model!(Node, "/nodes");

impl Node {
    pub fn new(kube_id: impl Into<String>, size: impl Into<String>) -> Self {
        Self {
            uuid: new_uuid(),
            kube_id: kube_id.into(),
            size: size.into(),
            ..Default::default()
        }
    }
}

/// A block storage volume attached to a kube
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Volume {
    #[serde(skip)]
    pub id: String,

    #[serde(default = "new_uuid")]
    pub uuid: String,

    pub kube_id: String,

    pub name: String,

    /// Size in GiB
    pub size: u32,

    #[serde(default)]
    pub provider_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_status: Option<ActionStatus>,
}

impl_model!(Volume, "/volumes");

/// A load-balancer entrypoint in front of a kube
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Entrypoint {
    #[serde(skip)]
    pub id: String,

    #[serde(default = "new_uuid")]
    pub uuid: String,

    pub kube_id: String,

    pub name: String,

    #[serde(default)]
    pub provider_id: String,

    #[serde(default)]
    pub address: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_status: Option<ActionStatus>,
}

impl_model!(Entrypoint, "/entrypoints");

impl Entrypoint {
    pub fn new(kube_id: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            uuid: new_uuid(),
            kube_id: kube_id.into(),
            provider_id: format!("sg-{}", name),
            name,
            ..Default::default()
        }
    }
}

fn default_protocol() -> String {
    "TCP".to_string()
}

/// A port mapping on an [`Entrypoint`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntrypointListener {
    #[serde(skip)]
    pub id: String,

    #[serde(default = "new_uuid")]
    pub uuid: String,

    pub entrypoint_id: String,

    /// External port the user connects to
    pub entrypoint_port: u16,

    #[serde(default = "default_protocol")]
    pub entrypoint_protocol: String,

    /// Target port on the nodes
    pub node_port: u16,

    #[serde(default = "default_protocol")]
    pub node_protocol: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_status: Option<ActionStatus>,
}

impl_model!(EntrypointListener, "/entrypoint_listeners");

impl EntrypointListener {
    pub fn new(entrypoint_id: impl Into<String>, entrypoint_port: u16, node_port: u16) -> Self {
        Self {
            uuid: new_uuid(),
            entrypoint_id: entrypoint_id.into(),
            entrypoint_port,
            entrypoint_protocol: default_protocol(),
            node_port,
            node_protocol: default_protocol(),
            ..Default::default()
        }
    }
}
