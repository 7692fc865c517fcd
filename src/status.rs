use serde::{Deserialize, Serialize};

/// Durable lifecycle state of an FDU, as tracked locally.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FduState {
    #[default]
    Defined,
    Configured,
    Running,
    Paused,
}

/// Transient status strings published to the fabric. Distinct from
/// [`FduState`]: `starting`/`stop`/`error` have no durable state of their
/// own, they describe an in-flight or failed transition.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FduStatus {
    Defined,
    Configured,
    Starting,
    Run,
    Pause,
    Stop,
    Error,
}

impl From<FduState> for FduStatus {
    fn from(s: FduState) -> Self {
        match s {
            FduState::Defined => FduStatus::Defined,
            FduState::Configured => FduStatus::Configured,
            FduState::Running => FduStatus::Run,
            FduState::Paused => FduStatus::Pause,
        }
    }
}

/// The record written to the fabric's actual-state channel after every
/// successful (or failed) lifecycle operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FduActualState {
    pub status: FduStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl FduActualState {
    pub fn ok(status: FduStatus) -> Self {
        Self {
            status,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: FduStatus::Error,
            message: Some(message.into()),
        }
    }
}

/// Desired-state status strings the fabric observer dispatches on. Mirrors
/// the action vocabulary the lifecycle engine understands.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DesiredAction {
    Define,
    Configure,
    Run,
    Stop,
    Pause,
    Resume,
    Clean,
    Undefine,
}

/// Record of this node's plugin instance, published at startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PluginState {
    pub uuid: uuid::Uuid,
    pub name: String,
    pub version: String,
    pub pid: u32,
    pub status: PluginStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Running,
    Stopped,
}
