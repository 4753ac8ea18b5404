//! Data structures shared by the stream client and the discovery model.
//!
//! The platform reports lifecycle changes as JSON text frames.  Only
//! frames of the shape `{"type": "service", "uuid": .., "state": ..}`
//! influence reconfiguration; everything else decodes to
//! [`PlatformEvent::Ignored`] so a malformed or unrelated frame can never
//! disturb the debounce state.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a service or container as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Init,
    Starting,
    Running,
    #[serde(rename = "Partly running")]
    PartlyRunning,
    Scaling,
    Redeploying,
    Stopping,
    Stopped,
    #[serde(rename = "Not running")]
    NotRunning,
    Terminating,
    Terminated,
    #[serde(other)]
    Unknown,
}

/// How a lifecycle state affects pending reconfigurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Mid-change: rendering now would capture a half-updated topology.
    Transitional,
    /// Reached a stable end-state.
    Settled,
    /// Neither; has no effect on debouncing.
    Other,
}

impl LifecycleState {
    pub fn phase(self) -> Phase {
        match self {
            Self::Scaling
            | Self::Redeploying
            | Self::Stopping
            | Self::Starting
            | Self::Terminating => Phase::Transitional,
            Self::Running | Self::Stopped | Self::NotRunning | Self::Terminated => {
                Phase::Settled
            }
            _ => Phase::Other,
        }
    }

    /// Service-level "running" check (fully or partially).
    pub fn is_service_running(self) -> bool {
        matches!(self, Self::Running | Self::PartlyRunning)
    }

    /// Container-level routing eligibility.
    pub fn is_container_eligible(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "Init",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::PartlyRunning => "Partly running",
            Self::Scaling => "Scaling",
            Self::Redeploying => "Redeploying",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::NotRunning => "Not running",
            Self::Terminating => "Terminating",
            Self::Terminated => "Terminated",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// A decoded frame from the platform event feed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PlatformEvent {
    /// A service changed lifecycle state.
    Service { uuid: String, state: LifecycleState },
    /// Any other entity kind, or a frame we could not make sense of.
    #[serde(other)]
    Ignored,
}

impl PlatformEvent {
    /// Decode a text frame.  Never fails: unknown shapes are ignored.
    pub fn parse(text: &str) -> Self {
        serde_json::from_str(text).unwrap_or(Self::Ignored)
    }
}
