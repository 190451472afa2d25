//! Companion connection/scheduling status.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// State of a companion's boundary scheduler.
///
/// `Armed` means a pending tempo state and a live timer targeting the next
/// bar line exist. `Locked` means the local tempo engine has been aligned to
/// the currently active state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum SchedulerStatus {
    /// No channel to the authority.
    #[default]
    Disconnected,
    /// Channel being opened or clock sync in progress.
    Connecting,
    /// Channel open and clock synced; nothing pending.
    Connected,
    /// Pending state waiting for the next boundary.
    Armed,
    /// Engine aligned to the current state.
    Locked,
}

impl SchedulerStatus {
    /// Whether the authority channel is up in this state.
    pub const fn is_online(self) -> bool {
        matches!(self, Self::Connected | Self::Armed | Self::Locked)
    }
}

impl core::fmt::Display for SchedulerStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Armed => "armed",
            Self::Locked => "locked",
        };
        f.write_str(name)
    }
}
