//! Node status codes and signal payload definitions.

use std::net::IpAddr;

use fleetd_id::SystemId;
use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Node Status
// =============================================================================

/// Machine lifecycle status, owned by the controller.
///
/// Serialized as the controller's integer code. The agent never decides
/// transitions; it only reads the status returned by `set-deploy-params`
/// and writes terminal statuses through `update-node-status`. Codes this
/// build does not know decode to [`NodeStatus::Other`] and round-trip
/// unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum NodeStatus {
    New,
    Commissioning,
    FailedCommissioning,
    Missing,
    Ready,
    Reserved,
    Deployed,
    Retired,
    Broken,
    Deploying,
    Allocated,
    FailedDeployment,
    Releasing,
    FailedReleasing,
    DiskErasing,
    FailedDiskErasing,
    RescueMode,
    EnteringRescueMode,
    FailedEnteringRescueMode,
    ExitingRescueMode,
    FailedExitingRescueMode,
    Testing,
    FailedTesting,
    /// A code outside the known table.
    Other(i32),
}

impl NodeStatus {
    /// Known statuses, indexed by code.
    pub const KNOWN: [NodeStatus; 23] = [
        NodeStatus::New,
        NodeStatus::Commissioning,
        NodeStatus::FailedCommissioning,
        NodeStatus::Missing,
        NodeStatus::Ready,
        NodeStatus::Reserved,
        NodeStatus::Deployed,
        NodeStatus::Retired,
        NodeStatus::Broken,
        NodeStatus::Deploying,
        NodeStatus::Allocated,
        NodeStatus::FailedDeployment,
        NodeStatus::Releasing,
        NodeStatus::FailedReleasing,
        NodeStatus::DiskErasing,
        NodeStatus::FailedDiskErasing,
        NodeStatus::RescueMode,
        NodeStatus::EnteringRescueMode,
        NodeStatus::FailedEnteringRescueMode,
        NodeStatus::ExitingRescueMode,
        NodeStatus::FailedExitingRescueMode,
        NodeStatus::Testing,
        NodeStatus::FailedTesting,
    ];

    /// Returns the controller's integer code.
    pub fn code(self) -> i32 {
        match self {
            NodeStatus::New => 0,
            NodeStatus::Commissioning => 1,
            NodeStatus::FailedCommissioning => 2,
            NodeStatus::Missing => 3,
            NodeStatus::Ready => 4,
            NodeStatus::Reserved => 5,
            NodeStatus::Deployed => 6,
            NodeStatus::Retired => 7,
            NodeStatus::Broken => 8,
            NodeStatus::Deploying => 9,
            NodeStatus::Allocated => 10,
            NodeStatus::FailedDeployment => 11,
            NodeStatus::Releasing => 12,
            NodeStatus::FailedReleasing => 13,
            NodeStatus::DiskErasing => 14,
            NodeStatus::FailedDiskErasing => 15,
            NodeStatus::RescueMode => 16,
            NodeStatus::EnteringRescueMode => 17,
            NodeStatus::FailedEnteringRescueMode => 18,
            NodeStatus::ExitingRescueMode => 19,
            NodeStatus::FailedExitingRescueMode => 20,
            NodeStatus::Testing => 21,
            NodeStatus::FailedTesting => 22,
            NodeStatus::Other(code) => code,
        }
    }

    /// Looks up a status by its integer code.
    pub fn from_code(code: i32) -> Self {
        usize::try_from(code)
            .ok()
            .and_then(|idx| Self::KNOWN.get(idx).copied())
            .unwrap_or(NodeStatus::Other(code))
    }

    /// Returns true if a deployment may start from this status.
    pub fn is_deployable(self) -> bool {
        matches!(self, NodeStatus::Ready | NodeStatus::Allocated)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::New => "new",
            NodeStatus::Commissioning => "commissioning",
            NodeStatus::FailedCommissioning => "failed_commissioning",
            NodeStatus::Missing => "missing",
            NodeStatus::Ready => "ready",
            NodeStatus::Reserved => "reserved",
            NodeStatus::Deployed => "deployed",
            NodeStatus::Retired => "retired",
            NodeStatus::Broken => "broken",
            NodeStatus::Deploying => "deploying",
            NodeStatus::Allocated => "allocated",
            NodeStatus::FailedDeployment => "failed_deployment",
            NodeStatus::Releasing => "releasing",
            NodeStatus::FailedReleasing => "failed_releasing",
            NodeStatus::DiskErasing => "disk_erasing",
            NodeStatus::FailedDiskErasing => "failed_disk_erasing",
            NodeStatus::RescueMode => "rescue_mode",
            NodeStatus::EnteringRescueMode => "entering_rescue_mode",
            NodeStatus::FailedEnteringRescueMode => "failed_entering_rescue_mode",
            NodeStatus::ExitingRescueMode => "exiting_rescue_mode",
            NodeStatus::FailedExitingRescueMode => "failed_exiting_rescue_mode",
            NodeStatus::Testing => "testing",
            NodeStatus::FailedTesting => "failed_testing",
            NodeStatus::Other(_) => "unknown",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Other(code) => write!(f, "unknown({code})"),
            known => f.write_str(known.as_str()),
        }
    }
}

impl From<i32> for NodeStatus {
    fn from(code: i32) -> Self {
        Self::from_code(code)
    }
}

impl From<NodeStatus> for i32 {
    fn from(status: NodeStatus) -> Self {
        status.code()
    }
}

// =============================================================================
// Signal Kinds
// =============================================================================

/// The kinds of external signal a deployment can wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Lease,
    BootAsset,
    InstallerDownload,
    InstallerFinished,
    OsConfigDownload,
    OsConfigFinished,
}

impl SignalKind {
    pub const ALL: [SignalKind; 6] = [
        SignalKind::Lease,
        SignalKind::BootAsset,
        SignalKind::InstallerDownload,
        SignalKind::InstallerFinished,
        SignalKind::OsConfigDownload,
        SignalKind::OsConfigFinished,
    ];

    /// Channel name prefix for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Lease => "leases",
            SignalKind::BootAsset => "boot-assets",
            SignalKind::InstallerDownload => "installer-download",
            SignalKind::InstallerFinished => "installer-finished",
            SignalKind::OsConfigDownload => "os-config-download",
            SignalKind::OsConfigFinished => "os-config-finished",
        }
    }

    /// Decodes a payload of this kind and returns the machine it names.
    pub fn decode_system_id(self, payload: &serde_json::Value) -> Result<SystemId, EventError> {
        let invalid = |e: serde_json::Error| EventError::InvalidPayload {
            kind: self.as_str().to_string(),
            message: e.to_string(),
        };

        let system_id = match self {
            SignalKind::Lease => {
                LeaseSignal::deserialize(payload)
                    .map_err(invalid)?
                    .system_id
            }
            SignalKind::BootAsset => {
                BootAssetSignal::deserialize(payload)
                    .map_err(invalid)?
                    .system_id
            }
            SignalKind::InstallerDownload
            | SignalKind::InstallerFinished
            | SignalKind::OsConfigDownload
            | SignalKind::OsConfigFinished => {
                StageSignal::deserialize(payload)
                    .map_err(invalid)?
                    .system_id
            }
        };

        Ok(system_id)
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SignalKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| EventError::UnknownKind(s.to_string()))
    }
}

// =============================================================================
// Signal Payloads
// =============================================================================

/// A DHCP lease was handed to one of the machine's interfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseSignal {
    #[serde(alias = "machine_id")]
    pub system_id: SystemId,
    pub ip: IpAddr,
    pub hw_addr: String,
    #[serde(default)]
    pub is_boot_interface: bool,
}

/// The machine fetched a boot asset such as `ubuntu/jammy` or `ga-22.04`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootAssetSignal {
    #[serde(alias = "machine_id")]
    pub system_id: SystemId,
    pub boot_asset: String,
}

/// Start or end of an installer / OS configuration stage.
///
/// The four stage kinds share this payload; the channel kind carries the
/// meaning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSignal {
    #[serde(alias = "machine_id")]
    pub system_id: SystemId,
}
