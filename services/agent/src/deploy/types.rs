//! Inputs and outputs of the deployment operations.

use std::collections::BTreeMap;
use std::net::IpAddr;

use fleetd_events::NodeStatus;
use fleetd_id::{SegmentId, SystemId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Power driver that needs no agent action.
pub const MANUAL_POWER_TYPE: &str = "manual";

/// Power state reported when the machine is running.
pub const POWER_STATE_ON: &str = "on";

// =============================================================================
// Workflow Inputs
// =============================================================================

/// Parameters of one deployment attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployInput {
    pub system_id: SystemId,

    /// Task queue the deployment runs on.
    #[serde(default)]
    pub queue: String,

    pub osystem: String,
    pub distro_series: String,

    #[serde(default)]
    pub hwe_kernel: String,

    #[serde(default)]
    pub user_data: String,

    pub requesting_user_id: i64,

    #[serde(default)]
    pub install_kvm: bool,

    #[serde(default, alias = "install_vmhost")]
    pub register_vmhost: bool,

    #[serde(default)]
    pub enable_hw_sync: bool,

    /// Deploy to memory only; no installed OS phase.
    #[serde(default)]
    pub ephemeral_deploy: bool,
}

/// Bulk deployment: one child deployment per entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployNInput {
    pub params: Vec<DeployInput>,
}

/// Result of a successful deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployResult {
    pub system_id: SystemId,
    pub status: NodeStatus,
}

// =============================================================================
// Remote Operation Payloads
// =============================================================================

/// Input of operations keyed by machine only.
#[derive(Debug, Clone, Serialize)]
pub struct MachineInput {
    pub system_id: SystemId,
}

impl MachineInput {
    pub fn new(system_id: &SystemId) -> Self {
        Self {
            system_id: system_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UserInfoInput {
    pub user_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub is_superuser: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiskStatus {
    #[serde(default)]
    pub diskless: bool,
}

/// Power driver type and options, as returned by `get-power-params`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerParams {
    #[serde(default)]
    pub power_params: Map<String, Value>,
    pub power_type: String,
}

impl PowerParams {
    pub fn is_manual(&self) -> bool {
        self.power_type == MANUAL_POWER_TYPE
    }

    /// Input of `power-on` / `power-cycle`.
    pub fn driver_input(&self) -> PowerInput {
        PowerInput {
            driver_type: self.power_type.clone(),
            driver_opts: self.power_params.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerInput {
    pub driver_type: String,
    pub driver_opts: Map<String, Value>,
}

/// Final deployment parameters, as resolved by `set-deploy-params`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedDeployParams {
    #[serde(default)]
    pub bios_boot_method: String,
    #[serde(default)]
    pub osystem: String,
    #[serde(default)]
    pub distro_series: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub min_hwe_kernel: String,
    #[serde(default)]
    pub hwe_kernel: String,

    /// `on`, `off` or `unknown`.
    #[serde(default)]
    pub power_state: String,

    pub status: NodeStatus,

    #[serde(default)]
    pub previous_status: Option<NodeStatus>,

    #[serde(default)]
    pub ephemeral_deploy: bool,
    #[serde(default)]
    pub register_kvm_host: bool,
    #[serde(default)]
    pub install_kvm: bool,
    #[serde(default)]
    pub install_rackd: bool,
    #[serde(default)]
    pub netboot: bool,
    #[serde(default)]
    pub dynamic: bool,
    #[serde(default)]
    pub enable_hw_sync: bool,
}

impl ResolvedDeployParams {
    pub fn is_powered_on(&self) -> bool {
        self.power_state == POWER_STATE_ON
    }

    /// Boot assets the ephemeral environment fetches: the OS image
    /// `{osystem}/{distro_series}` and the kernel.
    pub fn boot_assets(&self) -> Vec<String> {
        vec![
            format!("{}/{}", self.osystem, self.distro_series),
            self.hwe_kernel.clone(),
        ]
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BootOrderInput {
    pub system_id: SystemId,
    pub netboot: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatusInput {
    pub system_id: SystemId,
    pub status: NodeStatus,
}

// =============================================================================
// Address Allocation
// =============================================================================

/// Candidate addresses proposed by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedIps {
    pub system_id: SystemId,
    #[serde(default)]
    pub ips: Vec<IpAddr>,
    #[serde(default, alias = "macs")]
    pub hw_addrs: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckIpInput {
    pub ips: Vec<IpAddr>,
}

/// Addresses found in use, with the hardware address answering for each.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckIpResult {
    #[serde(default)]
    pub ips: BTreeMap<IpAddr, String>,
}

/// Claim submitted to the controller. `None` marks a candidate that was
/// found in use; positions line up with the proposal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClaimIpsInput {
    pub system_id: SystemId,
    pub ips: Vec<Option<IpAddr>>,
    pub hw_addrs: Vec<String>,
}

// =============================================================================
// Capacity
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentList {
    #[serde(default)]
    pub segments: Vec<SegmentId>,
}
