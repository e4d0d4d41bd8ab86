//! Three-phase address allocation: propose, verify, claim.

use std::collections::BTreeMap;
use std::net::IpAddr;

use fleetd_id::SystemId;
use fleetd_workflow::{CallOptions, WorkflowContext, WorkflowError};
use serde_json::Value;
use tracing::{info, warn};

use super::error::{kind, DeployError};
use super::types::{CheckIpInput, CheckIpResult, ClaimIpsInput, MachineInput, ProposedIps};

/// Builds the claim list for `candidates`.
///
/// Position `i` holds candidate `i`, or `None` if that candidate was found
/// in use. The list is never shortened.
pub fn build_claim_list(candidates: &[IpAddr], in_use: &BTreeMap<IpAddr, String>) -> Vec<Option<IpAddr>> {
    candidates
        .iter()
        .map(|ip| (!in_use.contains_key(ip)).then_some(*ip))
        .collect()
}

/// Propose, verify and claim addresses for `system_id`.
pub async fn allocate_ips(ctx: &WorkflowContext, system_id: &SystemId) -> Result<(), DeployError> {
    let proposed: ProposedIps = ctx
        .execute("propose-ip", &MachineInput::new(system_id), CallOptions::default())
        .await?;

    let check = CheckIpInput {
        ips: proposed.ips.clone(),
    };
    // An empty answer means nothing is in use.
    let verified: Option<CheckIpResult> =
        ctx.execute("check-ip", &check, CallOptions::default()).await?;
    let in_use = verified.unwrap_or_default().ips;

    if !in_use.is_empty() {
        warn!(
            system_id = %system_id,
            in_use = in_use.len(),
            "Proposed addresses already in use"
        );
    }

    let claim = ClaimIpsInput {
        system_id: system_id.clone(),
        ips: build_claim_list(&proposed.ips, &in_use),
        hw_addrs: proposed.hw_addrs,
    };

    let claimed: Result<Value, WorkflowError> =
        ctx.execute("claim-ips", &claim, CallOptions::default()).await;

    match claimed {
        Ok(_) => {
            info!(
                system_id = %system_id,
                claimed = claim.ips.iter().flatten().count(),
                "Claimed addresses"
            );
            Ok(())
        }
        Err(WorkflowError::Invoke(e)) if e.code() == Some(kind::IP_ALLOCATION_CONFLICT) => {
            Err(DeployError::IpAllocationConflict {
                message: e.to_string(),
            })
        }
        Err(e) => Err(e.into()),
    }
}
