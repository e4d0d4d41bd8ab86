//! OS boot sub-flows.
//!
//! Both variants power the machine (unless its driver is manual), then wait
//! for, in order: a lease on the boot interface, every required boot asset,
//! and the start and end of the phase's stage.
//!
//! Events buffered for the machine before the power step are discarded:
//! they come from an earlier boot or an earlier attempt and must not satisfy
//! this phase's waits.

use std::collections::BTreeSet;

use fleetd_events::{BootAssetSignal, ChannelName, LeaseSignal, SignalKind, StageSignal};
use fleetd_id::SystemId;
use fleetd_workflow::{CallOptions, WorkflowContext, WorkflowError};
use serde_json::Value;
use tracing::{debug, info};

use super::types::{PowerParams, ResolvedDeployParams};

/// Which OS is being booted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPhase {
    /// In-memory installer environment.
    Ephemeral,
    /// The OS written to disk.
    Installed,
}

impl BootPhase {
    /// Stage start and finish signals of this phase.
    pub fn stage_signals(self) -> (SignalKind, SignalKind) {
        match self {
            BootPhase::Ephemeral => (SignalKind::InstallerDownload, SignalKind::InstallerFinished),
            BootPhase::Installed => (SignalKind::OsConfigDownload, SignalKind::OsConfigFinished),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BootPhase::Ephemeral => "ephemeral",
            BootPhase::Installed => "installed",
        }
    }
}

/// Boot assets still to be fetched.
///
/// Empty names are never required and duplicates collapse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingAssets {
    outstanding: BTreeSet<String>,
}

impl PendingAssets {
    pub fn new<I, S>(assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            outstanding: assets
                .into_iter()
                .map(Into::into)
                .filter(|a: &String| !a.is_empty())
                .collect(),
        }
    }

    /// Record a fetched asset. Returns true if it was outstanding.
    pub fn observe(&mut self, asset: &str) -> bool {
        self.outstanding.remove(asset)
    }

    pub fn is_satisfied(&self) -> bool {
        self.outstanding.is_empty()
    }

    pub fn outstanding(&self) -> impl Iterator<Item = &str> {
        self.outstanding.iter().map(String::as_str)
    }
}

fn channel(kind: SignalKind, system_id: &SystemId) -> String {
    ChannelName::new(kind, system_id).to_string()
}

/// Every event channel of `system_id`.
pub fn machine_channels(system_id: &SystemId) -> Vec<String> {
    SignalKind::ALL
        .into_iter()
        .map(|kind| channel(kind, system_id))
        .collect()
}

fn discard_stale_events(
    ctx: &WorkflowContext,
    system_id: &SystemId,
    phase: BootPhase,
) -> Result<(), WorkflowError> {
    let dropped = ctx.discard_signals(&machine_channels(system_id))?;
    if dropped > 0 {
        info!(system_id = %system_id, phase = phase.as_str(), dropped, "Dropped events from before power step");
    }
    Ok(())
}

/// Wait until a lease arrives for the boot interface. Leases for other
/// interfaces are consumed and ignored.
pub async fn wait_for_boot_lease(
    ctx: &WorkflowContext,
    system_id: &SystemId,
) -> Result<LeaseSignal, WorkflowError> {
    let channel = channel(SignalKind::Lease, system_id);

    loop {
        let lease: LeaseSignal = ctx.receive(&channel).await?;
        if lease.is_boot_interface {
            info!(system_id = %system_id, ip = %lease.ip, "Boot interface leased");
            return Ok(lease);
        }
        debug!(system_id = %system_id, hw_addr = %lease.hw_addr, "Ignoring non-boot lease");
    }
}

/// Wait until every asset in `pending` has been reported.
pub async fn wait_for_boot_assets(
    ctx: &WorkflowContext,
    system_id: &SystemId,
    mut pending: PendingAssets,
) -> Result<(), WorkflowError> {
    let channel = channel(SignalKind::BootAsset, system_id);

    while !pending.is_satisfied() {
        let signal: BootAssetSignal = ctx.receive(&channel).await?;
        if pending.observe(&signal.boot_asset) {
            debug!(system_id = %system_id, asset = %signal.boot_asset, "Boot asset fetched");
        }
    }

    Ok(())
}

/// Wait for the start and then the end of `phase`'s stage.
pub async fn wait_for_stage(
    ctx: &WorkflowContext,
    system_id: &SystemId,
    phase: BootPhase,
) -> Result<(), WorkflowError> {
    let (started, finished) = phase.stage_signals();

    let _: StageSignal = ctx.receive(&channel(started, system_id)).await?;
    debug!(system_id = %system_id, phase = phase.as_str(), "Stage started");

    let _: StageSignal = ctx.receive(&channel(finished, system_id)).await?;
    info!(system_id = %system_id, phase = phase.as_str(), "Stage finished");

    Ok(())
}

/// Boot the ephemeral installer environment.
///
/// Power-cycles a machine that is on and powers on one that is not.
pub async fn deploy_ephemeral_os(
    ctx: &WorkflowContext,
    system_id: &SystemId,
    power: &PowerParams,
    params: &ResolvedDeployParams,
) -> Result<(), WorkflowError> {
    discard_stale_events(ctx, system_id, BootPhase::Ephemeral)?;

    if !power.is_manual() {
        let operation = if params.is_powered_on() {
            "power-cycle"
        } else {
            "power-on"
        };
        let _: Value = ctx
            .execute(operation, &power.driver_input(), CallOptions::default())
            .await?;
        info!(system_id = %system_id, operation, "Powered machine for ephemeral boot");
    }

    wait_for_boot_lease(ctx, system_id).await?;
    wait_for_boot_assets(ctx, system_id, PendingAssets::new(params.boot_assets())).await?;
    wait_for_stage(ctx, system_id, BootPhase::Ephemeral).await
}

/// Boot the installed OS. Always power-cycles.
pub async fn deploy_installed_os(
    ctx: &WorkflowContext,
    system_id: &SystemId,
    power: &PowerParams,
) -> Result<(), WorkflowError> {
    discard_stale_events(ctx, system_id, BootPhase::Installed)?;

    if !power.is_manual() {
        let _: Value = ctx
            .execute("power-cycle", &power.driver_input(), CallOptions::default())
            .await?;
        info!(system_id = %system_id, "Power-cycled machine into installed OS");
    }

    wait_for_boot_lease(ctx, system_id).await?;
    wait_for_boot_assets(ctx, system_id, PendingAssets::default()).await?;
    wait_for_stage(ctx, system_id, BootPhase::Installed).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetd_testing::{environment, FakeController};
    use proptest::prelude::*;
    use serde_json::json;
    use std::time::Duration;

    fn asset(system_id: &str, name: &str) -> Value {
        json!({"system_id": system_id, "boot_asset": name})
    }

    #[tokio::test]
    async fn test_asset_wait_ignores_unrequired_and_any_order() {
        let env = environment(FakeController::new());
        let system_id = SystemId::parse("m1").unwrap();
        let ctx = WorkflowContext::new(env.clone(), "deploy:m1", "q");

        let waiting = tokio::spawn({
            let system_id = system_id.clone();
            async move {
                let pending = PendingAssets::new(["ubuntu/jammy", "ga-22.04"]);
                wait_for_boot_assets(&ctx, &system_id, pending).await
            }
        });

        let channel = "boot-assets:m1";
        for name in ["centos/8", "ga-22.04", "ga-22.04", "hwe-24.04"] {
            env.signals.signal(channel, asset("m1", name)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        env.signals.signal(channel, asset("m1", "ubuntu/jammy")).unwrap();
        env.signals.signal(channel, asset("m1", "after")).unwrap();
        tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // Arrivals after the last required asset stay for later steps.
        assert_eq!(env.signals.discard(channel), 1);
    }

    #[tokio::test]
    async fn test_no_required_assets_consumes_nothing() {
        let env = environment(FakeController::new());
        let system_id = SystemId::parse("m1").unwrap();
        env.signals.signal("boot-assets:m1", asset("m1", "ubuntu/jammy")).unwrap();

        let ctx = WorkflowContext::new(env.clone(), "deploy:m1", "q");
        wait_for_boot_assets(&ctx, &system_id, PendingAssets::default())
            .await
            .unwrap();

        assert_eq!(env.signals.discard("boot-assets:m1"), 1);
    }

    #[test]
    fn test_machine_channels() {
        let channels = machine_channels(&SystemId::parse("m1").unwrap());
        assert_eq!(
            channels,
            vec![
                "leases:m1",
                "boot-assets:m1",
                "installer-download:m1",
                "installer-finished:m1",
                "os-config-download:m1",
                "os-config-finished:m1",
            ]
        );
    }

    #[test]
    fn test_empty_names_are_dropped() {
        let pending = PendingAssets::new(["ubuntu/jammy", ""]);
        assert_eq!(pending.outstanding().collect::<Vec<_>>(), vec!["ubuntu/jammy"]);

        assert!(PendingAssets::new(Vec::<String>::new()).is_satisfied());
        assert!(PendingAssets::new([""]).is_satisfied());
    }

    #[test]
    fn test_duplicates_collapse() {
        let mut pending = PendingAssets::new(["ga-22.04", "ga-22.04"]);
        assert!(pending.observe("ga-22.04"));
        assert!(pending.is_satisfied());
        assert!(!pending.observe("ga-22.04"));
    }

    #[test]
    fn test_stage_signals() {
        assert_eq!(
            BootPhase::Ephemeral.stage_signals(),
            (SignalKind::InstallerDownload, SignalKind::InstallerFinished)
        );
        assert_eq!(
            BootPhase::Installed.stage_signals(),
            (SignalKind::OsConfigDownload, SignalKind::OsConfigFinished)
        );
    }

    fn arrivals() -> impl Strategy<Value = (Vec<String>, Vec<String>)> {
        proptest::collection::btree_set("[a-z]{1,6}/[a-z]{1,6}", 1..5).prop_flat_map(|required| {
            let required: Vec<String> = required.into_iter().collect();
            let noise = proptest::collection::vec("noise-[0-9]{1,3}", 0..4);
            (Just(required.clone()), Just(required).prop_shuffle(), noise)
                .prop_flat_map(|(required, order, noise)| {
                    let mut stream = order;
                    stream.extend(noise);
                    (Just(required), Just(stream).prop_shuffle())
                })
        })
    }

    proptest! {
        #[test]
        fn prop_assets_unblock_exactly_once((required, stream) in arrivals()) {
            let mut pending = PendingAssets::new(required.clone());
            let mut unblocked = 0;
            let mut seen_required = 0;

            for asset in &stream {
                let was_satisfied = pending.is_satisfied();
                let counted = pending.observe(asset);
                if counted {
                    seen_required += 1;
                }
                prop_assert_eq!(counted, required.contains(asset));
                if !was_satisfied && pending.is_satisfied() {
                    unblocked += 1;
                    prop_assert_eq!(seen_required, required.len());
                }
            }

            prop_assert_eq!(unblocked, 1);
        }
    }
}
