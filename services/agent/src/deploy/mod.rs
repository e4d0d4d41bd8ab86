//! Machine deployment.
//!
//! `deploy` drives one machine from ready or allocated to deployed:
//! precheck, address allocation, the ephemeral boot, and for on-disk
//! installs a second boot into the installed OS. `deploy-n` runs `deploy`
//! for a list of machines as child executions.

pub mod allocate;
pub mod boot;
pub mod error;
pub mod types;
pub mod workflow;

pub use allocate::{allocate_ips, build_claim_list};
pub use boot::{deploy_ephemeral_os, deploy_installed_os, machine_channels, BootPhase, PendingAssets};
pub use error::{kind, DeployError, DeployFailure};
pub use types::*;
pub use workflow::{
    deploy, deploy_handlers, deploy_n, deploy_workflow_id, DeployOptions, DEPLOY_CHILD_ATTEMPTS,
    DEPLOY_N_WORKFLOW, DEPLOY_WORKFLOW, PRECHECK_TIMEOUT,
};
