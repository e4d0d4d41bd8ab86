//! fleetd deployment agent.
//!
//! The agent serves deployment workflows for the network segments it is
//! attached to. A main worker runs the capacity configurator, which starts
//! one deploy worker per segment plus a fallback worker addressed to the
//! agent itself. Deploy workers drive machines from ready to deployed by
//! calling controller operations and waiting for boot-time signals.
//!
//! ## Modules
//!
//! - `agent`: assembly of the environment, worker pool and router
//! - `api`: HTTP control surface (signals, executions, reconfiguration)
//! - `client`: controller API client
//! - `configurator`: the `configure-agent` workflow
//! - `deploy`: the `deploy` and `deploy-n` workflows
//! - `state`: SQLite workflow journal

pub mod agent;
pub mod api;
pub mod client;
pub mod config;
pub mod configurator;
pub mod deploy;
pub mod state;

pub use agent::{build_environment, Agent};
pub use config::Config;
