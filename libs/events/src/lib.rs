//! # fleetd-events
//!
//! Wire types for the signals that drive deployments forward, plus the
//! externally-owned node status codes.
//!
//! ## Signal Channels
//!
//! Every external event is delivered to a named channel `{kind}:{system_id}`:
//!
//! - `leases:<id>`: DHCP lease assigned to one of the machine's interfaces
//! - `boot-assets:<id>`: the machine fetched a boot asset (image, kernel)
//! - `installer-download:<id>` / `installer-finished:<id>`: installer stage
//! - `os-config-download:<id>` / `os-config-finished:<id>`: first-boot
//!   configuration stage of the installed OS
//!
//! Producers (DHCP hooks, the boot asset server, installer callbacks) post
//! a JSON payload; [`SignalEnvelope::validate`] checks it against the kind
//! before it is handed to the signal registry.

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
