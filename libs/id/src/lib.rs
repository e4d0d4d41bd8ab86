//! # fleetd-id
//!
//! Identifier types shared by every fleetd crate.
//!
//! ## Identifier Kinds
//!
//! - [`SystemId`]: opaque machine key assigned by the controller. It is
//!   embedded in event channel names (`leases:{id}`) and task queue names
//!   (`{id}@main`), so the separator characters `:` and `@` are rejected.
//! - [`SegmentId`]: numeric network segment (VLAN) identifier.
//! - [`ExecutionId`] / [`WorkerId`]: agent-generated ULIDs in the
//!   `{prefix}_{ulid}` format, e.g. `exec_01HV4Z2WQXKJNM8GPQY6VBKC3D`.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
