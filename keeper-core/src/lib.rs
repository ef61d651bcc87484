//! Keeper core library: domain types, possession lock, errors.
//!
//! Public API surface:
//! - [`types`]: service identifiers, possession key/record, run config
//! - [`error`]: [`PossessionError`]
//! - [`possession`]: the machine-wide [`PossessionLock`]

pub mod error;
pub mod possession;
pub mod types;

pub use error::PossessionError;
pub use possession::{OwnerKiller, OwnerProbe, PossessionLock};
pub use types::{
    DaemonRunConfig, OwnerIdentity, PossessionKey, PossessionRecord, ServiceId,
    UnknownServiceName,
};
