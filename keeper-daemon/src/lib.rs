//! Keeper daemon runtime: possession-guarded socket server hosting services.

pub mod client;
mod error;
pub mod launch;
pub mod log_rotation;
pub mod logging;
pub mod paths;
pub mod probe;
pub mod protocol;
mod runtime;
pub mod server;
pub mod service;
pub mod supervisor;

pub use client::{request_status, request_stop, Client};
pub use error::{DaemonError, LaunchError, ProtocolError, FORCE_HINT};
pub use launch::{launch_and_wait, BackgroundLaunchOutcome, ReadinessStrategy};
pub use protocol::{DaemonRequest, DaemonResponse};
pub use runtime::{start_blocking, DaemonRunner, DaemonSettings};
pub use service::{Service, ServiceChannel, ServiceContext, ServiceError, ServiceTable};
pub use supervisor::ServiceRunner;
