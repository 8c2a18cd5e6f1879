//! Fan-out engine that relays messages from source channels to their mirrors.
//!
//! One source event (created, updated or deleted) becomes one operation: a
//! [`tracker::WorkTracker`] holding every destination, driven round by round by a
//! [`controller::WorkController`] that runs one [`kernel::MirrorKernel`] call per
//! destination until nothing is left to schedule.

pub mod config;
pub mod content;
pub mod controller;
pub mod driver;
pub mod kernel;
pub mod maintenance;
pub mod platform;
pub mod progress;
pub mod rate_limit;
pub mod schedule;
pub mod sources;
pub mod supervisor;
pub mod topology;
pub mod tracker;

pub use config::{CrosspostPolicy, InfraRetryPolicy, MirrorSettings, ProgressSettings};
pub use controller::WorkController;
pub use driver::{MirrorEngine, MirrorError, MirrorReport};
pub use kernel::{KernelError, MirrorKernel};
pub use platform::{ChatPlatform, EventPredicate, FailureClass, PlatformError};
pub use rate_limit::RateLimiter;
pub use schedule::{plan_round, PlannedKernel, RetryPolicy};
pub use progress::{ProgressHandle, ProgressReporter};
pub use sources::SourceChannels;
pub use supervisor::{OperationSupervisor, Registration, SupervisorError};
pub use topology::MirrorTopology;
pub use tracker::{OperationKey, ProgressCounts, SharedTracker, TargetState, TrackerError, WorkTracker};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
