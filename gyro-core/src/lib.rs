//! Gyro Core
//!
//! Primitives shared by Gyro's AWS resources: tag reconciliation and
//! waiting for eventually-consistent operations to converge.

pub mod config;
pub mod provider;
pub mod resource;
pub mod tags;
pub mod wait;

pub use config::{ConfigError, WaitConfig};
pub use provider::{BoxFuture, ProviderError, ProviderResult, TagClient, sync_tags};
pub use resource::ResourceId;
pub use tags::{TagDelta, TagSet, diff};
pub use wait::{
    CancelHandle, CancelToken, Clock, ConditionError, Converged, ConvergencePoller, PollError,
    PollPolicy, PollTimeoutError, TokioClock, cancel_pair,
};
