//! Gyro AWS Cloud Control Provider
//!
//! Cloud Control adapter for the Gyro core primitives.
//!
//! ## Module Structure
//!
//! - `provider` - AwsccProvider: resource reads, tag client, request waiters
//! - `tags` - Conversion between tag sets and the CloudFormation `Tags` property

pub mod provider;
pub mod tags;

// Re-export main types
pub use provider::{AwsccProvider, CloudControlTags, OperationProgress, classify_status};
pub use tags::{tags_from_json, tags_patch, tags_to_json};
