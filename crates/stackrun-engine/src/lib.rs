//! stackrun Engine Library
//!
//! Dependency-aware task trees and the stack lifecycle layer built on them:
//! creating, updating and deleting provisioning stacks, waiting for them to
//! settle, and ordering cluster teardown so that nothing is removed while
//! something still depends on it.
//!
//! Cloud services are reached through the traits in [`api`];
//! [`sim::SimulatedCloud`] implements all of them in memory.

pub mod api;
pub mod asg;
pub mod backoff;
pub mod config;
pub mod coordinator;
pub mod inflight;
pub mod lifecycle;
pub mod manager;
pub mod naming;
pub mod registry;
pub mod sim;
pub mod tasks;
pub mod wait;

pub use config::{ConfigError, EngineConfig};
pub use coordinator::{
    Cleanup, ClusterCreation, ClusterTeardown, NoCleanup, NodegroupSpec, ServiceAccountSpec,
    TeardownPlan,
};
pub use lifecycle::{DeleteOutcome, StackLifecycle, UpdateOutcome, UpdateStackOptions};
pub use manager::{Clients, StackManager};
pub use registry::StackRegistry;
pub use sim::SimulatedCloud;
pub use tasks::{AggregateError, ExecMode, LeafStatus, Task, TaskContext, TaskTree, TreeReport};
pub use wait::{DeleteWaitCondition, SignalGuard};
