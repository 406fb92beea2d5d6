//! # cortex-jobs
//!
//! Indexing job lifecycle for cortex: submission with a per-target
//! duplicate guard, status polling with confirmation, and a durable ledger
//! that lets tracking resume after a restart.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cortex_core::{EventBus, MemoryStore, TargetSpec};
//! use cortex_jobs::{CoordinatorConfig, HttpJobClient, JobCoordinator, JobLedger, JobPoller, PollerConfig, TimerRegistry};
//!
//! let transport = Arc::new(HttpJobClient::from_env()?);
//! let ledger = JobLedger::new(Arc::new(MemoryStore::new()));
//! let events = EventBus::default();
//! let poller = JobPoller::new(
//!     transport.clone(),
//!     ledger.clone(),
//!     Arc::new(TimerRegistry::new()),
//!     events.clone(),
//!     PollerConfig::from_env(),
//! );
//! let coordinator = JobCoordinator::new(transport, ledger, poller, events, CoordinatorConfig::from_env());
//!
//! coordinator.resume().await?;
//! let report = coordinator.start(TargetSpec::All).await?;
//! ```

pub mod coordinator;
pub mod http;
pub mod ledger;
pub mod poller;
pub mod timers;

#[cfg(test)]
mod test_support;

pub use coordinator::{CoordinatorConfig, JobCoordinator};
pub use http::HttpJobClient;
pub use ledger::JobLedger;
pub use poller::{JobPoller, PollPhase, PollerConfig};
pub use timers::TimerRegistry;
