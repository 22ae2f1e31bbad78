//! Buildkite agent stack for Kubernetes.
//!
//! Bridges the Buildkite job queue and a Kubernetes cluster: scheduled jobs
//! whose agent tags match the configured pool are materialised as ephemeral
//! batch Jobs that run one build each and are reaped by the cluster's TTL
//! controller. Concurrency is bounded, duplicates are suppressed against
//! cluster state, and stuck image pulls are resolved by cancelling the job
//! with a visible failure message.

pub mod agent_tags;
pub mod buildkite;
pub mod config;
pub mod monitor;
pub mod scheduler;
pub mod supervisor;

pub use buildkite::CommandJob;
pub use config::Config;
