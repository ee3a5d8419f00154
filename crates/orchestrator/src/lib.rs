//! Deployment Orchestrator
//!
//! Turns an [`genapi_common::Artifact`] into a running, isolated container
//! reachable on a deterministic loopback port, and keeps the
//! [`genapi_registry::ApiRegistry`] in step with what is actually running.
//!
//! ## Lifecycle
//!
//! ```text
//! unloaded -> building -> running <-> restarting
//!                 |           |
//!                 v           v
//!              crashed     stopped
//! ```
//!
//! Build failures are terminal for the artifact version that failed.
//! Runtime crashes are restarted by the container restart policy until the
//! restart budget runs out, after which the sweep reaps the container and
//! the next request redeploys it.

pub mod build_context;
pub mod config;
pub mod docker;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod port;
pub mod runtime;

pub use build_context::BuildContext;
pub use config::OrchestratorConfig;
pub use docker::DockerRuntime;
pub use error::{OrchestratorError, Result};
pub use models::{
    DeploymentRecord, DeploymentSummary, Diagnostics, HealthReport, ResourceLimits, SweepReport,
};
pub use orchestrator::{container_name, image_tag, DeploymentLease, Orchestrator};
pub use runtime::{ContainerInfo, ContainerRuntime, ContainerSpec, ContainerState, ResourceUsage};
