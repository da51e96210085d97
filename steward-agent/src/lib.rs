//! # Steward Agent
//!
//! Node agent that keeps OS service units in line with the cluster's
//! leadership: the elected node runs the configured units, every other node
//! keeps them stopped, and all nodes resolve the leader's well-known names
//! through a hosts file.
//!
//! ```no_run
//! use std::sync::Arc;
//! use steward_agent::{Agent, AgentConfig, SystemctlMonitor};
//! # async fn run(client: Arc<dyn steward_core::CoordinationClient>) -> steward_core::Result<()> {
//! let config = AgentConfig::from_file("/etc/steward/agent.toml")?;
//! let mut agent = Agent::start(config, client, Arc::new(SystemctlMonitor::new()))?;
//! // ...
//! agent.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod hosts;
pub mod plan;
pub mod units;
pub mod voter;

pub use agent::Agent;
pub use config::AgentConfig;
pub use hosts::{hosts_line, write_hosts_entry};
pub use plan::AgentPlan;
pub use units::{InMemoryUnitMonitor, SystemctlMonitor, UnitMonitor, UnitState};
pub use voter::Voter;
