//! Agent plan.
//!
//! Converges the node to its role: the leader runs the elected units, every
//! other node keeps them stopped. All nodes point the leader hosts entry at
//! the current leader and join or leave the election as configured.

use crate::hosts::write_hosts_entry;
use crate::units::UnitMonitor;
use crate::voter::Voter;
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use steward_core::Result;
use steward_reconciler::{Plan, Step};
use tracing::info;

/// Desired state of the local node for one leadership assignment.
///
/// Creating steps performs no I/O; all work happens when steps run.
#[derive(Clone)]
pub struct AgentPlan {
    /// Address of this node
    pub local_addr: String,
    /// Address of the current leader, empty if unknown
    pub leader_addr: String,
    /// Whether this node should stay out of the election
    pub election_paused: bool,
    /// Units that only run on the leader
    pub units: Vec<String>,
    /// Names resolved to the leader
    pub dns_names: Vec<String>,
    /// Hosts file holding the leader entry
    pub hosts_path: PathBuf,
    pub monitor: Arc<dyn UnitMonitor>,
    pub voter: Arc<dyn Voter>,
}

impl AgentPlan {
    pub fn is_leader(&self) -> bool {
        !self.leader_addr.is_empty() && self.leader_addr == self.local_addr
    }

    fn steps(&self) -> Vec<Box<dyn Step>> {
        let mut steps: Vec<Box<dyn Step>> = Vec::with_capacity(self.units.len() + 2);

        steps.push(Box::new(VoterStep {
            enable: !self.election_paused,
            voter: self.voter.clone(),
        }));

        if !self.leader_addr.is_empty() {
            steps.push(Box::new(UpdateDns {
                addr: self.leader_addr.clone(),
                names: self.dns_names.clone(),
                path: self.hosts_path.clone(),
            }));
        }

        let leader = self.is_leader();
        for unit in &self.units {
            let step: Box<dyn Step> = if leader {
                Box::new(StartUnit {
                    unit: unit.clone(),
                    monitor: self.monitor.clone(),
                })
            } else {
                Box::new(StopUnit {
                    unit: unit.clone(),
                    monitor: self.monitor.clone(),
                })
            };
            steps.push(step);
        }

        steps
    }
}

impl fmt::Debug for AgentPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentPlan")
            .field("local_addr", &self.local_addr)
            .field("leader_addr", &self.leader_addr)
            .field("election_paused", &self.election_paused)
            .field("units", &self.units)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Plan for AgentPlan {
    fn name(&self) -> String {
        format!("agent(local={}, leader={})", self.local_addr, self.leader_addr)
    }

    async fn create(&self) -> Result<Vec<Box<dyn Step>>> {
        Ok(self.steps())
    }
}

struct VoterStep {
    enable: bool,
    voter: Arc<dyn Voter>,
}

impl fmt::Debug for VoterStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoterStep")
            .field("enable", &self.enable)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Step for VoterStep {
    fn name(&self) -> String {
        if self.enable {
            "start-voter".to_string()
        } else {
            "stop-voter".to_string()
        }
    }

    async fn run(&self) -> Result<Vec<Box<dyn Step>>> {
        if self.enable {
            self.voter.add_voter().await?;
        } else {
            self.voter.remove_voter().await?;
        }
        Ok(Vec::new())
    }
}

#[derive(Debug)]
struct UpdateDns {
    addr: String,
    names: Vec<String>,
    path: PathBuf,
}

#[async_trait]
impl Step for UpdateDns {
    fn name(&self) -> String {
        format!("update-dns({})", self.addr)
    }

    async fn run(&self) -> Result<Vec<Box<dyn Step>>> {
        write_hosts_entry(&self.path, &self.addr, &self.names).await?;
        Ok(Vec::new())
    }
}

struct StartUnit {
    unit: String,
    monitor: Arc<dyn UnitMonitor>,
}

impl fmt::Debug for StartUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartUnit")
            .field("unit", &self.unit)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Step for StartUnit {
    fn name(&self) -> String {
        format!("start({})", self.unit)
    }

    async fn run(&self) -> Result<Vec<Box<dyn Step>>> {
        self.monitor.start(&self.unit).await?;
        info!(unit = %self.unit, "Started unit");
        Ok(Vec::new())
    }
}

struct StopUnit {
    unit: String,
    monitor: Arc<dyn UnitMonitor>,
}

impl fmt::Debug for StopUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopUnit")
            .field("unit", &self.unit)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Step for StopUnit {
    fn name(&self) -> String {
        format!("stop({})", self.unit)
    }

    async fn run(&self) -> Result<Vec<Box<dyn Step>>> {
        self.monitor.stop(&self.unit).await?;
        info!(unit = %self.unit, "Stopped unit");
        Ok(vec![Box::new(ResetFailed {
            unit: self.unit.clone(),
            monitor: self.monitor.clone(),
        })])
    }
}

struct ResetFailed {
    unit: String,
    monitor: Arc<dyn UnitMonitor>,
}

impl fmt::Debug for ResetFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResetFailed")
            .field("unit", &self.unit)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Step for ResetFailed {
    fn name(&self) -> String {
        format!("reset-failed({})", self.unit)
    }

    async fn run(&self) -> Result<Vec<Box<dyn Step>>> {
        self.monitor.reset_status(&self.unit).await?;
        Ok(Vec::new())
    }
}
