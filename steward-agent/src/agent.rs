//! Agent driver.
//!
//! Wires a [`Candidate`], an optional election-flag [`Watcher`] and a
//! [`Reconciler`] together: every leadership or flag change produces a new
//! [`AgentPlan`] which replaces the reconciler's active plan.
//!
//! With an election flag configured the candidate only joins the election
//! once the flag has been read and found not to be `"false"`.

use crate::config::AgentConfig;
use crate::plan::AgentPlan;
use crate::units::UnitMonitor;
use std::sync::Arc;
use std::time::Duration;
use steward_core::{CoordinationClient, Event, EventKind, Result};
use steward_leader::{Candidate, CandidateHandle, Watcher, WatcherConfig};
use steward_reconciler::Reconciler;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Running node agent.
pub struct Agent {
    candidate: CandidateHandle,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Agent {
    /// Starts the agent. Must be called from within a Tokio runtime.
    pub fn start(
        config: AgentConfig,
        client: Arc<dyn CoordinationClient>,
        monitor: Arc<dyn UnitMonitor>,
    ) -> Result<Self> {
        config.validate()?;

        let candidate = Candidate::new(config.candidate_config(client.clone()))?;
        let watcher = match &config.election_enabled_key {
            Some(key) => Some(Watcher::new(
                WatcherConfig::new(key.clone(), client.clone())
                    .with_retry_timeout(config.reconnect_timeout),
            )?),
            None => None,
        };
        let election_paused = config.election_enabled_key.is_some();
        let reconciler = Reconciler::new(config.reconciler_config());
        let handle = candidate.handle();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            local_address = %config.local_address,
            prefix = %config.election_key_prefix,
            units = ?config.elected_units,
            "Starting agent"
        );

        let driver = AgentDriver {
            config,
            client,
            monitor,
            candidate,
            watcher,
            reconciler,
            shutdown: shutdown_rx,
            leader: None,
            election_paused,
        };
        let task = tokio::spawn(driver.run());

        Ok(Self {
            candidate: handle,
            shutdown_tx,
            task: Some(task),
        })
    }

    /// Control handle of the agent's candidate.
    pub fn candidate(&self) -> CandidateHandle {
        self.candidate.clone()
    }

    /// Stops the flag watcher, the candidate and the reconciler, in that
    /// order.
    pub async fn stop(&mut self) {
        self.shutdown_tx.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("agent task failed: {}", e);
            }
        }
    }
}

struct AgentDriver {
    config: AgentConfig,
    client: Arc<dyn CoordinationClient>,
    monitor: Arc<dyn UnitMonitor>,
    candidate: Candidate,
    watcher: Option<Watcher>,
    reconciler: Reconciler,
    shutdown: watch::Receiver<bool>,
    leader: Option<String>,
    election_paused: bool,
}

impl AgentDriver {
    async fn run(mut self) {
        let initial_flag = read_election_flag(
            self.client.clone(),
            self.config.election_enabled_key.clone(),
            self.config.reconnect_timeout,
        );
        tokio::pin!(initial_flag);
        let mut flag_known = self.config.election_enabled_key.is_none();

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                paused = &mut initial_flag, if !flag_known => {
                    flag_known = true;
                    debug!(paused, "Election flag read");
                    self.set_election_paused(paused);
                }
                leader = self.candidate.leader_chan().recv() => match leader {
                    Some(leader) => {
                        info!(leader = %leader, "Leader changed");
                        self.leader = Some(leader);
                        self.reset();
                    }
                    None => {
                        warn!("Candidate stopped unexpectedly");
                        break;
                    }
                },
                event = next_event(&mut self.watcher) => match event {
                    Some(event) => {
                        flag_known = true;
                        self.on_election_flag(event);
                    }
                    None => {
                        warn!("Election flag watcher stopped");
                        self.watcher = None;
                    }
                },
            }
        }

        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop().await;
        }
        self.candidate.stop().await;
        self.reconciler.stop().await;
        info!(local_address = %self.config.local_address, "Agent stopped");
    }

    fn on_election_flag(&mut self, event: Event) {
        let paused = event.kind == EventKind::Put && is_disabled(&event.kv.value);
        debug!(
            key = %event.kv.key,
            kind = %event.kind,
            revision = event.revision(),
            paused,
            "Election flag changed"
        );
        self.set_election_paused(paused);
    }

    /// Applies the flag to the candidate right away; the plan's voter step
    /// keeps it applied.
    fn set_election_paused(&mut self, paused: bool) {
        if let Err(e) = self.candidate.pause(paused) {
            warn!(error = %e, "Failed to apply election flag");
        }
        if paused != self.election_paused {
            self.election_paused = paused;
            self.reset();
        }
    }

    fn reset(&self) {
        let Some(leader) = &self.leader else {
            debug!("Leader unknown, deferring plan");
            return;
        };

        let plan = AgentPlan {
            local_addr: self.config.local_address.clone(),
            leader_addr: leader.clone(),
            election_paused: self.election_paused,
            units: self.config.elected_units.clone(),
            dns_names: self.config.dns_names.clone(),
            hosts_path: self.config.leader_hosts_path.clone(),
            monitor: self.monitor.clone(),
            voter: Arc::new(self.candidate.handle()),
        };
        self.reconciler.reset(Arc::new(plan));
    }
}

fn is_disabled(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("false")
}

/// Reads the election flag once, retrying until the store answers.
/// Never completes without a flag key.
async fn read_election_flag(
    client: Arc<dyn CoordinationClient>,
    key: Option<String>,
    retry: Duration,
) -> bool {
    let Some(key) = key else {
        return std::future::pending().await;
    };
    loop {
        match client.get(&key, false).await {
            Ok(resp) => return resp.first().is_some_and(|kv| is_disabled(&kv.value)),
            Err(e) => warn!(key = %key, error = %e, "Failed to read election flag"),
        }
        tokio::time::sleep(retry).await;
    }
}

async fn next_event(watcher: &mut Option<Watcher>) -> Option<Event> {
    match watcher {
        Some(watcher) => watcher.resp_chan().recv().await,
        None => std::future::pending().await,
    }
}
