use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use steward_core::{CoordinationClient, Result, StewardError};
use steward_leader::{CandidateConfig, MIN_TERM};
use steward_reconciler::ReconcilerConfig;

/// Agent configuration.
///
/// Loaded from TOML; every field has a default except `local_address`.
/// Durations use humantime notation (`"60s"`, `"5m"`).
///
/// ```toml
/// local_address = "10.0.0.1"
/// election_key_prefix = "/steward/election"
/// term = "60s"
/// elected_units = ["kube-apiserver.service"]
/// ```
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AgentConfig {
    /// Election key prefix shared by all agents of a cluster
    pub election_key_prefix: String,

    /// Election term (session TTL)
    #[serde(with = "humantime_serde")]
    pub term: Duration,

    /// Interval between store reconnect attempts
    #[serde(with = "humantime_serde")]
    pub reconnect_timeout: Duration,

    /// Address of this node, published while it leads
    pub local_address: String,

    /// Hosts file pointing `dns_names` at the leader
    pub leader_hosts_path: PathBuf,

    /// Units that only run on the leader
    pub elected_units: Vec<String>,

    /// Names resolved to the leader
    pub dns_names: Vec<String>,

    /// Key whose value `"false"` takes this node out of the election
    pub election_enabled_key: Option<String>,

    /// Delay before retrying a failed reconciliation
    #[serde(with = "humantime_serde")]
    pub reconcile_timeout: Duration,

    /// Delay between successful reconciliations
    #[serde(with = "humantime_serde")]
    pub resync_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            election_key_prefix: "/steward/election".to_string(),
            term: Duration::from_secs(60),
            reconnect_timeout: Duration::from_secs(5),
            local_address: String::new(),
            leader_hosts_path: PathBuf::from("/run/steward/leader.hosts"),
            elected_units: vec![
                "kube-controller-manager.service".to_string(),
                "kube-scheduler.service".to_string(),
                "kube-apiserver.service".to_string(),
            ],
            dns_names: vec![
                "leader.cluster.local".to_string(),
                "apiserver.cluster.local".to_string(),
            ],
            election_enabled_key: None,
            reconcile_timeout: Duration::from_secs(10),
            resync_timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl AgentConfig {
    pub fn new(local_address: impl Into<String>) -> Self {
        Self {
            local_address: local_address.into(),
            ..Self::default()
        }
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: AgentConfig = toml::from_str(contents)
            .map_err(|e| StewardError::config(format!("invalid agent config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            StewardError::config(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn with_election_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.election_key_prefix = prefix.into();
        self
    }

    pub fn with_term(mut self, term: Duration) -> Self {
        self.term = term;
        self
    }

    pub fn with_reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_timeout = timeout;
        self
    }

    pub fn with_leader_hosts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.leader_hosts_path = path.into();
        self
    }

    pub fn with_elected_units(mut self, units: Vec<String>) -> Self {
        self.elected_units = units;
        self
    }

    pub fn with_dns_names(mut self, names: Vec<String>) -> Self {
        self.dns_names = names;
        self
    }

    pub fn with_election_enabled_key(mut self, key: impl Into<String>) -> Self {
        self.election_enabled_key = Some(key.into());
        self
    }

    pub fn with_reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = timeout;
        self
    }

    pub fn with_resync_timeout(mut self, timeout: Duration) -> Self {
        self.resync_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_address.is_empty() {
            return Err(StewardError::config("local_address must be set"));
        }
        if self.election_key_prefix.is_empty() {
            return Err(StewardError::config("election_key_prefix must not be empty"));
        }
        if !self.term.is_zero() && self.term < MIN_TERM {
            return Err(StewardError::config(format!(
                "term {:?} is shorter than the minimum of {:?}",
                self.term, MIN_TERM
            )));
        }
        if self.leader_hosts_path.as_os_str().is_empty() {
            return Err(StewardError::config("leader_hosts_path must not be empty"));
        }
        if matches!(&self.election_enabled_key, Some(key) if key.is_empty()) {
            return Err(StewardError::config("election_enabled_key must not be empty"));
        }
        Ok(())
    }

    /// Candidate settings. With an election flag configured the candidate
    /// starts paused until the flag has been read.
    pub fn candidate_config(&self, client: Arc<dyn CoordinationClient>) -> CandidateConfig {
        CandidateConfig::new(&self.local_address, &self.election_key_prefix, client)
            .with_term(self.term)
            .with_reconnect_timeout(self.reconnect_timeout)
            .with_paused(self.election_enabled_key.is_some())
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig::new()
            .with_timeout(self.reconcile_timeout)
            .with_resync_timeout(self.resync_timeout)
    }
}
