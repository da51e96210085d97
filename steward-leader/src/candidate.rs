//! Leader election candidate.
//!
//! A [`Candidate`] campaigns for leadership of an election prefix and reports
//! every leadership change it observes. It keeps itself connected to the
//! coordination store: when its session expires or the store becomes
//! unreachable it drops the session, tells its owner that the leader is
//! unknown if it was leading, and reconnects on a fixed interval. A
//! candidate that is still recorded as leader when it reconnects resumes
//! leadership on its old lease instead of campaigning again. If it was
//! paused or asked to step down in the meantime, it adopts the old lease
//! only to resign the key.

use crate::{LeaderError, LeaderResult};
use futures_util::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use steward_core::{
    CoordinationClient, Election, KeyValue, ObserveStream, Session, StoreError, StoreResult,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, timeout, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default election term (session TTL)
pub const DEFAULT_TERM: Duration = Duration::from_secs(60);

/// Default interval between reconnect attempts
pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Shortest accepted election term
pub const MIN_TERM: Duration = Duration::from_secs(1);

/// Configuration of a [`Candidate`]
#[derive(Clone)]
pub struct CandidateConfig {
    /// Value published while this candidate leads
    pub name: String,

    /// Election key prefix
    pub prefix: String,

    /// TTL of the candidate's session; zero selects [`DEFAULT_TERM`]
    pub term: Duration,

    /// Interval between reconnect attempts; zero selects
    /// [`DEFAULT_RECONNECT_TIMEOUT`]
    pub reconnect_timeout: Duration,

    /// Coordination store client
    pub client: Option<Arc<dyn CoordinationClient>>,

    /// Start without campaigning
    pub paused: bool,
}

impl CandidateConfig {
    pub fn new(
        name: impl Into<String>,
        prefix: impl Into<String>,
        client: Arc<dyn CoordinationClient>,
    ) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            term: DEFAULT_TERM,
            reconnect_timeout: DEFAULT_RECONNECT_TIMEOUT,
            client: Some(client),
            paused: false,
        }
    }

    pub fn with_term(mut self, term: Duration) -> Self {
        self.term = term;
        self
    }

    pub fn with_reconnect_timeout(mut self, reconnect_timeout: Duration) -> Self {
        self.reconnect_timeout = reconnect_timeout;
        self
    }

    pub fn with_paused(mut self, paused: bool) -> Self {
        self.paused = paused;
        self
    }

    /// Checks the configuration and replaces zero durations with defaults.
    pub fn validate(mut self) -> LeaderResult<Self> {
        if self.name.is_empty() {
            return Err(LeaderError::config("candidate name must not be empty"));
        }
        if self.prefix.is_empty() {
            return Err(LeaderError::config("election prefix must not be empty"));
        }
        if self.client.is_none() {
            return Err(LeaderError::config("coordination client is required"));
        }
        if self.term.is_zero() {
            self.term = DEFAULT_TERM;
        }
        if self.term < MIN_TERM {
            return Err(LeaderError::config(format!(
                "term {:?} is shorter than the minimum of {:?}",
                self.term, MIN_TERM
            )));
        }
        if self.reconnect_timeout.is_zero() {
            self.reconnect_timeout = DEFAULT_RECONNECT_TIMEOUT;
        }
        Ok(self)
    }
}

impl fmt::Debug for CandidateConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CandidateConfig")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .field("term", &self.term)
            .field("reconnect_timeout", &self.reconnect_timeout)
            .field("paused", &self.paused)
            .finish_non_exhaustive()
    }
}

/// Lifecycle state of a [`Candidate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateState {
    /// No session with the store
    Disconnected,

    /// Campaign in progress
    Campaigning,

    /// This candidate holds leadership
    Leading,

    /// Connected but not campaigning (cool-down after a step-down)
    Following,

    /// Connected, campaign withdrawn on request
    Paused,

    /// The candidate task has exited
    Stopped,
}

impl fmt::Display for CandidateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CandidateState::Disconnected => "disconnected",
            CandidateState::Campaigning => "campaigning",
            CandidateState::Leading => "leading",
            CandidateState::Following => "following",
            CandidateState::Paused => "paused",
            CandidateState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

enum Command {
    Pause(bool),
    StepDown,
}

/// Cloneable control handle of a [`Candidate`].
///
/// Requests are queued to the candidate task and applied in order; observe
/// their effect through [`CandidateHandle::subscribe`].
#[derive(Clone)]
pub struct CandidateHandle {
    name: String,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<CandidateState>,
}

impl CandidateHandle {
    /// Withdraws (`true`) or resumes (`false`) the campaign.
    ///
    /// The session and leader observation are kept while paused. Pausing a
    /// leading candidate resigns leadership.
    pub fn pause(&self, paused: bool) -> LeaderResult<()> {
        self.send(Command::Pause(paused))
    }

    /// Resigns leadership if held, then waits two terms before
    /// campaigning again. A no-op unless leading.
    ///
    /// While disconnected after losing a session it led with, the
    /// resignation happens on reconnect if the old key is still held.
    pub fn step_down(&self) -> LeaderResult<()> {
        self.send(Command::StepDown)
    }

    pub fn state(&self) -> CandidateState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CandidateState> {
        self.state.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, command: Command) -> LeaderResult<()> {
        self.commands
            .send(command)
            .map_err(|_| LeaderError::Stopped {
                name: self.name.clone(),
            })
    }
}

/// Leader election candidate.
///
/// The candidate task starts on construction; [`Candidate::new`] must be
/// called from within a Tokio runtime.
pub struct Candidate {
    leader_rx: mpsc::Receiver<String>,
    handle: CandidateHandle,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Candidate {
    pub fn new(config: CandidateConfig) -> LeaderResult<Self> {
        let config = config.validate()?;
        let client = config
            .client
            .clone()
            .ok_or_else(|| LeaderError::config("coordination client is required"))?;

        let (leader_tx, leader_rx) = mpsc::channel(1);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CandidateState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (campaign_tx, campaign_rx) = mpsc::channel(1);

        let handle = CandidateHandle {
            name: config.name.clone(),
            commands: commands_tx,
            state: state_rx,
        };

        let actor = CandidateActor {
            name: config.name,
            prefix: config.prefix,
            term: config.term,
            reconnect_timeout: config.reconnect_timeout,
            client,
            paused: config.paused,
            leader_tx,
            state_tx,
            commands: commands_rx,
            shutdown: shutdown_rx,
            campaign_tx,
            campaign_rx,
            session: None,
            election: None,
            observe: None,
            campaign: None,
            generation: 0,
            leading: false,
            cooldown: None,
            reconnect: None,
            last_forwarded: None,
            orphaned_lead: false,
        };
        let task = tokio::spawn(actor.run());

        Ok(Self {
            leader_rx,
            handle,
            shutdown_tx,
            task: Some(task),
        })
    }

    /// Leadership changes, in the order they were observed.
    ///
    /// An empty string means the leader is unknown. The channel holds at
    /// most one pending value and is closed once the candidate stops.
    pub fn leader_chan(&mut self) -> &mut mpsc::Receiver<String> {
        &mut self.leader_rx
    }

    pub fn handle(&self) -> CandidateHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> CandidateState {
        self.handle.state()
    }

    pub fn pause(&self, paused: bool) -> LeaderResult<()> {
        self.handle.pause(paused)
    }

    pub fn step_down(&self) -> LeaderResult<()> {
        self.handle.step_down()
    }

    /// Stops the candidate, resigning leadership and closing its session.
    ///
    /// Pending leader values are discarded. Calling `stop` again is a no-op.
    pub async fn stop(&mut self) {
        self.shutdown_tx.send_replace(true);
        while self.leader_rx.recv().await.is_some() {}
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(candidate = %self.handle.name, "candidate task failed: {}", e);
            }
        }
    }
}

struct CampaignTask {
    generation: u64,
    _cancel: oneshot::Sender<()>,
}

struct CandidateActor {
    name: String,
    prefix: String,
    term: Duration,
    reconnect_timeout: Duration,
    client: Arc<dyn CoordinationClient>,
    paused: bool,

    leader_tx: mpsc::Sender<String>,
    state_tx: watch::Sender<CandidateState>,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: watch::Receiver<bool>,
    campaign_tx: mpsc::Sender<(u64, StoreResult<()>)>,
    campaign_rx: mpsc::Receiver<(u64, StoreResult<()>)>,

    session: Option<Arc<dyn Session>>,
    election: Option<Arc<dyn Election>>,
    observe: Option<ObserveStream>,
    campaign: Option<CampaignTask>,
    generation: u64,
    leading: bool,
    cooldown: Option<Instant>,
    reconnect: Option<Interval>,
    last_forwarded: Option<String>,
    /// Leadership was held when the session was lost
    orphaned_lead: bool,
}

impl CandidateActor {
    async fn run(mut self) {
        info!(candidate = %self.name, prefix = %self.prefix, "Starting candidate");

        if !self.connect().await {
            self.start_reconnect();
        }
        self.publish_state();

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let session_done = self.session.as_ref().map(|session| session.done());

            tokio::select! {
                _ = self.shutdown.changed() => break,
                observed = next_leader(&mut self.observe) => match observed {
                    Some(kv) => self.on_leader(kv).await,
                    None => self.on_connection_lost("leader observation ended").await,
                },
                Some((generation, result)) = self.campaign_rx.recv() => {
                    self.on_campaign_result(generation, result).await;
                }
                _ = session_expired(session_done) => {
                    self.on_connection_lost("session expired").await;
                }
                _ = tick(&mut self.reconnect) => {
                    if self.connect().await {
                        self.reconnect = None;
                    }
                }
                Some(command) = self.commands.recv() => self.on_command(command).await,
                _ = cool_down(self.cooldown) => {
                    debug!(candidate = %self.name, "cool-down elapsed");
                    self.cooldown = None;
                    self.start_campaign();
                }
            }

            self.publish_state();
        }

        self.shutdown().await;
        self.state_tx.send_replace(CandidateState::Stopped);
        info!(candidate = %self.name, prefix = %self.prefix, "Candidate stopped");
    }

    /// Establishes a session, resuming leadership if the store still
    /// records this candidate as leader.
    async fn connect(&mut self) -> bool {
        match self.try_connect().await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    candidate = %self.name,
                    prefix = %self.prefix,
                    error = %e,
                    "Failed to connect to the coordination store"
                );
                false
            }
        }
    }

    async fn try_connect(&mut self) -> StoreResult<()> {
        let resumed = match self.client.leader(&self.prefix).await {
            Ok(leader) if leader.value == self.name => self.resume(&leader).await?,
            Ok(_) | Err(StoreError::NoLeader) => None,
            Err(e) => return Err(e),
        };

        let (session, election, leading) = match resumed {
            Some((session, election)) if self.paused || self.cooldown.is_some() => {
                info!(
                    candidate = %self.name,
                    prefix = %self.prefix,
                    paused = self.paused,
                    "Resigning leadership held before the session was lost"
                );
                if let Err(e) = election.resign().await {
                    session.orphan();
                    return Err(e);
                }
                (session, election, false)
            }
            Some((session, election)) => (session, election, true),
            None => {
                let session = self.client.new_session(self.term, None).await?;
                let election = self.client.election(session.clone(), &self.prefix);
                (session, election, false)
            }
        };

        let observe = match self.client.observe(&self.prefix).await {
            Ok(observe) => observe,
            Err(e) => {
                session.orphan();
                return Err(e);
            }
        };

        debug!(
            candidate = %self.name,
            lease = session.lease(),
            resumed = leading,
            "Connected to the coordination store"
        );
        self.session = Some(session);
        self.election = Some(election);
        self.observe = Some(observe);
        self.leading = leading;
        self.orphaned_lead = false;
        if leading {
            info!(candidate = %self.name, prefix = %self.prefix, "Resumed leadership");
        }
        self.start_campaign();
        Ok(())
    }

    async fn resume(
        &mut self,
        leader: &KeyValue,
    ) -> StoreResult<Option<(Arc<dyn Session>, Arc<dyn Election>)>> {
        let session = match self.client.new_session(self.term, Some(leader.lease)).await {
            Ok(session) => session,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let election = self.client.election(session.clone(), &self.prefix);
        match election.resume(leader).await {
            Ok(()) => Ok(Some((session, election))),
            Err(e) => {
                session.orphan();
                if e.is_not_found() {
                    Ok(None)
                } else {
                    Err(e)
                }
            }
        }
    }

    fn start_reconnect(&mut self) {
        let period = self.reconnect_timeout;
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.reconnect = Some(interval);
    }

    fn start_campaign(&mut self) {
        if self.paused || self.leading || self.campaign.is_some() || self.cooldown.is_some() {
            return;
        }
        let Some(election) = self.election.clone() else {
            return;
        };

        self.generation += 1;
        let generation = self.generation;
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let results = self.campaign_tx.clone();
        let name = self.name.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel_rx => Err(StoreError::Canceled),
                result = election.campaign(&name) => result,
            };
            let _ = results.send((generation, result)).await;
        });

        debug!(candidate = %self.name, generation, "Campaign started");
        self.campaign = Some(CampaignTask {
            generation,
            _cancel: cancel_tx,
        });
    }

    async fn on_campaign_result(&mut self, generation: u64, result: StoreResult<()>) {
        let current = matches!(&self.campaign, Some(task) if task.generation == generation);
        if !current {
            debug!(candidate = %self.name, generation, "Ignoring stale campaign result");
            return;
        }
        self.campaign = None;

        match result {
            Ok(()) | Err(StoreError::AlreadyLeader { .. }) => {
                self.leading = true;
                info!(candidate = %self.name, prefix = %self.prefix, "Elected leader");
            }
            Err(e) if e.is_canceled() => {}
            Err(e) => {
                warn!(candidate = %self.name, error = %e, "Campaign failed");
                self.on_connection_lost("campaign failed").await;
            }
        }
    }

    async fn on_leader(&mut self, leader: KeyValue) {
        if leader.value != self.name && self.leading {
            warn!(
                candidate = %self.name,
                leader = %leader.value,
                "Leadership lost to another candidate"
            );
            self.leading = false;
            self.start_campaign();
        }
        self.forward(leader.value).await;
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Pause(paused) => {
                if paused == self.paused {
                    return;
                }
                self.paused = paused;
                if paused {
                    info!(candidate = %self.name, "Campaign paused");
                    self.withdraw().await;
                } else {
                    info!(candidate = %self.name, "Campaign resumed");
                    self.start_campaign();
                }
            }
            Command::StepDown => {
                if self.leading {
                    info!(candidate = %self.name, "Stepping down");
                    self.withdraw().await;
                } else if self.session.is_none() && self.orphaned_lead {
                    info!(candidate = %self.name, "Stepping down once reconnected");
                } else {
                    debug!(candidate = %self.name, "Not leading, ignoring step-down");
                    return;
                }
                self.cooldown = Some(Instant::now() + self.term * 2);
            }
        }
    }

    /// Cancels any campaign and resigns leadership.
    async fn withdraw(&mut self) {
        let campaigning = self.campaign.take().is_some();
        let leading = std::mem::replace(&mut self.leading, false);
        if !campaigning && !leading {
            return;
        }
        if let Some(election) = &self.election {
            if let Err(e) = election.resign().await {
                warn!(candidate = %self.name, error = %e, "Failed to resign");
            }
        }
    }

    async fn on_connection_lost(&mut self, reason: &str) {
        warn!(candidate = %self.name, prefix = %self.prefix, reason, "Lost coordination store session");

        self.campaign = None;
        self.orphaned_lead |= std::mem::replace(&mut self.leading, false);
        self.observe = None;
        self.election = None;
        if let Some(session) = self.session.take() {
            session.orphan();
        }
        self.publish_state();

        if self.last_forwarded.as_deref() == Some(self.name.as_str())
            && !self.forward(String::new()).await
        {
            return;
        }

        if self.connect().await {
            self.reconnect = None;
        } else if self.reconnect.is_none() {
            self.start_reconnect();
        }
    }

    /// Sends a leader value to the owner. Returns `false` on shutdown.
    async fn forward(&mut self, leader: String) -> bool {
        debug!(candidate = %self.name, leader = %leader, "Leader changed");
        tokio::select! {
            sent = self.leader_tx.send(leader.clone()) => {
                if sent.is_err() {
                    return false;
                }
            }
            _ = self.shutdown.changed() => return false,
        }
        self.last_forwarded = Some(leader);
        true
    }

    async fn shutdown(&mut self) {
        let result = timeout(self.reconnect_timeout, async {
            self.withdraw().await;
            match self.session.take() {
                Some(session) => session.close().await,
                None => Ok(()),
            }
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(candidate = %self.name, error = %e, "Failed to close session"),
            Err(_) => warn!(candidate = %self.name, "Timed out closing session"),
        }
        self.observe = None;
        self.election = None;
    }

    fn publish_state(&self) {
        let state = if self.session.is_none() {
            CandidateState::Disconnected
        } else if self.leading {
            CandidateState::Leading
        } else if self.paused {
            CandidateState::Paused
        } else if self.campaign.is_some() {
            CandidateState::Campaigning
        } else {
            CandidateState::Following
        };
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

async fn next_leader(observe: &mut Option<ObserveStream>) -> Option<KeyValue> {
    match observe {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn session_expired(done: Option<watch::Receiver<bool>>) {
    match done {
        Some(mut done) => {
            let _ = done.wait_for(|done| *done).await;
        }
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn cool_down(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
