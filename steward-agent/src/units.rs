//! Service unit management.
//!
//! `UnitMonitor` is the trait plan steps use to drive OS service units.
//! `SystemctlMonitor` is the production implementation shelling out to
//! `systemctl`. `InMemoryUnitMonitor` is the test double that tracks unit
//! states in memory and records every call.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use steward_core::{Result, StewardError};
use tokio::process::Command;
use tracing::debug;

/// Exit status of `systemctl` for an unknown unit
const UNIT_NOT_FOUND_EXIT: i32 = 5;

/// Activation state of a service unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitState {
    Active,
    Inactive,
    Failed,
    Activating,
    Deactivating,
    Unknown,
}

impl UnitState {
    /// Parses a systemd `ActiveState` value.
    pub fn from_active_state(state: &str) -> Self {
        match state.trim() {
            "active" | "reloading" => UnitState::Active,
            "inactive" => UnitState::Inactive,
            "failed" => UnitState::Failed,
            "activating" => UnitState::Activating,
            "deactivating" => UnitState::Deactivating,
            _ => UnitState::Unknown,
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitState::Active => "active",
            UnitState::Inactive => "inactive",
            UnitState::Failed => "failed",
            UnitState::Activating => "activating",
            UnitState::Deactivating => "deactivating",
            UnitState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Drives OS service units.
///
/// Unknown units fail with [`StewardError::UnitNotFound`]; every other
/// failure is [`StewardError::Unit`] or [`StewardError::Io`].
#[async_trait]
pub trait UnitMonitor: Send + Sync {
    async fn start(&self, unit: &str) -> Result<()>;

    async fn stop(&self, unit: &str) -> Result<()>;

    async fn status(&self, unit: &str) -> Result<UnitState>;

    /// Clears the failed state of a unit.
    async fn reset_status(&self, unit: &str) -> Result<()>;
}

/// Production monitor running `systemctl`.
#[derive(Debug, Clone)]
pub struct SystemctlMonitor {
    program: OsString,
}

impl SystemctlMonitor {
    pub fn new() -> Self {
        Self {
            program: OsString::from("systemctl"),
        }
    }

    /// Uses `program` instead of `systemctl` from `PATH`.
    pub fn with_program(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn systemctl(&self, args: &[&str], unit: &str) -> Result<String> {
        debug!(unit, ?args, "Running systemctl");
        let output = Command::new(&self.program)
            .args(args)
            .arg(unit)
            .output()
            .await?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.code() == Some(UNIT_NOT_FOUND_EXIT) || stderr.contains("not found") {
            return Err(StewardError::unit_not_found(unit));
        }
        let message = match stderr.trim() {
            "" => format!("systemctl {} exited with {}", args.join(" "), output.status),
            trimmed => trimmed.to_string(),
        };
        Err(StewardError::unit(unit, message))
    }
}

impl Default for SystemctlMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Extracts `LoadState` and `ActiveState` from `systemctl show` output.
fn parse_show(output: &str) -> (Option<&str>, Option<&str>) {
    let mut load_state = None;
    let mut active_state = None;
    for line in output.lines() {
        match line.split_once('=') {
            Some(("LoadState", value)) => load_state = Some(value.trim()),
            Some(("ActiveState", value)) => active_state = Some(value.trim()),
            _ => {}
        }
    }
    (load_state, active_state)
}

#[async_trait]
impl UnitMonitor for SystemctlMonitor {
    async fn start(&self, unit: &str) -> Result<()> {
        self.systemctl(&["start"], unit).await.map(|_| ())
    }

    async fn stop(&self, unit: &str) -> Result<()> {
        self.systemctl(&["stop"], unit).await.map(|_| ())
    }

    async fn status(&self, unit: &str) -> Result<UnitState> {
        let output = self
            .systemctl(&["show", "-p", "LoadState,ActiveState"], unit)
            .await?;
        match parse_show(&output) {
            (Some("not-found"), _) => Err(StewardError::unit_not_found(unit)),
            (_, Some(state)) => Ok(UnitState::from_active_state(state)),
            (_, None) => Ok(UnitState::Unknown),
        }
    }

    async fn reset_status(&self, unit: &str) -> Result<()> {
        self.systemctl(&["reset-failed"], unit).await.map(|_| ())
    }
}

/// Test-double monitor keeping unit states in memory.
///
/// Only registered units exist; calls on any other unit fail with
/// [`StewardError::UnitNotFound`]. Every call is recorded as
/// `"<operation>(<unit>)"`.
#[derive(Default)]
pub struct InMemoryUnitMonitor {
    units: DashMap<String, UnitState>,
    calls: Mutex<Vec<String>>,
}

impl InMemoryUnitMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a monitor with `units` registered and inactive.
    pub fn with_units<I, S>(units: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let monitor = Self::new();
        for unit in units {
            monitor.add_unit(unit);
        }
        monitor
    }

    pub fn add_unit(&self, unit: impl Into<String>) {
        self.units.insert(unit.into(), UnitState::Inactive);
    }

    pub fn remove_unit(&self, unit: &str) {
        self.units.remove(unit);
    }

    pub fn set_state(&self, unit: &str, state: UnitState) {
        if let Some(mut current) = self.units.get_mut(unit) {
            *current = state;
        }
    }

    pub fn state(&self, unit: &str) -> Option<UnitState> {
        self.units.get(unit).map(|state| *state)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, operation: &str, unit: &str) {
        self.calls.lock().push(format!("{}({})", operation, unit));
    }

    fn transition(&self, unit: &str, apply: impl FnOnce(&mut UnitState)) -> Result<()> {
        match self.units.get_mut(unit) {
            Some(mut state) => {
                apply(state.value_mut());
                Ok(())
            }
            None => Err(StewardError::unit_not_found(unit)),
        }
    }
}

#[async_trait]
impl UnitMonitor for InMemoryUnitMonitor {
    async fn start(&self, unit: &str) -> Result<()> {
        self.record("start", unit);
        self.transition(unit, |state| *state = UnitState::Active)
    }

    async fn stop(&self, unit: &str) -> Result<()> {
        self.record("stop", unit);
        self.transition(unit, |state| {
            if *state != UnitState::Failed {
                *state = UnitState::Inactive;
            }
        })
    }

    async fn status(&self, unit: &str) -> Result<UnitState> {
        self.record("status", unit);
        self.state(unit)
            .ok_or_else(|| StewardError::unit_not_found(unit))
    }

    async fn reset_status(&self, unit: &str) -> Result<()> {
        self.record("reset-failed", unit);
        self.transition(unit, |state| {
            if *state == UnitState::Failed {
                *state = UnitState::Inactive;
            }
        })
    }
}
