//! Priority based load controller
//!
//! Decides the desired on/off state of every configured load from one
//! telemetry snapshot. The decision logic is synchronous and takes the
//! current instant as a parameter; [`service`] drives it from a timer.

pub mod service;

use crate::config::ControllerConfig;
use crate::logging::{StructuredLogger, get_logger};
use crate::telemetry::{CutoffNotice, PowerReadings, Telemetry};
use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use service::{ControllerCommand, LoadControllerService};

fn default_priority() -> f64 {
    100.0
}

/// A JSON number or a string holding one
#[derive(Deserialize)]
#[serde(untagged)]
enum Numeric {
    Number(f64),
    Text(String),
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    let value = match Numeric::deserialize(deserializer)? {
        Numeric::Number(n) => n,
        Numeric::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| D::Error::custom(format!("invalid number {:?}", s)))?,
    };
    if value.is_finite() {
        Ok(value)
    } else {
        Err(D::Error::custom("number must be finite"))
    }
}

/// Dwell times below zero mean no dwell
fn lenient_seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let secs = lenient_f64(deserializer)?;
    Ok(if secs > 0.0 { secs.floor() as u64 } else { 0 })
}

/// Which policies run on each tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerMode {
    /// Enable loads on export surplus only
    Surplus,
    /// Shed loads above the import limit only
    Limit,
    #[default]
    Both,
}

impl ControllerMode {
    fn limits_import(self) -> bool {
        matches!(self, ControllerMode::Limit | ControllerMode::Both)
    }

    fn uses_surplus(self) -> bool {
        matches!(self, ControllerMode::Surplus | ControllerMode::Both)
    }
}

/// A switchable load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Load {
    pub name: String,

    /// Rated draw in watts
    #[serde(rename = "powerW", alias = "power_w", default, deserialize_with = "lenient_f64")]
    pub power_w: f64,

    /// Lower number means higher priority
    #[serde(default = "default_priority", deserialize_with = "lenient_f64")]
    pub priority: f64,

    #[serde(
        rename = "minOnSeconds",
        alias = "minOnSec",
        alias = "min_on_seconds",
        default,
        deserialize_with = "lenient_seconds"
    )]
    pub min_on_seconds: u64,

    #[serde(
        rename = "minOffSeconds",
        alias = "minOffSec",
        alias = "min_off_seconds",
        default,
        deserialize_with = "lenient_seconds"
    )]
    pub min_off_seconds: u64,
}

impl Load {
    pub fn new(name: &str, power_w: f64, priority: i32) -> Self {
        Self {
            name: name.to_string(),
            power_w,
            priority: f64::from(priority),
            min_on_seconds: 0,
            min_off_seconds: 0,
        }
    }

    pub fn with_dwell(mut self, min_on_seconds: u64, min_off_seconds: u64) -> Self {
        self.min_on_seconds = min_on_seconds;
        self.min_off_seconds = min_off_seconds;
        self
    }

    pub fn min_on(&self) -> Duration {
        Duration::from_secs(self.min_on_seconds)
    }

    pub fn min_off(&self) -> Duration {
        Duration::from_secs(self.min_off_seconds)
    }
}

/// Parse the configured load list.
///
/// Accepts a sequence of load records or a string holding a JSON array.
/// Numbers may be given as numeric strings. A malformed record is skipped;
/// anything that is not a list degrades to an empty one.
pub fn parse_loads(value: &serde_json::Value) -> Vec<Load> {
    let logger = get_logger("controller");
    let records = match value {
        serde_json::Value::Null => return Vec::new(),
        serde_json::Value::String(s) if s.trim().is_empty() => return Vec::new(),
        serde_json::Value::String(s) => serde_json::from_str::<Vec<serde_json::Value>>(s),
        other => serde_json::from_value::<Vec<serde_json::Value>>(other.clone()),
    };
    let records = match records {
        Ok(records) => records,
        Err(e) => {
            logger.warn(&format!("Ignoring malformed load list: {}", e));
            return Vec::new();
        }
    };

    records
        .into_iter()
        .enumerate()
        .filter_map(|(index, record)| match serde_json::from_value::<Load>(record) {
            Ok(load) => Some(load),
            Err(e) => {
                logger.warn(&format!("Ignoring load #{}: {}", index, e));
                None
            }
        })
        .collect()
}

/// Mutable per-load state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadRuntimeState {
    pub desired_on: bool,
    /// `None` until the first applied transition
    pub last_change: Option<Instant>,
}

/// Minimum dwell guard. Requests equal to the current state always pass.
pub fn can_toggle(load: &Load, state: &LoadRuntimeState, desired: bool, now: Instant) -> bool {
    if state.desired_on == desired {
        return true;
    }
    let Some(changed) = state.last_change else {
        return true;
    };
    let elapsed = now.saturating_duration_since(changed);
    let dwell = if desired { load.min_off() } else { load.min_on() };
    elapsed >= dwell
}

/// What triggered a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    CutoffNotice,
    ImportLimit,
    Surplus,
    SurplusDrop,
}

impl std::fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DecisionReason::CutoffNotice => "cutoff_notice",
            DecisionReason::ImportLimit => "import_limit",
            DecisionReason::Surplus => "surplus",
            DecisionReason::SurplusDrop => "surplus_drop",
        };
        f.write_str(s)
    }
}

/// One applied transition
#[derive(Debug, Clone, PartialEq)]
pub struct LoadDecision {
    pub load: String,
    pub desired: bool,
    pub reason: DecisionReason,
    pub telemetry: Arc<Telemetry>,
}

/// Tunables of the decision logic, clamped to non-negative values
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerSettings {
    pub mode: ControllerMode,
    pub surplus_reserve_w: f64,
    pub surplus_hysteresis_w: f64,
    pub max_import_w: f64,
    pub import_hysteresis_w: f64,
    pub force_off_on_cutoff: bool,
}

impl From<&ControllerConfig> for ControllerSettings {
    fn from(config: &ControllerConfig) -> Self {
        let clamp = |v: f64| if v.is_finite() { v.max(0.0) } else { 0.0 };
        Self {
            mode: config.mode,
            surplus_reserve_w: clamp(config.surplus_reserve_w),
            surplus_hysteresis_w: clamp(config.surplus_hysteresis_w),
            max_import_w: clamp(config.max_import_w),
            import_hysteresis_w: clamp(config.import_hysteresis_w),
            force_off_on_cutoff: config.force_off_on_cutoff,
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from(&ControllerConfig::default())
    }
}

/// Per-load entry of the tick summary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadSummary {
    pub name: String,
    pub desired: bool,
    #[serde(rename = "powerW")]
    pub power_w: f64,
    pub priority: f64,
}

/// Published once per control tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerSummary {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub ts: DateTime<Utc>,
    pub power: PowerReadings,
    pub cutoff: CutoffNotice,
    pub mode: ControllerMode,
    pub loads: Vec<LoadSummary>,
}

/// Shedding order: higher priority number first, then larger draw
fn shed_order(a: &Load, b: &Load) -> Ordering {
    b.priority
        .total_cmp(&a.priority)
        .then_with(|| b.power_w.total_cmp(&a.power_w))
}

/// Enabling order: lower priority number first, then smaller draw
fn enable_order(a: &Load, b: &Load) -> Ordering {
    a.priority
        .total_cmp(&b.priority)
        .then_with(|| a.power_w.total_cmp(&b.power_w))
}

/// Decision state for a fixed set of loads
#[derive(Debug)]
pub struct LoadController {
    settings: ControllerSettings,
    loads: Vec<Load>,
    states: Vec<LoadRuntimeState>,
    logger: StructuredLogger,
}

impl LoadController {
    /// Build a controller; later duplicates of a load name are dropped
    pub fn new(settings: ControllerSettings, loads: Vec<Load>) -> Self {
        let logger = get_logger("controller");
        let mut unique: Vec<Load> = Vec::with_capacity(loads.len());
        for load in loads {
            if unique.iter().any(|l| l.name == load.name) {
                logger.warn(&format!("Duplicate load name '{}' ignored", load.name));
                continue;
            }
            unique.push(load);
        }
        let states = vec![LoadRuntimeState::default(); unique.len()];
        Self {
            settings,
            loads: unique,
            states,
            logger,
        }
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn loads(&self) -> &[Load] {
        &self.loads
    }

    pub fn state(&self, name: &str) -> Option<&LoadRuntimeState> {
        self.index_of(name).map(|i| &self.states[i])
    }

    pub fn is_on(&self, name: &str) -> bool {
        self.state(name).is_some_and(|s| s.desired_on)
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.loads.iter().position(|l| l.name == name)
    }

    /// Apply a transition if it changes anything and passes the guard
    fn set_desired(
        &mut self,
        index: usize,
        desired: bool,
        reason: DecisionReason,
        telemetry: &Arc<Telemetry>,
        now: Instant,
    ) -> Option<LoadDecision> {
        let load = &self.loads[index];
        let state = &mut self.states[index];
        if state.desired_on == desired || !can_toggle(load, state, desired, now) {
            return None;
        }
        state.desired_on = desired;
        state.last_change = Some(now);

        self.logger.info(&format!(
            "Load '{}' -> {} ({})",
            load.name,
            if desired { "on" } else { "off" },
            reason
        ));
        Some(LoadDecision {
            load: load.name.clone(),
            desired,
            reason,
            telemetry: Arc::clone(telemetry),
        })
    }

    fn sorted(&self, order: fn(&Load, &Load) -> Ordering) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.loads.len()).collect();
        indices.sort_by(|&a, &b| order(&self.loads[a], &self.loads[b]));
        indices
    }

    fn committed_power(&self) -> f64 {
        self.loads
            .iter()
            .zip(&self.states)
            .filter(|(_, s)| s.desired_on)
            .map(|(l, _)| l.power_w)
            .sum()
    }

    /// Run the policies once and return every applied transition in order
    pub fn compute_actions(&mut self, telemetry: &Arc<Telemetry>, now: Instant) -> Vec<LoadDecision> {
        let mut actions = Vec::new();
        let settings = self.settings;

        if telemetry.cutoff.has_warning && settings.force_off_on_cutoff {
            for index in 0..self.loads.len() {
                actions.extend(self.set_desired(
                    index,
                    false,
                    DecisionReason::CutoffNotice,
                    telemetry,
                    now,
                ));
            }
            return actions;
        }

        if settings.mode.limits_import() {
            let stop_at = (settings.max_import_w - settings.import_hysteresis_w).max(0.0);
            let mut estimated_w = f64::from(telemetry.power.import_w);

            let shed_list: Vec<usize> = self
                .sorted(shed_order)
                .into_iter()
                .filter(|&i| self.states[i].desired_on)
                .collect();

            for index in shed_list {
                if estimated_w <= stop_at {
                    break;
                }
                if let Some(decision) =
                    self.set_desired(index, false, DecisionReason::ImportLimit, telemetry, now)
                {
                    estimated_w -= self.loads[index].power_w;
                    actions.push(decision);
                }
            }
        }

        if settings.mode.uses_surplus() {
            let available_w = (f64::from(telemetry.power.export_w) - settings.surplus_reserve_w).max(0.0);
            let target_w = (available_w + settings.surplus_hysteresis_w).max(0.0);

            for index in self.sorted(enable_order) {
                let power_w = self.loads[index].power_w;
                if self.states[index].desired_on || power_w <= 0.0 {
                    continue;
                }
                if self.committed_power() + power_w <= target_w {
                    actions.extend(self.set_desired(
                        index,
                        true,
                        DecisionReason::Surplus,
                        telemetry,
                        now,
                    ));
                }
            }

            let mut running_w = self.committed_power();
            if running_w > available_w {
                let shed_list: Vec<usize> = self
                    .sorted(shed_order)
                    .into_iter()
                    .filter(|&i| self.states[i].desired_on)
                    .collect();

                for index in shed_list {
                    if running_w <= available_w {
                        break;
                    }
                    if let Some(decision) =
                        self.set_desired(index, false, DecisionReason::SurplusDrop, telemetry, now)
                    {
                        running_w -= self.loads[index].power_w;
                        actions.push(decision);
                    }
                }
            }
        }

        actions
    }

    /// External override for one load; still subject to the dwell guard.
    ///
    /// Returns whether the load is now in the requested state.
    pub fn apply_override(&mut self, name: &str, desired: bool, now: Instant) -> bool {
        let Some(index) = self.index_of(name) else {
            self.logger
                .warn(&format!("Override for unknown load '{}' ignored", name));
            return false;
        };

        let load = &self.loads[index];
        let state = &mut self.states[index];
        if state.desired_on == desired {
            return true;
        }
        if !can_toggle(load, state, desired, now) {
            self.logger.debug(&format!(
                "Override for '{}' blocked by minimum dwell time",
                name
            ));
            return false;
        }
        state.desired_on = desired;
        state.last_change = Some(now);
        self.logger
            .info(&format!("Load '{}' overridden to {}", name, desired));
        true
    }

    /// Snapshot of every load's state for the tick summary
    pub fn summary(&self, telemetry: &Telemetry) -> ControllerSummary {
        ControllerSummary {
            ts: telemetry.timestamp,
            power: telemetry.power,
            cutoff: telemetry.cutoff.clone(),
            mode: self.settings.mode,
            loads: self
                .loads
                .iter()
                .zip(&self.states)
                .map(|(load, state)| LoadSummary {
                    name: load.name.clone(),
                    desired: state.desired_on,
                    power_w: load.power_w,
                    priority: load.priority,
                })
                .collect(),
        }
    }
}
