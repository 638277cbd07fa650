//! Outbound and inbound messages
//!
//! Every component reports through an [`OutboundSender`]. Messages render to
//! a `{topic, payload, ...}` JSON object at the process boundary.

use crate::connection::StatusEvent;
use crate::controller::{ControllerSummary, LoadDecision};
use crate::error::{Result, SinapsiError};
use crate::publisher::{SimplifiedTelemetry, TelemetryInsight};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const TELEMETRY_TOPIC: &str = "alfasinapsi/telemetry";
pub const TELEMETRY_ERROR_TOPIC: &str = "alfasinapsi/telemetry/error";
pub const KNX_LOAD_CONTROL_PIN_TOPIC: &str = "alfasinapsi/telemetry/knx-load-control-pin";
pub const CONTROLLER_TOPIC: &str = "alfasinapsi/controller";
pub const CONTROLLER_ERROR_TOPIC: &str = "alfasinapsi/controller/error";

/// Prefix of per-load decision and override topics
pub const LOAD_TOPIC_PREFIX: &str = "load/";

/// Maximum length of a status text
pub const STATUS_TEXT_MAX: usize = 32;

pub type OutboundSender = mpsc::UnboundedSender<Outbound>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Ok,
    Warn,
    Error,
}

/// Short human readable component status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusIndicator {
    pub severity: Severity,
    pub text: String,
}

impl StatusIndicator {
    fn new(severity: Severity, text: &str) -> Self {
        Self {
            severity,
            text: truncate_chars(text, STATUS_TEXT_MAX),
        }
    }

    pub fn from_event(event: &StatusEvent) -> Self {
        if event.connecting {
            Self::new(Severity::Warn, "connecting")
        } else if event.connected {
            Self::new(Severity::Ok, "connected")
        } else {
            match &event.error {
                Some(e) => Self::new(Severity::Error, &format!("error: {}", e)),
                None => Self::new(Severity::Error, "disconnected"),
            }
        }
    }

    /// Status after a failed tick
    pub fn from_error(error: &SinapsiError) -> Self {
        if error.is_timeout() {
            Self::new(Severity::Error, "timeout")
        } else {
            Self::new(Severity::Error, &format!("error: {}", error))
        }
    }

    pub fn not_configured() -> Self {
        Self::new(Severity::Error, "device not configured")
    }
}

/// Cut a string to at most `max` characters
pub fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Everything the service emits
#[derive(Debug, Clone)]
pub enum Outbound {
    Telemetry {
        payload: SimplifiedTelemetry,
        insight: Box<TelemetryInsight>,
    },
    LoadControlPin {
        shedding: bool,
    },
    Decision(LoadDecision),
    Summary(ControllerSummary),
    /// Full error text of a failed tick
    Error {
        topic: &'static str,
        message: String,
    },
    Status {
        source: &'static str,
        indicator: StatusIndicator,
    },
}

impl Outbound {
    pub fn topic(&self) -> String {
        match self {
            Outbound::Telemetry { .. } => TELEMETRY_TOPIC.to_string(),
            Outbound::LoadControlPin { .. } => KNX_LOAD_CONTROL_PIN_TOPIC.to_string(),
            Outbound::Decision(d) => format!("{}{}", LOAD_TOPIC_PREFIX, d.load),
            Outbound::Summary(_) => CONTROLLER_TOPIC.to_string(),
            Outbound::Error { topic, .. } => (*topic).to_string(),
            Outbound::Status { source, .. } => format!("{}/status", source),
        }
    }

    /// Render as a `{topic, payload, ...}` object
    pub fn to_json(&self) -> Result<Value> {
        let topic = self.topic();
        let value = match self {
            Outbound::Telemetry { payload, insight } => json!({
                "topic": topic,
                "payload": serde_json::to_value(payload)?,
                "insight": serde_json::to_value(insight.as_ref())?,
            }),
            Outbound::LoadControlPin { shedding } => {
                let state = if *shedding { "shed" } else { "unshed" };
                json!({ "topic": topic, "payload": state, "shedding": state })
            }
            Outbound::Decision(d) => json!({
                "topic": topic,
                "payload": d.desired,
                "load": d.load,
                "reason": d.reason,
                "telemetry": serde_json::to_value(d.telemetry.as_ref())?,
            }),
            Outbound::Summary(summary) => json!({
                "topic": topic,
                "payload": serde_json::to_value(summary)?,
            }),
            Outbound::Error { message, .. } => json!({
                "topic": topic,
                "payload": { "message": message },
            }),
            Outbound::Status { indicator, .. } => json!({
                "topic": topic,
                "payload": serde_json::to_value(indicator)?,
            }),
        };
        Ok(value)
    }
}

/// A message arriving on stdin
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
}

impl InboundMessage {
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(SinapsiError::from)
    }

    /// `load/<name>` with a boolean payload
    pub fn as_override(&self) -> Option<(&str, bool)> {
        let name = self.topic.strip_prefix(LOAD_TOPIC_PREFIX)?;
        if name.is_empty() {
            return None;
        }
        self.payload.as_bool().map(|desired| (name, desired))
    }
}

/// Forward connection status transitions as status messages of `source`
pub fn spawn_status_forwarder(
    mut status: broadcast::Receiver<StatusEvent>,
    source: &'static str,
    out: OutboundSender,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = status.recv() => event,
            };
            match event {
                Ok(event) => {
                    let indicator = StatusIndicator::from_event(&event);
                    if out.send(Outbound::Status { source, indicator }).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
