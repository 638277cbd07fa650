//! Telemetry publisher
//!
//! Polls the [`TelemetryReader`] on its own timer and emits simplified
//! telemetry (kW/kWh) together with the full snapshot. In KNX load-control
//! pin mode it emits only a periodic `shed`/`unshed` signal derived from the
//! last observed cutoff warning.

use crate::config::{DeviceConfig, KNX_LOAD_CONTROL_PIN_INTERVAL_MS, TelemetryCompatibility, TelemetryConfig};
use crate::error::{Result, SinapsiError};
use crate::logging::{StructuredLogger, get_logger};
use crate::messages::{
    Outbound, OutboundSender, StatusIndicator, TELEMETRY_ERROR_TOPIC, TELEMETRY_TOPIC,
    spawn_status_forwarder,
};
use crate::modbus::READ_HOLDING_REGISTERS;
use crate::scheduler::spawn_periodic;
use crate::telemetry::{ReadMode, Telemetry, TelemetryReader};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn kilo(value: u32) -> f64 {
    f64::from(value) / 1000.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimplifiedPower {
    #[serde(rename = "importkW")]
    pub import_kw: f64,
    #[serde(rename = "exportkW")]
    pub export_kw: f64,
    #[serde(rename = "productionkW")]
    pub production_kw: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimplifiedEnergy {
    #[serde(rename = "importTotalkWh")]
    pub import_total_kwh: f64,
    #[serde(rename = "exportTotalkWh")]
    pub export_total_kwh: f64,
    #[serde(rename = "productionTotalkWh")]
    pub production_total_kwh: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimplifiedCutoff {
    pub has_warning: bool,
    pub at_iso: Option<String>,
}

/// Telemetry payload in kW and kWh
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimplifiedTelemetry {
    pub power: SimplifiedPower,
    pub energy: SimplifiedEnergy,
    pub tariff_band: u16,
    pub cutoff: SimplifiedCutoff,
}

impl From<&Telemetry> for SimplifiedTelemetry {
    fn from(t: &Telemetry) -> Self {
        Self {
            power: SimplifiedPower {
                import_kw: kilo(t.power.import_w),
                export_kw: kilo(t.power.export_w),
                production_kw: kilo(t.power.production_w),
            },
            energy: SimplifiedEnergy {
                import_total_kwh: kilo(t.energy.import_total_wh),
                export_total_kwh: kilo(t.energy.export_total_wh),
                production_total_kwh: kilo(t.energy.production_total_wh),
            },
            tariff_band: t.tariff_band,
            cutoff: SimplifiedCutoff {
                has_warning: t.cutoff.has_warning,
                at_iso: t.cutoff.at_iso.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightMeta {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub ts: DateTime<Utc>,
    pub function_code: u8,
    pub read_mode: ReadMode,
}

/// Connection constants echoed with every telemetry message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInsight {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub timeout_ms: u64,
    pub reconnect_timeout_ms: u64,
    pub queue_delay_ms: u64,
}

impl From<&DeviceConfig> for DeviceInsight {
    fn from(d: &DeviceConfig) -> Self {
        Self {
            host: d.host.clone(),
            port: d.port,
            unit_id: d.unit_id,
            timeout_ms: d.timeout_ms,
            reconnect_timeout_ms: d.reconnect_interval_ms,
            queue_delay_ms: d.queue_delay_ms,
        }
    }
}

/// Full snapshot plus read metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryInsight {
    pub telemetry: Telemetry,
    pub meta: InsightMeta,
    pub device: DeviceInsight,
}

#[derive(Default)]
struct PublisherState {
    last_payload: Option<SimplifiedTelemetry>,
    /// `None` until the first successful read
    last_cutoff_warning: Option<bool>,
}

/// Periodic telemetry output
pub struct TelemetryPublisher {
    config: TelemetryConfig,
    reader: Option<TelemetryReader>,
    state: Mutex<PublisherState>,
    out: OutboundSender,
    logger: StructuredLogger,
}

impl TelemetryPublisher {
    /// A publisher without a reader stays disabled and reports so
    pub fn new(config: TelemetryConfig, reader: Option<TelemetryReader>, out: OutboundSender) -> Self {
        Self {
            config,
            reader,
            state: Mutex::new(PublisherState::default()),
            out,
            logger: get_logger("publisher"),
        }
    }

    fn state(&self) -> MutexGuard<'_, PublisherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, message: Outbound) {
        if self.out.send(message).is_err() {
            self.logger.debug("Outbound channel closed, message dropped");
        }
    }

    /// Read once and publish; errors are returned to the caller
    pub async fn tick(&self) -> Result<()> {
        let reader = self
            .reader
            .as_ref()
            .ok_or_else(|| SinapsiError::config("device not configured"))?;
        let telemetry = reader.read().await?;
        self.state().last_cutoff_warning = Some(telemetry.cutoff.has_warning);

        if self.config.compatibility != TelemetryCompatibility::Telemetry {
            return Ok(());
        }

        let payload = SimplifiedTelemetry::from(telemetry.as_ref());
        {
            let mut state = self.state();
            if self.config.send_on_change && state.last_payload.as_ref() == Some(&payload) {
                self.logger.trace("Telemetry unchanged, not published");
                return Ok(());
            }
            state.last_payload = Some(payload.clone());
        }

        let insight = TelemetryInsight {
            telemetry: telemetry.as_ref().clone(),
            meta: InsightMeta {
                ts: telemetry.timestamp,
                function_code: READ_HOLDING_REGISTERS,
                read_mode: reader.mode(),
            },
            device: DeviceInsight::from(reader.connection().config()),
        };
        self.emit(Outbound::Telemetry {
            payload,
            insight: Box::new(insight),
        });
        Ok(())
    }

    /// [`Self::tick`] with failures turned into status and error reports
    pub async fn poll(&self) {
        if let Err(e) = self.tick().await {
            self.logger.error(&format!("Telemetry read failed: {}", e));
            self.emit(Outbound::Status {
                source: TELEMETRY_TOPIC,
                indicator: StatusIndicator::from_error(&e),
            });
            self.emit(Outbound::Error {
                topic: TELEMETRY_ERROR_TOPIC,
                message: e.to_string(),
            });
        }
    }

    /// Emit the load-control pin from the last observed cutoff state
    pub fn publish_pin(&self) {
        let last = self.state().last_cutoff_warning;
        if let Some(shedding) = last {
            self.emit(Outbound::LoadControlPin { shedding });
        }
    }

    /// Start the poll loop, the pin loop when enabled and the status forwarder
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let Some(reader) = self.reader.as_ref() else {
            self.logger.error("Telemetry publisher disabled: device not configured");
            self.emit(Outbound::Status {
                source: TELEMETRY_TOPIC,
                indicator: StatusIndicator::not_configured(),
            });
            return Vec::new();
        };

        let mut handles = vec![spawn_status_forwarder(
            reader.connection().subscribe_status(),
            TELEMETRY_TOPIC,
            self.out.clone(),
            shutdown.clone(),
        )];

        let publisher = Arc::clone(&self);
        handles.push(spawn_periodic(
            "telemetry poll",
            self.config.poll_interval(),
            shutdown.clone(),
            move || {
                let publisher = Arc::clone(&publisher);
                async move { publisher.poll().await }
            },
        ));

        if self.config.compatibility == TelemetryCompatibility::KnxLoadControlPin {
            let publisher = Arc::clone(&self);
            handles.push(spawn_periodic(
                "knx load-control pin",
                Duration::from_millis(KNX_LOAD_CONTROL_PIN_INTERVAL_MS),
                shutdown,
                move || {
                    let publisher = Arc::clone(&publisher);
                    async move { publisher.publish_pin() }
                },
            ));
        }

        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{DecodedValues, WordOrder, build_telemetry};
    use crate::registers::Quantity;

    #[test]
    fn simplified_payload_uses_kilo_units() {
        let mut values = DecodedValues::new();
        values.insert(Quantity::PowerImportW, 1500);
        values.insert(Quantity::EnergyExportTotalWh, 123_456);
        values.insert(Quantity::CurrentTariffBand, 2);
        values.insert(Quantity::CutoffEventEpoch, u32::MAX);
        let t = build_telemetry(&values, WordOrder::HiLo, Utc::now());

        let simple = SimplifiedTelemetry::from(&t);
        assert_eq!(simple.power.import_kw, 1.5);
        assert_eq!(simple.energy.export_total_kwh, 123.456);

        let json = serde_json::to_value(&simple).unwrap();
        assert_eq!(json["power"]["importkW"], 1.5);
        assert_eq!(json["tariffBand"], 2);
        assert_eq!(json["cutoff"]["hasWarning"], false);
        assert!(json["cutoff"]["atIso"].is_null());
    }

    #[tokio::test]
    async fn disabled_publisher_reports_not_configured() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let publisher = Arc::new(TelemetryPublisher::new(TelemetryConfig::default(), None, tx));

        let handles = Arc::clone(&publisher).spawn(CancellationToken::new());
        assert!(handles.is_empty());
        match rx.try_recv().unwrap() {
            Outbound::Status { indicator, .. } => assert_eq!(indicator.text, "device not configured"),
            other => panic!("unexpected message {:?}", other),
        }

        publisher.poll().await;
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Status { .. }));
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Error { .. }));
    }

    #[test]
    fn pin_is_silent_before_first_read() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let publisher = TelemetryPublisher::new(TelemetryConfig::default(), None, tx);
        publisher.publish_pin();
        assert!(rx.try_recv().is_err());

        publisher.state().last_cutoff_warning = Some(true);
        publisher.publish_pin();
        assert!(matches!(
            rx.try_recv().unwrap(),
            Outbound::LoadControlPin { shedding: true }
        ));
    }
}
