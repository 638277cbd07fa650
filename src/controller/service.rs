//! Control loop around [`LoadController`]

use super::{ControllerSettings, Load, LoadController};
use crate::error::{Result, SinapsiError};
use crate::logging::{StructuredLogger, get_logger};
use crate::messages::{
    CONTROLLER_ERROR_TOPIC, CONTROLLER_TOPIC, Outbound, OutboundSender, StatusIndicator,
    spawn_status_forwarder,
};
use crate::scheduler::spawn_periodic;
use crate::telemetry::TelemetryReader;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Requests accepted by the running service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerCommand {
    /// Manual override of one load
    SetLoad { name: String, desired: bool },
}

pub struct LoadControllerService {
    reader: Option<TelemetryReader>,
    controller: Mutex<LoadController>,
    poll_interval: Duration,
    out: OutboundSender,
    logger: StructuredLogger,
}

impl LoadControllerService {
    pub fn new(
        settings: ControllerSettings,
        loads: Vec<Load>,
        poll_interval: Duration,
        reader: Option<TelemetryReader>,
        out: OutboundSender,
    ) -> Self {
        Self {
            reader,
            controller: Mutex::new(LoadController::new(settings, loads)),
            poll_interval,
            out,
            logger: get_logger("controller"),
        }
    }

    fn emit(&self, message: Outbound) {
        if self.out.send(message).is_err() {
            self.logger.debug("Outbound channel closed, message dropped");
        }
    }

    /// Read telemetry, publish the summary, then every applied decision
    pub async fn tick(&self) -> Result<()> {
        let reader = self
            .reader
            .as_ref()
            .ok_or_else(|| SinapsiError::config("device not configured"))?;
        let telemetry = reader.read().await?;

        let mut controller = self.controller.lock().await;
        let summary = controller.summary(&telemetry);
        let decisions = controller.compute_actions(&telemetry, Instant::now());
        drop(controller);

        self.emit(Outbound::Summary(summary));
        for decision in decisions {
            self.emit(Outbound::Decision(decision));
        }
        Ok(())
    }

    /// [`Self::tick`] with failures turned into status and error reports
    pub async fn poll(&self) {
        if let Err(e) = self.tick().await {
            self.logger.error(&format!("Control tick failed: {}", e));
            self.emit(Outbound::Status {
                source: CONTROLLER_TOPIC,
                indicator: StatusIndicator::from_error(&e),
            });
            self.emit(Outbound::Error {
                topic: CONTROLLER_ERROR_TOPIC,
                message: e.to_string(),
            });
        }
    }

    pub async fn handle_command(&self, command: ControllerCommand) {
        match command {
            ControllerCommand::SetLoad { name, desired } => {
                self.controller
                    .lock()
                    .await
                    .apply_override(&name, desired, Instant::now());
            }
        }
    }

    /// Whether a load is currently desired on
    pub async fn is_on(&self, name: &str) -> bool {
        self.controller.lock().await.is_on(name)
    }

    /// Start the control loop, the command loop and the status forwarder
    pub fn spawn(
        self: Arc<Self>,
        shutdown: CancellationToken,
        mut commands: mpsc::UnboundedReceiver<ControllerCommand>,
    ) -> Vec<JoinHandle<()>> {
        let Some(reader) = self.reader.as_ref() else {
            self.logger.error("Load controller disabled: device not configured");
            self.emit(Outbound::Status {
                source: CONTROLLER_TOPIC,
                indicator: StatusIndicator::not_configured(),
            });
            return Vec::new();
        };

        let mut handles = vec![spawn_status_forwarder(
            reader.connection().subscribe_status(),
            CONTROLLER_TOPIC,
            self.out.clone(),
            shutdown.clone(),
        )];

        let service = Arc::clone(&self);
        handles.push(spawn_periodic(
            "control loop",
            self.poll_interval,
            shutdown.clone(),
            move || {
                let service = Arc::clone(&service);
                async move { service.poll().await }
            },
        ));

        let service = Arc::clone(&self);
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    command = commands.recv() => match command {
                        Some(command) => service.handle_command(command).await,
                        None => break,
                    },
                }
            }
        }));

        handles
    }
}
