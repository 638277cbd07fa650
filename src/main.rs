use anyhow::Result;
use sinapsi::config::Config;
use sinapsi::connection::ConnectionManager;
use sinapsi::controller::{ControllerCommand, ControllerSettings, LoadControllerService};
use sinapsi::logging::init_logging;
use sinapsi::messages::{InboundMessage, Outbound};
use sinapsi::modbus::ModbusTcpFactory;
use sinapsi::publisher::TelemetryPublisher;
use sinapsi::registers::RegisterMap;
use sinapsi::telemetry::TelemetryReader;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Write every outbound message as one JSON line on stdout
async fn write_outbound(mut rx: mpsc::UnboundedReceiver<Outbound>) {
    let mut stdout = tokio::io::stdout();
    while let Some(message) = rx.recv().await {
        let line = match message.to_json() {
            Ok(value) => value.to_string(),
            Err(e) => {
                error!("Failed to serialise {}: {}", message.topic(), e);
                continue;
            }
        };
        if stdout.write_all(format!("{}\n", line).as_bytes()).await.is_err() {
            break;
        }
        let _ = stdout.flush().await;
    }
}

/// Turn `load/<name>` lines from stdin into controller overrides
async fn read_inbound(commands: mpsc::UnboundedSender<ControllerCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match InboundMessage::parse(&line) {
                Ok(message) => match message.as_override() {
                    Some((name, desired)) => {
                        let command = ControllerCommand::SetLoad {
                            name: name.to_string(),
                            desired,
                        };
                        if commands.send(command).is_err() {
                            break;
                        }
                    }
                    None => warn!("Ignoring inbound message on topic {}", message.topic),
                },
                Err(e) => warn!("Ignoring malformed inbound line: {}", e),
            },
            Ok(None) => break,
            Err(e) => {
                error!("stdin read failed: {}", e);
                break;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    init_logging(&config.logging).map_err(|e| anyhow::anyhow!("Failed to initialise logging: {}", e))?;

    info!("Sinapsi {} starting up", env!("APP_VERSION"));

    for warning in config.warnings() {
        warn!("{}", warning);
    }

    // Components without a usable device stay disabled and report it
    let connection = match config.device.validate() {
        Ok(()) => Some(ConnectionManager::spawn(
            config.device.clone(),
            Arc::new(ModbusTcpFactory::new(&config.device)),
        )),
        Err(e) => {
            error!("Device disabled: {}", e);
            None
        }
    };
    let reader = connection
        .clone()
        .map(|c| TelemetryReader::new(c, RegisterMap::default(), config.device.word_order));

    let shutdown = tokio_util::sync::CancellationToken::new();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let mut tasks = Vec::new();

    if config.telemetry.enabled {
        let publisher = Arc::new(TelemetryPublisher::new(
            config.telemetry.clone(),
            reader.clone(),
            out_tx.clone(),
        ));
        tasks.extend(publisher.spawn(shutdown.child_token()));
    }

    if config.controller.enabled {
        let service = Arc::new(LoadControllerService::new(
            ControllerSettings::from(&config.controller),
            config.controller.load_definitions(),
            config.controller.poll_interval(),
            reader.clone(),
            out_tx.clone(),
        ));
        tasks.extend(service.spawn(shutdown.child_token(), cmd_rx));
    }
    drop(out_tx);

    let writer = tokio::spawn(write_outbound(out_rx));
    let stdin_task = tokio::spawn(read_inbound(cmd_tx));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    shutdown.cancel();
    stdin_task.abort();
    if let Some(connection) = &connection {
        connection.close().await;
    }
    for task in tasks {
        let _ = task.await;
    }
    drop(reader);
    writer.abort();

    info!("Shutdown complete");
    Ok(())
}
