//! Modbus TCP transport for the Sinapsi Alfa meter
//!
//! The connection manager talks to the meter through [`RegisterTransport`],
//! creating a fresh transport from a [`TransportFactory`] on every connect
//! attempt. [`ModbusTcpTransport`] is the production implementation on top of
//! `tokio-modbus`; tests plug in in-memory transports.

use crate::config::DeviceConfig;
use crate::error::{Result, SinapsiError};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;
use tokio_modbus::client::tcp;
use tokio_modbus::prelude::*;

/// Modbus function code used for every telemetry read
pub const READ_HOLDING_REGISTERS: u8 = 3;

/// Largest word count a single holding-register read may request
pub const MAX_READ_COUNT: u16 = 125;

/// Addressing convention of configured register addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressBase {
    /// Addresses are already wire offsets
    #[default]
    #[serde(alias = "0")]
    Zero,
    /// Addresses count from 1 (register "40001" style tables)
    #[serde(alias = "1")]
    One,
}

impl AddressBase {
    /// Translate a configured address to the 0-based wire offset, clamping at 0
    pub fn to_wire(self, address: u16) -> u16 {
        match self {
            AddressBase::Zero => address,
            AddressBase::One => address.saturating_sub(1),
        }
    }
}

/// One physical link to the meter
#[async_trait::async_trait]
pub trait RegisterTransport: Send {
    /// Open the link and select the unit identifier
    async fn connect(&mut self, host: &str, port: u16, unit_id: u8) -> Result<()>;

    /// Function code 3
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>>;

    /// Function code 6
    async fn write_single_register(&mut self, address: u16, value: u16) -> Result<()>;

    /// Function code 5
    async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<()>;

    /// Tear the link down; never fails
    async fn close(&mut self);
}

/// Builds unconnected transports
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Box<dyn RegisterTransport>;
}

/// Modbus TCP transport backed by `tokio-modbus`
pub struct ModbusTcpTransport {
    /// Modbus TCP client connection
    context: Option<tokio_modbus::client::Context>,

    /// Per-request timeout enforced by the transport
    operation_timeout: Duration,

    /// Logger
    logger: StructuredLogger,
}

impl ModbusTcpTransport {
    pub fn new(operation_timeout: Duration, logger: StructuredLogger) -> Self {
        Self {
            context: None,
            operation_timeout,
            logger,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.context.is_some()
    }

    fn get_client(&mut self) -> Result<&mut tokio_modbus::client::Context> {
        self.context
            .as_mut()
            .ok_or_else(|| SinapsiError::not_connected("Not connected to Modbus server"))
    }
}

#[async_trait::async_trait]
impl RegisterTransport for ModbusTcpTransport {
    async fn connect(&mut self, host: &str, port: u16, unit_id: u8) -> Result<()> {
        let address = format!("{}:{}", host, port);
        self.logger
            .info(&format!("Connecting to Modbus server at {}", address));

        let socket_addr = tokio::net::lookup_host(address.as_str())
            .await
            .map_err(|e| SinapsiError::modbus(format!("Invalid socket address: {}", e)))?
            .next()
            .ok_or_else(|| {
                SinapsiError::modbus(format!("Invalid socket address: {} did not resolve", address))
            })?;

        match tcp::connect_slave(socket_addr, Slave(unit_id)).await {
            Ok(ctx) => {
                self.context = Some(ctx);
                self.logger.info("Successfully connected to Modbus server");
                Ok(())
            }
            Err(e) => {
                let error_msg = format!("Failed to connect to Modbus server: {}", e);
                self.logger.error(&error_msg);
                Err(SinapsiError::modbus(error_msg))
            }
        }
    }

    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
        let timeout_duration = self.operation_timeout;

        // Log before borrowing client
        self.logger.debug(&format!(
            "Reading {} registers from address {}",
            count, address
        ));

        let client = self.get_client()?;
        match timeout(timeout_duration, client.read_holding_registers(address, count)).await {
            Ok(Ok(Ok(response))) => {
                self.logger.trace(&format!(
                    "Read {} registers: {:?}",
                    response.len(),
                    response
                ));
                Ok(response)
            }
            Ok(Ok(Err(exception))) => Err(exception.into()),
            Ok(Err(e)) => {
                let error_msg = format!("Failed to read holding registers: {}", e);
                self.logger.error(&error_msg);
                Err(SinapsiError::modbus(error_msg))
            }
            Err(_) => Err(SinapsiError::timeout("Read operation timed out")),
        }
    }

    async fn write_single_register(&mut self, address: u16, value: u16) -> Result<()> {
        let timeout_duration = self.operation_timeout;

        self.logger.debug(&format!(
            "Writing value {} to register {}",
            value, address
        ));

        let client = self.get_client()?;
        match timeout(timeout_duration, client.write_single_register(address, value)).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(exception))) => Err(exception.into()),
            Ok(Err(e)) => Err(SinapsiError::modbus(format!(
                "Failed to write single register: {}",
                e
            ))),
            Err(_) => Err(SinapsiError::timeout("Write operation timed out")),
        }
    }

    async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<()> {
        let timeout_duration = self.operation_timeout;

        self.logger
            .debug(&format!("Writing coil {} = {}", address, value));

        let client = self.get_client()?;
        match timeout(timeout_duration, client.write_single_coil(address, value)).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(exception))) => Err(exception.into()),
            Ok(Err(e)) => Err(SinapsiError::modbus(format!(
                "Failed to write single coil: {}",
                e
            ))),
            Err(_) => Err(SinapsiError::timeout("Write operation timed out")),
        }
    }

    async fn close(&mut self) {
        if let Some(mut ctx) = self.context.take() {
            self.logger.info("Disconnecting from Modbus server");
            if let Err(e) = ctx.disconnect().await {
                self.logger.debug(&format!("Ignoring disconnect error: {}", e));
            }
        }
    }
}

/// Factory for [`ModbusTcpTransport`]
pub struct ModbusTcpFactory {
    operation_timeout: Duration,
    host: String,
    unit_id: u8,
}

impl ModbusTcpFactory {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            operation_timeout: config.connect_timeout(),
            host: config.host.clone(),
            unit_id: config.unit_id,
        }
    }
}

impl TransportFactory for ModbusTcpFactory {
    fn create(&self) -> Box<dyn RegisterTransport> {
        let logger = get_logger_with_context(
            LogContext::new("modbus")
                .with_host(&self.host)
                .with_field("unit", self.unit_id.to_string()),
        );
        Box::new(ModbusTcpTransport::new(self.operation_timeout, logger))
    }
}
