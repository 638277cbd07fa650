#![allow(dead_code)]

use sinapsi::config::DeviceConfig;
use sinapsi::error::{Result, SinapsiError};
use sinapsi::modbus::{RegisterTransport, TransportFactory};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Shared state of the simulated meter
#[derive(Default)]
pub struct MeterState {
    pub words: Mutex<HashMap<u16, u16>>,
    pub connects: AtomicUsize,
    pub reads: AtomicUsize,
    pub closes: AtomicUsize,
    pub refuse_connect: AtomicBool,
    /// Reads wider than this fail with an exception
    pub max_read_count: Mutex<Option<u16>>,
    pub writes: Mutex<Vec<(u16, u16)>>,
    pub coils: Mutex<Vec<(u16, bool)>>,
    pub read_delay: Mutex<Duration>,
    /// Reads currently inside the transport, and the most seen at once
    pub reads_in_flight: AtomicUsize,
    pub max_reads_in_flight: AtomicUsize,
    /// Start and end of every read, failed ones included
    pub read_spans: Mutex<Vec<(Instant, Instant)>>,
}

impl MeterState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_word(&self, address: u16, value: u16) {
        self.words.lock().unwrap().insert(address, value);
    }

    pub fn set_u32(&self, address: u16, value: u32) {
        self.set_word(address, (value >> 16) as u16);
        self.set_word(address + 1, (value & 0xFFFF) as u16);
    }

    pub fn limit_reads(&self, max: u16) {
        *self.max_read_count.lock().unwrap() = Some(max);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn max_reads_in_flight(&self) -> usize {
        self.max_reads_in_flight.load(Ordering::SeqCst)
    }

    /// Idle time between consecutive reads
    pub fn read_gaps(&self) -> Vec<Duration> {
        let spans = self.read_spans.lock().unwrap();
        spans
            .windows(2)
            .map(|pair| pair[1].0.saturating_duration_since(pair[0].1))
            .collect()
    }

    fn read_words(&self, address: u16, count: u16) -> Result<Vec<u16>> {
        if let Some(max) = *self.max_read_count.lock().unwrap() {
            if count > max {
                return Err(SinapsiError::modbus("device exception: IllegalDataAddress"));
            }
        }
        let words = self.words.lock().unwrap();
        Ok((address..address + count)
            .map(|a| words.get(&a).copied().unwrap_or(0))
            .collect())
    }
}

pub struct MockMeter {
    state: Arc<MeterState>,
}

#[async_trait::async_trait]
impl RegisterTransport for MockMeter {
    async fn connect(&mut self, _host: &str, _port: u16, _unit_id: u8) -> Result<()> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if self.state.refuse_connect.load(Ordering::SeqCst) {
            return Err(SinapsiError::modbus("Connection refused"));
        }
        Ok(())
    }

    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
        let started = Instant::now();
        self.state.reads.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.state.reads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .max_reads_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);

        let delay = *self.state.read_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let result = self.state.read_words(address, count);

        self.state.reads_in_flight.fetch_sub(1, Ordering::SeqCst);
        self.state
            .read_spans
            .lock()
            .unwrap()
            .push((started, Instant::now()));
        result
    }

    async fn write_single_register(&mut self, address: u16, value: u16) -> Result<()> {
        self.state.writes.lock().unwrap().push((address, value));
        Ok(())
    }

    async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<()> {
        self.state.coils.lock().unwrap().push((address, value));
        Ok(())
    }

    async fn close(&mut self) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockMeterFactory(pub Arc<MeterState>);

impl TransportFactory for MockMeterFactory {
    fn create(&self) -> Box<dyn RegisterTransport> {
        Box::new(MockMeter {
            state: Arc::clone(&self.0),
        })
    }
}

pub fn device_config() -> DeviceConfig {
    DeviceConfig {
        host: "alfa.test".to_string(),
        queue_delay_ms: 0,
        reconnect_interval_ms: 50,
        ..Default::default()
    }
}
