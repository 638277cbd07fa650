use super::Telemetry;
use crate::connection::ConnectionManager;
use crate::decode::{DecodedValues, WordOrder, WordTable, build_telemetry, decode_all};
use crate::error::{Result, SinapsiError};
use crate::logging::{StructuredLogger, get_logger};
use crate::registers::RegisterMap;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Strategy used to fetch the register map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadMode {
    /// One request per read group
    #[default]
    Group,
    /// One request per register definition
    Single,
}

type SharedRead = Shared<BoxFuture<'static, Result<Arc<Telemetry>>>>;

struct InFlight {
    generation: u64,
    read: SharedRead,
}

#[derive(Default)]
struct ReaderState {
    mode: ReadMode,
    in_flight: Option<InFlight>,
    generation: u64,
}

struct ReaderInner {
    connection: ConnectionManager,
    map: RegisterMap,
    word_order: WordOrder,
    state: Mutex<ReaderState>,
    logger: StructuredLogger,
}

/// Fetches telemetry snapshots through a [`ConnectionManager`].
///
/// Concurrent callers share one read cycle. A group read that fails is
/// retried register by register, and once that succeeds the reader stays in
/// single mode until [`TelemetryReader::reset_mode`].
#[derive(Clone)]
pub struct TelemetryReader {
    inner: Arc<ReaderInner>,
}

impl TelemetryReader {
    pub fn new(connection: ConnectionManager, map: RegisterMap, word_order: WordOrder) -> Self {
        Self {
            inner: Arc::new(ReaderInner {
                connection,
                map,
                word_order,
                state: Mutex::new(ReaderState::default()),
                logger: get_logger("telemetry"),
            }),
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    /// Current sticky read mode
    pub fn mode(&self) -> ReadMode {
        self.inner.state().mode
    }

    /// Go back to group reads
    pub fn reset_mode(&self) {
        self.inner.state().mode = ReadMode::Group;
    }

    /// Read one snapshot, joining a cycle already in flight
    pub async fn read(&self) -> Result<Arc<Telemetry>> {
        let (generation, read) = {
            let mut state = self.inner.state();
            match state.in_flight.as_ref() {
                Some(in_flight) => (in_flight.generation, in_flight.read.clone()),
                None => {
                    state.generation = state.generation.wrapping_add(1);
                    let generation = state.generation;
                    let inner = Arc::clone(&self.inner);
                    let read = async move { inner.read_cycle().await }.boxed().shared();
                    state.in_flight = Some(InFlight {
                        generation,
                        read: read.clone(),
                    });
                    (generation, read)
                }
            }
        };

        let result = read.await;

        let mut state = self.inner.state();
        if state
            .in_flight
            .as_ref()
            .is_some_and(|f| f.generation == generation)
        {
            state.in_flight = None;
        }
        result
    }
}

impl ReaderInner {
    fn state(&self) -> MutexGuard<'_, ReaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn read_cycle(self: Arc<Self>) -> Result<Arc<Telemetry>> {
        let mode = self.state().mode;
        let values = match mode {
            ReadMode::Single => self.read_single().await?,
            ReadMode::Group => match self.read_groups().await {
                Ok(values) => values,
                Err(group_err) => {
                    self.logger.warn(&format!(
                        "Group read failed ({}), retrying register by register",
                        group_err
                    ));
                    match self.read_single().await {
                        Ok(values) => {
                            self.state().mode = ReadMode::Single;
                            self.logger.warn("Switched to single-register reads");
                            values
                        }
                        Err(single_err) => {
                            self.logger
                                .debug(&format!("Single-register fallback failed: {}", single_err));
                            return Err(group_err);
                        }
                    }
                }
            },
        };

        let telemetry = build_telemetry(&values, self.word_order, Utc::now());
        self.logger.trace(&format!(
            "import={}W export={}W band={}",
            telemetry.power.import_w, telemetry.power.export_w, telemetry.tariff_band
        ));
        Ok(Arc::new(telemetry))
    }

    async fn read_groups(&self) -> Result<DecodedValues> {
        let mut words = WordTable::new();
        for group in self.map.groups() {
            let response = self
                .connection
                .read_holding_registers(group.start, group.count)
                .await?;
            if response.len() < usize::from(group.count) {
                return Err(SinapsiError::decode(format!(
                    "short response for group {}+{}: {} words",
                    group.start,
                    group.count,
                    response.len()
                )));
            }
            for (address, word) in (group.start..).zip(response) {
                words.insert(address, word);
            }
        }
        decode_all(self.map.registers(), &words, self.word_order)
    }

    async fn read_single(&self) -> Result<DecodedValues> {
        let mut words = WordTable::new();
        for def in self.map.registers() {
            let count = def.kind.word_count();
            if (def.address..def.address.saturating_add(count)).all(|a| words.contains_key(&a)) {
                continue;
            }
            let response = self
                .connection
                .read_holding_registers(def.address, count)
                .await?;
            for (address, word) in (def.address..).zip(response) {
                words.insert(address, word);
            }
        }
        decode_all(self.map.registers(), &words, self.word_order)
    }
}
