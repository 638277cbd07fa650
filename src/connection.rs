//! Connection manager for the meter
//!
//! Owns the only transport instance, the connection state machine, the
//! constant-interval reconnect timer and the operation queue. Every register
//! operation is submitted to a single worker task that drains the queue in
//! order, so at most one request is ever on the wire.
//!
//! State changes are published twice: the current [`ConnectionState`] on a
//! watch channel, and a [`StatusEvent`] per transition on a broadcast channel.

use crate::config::DeviceConfig;
use crate::error::{Result, SinapsiError};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::modbus::{MAX_READ_COUNT, RegisterTransport, TransportFactory};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Connection state as owned by the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected(String),
}

/// Notification emitted on every state transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEvent {
    pub connecting: bool,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusEvent {
    pub fn connecting() -> Self {
        Self {
            connecting: true,
            connected: false,
            error: None,
        }
    }

    pub fn connected() -> Self {
        Self {
            connecting: false,
            connected: true,
            error: None,
        }
    }

    pub fn disconnected(error: Option<String>) -> Self {
        Self {
            connecting: false,
            connected: false,
            error,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    ReadHolding { address: u16, count: u16 },
    WriteRegister { address: u16, value: u16 },
    WriteCoil { address: u16, value: bool },
}

struct PendingOperation {
    operation: Operation,
    reply: oneshot::Sender<Result<Vec<u16>>>,
}

type ConnectAttempt = Shared<BoxFuture<'static, ()>>;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    config: DeviceConfig,
    factory: Arc<dyn TransportFactory>,
    transport: Mutex<Option<Box<dyn RegisterTransport>>>,
    state_tx: watch::Sender<ConnectionState>,
    status_tx: broadcast::Sender<StatusEvent>,
    connect_attempt: StdMutex<Option<ConnectAttempt>>,
    retry_timer: StdMutex<Option<JoinHandle<()>>>,
    queue_tx: mpsc::UnboundedSender<PendingOperation>,
    closing: CancellationToken,
    logger: StructuredLogger,
}

/// Handle to the connection manager; clones share one connection
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("host", &self.inner.config.host)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    /// Create the manager and its queue worker without connecting.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: DeviceConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let logger = get_logger_with_context(LogContext::new("connection").with_host(&config.host));

        let inner = Arc::new(Inner {
            config,
            factory,
            transport: Mutex::new(None),
            state_tx,
            status_tx,
            connect_attempt: StdMutex::new(None),
            retry_timer: StdMutex::new(None),
            queue_tx,
            closing: CancellationToken::new(),
            logger,
        });

        tokio::spawn(run_queue(
            Arc::downgrade(&inner),
            queue_rx,
            inner.closing.clone(),
            inner.config.queue_delay(),
        ));

        Self { inner }
    }

    /// Create the manager and start the first connect attempt in the background
    pub fn spawn(config: DeviceConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let manager = Self::new(config, factory);
        let inner = Arc::clone(&manager.inner);
        tokio::spawn(async move { inner.connect().await });
        manager
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Receive a [`StatusEvent`] for every transition from now on
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.status_tx.subscribe()
    }

    /// Connect, or join the attempt already in flight
    pub async fn connect(&self) -> Result<()> {
        self.inner.connect().await;
        if self.inner.is_connected() {
            Ok(())
        } else {
            Err(SinapsiError::not_connected(self.disconnect_reason()))
        }
    }

    /// Read `count` holding registers starting at `address`
    pub async fn read_holding_registers(&self, address: u16, count: u16) -> Result<Vec<u16>> {
        if count == 0 || count > MAX_READ_COUNT {
            return Err(SinapsiError::validation(
                "count",
                format!("must be between 1 and {}", MAX_READ_COUNT),
            ));
        }
        self.submit(Operation::ReadHolding { address, count }).await
    }

    pub async fn write_register(&self, address: u16, value: u16) -> Result<()> {
        self.submit(Operation::WriteRegister { address, value })
            .await
            .map(|_| ())
    }

    pub async fn write_coil(&self, address: u16, value: bool) -> Result<()> {
        self.submit(Operation::WriteCoil { address, value })
            .await
            .map(|_| ())
    }

    /// Stop reconnecting and tear the transport down.
    ///
    /// Operations still queued or in flight fail with a shutdown error.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closing.is_cancelled() {
            return;
        }
        inner.logger.info("Closing connection manager");
        inner.closing.cancel();

        if let Some(timer) = lock(&inner.retry_timer).take() {
            timer.abort();
        }

        let mut guard = inner.transport.lock().await;
        if let Some(mut transport) = guard.take() {
            transport.close().await;
        }
        drop(guard);

        inner.set_state(ConnectionState::Disconnected("closed".to_string()));
        inner.publish(StatusEvent::disconnected(None));
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.is_cancelled()
    }

    async fn submit(&self, operation: Operation) -> Result<Vec<u16>> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .queue_tx
            .send(PendingOperation { operation, reply })
            .map_err(|_| SinapsiError::shutdown("operation queue closed"))?;
        rx.await
            .map_err(|_| SinapsiError::shutdown("operation dropped before completion"))?
    }

    fn disconnect_reason(&self) -> String {
        match self.state() {
            ConnectionState::Disconnected(reason) => reason,
            _ => "Sinapsi Alfa not connected".to_string(),
        }
    }
}

impl Inner {
    fn is_connected(&self) -> bool {
        matches!(*self.state_tx.borrow(), ConnectionState::Connected)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn publish(&self, event: StatusEvent) {
        // No subscribers is fine
        let _ = self.status_tx.send(event);
    }

    async fn connect(self: &Arc<Self>) {
        if self.closing.is_cancelled() || self.is_connected() {
            return;
        }

        let attempt = {
            let mut slot = lock(&self.connect_attempt);
            match slot.as_ref() {
                Some(attempt) => attempt.clone(),
                None => {
                    let this = Arc::clone(self);
                    let attempt = async move { this.connect_once().await }.boxed().shared();
                    *slot = Some(attempt.clone());
                    attempt
                }
            }
        };

        attempt.await;
    }

    async fn connect_once(self: Arc<Self>) {
        self.set_state(ConnectionState::Connecting);
        self.publish(StatusEvent::connecting());

        match self.open_transport().await {
            Ok(()) => {
                self.logger.info(&format!(
                    "Connected to {}:{} unit {}",
                    self.config.host, self.config.port, self.config.unit_id
                ));
            }
            // close() owns the final state
            Err(_) if self.closing.is_cancelled() => {}
            Err(e) => {
                let reason = e.to_string();
                self.logger.warn(&format!("Connect failed: {}", reason));
                self.set_state(ConnectionState::Disconnected(reason.clone()));
                self.publish(StatusEvent::disconnected(Some(reason)));
                self.arm_retry();
            }
        }

        *lock(&self.connect_attempt) = None;
    }

    /// Replace whatever transport exists with a freshly connected one
    async fn open_transport(&self) -> Result<()> {
        let mut guard = self.transport.lock().await;
        if let Some(mut old) = guard.take() {
            old.close().await;
        }
        if self.closing.is_cancelled() {
            return Err(SinapsiError::shutdown("connection manager closed"));
        }

        let mut fresh = self.factory.create();
        let connect = fresh.connect(&self.config.host, self.config.port, self.config.unit_id);
        match tokio::time::timeout(self.config.connect_timeout(), connect).await {
            Ok(Ok(())) if self.closing.is_cancelled() => {
                fresh.close().await;
                Err(SinapsiError::shutdown("connection manager closed"))
            }
            Ok(Ok(())) => {
                *guard = Some(fresh);
                // Still under the transport lock, so a racing close() lands after this
                self.set_state(ConnectionState::Connected);
                self.publish(StatusEvent::connected());
                Ok(())
            }
            Ok(Err(e)) => {
                fresh.close().await;
                Err(e)
            }
            Err(_) => {
                fresh.close().await;
                Err(SinapsiError::timeout("Connect timed out"))
            }
        }
    }

    fn arm_retry(self: &Arc<Self>) {
        if self.closing.is_cancelled() {
            return;
        }
        let mut slot = lock(&self.retry_timer);
        if slot.as_ref().is_some_and(|timer| !timer.is_finished()) {
            return;
        }

        let delay = self.config.reconnect_interval();
        self.logger
            .debug(&format!("Reconnect scheduled in {} ms", delay.as_millis()));
        let weak = Arc::downgrade(self);
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                lock(&inner.retry_timer).take();
                inner.connect().await;
            }
        }));
    }

    async fn ensure_connected(self: &Arc<Self>) -> Result<()> {
        if self.closing.is_cancelled() {
            return Err(SinapsiError::shutdown("connection manager closed"));
        }
        if !self.is_connected() {
            self.connect().await;
        }
        if self.is_connected() {
            Ok(())
        } else {
            Err(SinapsiError::not_connected("Sinapsi Alfa not connected"))
        }
    }

    async fn execute(self: &Arc<Self>, operation: Operation) -> Result<Vec<u16>> {
        self.ensure_connected().await?;

        let base = self.config.base_address;
        let result = {
            let mut guard = self.transport.lock().await;
            match guard.as_mut() {
                Some(transport) => match operation {
                    Operation::ReadHolding { address, count } => {
                        transport
                            .read_holding_registers(base.to_wire(address), count)
                            .await
                    }
                    Operation::WriteRegister { address, value } => transport
                        .write_single_register(base.to_wire(address), value)
                        .await
                        .map(|()| Vec::new()),
                    Operation::WriteCoil { address, value } => transport
                        .write_single_coil(base.to_wire(address), value)
                        .await
                        .map(|()| Vec::new()),
                },
                None => Err(SinapsiError::not_connected("transport was torn down")),
            }
        };

        if let Err(e) = &result {
            self.mark_failed(e).await;
        }
        result
    }

    /// Drop the broken transport after a failed operation
    async fn mark_failed(self: &Arc<Self>, error: &SinapsiError) {
        self.logger
            .warn(&format!("Operation failed, dropping connection: {}", error));

        let mut guard = self.transport.lock().await;
        if let Some(mut transport) = guard.take() {
            transport.close().await;
        }
        drop(guard);

        let reason = error.to_string();
        self.set_state(ConnectionState::Disconnected(reason.clone()));
        self.publish(StatusEvent::disconnected(Some(reason)));
        self.arm_retry();
    }
}

/// Queue worker: runs each operation to completion, replies, then paces
async fn run_queue(
    inner: Weak<Inner>,
    mut rx: mpsc::UnboundedReceiver<PendingOperation>,
    closing: CancellationToken,
    delay: std::time::Duration,
) {
    while let Some(pending) = rx.recv().await {
        let Some(manager) = inner.upgrade() else {
            let _ = pending
                .reply
                .send(Err(SinapsiError::shutdown("connection manager dropped")));
            break;
        };

        let result = tokio::select! {
            biased;
            _ = closing.cancelled() => Err(SinapsiError::shutdown("connection manager closed")),
            r = manager.execute(pending.operation) => r,
        };
        drop(manager);

        // Caller may have given up
        let _ = pending.reply.send(result);

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Counters {
        connects: AtomicUsize,
        closes: AtomicUsize,
        reads: AtomicUsize,
        fail_connect: std::sync::atomic::AtomicBool,
        fail_reads: AtomicUsize,
    }

    struct FakeTransport {
        counters: Arc<Counters>,
    }

    #[async_trait::async_trait]
    impl RegisterTransport for FakeTransport {
        async fn connect(&mut self, _host: &str, _port: u16, _unit_id: u8) -> Result<()> {
            self.counters.connects.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.counters.fail_connect.load(Ordering::SeqCst) {
                return Err(SinapsiError::modbus("connection refused"));
            }
            Ok(())
        }

        async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
            self.counters.reads.fetch_add(1, Ordering::SeqCst);
            if self.counters.fail_reads.load(Ordering::SeqCst) > 0 {
                self.counters.fail_reads.fetch_sub(1, Ordering::SeqCst);
                return Err(SinapsiError::modbus("broken pipe"));
            }
            Ok((address..address + count).collect())
        }

        async fn write_single_register(&mut self, _address: u16, _value: u16) -> Result<()> {
            Ok(())
        }

        async fn write_single_coil(&mut self, _address: u16, _value: bool) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeFactory(Arc<Counters>);

    impl TransportFactory for FakeFactory {
        fn create(&self) -> Box<dyn RegisterTransport> {
            Box::new(FakeTransport {
                counters: Arc::clone(&self.0),
            })
        }
    }

    fn device() -> DeviceConfig {
        DeviceConfig {
            host: "meter.test".to_string(),
            queue_delay_ms: 0,
            reconnect_interval_ms: 50,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_attempt() {
        let counters = Arc::new(Counters::default());
        let manager = ConnectionManager::new(device(), Arc::new(FakeFactory(counters.clone())));
        assert_eq!(manager.state(), ConnectionState::Idle);

        let (a, b) = tokio::join!(manager.connect(), manager.connect());
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn read_connects_lazily_and_translates_addresses() {
        let counters = Arc::new(Counters::default());
        let mut config = device();
        config.base_address = crate::modbus::AddressBase::One;
        let manager = ConnectionManager::new(config, Arc::new(FakeFactory(counters.clone())));

        let words = manager.read_holding_registers(781, 3).await.unwrap();
        assert_eq!(words, vec![780, 781, 782]);
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_operation_tears_down_and_queue_keeps_going() {
        let counters = Arc::new(Counters::default());
        let manager = ConnectionManager::new(device(), Arc::new(FakeFactory(counters.clone())));
        let mut status = manager.subscribe_status();

        manager.connect().await.unwrap();
        counters.fail_reads.store(1, Ordering::SeqCst);

        let (first, second) = tokio::join!(
            manager.read_holding_registers(0, 2),
            manager.read_holding_registers(10, 1)
        );
        assert!(first.unwrap_err().to_string().contains("broken pipe"));
        assert_eq!(second.unwrap(), vec![10]);

        // The failing read closed its transport and the next one reconnected
        assert!(counters.closes.load(Ordering::SeqCst) >= 1);
        assert_eq!(counters.connects.load(Ordering::SeqCst), 2);

        let mut saw_error = false;
        while let Ok(event) = status.try_recv() {
            if event.error.as_deref().is_some_and(|e| e.contains("broken pipe")) {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn connect_failure_arms_retry() {
        let counters = Arc::new(Counters::default());
        counters.fail_connect.store(true, Ordering::SeqCst);
        let manager = ConnectionManager::new(device(), Arc::new(FakeFactory(counters.clone())));

        assert!(manager.connect().await.is_err());
        assert!(matches!(manager.state(), ConnectionState::Disconnected(_)));

        counters.fail_connect.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(manager.is_connected());
        assert_eq!(counters.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn close_stops_reconnects_and_fails_operations() {
        let counters = Arc::new(Counters::default());
        counters.fail_connect.store(true, Ordering::SeqCst);
        let manager = ConnectionManager::new(device(), Arc::new(FakeFactory(counters.clone())));

        assert!(manager.connect().await.is_err());
        manager.close().await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);

        let err = manager.read_holding_registers(0, 1).await.unwrap_err();
        assert!(matches!(err, SinapsiError::Shutdown { .. }));
    }

    #[tokio::test]
    async fn close_during_connect_never_reports_connected() {
        let counters = Arc::new(Counters::default());
        let manager = ConnectionManager::new(device(), Arc::new(FakeFactory(counters.clone())));
        let mut status = manager.subscribe_status();

        let connecting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(2)).await;
        manager.close().await;
        assert!(connecting.await.unwrap().is_err());

        assert_eq!(manager.state(), ConnectionState::Disconnected("closed".to_string()));
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        let mut events = Vec::new();
        while let Ok(event) = status.try_recv() {
            events.push(event);
        }
        assert_eq!(events, vec![StatusEvent::connecting(), StatusEvent::disconnected(None)]);
    }

    #[tokio::test]
    async fn invalid_read_count_is_rejected() {
        let counters = Arc::new(Counters::default());
        let manager = ConnectionManager::new(device(), Arc::new(FakeFactory(counters)));
        assert!(manager.read_holding_registers(0, 0).await.is_err());
        assert!(manager.read_holding_registers(0, 126).await.is_err());
    }
}
