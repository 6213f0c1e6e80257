//! Common test helpers for Shroud tests
//!
//! This crate provides:
//! - Condition-based waiting (no hardcoded sleeps)
//! - Event collectors that subscribe to any bus
//! - Pairs of endpoints over an in-memory network or real UDP sockets

use parking_lot::Mutex;
use shroud_engine::{Bus, Endpoint, EngineConfig, Handler, SubscriberId};
use shroud_transport::MemoryNetwork;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::timeout;

/// Default test timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default condition check interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Port Allocation
// ============================================================================

/// Find an available UDP port for testing
pub fn find_available_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

/// Loopback address on `port`
pub fn local(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

// ============================================================================
// Condition-Based Waiting
// ============================================================================

/// Wait for a condition with timeout - condition-based, not time-based
pub async fn wait_for<F, Fut>(check: F, interval: Duration, max_wait: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if check().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

/// Wait for an atomic counter to reach a target value
pub async fn wait_for_count(counter: &AtomicU32, target: u32, max_wait: Duration) -> bool {
    wait_for(
        || async { counter.load(Ordering::SeqCst) >= target },
        DEFAULT_CHECK_INTERVAL,
        max_wait,
    )
    .await
}

/// Wait for a boolean flag to become true
pub async fn wait_for_flag(flag: &AtomicBool, max_wait: Duration) -> bool {
    wait_for(
        || async { flag.load(Ordering::SeqCst) },
        DEFAULT_CHECK_INTERVAL,
        max_wait,
    )
    .await
}

/// Wait with notification - more efficient than polling
pub async fn wait_with_notify(notify: &Notify, max_wait: Duration) -> bool {
    timeout(max_wait, notify.notified()).await.is_ok()
}

// ============================================================================
// Event Collectors - for verifying published events
// ============================================================================

/// Collects every event published on the buses it subscribes to
pub struct EventCollector<E> {
    events: Mutex<Vec<E>>,
    count: AtomicU32,
    notify: Notify,
}

impl<E: Clone + Send + Sync + 'static> EventCollector<E> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            count: AtomicU32::new(0),
            notify: Notify::new(),
        })
    }

    /// Register on `bus`
    pub fn subscribe(self: &Arc<Self>, bus: &Bus<E>) -> SubscriberId {
        bus.subscribe(self.clone())
    }

    /// Get the count of collected events
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait for at least n events
    pub async fn wait_for_count(&self, n: u32, max_wait: Duration) -> bool {
        wait_for_count(&self.count, n, max_wait).await
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<E> {
        self.events.lock().clone()
    }

    /// Events matching a predicate
    pub fn matching(&self, pred: impl Fn(&E) -> bool) -> Vec<E> {
        self.events.lock().iter().filter(|e| pred(e)).cloned().collect()
    }

    /// Get the last event collected
    pub fn last(&self) -> Option<E> {
        self.events.lock().last().cloned()
    }

    /// Clear all collected events
    pub fn clear(&self) {
        self.events.lock().clear();
        self.count.store(0, Ordering::SeqCst);
    }
}

impl<E: Clone + Send + Sync> Handler<E> for EventCollector<E> {
    fn handle(&self, event: &E) -> shroud_engine::Result<()> {
        self.events.lock().push(event.clone());
        self.count.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }
}

// ============================================================================
// Test Peers - two connected endpoints
// ============================================================================

/// Two endpoints that can reach each other
pub struct TestPeers {
    pub a: Endpoint,
    pub b: Endpoint,
    /// Present for in-memory peers; controls loss
    pub network: Option<MemoryNetwork>,
}

impl TestPeers {
    /// Peers on an in-memory network
    pub fn memory(config: EngineConfig) -> Self {
        Self::memory_with(config.clone(), config)
    }

    /// In-memory peers with separate configurations
    pub fn memory_with(a_config: EngineConfig, b_config: EngineConfig) -> Self {
        let network = MemoryNetwork::new();
        let (a_channel, a_rx) = network.bind(local(10_001)).unwrap();
        let (b_channel, b_rx) = network.bind(local(10_002)).unwrap();

        let a = Endpoint::with_channel(Arc::new(a_channel), a_rx, a_config).unwrap();
        let b = Endpoint::with_channel(Arc::new(b_channel), b_rx, b_config).unwrap();
        Self {
            a,
            b,
            network: Some(network),
        }
    }

    /// Peers on real loopback UDP sockets
    pub async fn udp(config: EngineConfig) -> Self {
        let a = Endpoint::bind("127.0.0.1:0", config.clone()).await.unwrap();
        let b = Endpoint::bind("127.0.0.1:0", config).await.unwrap();
        Self {
            a,
            b,
            network: None,
        }
    }

    pub fn a_addr(&self) -> SocketAddr {
        self.a.local_addr()
    }

    pub fn b_addr(&self) -> SocketAddr {
        self.b.local_addr()
    }

    /// Shut both endpoints down
    pub async fn shutdown(&self) {
        self.a.shutdown().await;
        self.b.shutdown().await;
    }
}
