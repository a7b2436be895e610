use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

pub struct BrokerMetrics {
    open_connections: AtomicU64,
    signal_frames_total: Mutex<HashMap<String, u64>>,
    forced_closes_total: AtomicU64,
    auth_rejects_total: AtomicU64,
    notifications_emitted_total: AtomicU64,
}

static GLOBAL_METRICS: OnceLock<Arc<BrokerMetrics>> = OnceLock::new();

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self {
            open_connections: AtomicU64::new(0),
            signal_frames_total: Mutex::new(HashMap::new()),
            forced_closes_total: AtomicU64::new(0),
            auth_rejects_total: AtomicU64::new(0),
            notifications_emitted_total: AtomicU64::new(0),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<BrokerMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<BrokerMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn set_open_connections(count: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.set_open_connections(count);
    }
}

pub fn record_signal_frame(kind: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_signal_frame(kind);
    }
}

pub fn increment_forced_closes() {
    if let Some(metrics) = global_metrics() {
        metrics.increment_forced_closes();
    }
}

pub fn increment_auth_rejects() {
    if let Some(metrics) = global_metrics() {
        metrics.increment_auth_rejects();
    }
}

pub fn add_notifications_emitted(count: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.add_notifications_emitted(count);
    }
}

impl BrokerMetrics {
    pub fn set_open_connections(&self, count: usize) {
        self.open_connections.store(count as u64, Ordering::Relaxed);
    }

    pub fn record_signal_frame(&self, kind: &str) {
        let mut guard = self.signal_frames_total.lock().expect("metrics mutex poisoned");
        *guard.entry(kind.to_owned()).or_insert(0) += 1;
    }

    pub fn increment_forced_closes(&self) {
        self.forced_closes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_auth_rejects(&self) {
        self.auth_rejects_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_notifications_emitted(&self, count: u64) {
        self.notifications_emitted_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let signal_frames_total =
            self.signal_frames_total.lock().expect("metrics mutex poisoned").clone();

        MetricsSnapshot {
            open_connections: self.open_connections.load(Ordering::Relaxed),
            signal_frames_total,
            forced_closes_total: self.forced_closes_total.load(Ordering::Relaxed),
            auth_rejects_total: self.auth_rejects_total.load(Ordering::Relaxed),
            notifications_emitted_total: self.notifications_emitted_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub open_connections: u64,
    pub signal_frames_total: HashMap<String, u64>,
    pub forced_closes_total: u64,
    pub auth_rejects_total: u64,
    pub notifications_emitted_total: u64,
}
