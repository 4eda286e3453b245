//! Heartbeat liveness watchdog
//!
//! Every heartbeat resets the timer. When no heartbeat arrives within the
//! timeout the state flips to `Lost` and the `on_lost` callback given to
//! [`ConnectionWatcher::start`] runs once. A later heartbeat flips the state
//! back to `Healthy` but never re-arms the callback; the owner tears the
//! connection down on the first loss.

use fablink_core::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Watchdog timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionWatchConfig {
    /// Silence after which the connection counts as lost.
    pub timeout_ms: u64,
    /// How often the check task wakes up.
    pub check_interval_ms: u64,
}

impl Default for ConnectionWatchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            check_interval_ms: 500,
        }
    }
}

/// Watchdog verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionWatchState {
    /// Heartbeats arrive in time.
    Healthy,
    /// Timed out.
    Lost,
}

type LostCallback = Box<dyn FnOnce() + Send>;

/// Tracks heartbeat arrival and reports the first timeout
pub struct ConnectionWatcher {
    config: ConnectionWatchConfig,
    last_heartbeat: Arc<Mutex<Instant>>,
    state: Arc<RwLock<ConnectionWatchState>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionWatcher {
    /// Create a stopped watcher
    pub fn new(config: ConnectionWatchConfig) -> Self {
        Self {
            config,
            last_heartbeat: Arc::new(Mutex::new(Instant::now())),
            state: Arc::new(RwLock::new(ConnectionWatchState::Healthy)),
            task: Mutex::new(None),
        }
    }

    /// Configuration in use
    pub fn config(&self) -> ConnectionWatchConfig {
        self.config
    }

    /// Record a heartbeat
    pub fn heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    /// Milliseconds since the last heartbeat
    pub fn time_since_heartbeat(&self) -> u64 {
        self.last_heartbeat.lock().elapsed().as_millis() as u64
    }

    /// Current verdict
    pub async fn get_state(&self) -> ConnectionWatchState {
        *self.state.read().await
    }

    /// Whether the check task runs
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Start checking; the timer starts now
    pub async fn start<F>(&self, on_lost: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.config.timeout_ms == 0 || self.config.check_interval_ms == 0 {
            return Err(Error::other("heartbeat watchdog needs non-zero timings"));
        }
        self.stop().await;
        self.heartbeat();
        *self.state.write().await = ConnectionWatchState::Healthy;

        let timeout = Duration::from_millis(self.config.timeout_ms);
        let interval = Duration::from_millis(self.config.check_interval_ms);
        let last_heartbeat = self.last_heartbeat.clone();
        let state = self.state.clone();
        let mut on_lost: Option<LostCallback> = Some(Box::new(on_lost));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let silent_for = last_heartbeat.lock().elapsed();
                let verdict = if silent_for >= timeout {
                    ConnectionWatchState::Lost
                } else {
                    ConnectionWatchState::Healthy
                };

                let previous = {
                    let mut guard = state.write().await;
                    std::mem::replace(&mut *guard, verdict)
                };
                if previous != verdict {
                    tracing::debug!("Heartbeat watchdog: {:?} -> {:?}", previous, verdict);
                }

                if verdict == ConnectionWatchState::Lost {
                    if let Some(callback) = on_lost.take() {
                        tracing::warn!(
                            "No heartbeat for {} ms, connection presumed lost",
                            silent_for.as_millis()
                        );
                        callback();
                    }
                }
            }
        });

        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Stop checking
    pub async fn stop(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for ConnectionWatcher {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quick() -> ConnectionWatchConfig {
        ConnectionWatchConfig {
            timeout_ms: 200,
            check_interval_ms: 20,
        }
    }

    #[test]
    fn test_watcher_creation() {
        let watcher = ConnectionWatcher::new(ConnectionWatchConfig::default());
        assert!(watcher.time_since_heartbeat() < 100);
        assert!(!watcher.is_running());
    }

    #[tokio::test]
    async fn test_heartbeat_update() {
        let watcher = ConnectionWatcher::new(ConnectionWatchConfig::default());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(watcher.time_since_heartbeat() >= 50);
        watcher.heartbeat();
        assert!(watcher.time_since_heartbeat() <= 10);
    }

    #[tokio::test]
    async fn test_lost_fires_exactly_once() {
        let watcher = ConnectionWatcher::new(quick());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        watcher
            .start(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        assert_eq!(watcher.get_state().await, ConnectionWatchState::Healthy);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(watcher.get_state().await, ConnectionWatchState::Lost);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        watcher.heartbeat();
        let mut state = watcher.get_state().await;
        for _ in 0..10 {
            if state == ConnectionWatchState::Healthy {
                break;
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
            state = watcher.get_state().await;
        }
        assert_eq!(state, ConnectionWatchState::Healthy);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_heartbeats_keep_it_healthy() {
        let watcher = ConnectionWatcher::new(quick());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        watcher
            .start(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        for _ in 0..8 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            watcher.heartbeat();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        watcher.stop().await;
        assert!(!watcher.is_running());
    }

    #[tokio::test]
    async fn test_stopped_watcher_never_fires() {
        let watcher = ConnectionWatcher::new(quick());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        watcher
            .start(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        watcher.stop().await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_zero_timeout_is_rejected() {
        let watcher = ConnectionWatcher::new(ConnectionWatchConfig {
            timeout_ms: 0,
            check_interval_ms: 10,
        });
        assert!(watcher.start(|| {}).await.is_err());
    }
}
