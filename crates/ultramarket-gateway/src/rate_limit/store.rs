//! Sliding-window storage.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("window store connection failed: {0}")]
    Connection(String),

    #[error("window store command failed: {0}")]
    Backend(String),

    #[error("window store returned malformed data: {0}")]
    Protocol(String),

    #[error("window store did not answer within {0:?}")]
    Timeout(std::time::Duration),
}

/// One window to check and, if every window has room, append to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSpec {
    pub key: String,
    pub limit: u32,
    pub window_ms: u64,
}

/// State of one window after expired entries were purged, before any append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub count: u32,
    pub oldest_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquisition {
    /// Whether `now` was appended to every window.
    pub admitted: bool,
    /// One snapshot per requested window, in request order.
    pub windows: Vec<WindowSnapshot>,
}

/// Backing store for sliding windows.
///
/// `try_acquire` must purge, count and conditionally append for all windows as
/// one atomic step with respect to any other call touching the same keys.
#[async_trait]
pub trait WindowStore: Send + Sync + Debug {
    async fn try_acquire(&self, windows: &[WindowSpec], now_ms: u64)
        -> Result<Acquisition, StoreError>;

    /// Drops windows whose newest entry is older than `idle_before_ms`.
    async fn sweep(&self, idle_before_ms: u64) -> Result<usize, StoreError>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Default)]
struct SlidingWindow {
    timestamps: VecDeque<u64>,
    /// Set once the sweeper removed this window from the map.
    retired: bool,
}

impl SlidingWindow {
    fn purge(&mut self, now_ms: u64, window_ms: u64) {
        let cutoff = now_ms.saturating_sub(window_ms);
        while self.timestamps.front().is_some_and(|&ts| ts < cutoff) {
            self.timestamps.pop_front();
        }
    }

    fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            count: u32::try_from(self.timestamps.len()).unwrap_or(u32::MAX),
            oldest_ms: self.timestamps.front().copied(),
        }
    }
}

/// Process-local windows keyed by string.
#[derive(Debug, Default)]
pub struct InMemoryWindowStore {
    windows: DashMap<String, Arc<Mutex<SlidingWindow>>>,
}

impl InMemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    fn acquire_now(&self, specs: &[WindowSpec], now_ms: u64) -> Acquisition {
        loop {
            let handles: Vec<_> = specs
                .iter()
                .map(|spec| Arc::clone(self.windows.entry(spec.key.clone()).or_default().value()))
                .collect();

            // Fixed lock order so two requests over the same keys never deadlock.
            let mut order: Vec<usize> = (0..specs.len()).collect();
            order.sort_by(|&a, &b| specs[a].key.cmp(&specs[b].key));

            let mut guards: Vec<Option<MutexGuard<'_, SlidingWindow>>> =
                (0..specs.len()).map(|_| None).collect();
            for &i in &order {
                guards[i] = Some(handles[i].lock());
            }

            let mut locked: Vec<MutexGuard<'_, SlidingWindow>> =
                guards.into_iter().flatten().collect();

            if locked.iter().any(|w| w.retired) {
                // Raced with the sweeper; the next lookup creates fresh windows.
                continue;
            }

            let windows: Vec<WindowSnapshot> = locked
                .iter_mut()
                .zip(specs)
                .map(|(window, spec)| {
                    window.purge(now_ms, spec.window_ms);
                    window.snapshot()
                })
                .collect();

            let admitted = windows
                .iter()
                .zip(specs)
                .all(|(snapshot, spec)| snapshot.count < spec.limit);

            if admitted {
                for window in &mut locked {
                    window.timestamps.push_back(now_ms);
                }
            }

            return Acquisition { admitted, windows };
        }
    }
}

#[async_trait]
impl WindowStore for InMemoryWindowStore {
    async fn try_acquire(
        &self,
        windows: &[WindowSpec],
        now_ms: u64,
    ) -> Result<Acquisition, StoreError> {
        Ok(self.acquire_now(windows, now_ms))
    }

    async fn sweep(&self, idle_before_ms: u64) -> Result<usize, StoreError> {
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            // A held lock means the window is in use right now.
            let Some(mut guard) = window.try_lock() else {
                return true;
            };
            let idle = guard
                .timestamps
                .back()
                .map_or(true, |&newest| newest < idle_before_ms);
            if idle {
                guard.retired = true;
            }
            !idle
        });
        Ok(before.saturating_sub(self.windows.len()))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
