use pkg_types::{ControlError, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Per-key exponential backoff: `base`, `2*base`, `4*base`, ... capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    failures: HashMap<String, u32>,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            failures: HashMap::new(),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying.
    pub fn when(&mut self, key: &str) -> Duration {
        let failures = self.failures.entry(key.to_string()).or_insert(0);
        let exponent = *failures;
        *failures = failures.saturating_add(1);
        self.delay_for(exponent)
    }

    pub fn delay_for(&self, exponent: u32) -> Duration {
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }

    pub fn forget(&mut self, key: &str) {
        self.failures.remove(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }
}

/// Proof that a key was handed out by [`WorkQueue::get`]; give it back
/// through [`WorkQueue::done`].
#[must_use = "a key stays in processing until its token is passed to done()"]
#[derive(Debug)]
pub struct DoneToken {
    key: String,
}

impl DoneToken {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Deduplicating, rate-limited queue of reconciliation keys.
///
/// A key is in at most one of: queued, processing, waiting on backoff.
/// Adding a key that is being processed marks it dirty, and it is queued
/// again exactly once when the worker calls `done`. So one key is never
/// reconciled by two workers at the same time.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    /// Signalled when a key becomes available or the queue shuts down.
    available: Notify,
    /// Signalled when the processing set drains to empty.
    idle: Notify,
}

struct QueueState {
    queue: VecDeque<String>,
    /// Keys that need processing: everything queued plus keys re-added
    /// while processing.
    dirty: HashSet<String>,
    processing: HashSet<String>,
    /// Earliest retry instant for keys waiting on a delayed add.
    waiting: HashMap<String, Instant>,
    limiter: ExponentialBackoff,
    shutting_down: bool,
}

impl WorkQueue {
    pub fn new(limiter: ExponentialBackoff) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    waiting: HashMap::new(),
                    limiter,
                    shutting_down: false,
                }),
                available: Notify::new(),
                idle: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `key` unless it is already queued. Ignored after shutdown.
    pub fn add(&self, key: &str) {
        {
            let mut state = self.state();
            if state.shutting_down {
                debug!("work queue shut down, dropping key {}", key);
                return;
            }
            if !state.dirty.insert(key.to_string()) {
                return;
            }
            if state.processing.contains(key) {
                debug!("key {} is processing, marked dirty", key);
                return;
            }
            state.queue.push_back(key.to_string());
        }
        self.inner.available.notify_one();
    }

    /// Wait for the next key and mark it processing.
    ///
    /// Fails with `Closed` once the queue is shutting down.
    pub async fn get(&self) -> Result<(String, DoneToken)> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state();
                if state.shutting_down {
                    return Err(ControlError::Closed("work queue"));
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Ok((key.clone(), DoneToken { key }));
                }
            }
            notified.await;
        }
    }

    /// Finish processing. A key re-added meanwhile goes back on the queue.
    pub fn done(&self, token: DoneToken) {
        let (requeued, idle) = {
            let mut state = self.state();
            state.processing.remove(&token.key);
            let requeued = state.dirty.contains(&token.key);
            if requeued {
                state.queue.push_back(token.key.clone());
            }
            (requeued, state.processing.is_empty())
        };
        if requeued {
            debug!("key {} was dirty, requeued", token.key);
            self.inner.available.notify_one();
        }
        if idle {
            self.inner.idle.notify_waiters();
        }
    }

    /// Queue `key` once `delay` has elapsed. An earlier pending retry for the
    /// same key wins over a later one.
    pub fn add_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let ready_at = Instant::now() + delay;
        {
            let mut state = self.state();
            if state.shutting_down {
                return;
            }
            match state.waiting.get(key) {
                Some(existing) if *existing <= ready_at => return,
                _ => {
                    state.waiting.insert(key.to_string(), ready_at);
                }
            }
        }
        debug!("key {} waiting {:?} before retry", key, delay);

        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep_until(ready_at).await;
            queue.fire(&key, ready_at);
        });
    }

    fn fire(&self, key: &str, ready_at: Instant) {
        {
            let mut state = self.state();
            if state.waiting.get(key) != Some(&ready_at) {
                // superseded by an earlier retry
                return;
            }
            state.waiting.remove(key);
        }
        self.add(key);
    }

    /// Requeue after this key's next backoff delay.
    pub fn add_rate_limited(&self, key: &str) {
        let delay = self.state().limiter.when(key);
        self.add_after(key, delay);
    }

    /// Reset the backoff of `key` after a successful reconciliation.
    pub fn forget(&self, key: &str) {
        self.state().limiter.forget(key);
    }

    /// Consecutive failures recorded for `key`.
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.state().limiter.num_requeues(key)
    }

    /// When a key waiting on backoff becomes eligible again.
    pub fn retry_at(&self, key: &str) -> Option<Instant> {
        self.state().waiting.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_processing(&self, key: &str) -> bool {
        self.state().processing.contains(key)
    }

    /// Stop handing out keys. Blocked and future `get` calls fail with
    /// `Closed`; in-flight keys may still call `done`.
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.inner.available.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Shut down, then wait until every in-flight key has been marked done.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.state().processing.is_empty() {
                return;
            }
            idle.await;
        }
    }
}
