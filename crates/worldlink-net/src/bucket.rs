//! Token-bucket pacing for outbound sends.
//!
//! Tokens are not refilled by a timer. Every check rolls the window forward
//! lazily once `interval + token_limit * latency` has passed since the last
//! reset, then drains the pending queue while capacity remains. A single
//! timer is armed when items are left over.
//!
//! [`BucketState`] is the clock-free core (it is handed `now` explicitly) so
//! that ordering and window properties can be tested deterministically.
//! [`TokenBucket`] wraps it with a mutex and tokio timers.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Smallest timer the bucket will arm.
const MIN_TIMER: Duration = Duration::from_millis(1);

// ---------------------------------------------------------------------------
// BucketState
// ---------------------------------------------------------------------------

struct Pending<J> {
    priority: bool,
    job: J,
}

/// Result of one drain pass.
pub struct Drain<J> {
    /// Dequeued jobs in dispatch order, each with the delay to wait before
    /// running it (non-zero only when simulated latency is configured).
    pub ready: Vec<(J, Duration)>,
    /// If set, the caller must call [`BucketState::on_timer`] after this long.
    pub rearm: Option<Duration>,
}

impl<J> Drain<J> {
    fn empty() -> Self {
        Self {
            ready: Vec::new(),
            rearm: None,
        }
    }
}

/// Pure token-bucket state machine.
pub struct BucketState<J> {
    token_limit: u32,
    interval: Duration,
    reserved: u32,
    latency: Duration,
    tokens: u32,
    last_reset: Option<Instant>,
    last_send: Option<Instant>,
    queue: VecDeque<Pending<J>>,
    timer_armed: bool,
}

impl<J> BucketState<J> {
    pub fn new(token_limit: u32, interval: Duration) -> Self {
        Self {
            token_limit,
            interval,
            reserved: 0,
            latency: Duration::ZERO,
            tokens: 0,
            last_reset: None,
            last_send: None,
            queue: VecDeque::new(),
            timer_armed: false,
        }
    }

    /// Enqueue a job. Priority jobs go ahead of every queued non-priority
    /// job but stay behind priority jobs queued earlier.
    pub fn push(&mut self, job: J, priority: bool) {
        let item = Pending { priority, job };
        if priority {
            let at = self
                .queue
                .iter()
                .position(|p| !p.priority)
                .unwrap_or(self.queue.len());
            self.queue.insert(at, item);
        } else {
            self.queue.push_back(item);
        }
    }

    /// Roll the window if due and drain as much of the queue as capacity
    /// allows. Does nothing while a timer is armed.
    pub fn poll(&mut self, now: Instant) -> Drain<J> {
        if self.timer_armed || self.queue.is_empty() {
            return Drain::empty();
        }

        let span = self.window_span();
        let reset = match self.last_reset {
            Some(reset) if now < reset + span => reset,
            _ => {
                self.tokens = self.tokens.saturating_sub(self.token_limit);
                self.last_reset = Some(now);
                now
            }
        };

        let mut drain = Drain::empty();
        while let Some(head) = self.queue.front() {
            let available = self.tokens < self.token_limit;
            let unreserved = self.tokens < self.token_limit.saturating_sub(self.reserved);
            if !(unreserved || (available && head.priority)) {
                break;
            }
            let Some(item) = self.queue.pop_front() else {
                break;
            };
            self.tokens += 1;

            let delay = match self.last_send {
                Some(last) if !self.latency.is_zero() => {
                    (last + self.latency).saturating_duration_since(now)
                }
                _ => Duration::ZERO,
            };
            self.last_send = Some(now + delay);
            drain.ready.push((item.job, delay));
        }

        if !self.queue.is_empty() {
            let until_reset = (reset + span).saturating_duration_since(now);
            let wait = if self.tokens < self.token_limit && !self.latency.is_zero() {
                self.latency.min(until_reset)
            } else {
                until_reset
            };
            self.timer_armed = true;
            drain.rearm = Some(wait.max(MIN_TIMER));
        }
        drain
    }

    /// The armed timer fired.
    pub fn on_timer(&mut self, now: Instant) -> Drain<J> {
        self.timer_armed = false;
        self.poll(now)
    }

    fn window_span(&self) -> Duration {
        self.interval + self.latency * self.token_limit
    }

    pub fn token_limit(&self) -> u32 {
        self.token_limit
    }

    /// Takes effect from the next drain pass.
    pub fn set_token_limit(&mut self, limit: u32) {
        self.token_limit = limit;
    }

    /// Tokens consumed in the current window.
    pub fn tokens(&self) -> u32 {
        self.tokens
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn last_reset(&self) -> Option<Instant> {
        self.last_reset
    }
}

// ---------------------------------------------------------------------------
// TokenBucket
// ---------------------------------------------------------------------------

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Shareable rate limiter running queued closures on the tokio runtime.
///
/// A closure runs inline inside [`queue`](Self::queue) only when capacity is
/// available and no latency applies. Otherwise it runs from a timer task, so
/// `queue` must be called from within a tokio runtime.
#[derive(Clone)]
pub struct TokenBucket {
    inner: Arc<Mutex<BucketState<Job>>>,
}

impl TokenBucket {
    pub fn new(token_limit: u32, interval: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BucketState::new(token_limit, interval))),
        }
    }

    /// Keep `reserved` tokens of every window for priority items.
    pub fn with_reserved_tokens(self, reserved: u32) -> Self {
        self.inner.lock().reserved = reserved;
        self
    }

    /// Space consecutive sends at least `latency` apart.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.inner.lock().latency = latency;
        self
    }

    /// Queue a closure. See the type docs for when it runs.
    pub fn queue<F>(&self, job: F, priority: bool)
    where
        F: FnOnce() + Send + 'static,
    {
        let drain = {
            let mut state = self.inner.lock();
            state.push(Box::new(job), priority);
            state.poll(Instant::now())
        };
        run_drain(&self.inner, drain);
    }

    pub fn set_token_limit(&self, limit: u32) {
        self.inner.lock().set_token_limit(limit);
    }

    pub fn token_limit(&self) -> u32 {
        self.inner.lock().token_limit()
    }

    pub fn tokens(&self) -> u32 {
        self.inner.lock().tokens()
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().pending()
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("TokenBucket")
            .field("token_limit", &state.token_limit)
            .field("tokens", &state.tokens)
            .field("pending", &state.queue.len())
            .finish()
    }
}

fn run_drain(inner: &Arc<Mutex<BucketState<Job>>>, drain: Drain<Job>) {
    for (job, delay) in drain.ready {
        if delay.is_zero() {
            job();
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                job();
            });
        }
    }

    if let Some(wait) = drain.rearm {
        let weak: Weak<Mutex<BucketState<Job>>> = Arc::downgrade(inner);
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            // The owning session is gone; pending sends die with it.
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let drain = inner.lock().on_timer(Instant::now());
            run_drain(&inner, drain);
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
