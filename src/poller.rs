use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::fetcher::AvailabilityFetcher;
use crate::model::{AvailabilitySnapshot, Ms, StayQuery, now_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Polling,
    /// Host hidden; no timer, no fetches.
    Suspended,
}

/// A snapshot delivered to the consumer.
#[derive(Debug, Clone)]
pub struct PollUpdate {
    pub snapshot: Arc<AvailabilitySnapshot>,
    pub fetched_at: Ms,
    /// First fetch after `start()`. Only this one should drive a full-page loading state.
    pub initial: bool,
}

#[derive(Debug, Clone)]
pub struct PollStatus {
    pub state: PollState,
    /// True from `start()` until the first fetch settles; background polls never set it.
    pub loading: bool,
    pub latest: Option<PollUpdate>,
    pub last_error: Option<String>,
}

impl Default for PollStatus {
    fn default() -> Self {
        Self {
            state: PollState::Idle,
            loading: false,
            latest: None,
            last_error: None,
        }
    }
}

type SnapshotCallback = Arc<dyn Fn(PollUpdate) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Whether the host page is visible. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct HostVisibility {
    tx: Arc<watch::Sender<bool>>,
}

impl HostVisibility {
    pub fn new(visible: bool) -> Self {
        Self {
            tx: Arc::new(watch::channel(visible).0),
        }
    }

    pub fn set_visible(&self, visible: bool) {
        self.tx.send_if_modified(|current| {
            if *current == visible {
                false
            } else {
                *current = visible;
                true
            }
        });
    }

    pub fn is_visible(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Keeps one (unit, date range) snapshot fresh: fetches immediately on
/// start, then every `interval` while the host is visible.
///
/// `start()` spawns onto the current tokio runtime.
pub struct AvailabilityPoller {
    fetcher: Arc<dyn AvailabilityFetcher>,
    visibility: HostVisibility,
    interval: Duration,
    /// Bumped on every start/stop; a task whose generation is behind is stale.
    generation: Arc<AtomicU64>,
    status: Arc<watch::Sender<PollStatus>>,
    active: Option<(StayQuery, CancellationToken)>,
}

impl AvailabilityPoller {
    pub fn new(fetcher: Arc<dyn AvailabilityFetcher>, visibility: HostVisibility, interval: Duration) -> Self {
        Self {
            fetcher,
            visibility,
            interval,
            generation: Arc::new(AtomicU64::new(0)),
            status: Arc::new(watch::channel(PollStatus::default()).0),
            active: None,
        }
    }

    pub fn start<S, E>(&mut self, query: StayQuery, on_snapshot: S, on_error: E)
    where
        S: Fn(PollUpdate) + Send + Sync + 'static,
        E: Fn(String) + Send + Sync + 'static,
    {
        self.stop();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();

        self.status.send_modify(|s| {
            *s = PollStatus {
                state: PollState::Idle,
                loading: true,
                latest: None,
                last_error: None,
            };
        });

        let task = PollTask {
            fetcher: self.fetcher.clone(),
            query: query.clone(),
            interval: self.interval,
            visibility: self.visibility.subscribe(),
            token: token.clone(),
            generation,
            current: self.generation.clone(),
            status: self.status.clone(),
            on_snapshot: Arc::new(on_snapshot),
            on_error: Arc::new(on_error),
        };
        debug!("starting availability poll for {query} (generation {generation})");
        tokio::spawn(task.run());
        self.active = Some((query, token));
    }

    /// Stop polling. An in-flight fetch is discarded when it lands.
    pub fn stop(&mut self) {
        let Some((query, token)) = self.active.take() else {
            return;
        };
        self.generation.fetch_add(1, Ordering::SeqCst);
        token.cancel();
        self.status.send_modify(|s| {
            s.state = PollState::Idle;
            s.loading = false;
        });
        debug!("stopped availability poll for {query}");
    }

    pub fn query(&self) -> Option<&StayQuery> {
        self.active.as_ref().map(|(q, _)| q)
    }

    pub fn status(&self) -> PollStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<PollStatus> {
        self.status.subscribe()
    }

    pub fn state(&self) -> PollState {
        self.status.borrow().state
    }

    pub fn latest(&self) -> Option<PollUpdate> {
        self.status.borrow().latest.clone()
    }
}

impl Drop for AvailabilityPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

struct PollTask {
    fetcher: Arc<dyn AvailabilityFetcher>,
    query: StayQuery,
    interval: Duration,
    visibility: watch::Receiver<bool>,
    token: CancellationToken,
    generation: u64,
    current: Arc<AtomicU64>,
    status: Arc<watch::Sender<PollStatus>>,
    on_snapshot: SnapshotCallback,
    on_error: ErrorCallback,
}

impl PollTask {
    fn is_current(&self) -> bool {
        !self.token.is_cancelled() && self.current.load(Ordering::SeqCst) == self.generation
    }

    /// Apply `f` to the shared status unless this task has gone stale.
    /// The check runs under the status lock, so it cannot interleave with `stop()`.
    fn update_status(&self, f: impl FnOnce(&mut PollStatus)) -> bool {
        self.status.send_if_modified(|s| {
            if self.current.load(Ordering::SeqCst) != self.generation {
                return false;
            }
            f(s);
            true
        })
    }

    fn set_state(&self, state: PollState) -> bool {
        self.update_status(|s| s.state = state)
    }

    async fn run(mut self) {
        let mut initial = true;
        loop {
            if !*self.visibility.borrow_and_update() {
                if !self.set_state(PollState::Suspended) {
                    return;
                }
                debug!("availability poll for {} suspended", self.query);
                tokio::select! {
                    _ = self.token.cancelled() => return,
                    changed = self.visibility.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                }
            }

            if !self.set_state(PollState::Polling) {
                return;
            }
            if !self.poll_once(initial).await {
                return;
            }
            initial = false;

            let next_tick = tokio::time::sleep(self.interval);
            tokio::pin!(next_tick);
            loop {
                tokio::select! {
                    _ = self.token.cancelled() => return,
                    _ = &mut next_tick => break,
                    changed = self.visibility.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if !*self.visibility.borrow_and_update() {
                            break;
                        }
                    }
                }
            }
        }
    }

    /// One fetch. Returns false if the subscription went away meanwhile.
    async fn poll_once(&self, initial: bool) -> bool {
        let started = Instant::now();
        let fetch = AssertUnwindSafe(self.fetcher.fetch(&self.query)).catch_unwind();
        let outcome = tokio::select! {
            _ = self.token.cancelled() => return false,
            outcome = fetch => outcome,
        };

        if !self.is_current() {
            metrics::counter!(crate::observability::STALE_RESULTS_DISCARDED_TOTAL).increment(1);
            debug!("discarding stale availability result for {}", self.query);
            return false;
        }
        metrics::histogram!(crate::observability::FETCH_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        let failure = match outcome {
            Ok(Ok(snapshot)) => {
                metrics::counter!(crate::observability::FETCH_TOTAL, "status" => "ok").increment(1);
                let update = PollUpdate {
                    snapshot: Arc::new(snapshot),
                    fetched_at: now_ms(),
                    initial,
                };
                let delivered = update.clone();
                if !self.update_status(|s| {
                    s.latest = Some(delivered);
                    s.last_error = None;
                    if initial {
                        s.loading = false;
                    }
                }) {
                    return false;
                }
                let on_snapshot = &self.on_snapshot;
                if catch_unwind(AssertUnwindSafe(|| on_snapshot(update))).is_err() {
                    tracing::error!("snapshot callback panicked for {}", self.query);
                }
                return true;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "availability fetcher panicked".to_string(),
        };

        metrics::counter!(crate::observability::FETCH_TOTAL, "status" => "error").increment(1);
        warn!("availability fetch for {} failed: {failure}", self.query);
        // Previous snapshot stays; the schedule is unaffected.
        let message = failure.clone();
        if !self.update_status(|s| {
            s.last_error = Some(message);
            if initial {
                s.loading = false;
            }
        }) {
            return false;
        }
        let on_error = &self.on_error;
        if catch_unwind(AssertUnwindSafe(|| on_error(failure))).is_err() {
            tracing::error!("error callback panicked for {}", self.query);
        }
        true
    }
}
