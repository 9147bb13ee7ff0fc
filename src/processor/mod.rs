//! Consume/persist/commit loop.
//!
//! Each [`Processor`] owns one log consumer and drives it through an explicit
//! [`State`] machine. An offset is committed only after the event at that
//! position has been written to the store; a failed write leaves the offset
//! where it is and rewinds the consumer so the same message is fetched again.
//! That non-advancing offset is the retry mechanism: there is no retry counter
//! and no per-message backoff.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ProcessorConfig;
use crate::event::{codec, Event};
use crate::health::HealthMetrics;
use crate::queue::{LogConsumer, Position, QueueError, QueuedMessage};
use crate::store::EventStore;

/// Processor loop states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    /// Between messages; checks for shutdown and due commits.
    Idle,
    /// Waiting for the next message.
    Fetching,
    /// Turning a fetched payload into an event.
    Decoding(QueuedMessage),
    /// Writing the event to the store.
    Persisting { position: Position, event: Event },
    /// Moving the consumer back so a failed position is fetched again.
    Rewinding(Position),
    /// Recording a persisted position as processed.
    Committing(Position),
    /// Terminal.
    Stopped,
}

/// One consumer loop.
pub struct Processor<C, S> {
    consumer: C,
    store: Arc<S>,
    worker: usize,
    fetch_backoff: Duration,
    commit_interval: Duration,
    /// Highest persisted-but-uncommitted position per partition.
    pending: BTreeMap<i32, Position>,
    last_commit: Instant,
    health: Option<Arc<HealthMetrics>>,
}

impl<C: LogConsumer, S: EventStore> Processor<C, S> {
    pub fn new(consumer: C, store: Arc<S>, cfg: &ProcessorConfig) -> Self {
        Self {
            consumer,
            store,
            worker: 0,
            fetch_backoff: cfg.fetch_backoff,
            commit_interval: cfg.commit_interval,
            pending: BTreeMap::new(),
            last_commit: Instant::now(),
            health: None,
        }
    }

    /// Sets the worker index used in log fields.
    pub fn with_worker(mut self, worker: usize) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Runs until `cancel` fires, then flushes pending commits and closes the
    /// consumer. A message already being persisted is finished first.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!(worker = self.worker, "Processor started");
        if let Some(h) = &self.health {
            h.processors_running.inc();
        }

        let mut state = State::Idle;
        while state != State::Stopped {
            state = self.step(state, &cancel).await;
        }

        self.finish().await;

        if let Some(h) = &self.health {
            h.processors_running.dec();
        }
        info!(worker = self.worker, "Processor stopped");

        Ok(())
    }

    /// Performs one transition.
    pub async fn step(&mut self, state: State, cancel: &CancellationToken) -> State {
        match state {
            State::Idle => {
                if cancel.is_cancelled() {
                    return State::Stopped;
                }
                if self.commit_due() {
                    self.flush_pending().await;
                }
                State::Fetching
            }
            State::Fetching => self.fetch(cancel).await,
            State::Decoding(msg) => self.decode(msg),
            State::Persisting { position, event } => self.persist(position, event).await,
            State::Rewinding(position) => self.rewind(position, cancel).await,
            State::Committing(position) => {
                self.record_processed(position).await;
                State::Idle
            }
            State::Stopped => State::Stopped,
        }
    }

    /// Positions persisted but not yet committed, one per partition.
    pub fn pending_commits(&self) -> Vec<Position> {
        self.pending.values().copied().collect()
    }

    async fn fetch(&mut self, cancel: &CancellationToken) -> State {
        let flush_at = self.flush_deadline();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return State::Stopped,
            _ = wait_until(flush_at) => return State::Idle,
            result = self.consumer.fetch() => result,
        };

        match result {
            Ok(msg) => {
                if let Some(h) = &self.health {
                    h.events_fetched.inc();
                }
                State::Decoding(msg)
            }
            Err(QueueError::Closed) => {
                error!(worker = self.worker, "Consumer closed underneath processor");
                State::Stopped
            }
            Err(e) => {
                warn!(worker = self.worker, error = %e, "Fetch failed");
                if let Some(h) = &self.health {
                    h.fetch_errors.inc();
                }
                self.backoff(cancel, State::Idle).await
            }
        }
    }

    fn decode(&self, msg: QueuedMessage) -> State {
        match codec::decode(&msg.payload) {
            Ok(event) => State::Persisting {
                position: msg.position,
                event,
            },
            Err(e) => {
                warn!(
                    worker = self.worker,
                    partition = msg.position.partition,
                    offset = msg.position.offset,
                    error = %e,
                    "Dropping undecodable message"
                );
                if let Some(h) = &self.health {
                    h.decode_errors.with_label_values(&[e.kind()]).inc();
                }
                State::Idle
            }
        }
    }

    async fn persist(&mut self, position: Position, event: Event) -> State {
        match self.store.insert_event(&event).await {
            Ok(()) => {
                debug!(
                    worker = self.worker,
                    partition = position.partition,
                    offset = position.offset,
                    site_id = event.site_id(),
                    "Event persisted"
                );
                if let Some(h) = &self.health {
                    h.events_persisted.inc();
                }
                State::Committing(position)
            }
            Err(e) => {
                error!(
                    worker = self.worker,
                    partition = position.partition,
                    offset = position.offset,
                    site_id = event.site_id(),
                    error = %format!("{e:#}"),
                    "Failed to persist event, offset not committed"
                );
                if let Some(h) = &self.health {
                    h.persist_errors.inc();
                }
                State::Rewinding(position)
            }
        }
    }

    async fn rewind(&mut self, position: Position, cancel: &CancellationToken) -> State {
        match self.consumer.rewind(position).await {
            Ok(()) => {
                if let Some(h) = &self.health {
                    h.rewinds.inc();
                }
                State::Idle
            }
            Err(e) => {
                warn!(
                    worker = self.worker,
                    partition = position.partition,
                    offset = position.offset,
                    error = %e,
                    "Rewind failed"
                );
                if let Some(h) = &self.health {
                    h.fetch_errors.inc();
                }
                self.backoff(cancel, State::Rewinding(position)).await
            }
        }
    }

    async fn record_processed(&mut self, position: Position) {
        if self.commit_interval.is_zero() {
            self.commit(position).await;
            return;
        }

        self.pending
            .entry(position.partition)
            .and_modify(|p| {
                if position.offset > p.offset {
                    *p = position;
                }
            })
            .or_insert(position);

        if self.commit_due() {
            self.flush_pending().await;
        }
    }

    async fn commit(&mut self, position: Position) {
        match self.consumer.commit(position).await {
            Ok(()) => {
                debug!(
                    worker = self.worker,
                    partition = position.partition,
                    offset = position.offset,
                    "Offset committed"
                );
                if let Some(h) = &self.health {
                    h.committed_offset
                        .with_label_values(&[&position.partition.to_string()])
                        .set(position.offset as f64);
                }
            }
            Err(e) => {
                error!(
                    worker = self.worker,
                    partition = position.partition,
                    offset = position.offset,
                    error = %e,
                    "Failed to commit offset"
                );
                if let Some(h) = &self.health {
                    h.commit_errors.inc();
                }
            }
        }
    }

    async fn flush_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for position in pending.into_values() {
            self.commit(position).await;
        }
        self.last_commit = Instant::now();
    }

    fn commit_due(&self) -> bool {
        !self.pending.is_empty() && self.last_commit.elapsed() >= self.commit_interval
    }

    fn flush_deadline(&self) -> Option<Instant> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.last_commit + self.commit_interval)
        }
    }

    async fn backoff(&mut self, cancel: &CancellationToken, next: State) -> State {
        tokio::select! {
            _ = cancel.cancelled() => State::Stopped,
            _ = tokio::time::sleep(self.fetch_backoff) => next,
        }
    }

    async fn finish(&mut self) {
        if !self.pending.is_empty() {
            self.flush_pending().await;
        }
        if let Err(e) = self.consumer.close().await {
            warn!(worker = self.worker, error = %e, "Closing consumer");
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::queue::memory::MemoryLog;
    use crate::queue::LogProducer;
    use crate::store::memory::MemoryStore;
    use crate::store::{DayWindow, PathViews, SiteStats};

    /// Memory store that fails the first `failures` inserts.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicUsize,
        attempts: AtomicUsize,
    }

    impl FlakyStore {
        fn failing(n: usize) -> Self {
            Self {
                failures: AtomicUsize::new(n),
                ..Default::default()
            }
        }
    }

    impl EventStore for FlakyStore {
        async fn insert_event(&self, event: &Event) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                anyhow::bail!("store unavailable");
            }
            self.inner.insert_event(event).await
        }

        async fn site_stats(&self, site_id: &str, window: DayWindow) -> Result<SiteStats> {
            self.inner.site_stats(site_id, window).await
        }

        async fn top_paths(&self, site_id: &str, window: DayWindow) -> Result<Vec<PathViews>> {
            self.inner.top_paths(site_id, window).await
        }
    }

    fn sample_event() -> Event {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        Event::new("s1", "page_view", "/home", "u1", ts).unwrap()
    }

    fn processor_cfg(commit_interval: Duration) -> ProcessorConfig {
        ProcessorConfig {
            workers: 1,
            fetch_backoff: Duration::from_millis(10),
            commit_interval,
        }
    }

    async fn log_with_events(n: usize) -> MemoryLog {
        let log = MemoryLog::new(1);
        let producer = log.producer();
        for _ in 0..n {
            producer.append(codec::encode(&sample_event())).await.unwrap();
        }
        log
    }

    #[tokio::test]
    async fn test_idle_stops_when_cancelled() {
        let log = MemoryLog::new(1);
        let store = Arc::new(MemoryStore::new());
        let mut p = Processor::new(log.consumer("g"), store, &processor_cfg(Duration::ZERO));

        let cancel = CancellationToken::new();
        assert_eq!(p.step(State::Idle, &cancel).await, State::Fetching);

        cancel.cancel();
        assert_eq!(p.step(State::Idle, &cancel).await, State::Stopped);
    }

    #[tokio::test]
    async fn test_fetching_stops_on_cancel_without_messages() {
        let log = MemoryLog::new(1);
        let store = Arc::new(MemoryStore::new());
        let mut p = Processor::new(log.consumer("g"), store, &processor_cfg(Duration::ZERO));

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(p.step(State::Fetching, &cancel).await, State::Stopped);
    }

    #[tokio::test]
    async fn test_happy_path_transitions() {
        let log = log_with_events(1).await;
        let store = Arc::new(MemoryStore::new());
        let mut p = Processor::new(
            log.consumer("g"),
            Arc::clone(&store),
            &processor_cfg(Duration::ZERO),
        );
        let cancel = CancellationToken::new();

        let state = p.step(State::Fetching, &cancel).await;
        assert!(matches!(state, State::Decoding(_)));

        let state = p.step(state, &cancel).await;
        assert_eq!(
            state,
            State::Persisting {
                position: Position::new(0, 0),
                event: sample_event()
            }
        );

        let state = p.step(state, &cancel).await;
        assert_eq!(state, State::Committing(Position::new(0, 0)));
        assert_eq!(log.committed_offset("g", 0), None);

        let state = p.step(state, &cancel).await;
        assert_eq!(state, State::Idle);
        assert_eq!(log.committed_offset("g", 0), Some(0));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_message_is_dropped() {
        let log = MemoryLog::new(1);
        log.producer().append(b"{not json".to_vec()).await.unwrap();
        let store = Arc::new(MemoryStore::new());
        let health = Arc::new(HealthMetrics::new(":0").unwrap());
        let mut p = Processor::new(
            log.consumer("g"),
            Arc::clone(&store),
            &processor_cfg(Duration::ZERO),
        )
        .with_health(Arc::clone(&health));
        let cancel = CancellationToken::new();

        let state = p.step(State::Fetching, &cancel).await;
        assert_eq!(p.step(state, &cancel).await, State::Idle);

        assert!(store.is_empty());
        assert_eq!(log.committed_offset("g", 0), None);
        assert_eq!(
            health.decode_errors.with_label_values(&["malformed"]).get(),
            1.0
        );
    }

    #[tokio::test]
    async fn test_persist_failure_rewinds_without_commit() {
        let log = log_with_events(1).await;
        let store = Arc::new(FlakyStore::failing(1));
        let mut p = Processor::new(
            log.consumer("g"),
            Arc::clone(&store),
            &processor_cfg(Duration::ZERO),
        );
        let cancel = CancellationToken::new();

        let position = Position::new(0, 0);
        let state = p
            .step(
                State::Persisting {
                    position,
                    event: sample_event(),
                },
                &cancel,
            )
            .await;
        assert_eq!(state, State::Rewinding(position));
        assert_eq!(log.committed_offset("g", 0), None);

        // Consume the message once so the rewind is observable.
        let fetched = p.step(State::Fetching, &cancel).await;
        assert!(matches!(fetched, State::Decoding(ref m) if m.position == position));

        assert_eq!(p.step(state, &cancel).await, State::Idle);
        match p.step(State::Fetching, &cancel).await {
            State::Decoding(msg) => assert_eq!(msg.position, position),
            other => panic!("expected redelivery, got {other:?}"),
        }
        assert!(store.inner.is_empty());
    }

    #[tokio::test]
    async fn test_rewind_failure_backs_off_and_retries() {
        let log = MemoryLog::new(2);
        let store = Arc::new(MemoryStore::new());
        // Member 0 of 2 owns only partition 0.
        let mut p = Processor::new(
            log.consumer_for("g", 0, 2),
            store,
            &processor_cfg(Duration::ZERO),
        );
        let cancel = CancellationToken::new();

        let foreign = Position::new(1, 0);
        assert_eq!(
            p.step(State::Rewinding(foreign), &cancel).await,
            State::Rewinding(foreign)
        );

        cancel.cancel();
        assert_eq!(
            p.step(State::Rewinding(foreign), &cancel).await,
            State::Stopped
        );
    }

    #[tokio::test]
    async fn test_periodic_commit_defers_until_due() {
        let log = log_with_events(2).await;
        let store = Arc::new(MemoryStore::new());
        let mut p = Processor::new(
            log.consumer("g"),
            store,
            &processor_cfg(Duration::from_secs(3600)),
        );
        let cancel = CancellationToken::new();

        assert_eq!(
            p.step(State::Committing(Position::new(0, 0)), &cancel).await,
            State::Idle
        );
        assert_eq!(
            p.step(State::Committing(Position::new(0, 1)), &cancel).await,
            State::Idle
        );

        assert_eq!(p.pending_commits(), vec![Position::new(0, 1)]);
        assert_eq!(log.committed_offset("g", 0), None);
    }

    #[tokio::test]
    async fn test_run_flushes_pending_commits_on_shutdown() {
        let log = log_with_events(3).await;
        let store = Arc::new(MemoryStore::new());
        let p = Processor::new(
            log.consumer("g"),
            Arc::clone(&store),
            &processor_cfg(Duration::from_secs(3600)),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(p.run(cancel.clone()));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while store.len() < 3 {
            assert!(std::time::Instant::now() < deadline, "events not persisted");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(log.committed_offset("g", 0), Some(2));
    }

    #[tokio::test]
    async fn test_run_retries_until_persisted() {
        let log = log_with_events(1).await;
        let store = Arc::new(FlakyStore::failing(3));
        let p = Processor::new(
            log.consumer("g"),
            Arc::clone(&store),
            &processor_cfg(Duration::ZERO),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(p.run(cancel.clone()));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while log.committed_offset("g", 0).is_none() {
            assert!(std::time::Instant::now() < deadline, "offset never committed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(store.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(store.inner.len(), 1);
    }
}
