//! # Shard Workers
//!
//! Runs every shard on its own OS thread. A worker is the only writer of
//! its shard: it takes events off a bounded queue, applies them one at a
//! time and runs the gap check on a fixed tick.
//!
//! ```text
//! HTTP handler -> Pipeline::ingest -> Ingestor (validate, pause gate)
//!                                  -> ShardRouter -> queue -> worker thread -> Shard
//! ```
//!
//! Each worker thread drives a single-threaded runtime of its own, so blob
//! resolution blocks that worker and never the server runtime. Reads go
//! through the shared [`QueryService`] and never touch the queues.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use worldline_core::{
    IngestOutcome, IngestedEvent, Ingestor, QueryService, Registry, RegistryError, Shard,
    ShardRouter, SourceId, TransientError,
};

/// Events a shard queue holds before submitters wait for the worker.
pub const SHARD_QUEUE_DEPTH: usize = 256;

// =============================================================================
// CLOCK
// =============================================================================

/// Milliseconds since the pipeline started. Only drives gap timeouts;
/// nothing derived from it is ever stored in a version.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    start: Instant,
}

impl Clock {
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    #[must_use]
    pub fn now_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

// =============================================================================
// WORKER
// =============================================================================

struct Command {
    event: IngestedEvent,
    reply: oneshot::Sender<IngestOutcome>,
}

struct Worker {
    shard: Shard,
    clock: Clock,
}

impl Worker {
    fn ingest(&mut self, command: Command) {
        let outcome = self.shard.ingest(command.event, self.clock.now_ms());
        // The caller may have gone away; the event is applied either way.
        let _ = command.reply.send(outcome);
    }

    fn tick(&mut self) {
        let report = self.shard.tick(self.clock.now_ms());
        if !report.anomalies.is_empty() || report.discarded > 0 {
            tracing::debug!(
                shard = self.shard.index(),
                anomalies = report.anomalies.len(),
                applied = report.applied.len(),
                discarded = report.discarded,
                "gap check"
            );
        }
    }

    /// Serve the queue until shutdown is signalled or every sender is gone.
    /// Commands already queued at shutdown are still applied.
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut stop: watch::Receiver<bool>,
        tick: Duration,
    ) {
        let index = self.shard.index();
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::debug!(shard = index, "shard worker started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.ingest(command),
                    None => break,
                },
                _ = ticker.tick() => self.tick(),
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        commands.close();
                        while let Some(command) = commands.recv().await {
                            self.ingest(command);
                        }
                        break;
                    }
                }
            }
        }

        tracing::debug!(
            shard = index,
            buffered = self.shard.buffered(),
            "shard worker stopped"
        );
    }
}

// =============================================================================
// PIPELINE
// =============================================================================

/// The running write path of a server.
pub struct Pipeline {
    senders: Vec<mpsc::Sender<Command>>,
    stop: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    router: ShardRouter,
    ingestor: Arc<Ingestor>,
    query: QueryService,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("shards", &self.senders.len())
            .field("paused", &self.ingestor.paused_sources())
            .finish()
    }
}

impl Pipeline {
    /// Take a registry apart and start one worker thread per shard.
    pub fn start(registry: Registry, tick_interval_ms: u64) -> Result<Self, RegistryError> {
        let parts = registry.into_parts();
        let clock = Clock::start();
        let tick = Duration::from_millis(tick_interval_ms.max(1));
        let (stop, stop_rx) = watch::channel(false);

        let mut senders = Vec::with_capacity(parts.shards.len());
        let mut workers = Vec::with_capacity(parts.shards.len());
        for shard in parts.shards {
            let index = shard.index();
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .map_err(|e| RegistryError::Io(format!("cannot build shard runtime: {e}")))?;
            let (tx, rx) = mpsc::channel(SHARD_QUEUE_DEPTH);
            let worker = Worker { shard, clock };
            let stop_rx = stop_rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("shard-{index}"))
                .spawn(move || runtime.block_on(worker.run(rx, stop_rx, tick)))
                .map_err(|e| RegistryError::Io(format!("cannot spawn shard worker: {e}")))?;
            senders.push(tx);
            workers.push(handle);
        }

        tracing::info!(
            shards = senders.len(),
            tick_interval_ms,
            queue_depth = SHARD_QUEUE_DEPTH,
            "shard workers running"
        );

        Ok(Self {
            senders,
            stop,
            workers: Mutex::new(workers),
            router: parts.router,
            ingestor: parts.ingestor,
            query: parts.query,
        })
    }

    /// Validate, gate and hand an event to its shard's worker. Resolves
    /// once the worker has processed it.
    pub async fn ingest(&self, event: IngestedEvent) -> IngestOutcome {
        match self.submit(event).await {
            Ok(reply) => Self::await_reply(reply).await,
            Err(outcome) => outcome,
        }
    }

    /// Ingest a batch. Events are queued in order before any reply is
    /// awaited, so different shards work in parallel while per-worldline
    /// order is kept by the queues. A full queue holds the batch back until
    /// its worker catches up.
    pub async fn ingest_batch(
        &self,
        events: Vec<IngestedEvent>,
    ) -> Result<Vec<IngestOutcome>, RegistryError> {
        Ingestor::validate_batch(&events)?;
        let mut pending = Vec::with_capacity(events.len());
        for event in events {
            pending.push(self.submit(event).await);
        }

        let mut outcomes = Vec::with_capacity(pending.len());
        for submitted in pending {
            outcomes.push(match submitted {
                Ok(reply) => Self::await_reply(reply).await,
                Err(outcome) => outcome,
            });
        }
        Ok(outcomes)
    }

    async fn submit(
        &self,
        event: IngestedEvent,
    ) -> Result<oneshot::Receiver<IngestOutcome>, IngestOutcome> {
        if let Err(e) = self.ingestor.admit(&event) {
            tracing::warn!(event_id = %event.event_id, error = %e, "event refused");
            return Err(IngestOutcome::Rejected(e));
        }
        let index = self.router.route(&event.worldline);
        let (reply, rx) = oneshot::channel();
        self.senders[index]
            .send(Command { event, reply })
            .await
            .map_err(|_| Self::worker_gone())?;
        Ok(rx)
    }

    async fn await_reply(reply: oneshot::Receiver<IngestOutcome>) -> IngestOutcome {
        reply.await.unwrap_or_else(|_| Self::worker_gone())
    }

    fn worker_gone() -> IngestOutcome {
        IngestOutcome::Rejected(
            TransientError::StoreUnavailable("shard worker stopped".to_string()).into(),
        )
    }

    pub fn pause(&self, source: SourceId) -> bool {
        self.ingestor.pause(source)
    }

    pub fn resume(&self, source: &SourceId) -> bool {
        self.ingestor.resume(source)
    }

    #[must_use]
    pub fn paused_sources(&self) -> Vec<SourceId> {
        self.ingestor.paused_sources()
    }

    #[must_use]
    pub fn query(&self) -> &QueryService {
        &self.query
    }

    #[must_use]
    pub fn shards(&self) -> usize {
        self.senders.len()
    }

    /// Stop every worker and wait for it. Queued events are applied first.
    /// Events still buffered for a missing sequence are dropped; they were
    /// never marked seen, so the source can redeliver them.
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!("shard worker panicked");
            }
        }
        tracing::info!("shard workers stopped");
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use worldline_core::{
        Admission, ApplyResult, BlobResolver, ClassPolicy, EventPayload, FieldMask, GapPolicy,
        MemoryBlobStore, OrderingKey, PolicyTable, ShardConfig, WorldlineId,
    };

    fn pipeline(policy: GapPolicy, gap_timeout_ms: u64) -> Pipeline {
        let class = ClassPolicy::new("GOLD_VAULT", ["ORIGINATED", "ONCHAIN_ACTIVE"])
            .with_transition("ORIGINATED", "ONCHAIN_ACTIVE");
        let registry = Registry::in_memory(
            3,
            PolicyTable::from_policies([class]).unwrap(),
            BlobResolver::in_memory(Arc::new(MemoryBlobStore::new())),
            ShardConfig {
                gap_timeout_ms,
                ..ShardConfig::new(policy)
            },
        )
        .unwrap();
        Pipeline::start(registry, 5).unwrap()
    }

    fn activate(id: &WorldlineId, seq: u64) -> IngestedEvent {
        IngestedEvent {
            event_id: format!("act-{seq}").into(),
            worldline: id.clone(),
            ordering: OrderingKey::new("ledger", seq),
            timestamp: 10,
            payload: EventPayload::UpdateState {
                mask: FieldMask::phase_only(),
                blob: None,
                phase: Some("ONCHAIN_ACTIVE".into()),
            },
        }
    }

    #[tokio::test]
    async fn ingest_goes_through_worker() {
        let pipeline = pipeline(GapPolicy::Hold, 1_000);
        let create = IngestedEvent::create("c-1", "ledger", 1, "GOLD_VAULT", "SKR-1", "0,0");
        let id = create.worldline.clone();

        let outcome = pipeline.ingest(create.clone()).await;
        assert_eq!(outcome.reports().len(), 1);
        assert!(pipeline.ingest(create).await.is_deduplicated());

        let current = pipeline.query().get_current(&id).unwrap();
        assert_eq!(current.version.phase.as_str(), "ORIGINATED");
        pipeline.shutdown();
    }

    #[tokio::test]
    async fn batch_keeps_per_worldline_order() {
        let pipeline = pipeline(GapPolicy::Hold, 1_000);
        let create = IngestedEvent::create("c-1", "ledger", 1, "GOLD_VAULT", "SKR-1", "0,0");
        let id = create.worldline.clone();

        let outcomes = pipeline
            .ingest_batch(vec![create, activate(&id, 1)])
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        match &outcomes[1] {
            IngestOutcome::Accepted(Admission::Applied(reports)) => {
                assert!(matches!(reports[0].result, ApplyResult::Applied(_)));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(pipeline.query().get_history(&id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn batch_deeper_than_queue_completes() {
        let pipeline = pipeline(GapPolicy::Hold, 1_000);
        let create = IngestedEvent::create("c-1", "ledger", 1, "GOLD_VAULT", "SKR-1", "0,0");
        let id = create.worldline.clone();

        let updates = 2 * SHARD_QUEUE_DEPTH as u64;
        let mut events = vec![create];
        events.extend((1..=updates).map(|seq| activate(&id, seq)));

        let outcomes = pipeline.ingest_batch(events).await.unwrap();
        assert_eq!(outcomes.len(), SHARD_QUEUE_DEPTH * 2 + 1);
        assert!(
            outcomes
                .iter()
                .all(|outcome| matches!(outcome, IngestOutcome::Accepted(Admission::Applied(_))))
        );
        assert_eq!(
            pipeline.query().get_current(&id).unwrap().version.sequence,
            updates
        );
        pipeline.shutdown();
    }

    #[tokio::test]
    async fn paused_source_is_refused() {
        let pipeline = pipeline(GapPolicy::Hold, 1_000);
        assert!(pipeline.pause(SourceId::from("ledger")));
        let create = IngestedEvent::create("c-1", "ledger", 1, "GOLD_VAULT", "SKR-1", "0,0");
        assert!(matches!(
            pipeline.ingest(create.clone()).await,
            IngestOutcome::Rejected(RegistryError::SourcePaused(_))
        ));

        assert!(pipeline.resume(&SourceId::from("ledger")));
        assert_eq!(pipeline.ingest(create).await.reports().len(), 1);
    }

    #[tokio::test]
    async fn worker_ticks_report_gaps() {
        let pipeline = pipeline(GapPolicy::Hold, 10);
        let create = IngestedEvent::create("c-1", "ledger", 1, "GOLD_VAULT", "SKR-1", "0,0");
        let id = create.worldline.clone();
        pipeline.ingest(create).await;

        let outcome = pipeline.ingest(activate(&id, 2)).await;
        assert!(matches!(
            outcome,
            IngestOutcome::Accepted(Admission::Buffered { awaiting: 1 })
        ));

        let mut anomalies = Vec::new();
        for _ in 0..200 {
            anomalies = pipeline.query().anomalies().unwrap();
            if !anomalies.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!anomalies.is_empty());
        pipeline.shutdown();
    }

    #[tokio::test]
    async fn ingest_after_shutdown_is_transient() {
        let pipeline = pipeline(GapPolicy::Hold, 1_000);
        pipeline.shutdown();
        let create = IngestedEvent::create("c-1", "ledger", 1, "GOLD_VAULT", "SKR-1", "0,0");
        match pipeline.ingest(create).await {
            IngestOutcome::Rejected(e) => assert!(e.is_transient()),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn clock_is_monotonic() {
        let clock = Clock::start();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
    }
}
