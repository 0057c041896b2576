//! The per-dataset pipeline: one sequential loop from cursor to checkpoint.
//!
//! # Startup
//! 1. Refuse to start if the checkpoint carries a recorded failure.
//! 2. Resolve the manifest, register the graph schema, converge the two
//!    stores with [`BlockCommitter::recover`].
//! 3. Align stores with the checkpoint: stores ahead are reverted to it, a
//!    checkpoint ahead of the stores is fatal.
//! 4. Verify the resumed block is still canonical.
//!
//! # Loop
//! For each block the cursor hands out: fetch its events, match them against
//! the manifest, run the mapping, commit both stores, then accept the block
//! in the cursor and (interval-gated) persist the checkpoint. Reorgs revert
//! both stores to the common ancestor and rewind the cursor before the new
//! branch is replayed.
//!
//! Shutdown is observed only between blocks.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use blockgraph_core::checkpoint::{CheckpointManager, CheckpointStore};
use blockgraph_core::commit::BlockCommitter;
use blockgraph_core::config::{DatasetState, DatasetStatus, DeepReorgPolicy, PipelineConfig};
use blockgraph_core::cursor::ChainCursor;
use blockgraph_core::error::IndexerError;
use blockgraph_core::manifest::{Manifest, ManifestResolver};
use blockgraph_core::mapping::{MappingExecutor, MatchedEvent};
use blockgraph_core::reorg::{Outcome, ReorgEvent};
use blockgraph_core::retry::RetryPolicy;
use blockgraph_core::source::BlockSource;
use blockgraph_core::store::{EntityStore, GraphStore, StageOutcome};
use blockgraph_core::types::{Block, BlockId, BlockPtr};

/// Per-dataset status, shared between pipelines and whoever reports on them.
pub type StatusMap = Arc<DashMap<String, DatasetStatus>>;

/// The collaborators a pipeline runs against.
pub struct PipelineParts {
    pub source: Arc<dyn BlockSource>,
    pub resolver: Arc<dyn ManifestResolver>,
    pub mapping: Arc<dyn MappingExecutor>,
    pub entities: Arc<dyn EntityStore>,
    pub graph: Arc<dyn GraphStore>,
    pub checkpoints: Box<dyn CheckpointStore>,
}

/// State that exists once startup succeeded.
struct Session {
    manifest: Manifest,
    committer: BlockCommitter,
    cursor: ChainCursor,
}

/// Ingests one dataset.
pub struct DatasetPipeline {
    config: PipelineConfig,
    source: Arc<dyn BlockSource>,
    resolver: Arc<dyn ManifestResolver>,
    mapping: Arc<dyn MappingExecutor>,
    entities: Arc<dyn EntityStore>,
    graph: Arc<dyn GraphStore>,
    checkpoints: CheckpointManager,
    retry: RetryPolicy,
    status: StatusMap,
}

impl DatasetPipeline {
    pub fn new(config: PipelineConfig, parts: PipelineParts) -> Result<Self, IndexerError> {
        config.validate()?;
        let checkpoints = CheckpointManager::new(parts.checkpoints, config.id.clone(), config.checkpoint_interval);
        let status: StatusMap = Arc::new(DashMap::new());
        status.insert(config.id.clone(), DatasetStatus::new(config.id.clone()));
        Ok(Self {
            retry: RetryPolicy::new(config.retry.clone()),
            source: parts.source,
            resolver: parts.resolver,
            mapping: parts.mapping,
            entities: parts.entities,
            graph: parts.graph,
            checkpoints,
            status,
            config,
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Publish status into `status` instead of the pipeline's own map.
    pub fn with_status(mut self, status: StatusMap) -> Self {
        status.insert(self.config.id.clone(), DatasetStatus::new(self.config.id.clone()));
        self.status = status;
        self
    }

    pub fn status(&self) -> DatasetStatus {
        self.status
            .get(&self.config.id)
            .map(|s| s.clone())
            .unwrap_or_else(|| DatasetStatus::new(self.config.id.clone()))
    }

    pub fn status_map(&self) -> StatusMap {
        self.status.clone()
    }

    /// Run until shutdown, the stop block, or a fatal error.
    ///
    /// Dataset-fatal errors are recorded with the checkpoint before being
    /// returned, so the dataset stays halted across restarts.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), IndexerError> {
        let result = self.run_inner(&mut shutdown).await;
        match &result {
            Ok(()) => {
                self.set_state(DatasetState::Stopped);
                info!(dataset = %self.config.id, "Pipeline stopped");
            }
            Err(IndexerError::Aborted { reason }) => {
                self.set_state(DatasetState::Stopped);
                info!(dataset = %self.config.id, reason, "Pipeline aborted");
            }
            Err(IndexerError::DatasetFailed { reason, .. }) => {
                self.set_failed(reason.clone());
            }
            Err(e) => {
                error!(dataset = %self.config.id, error = %e, "Pipeline failed");
                let reason = e.to_string();
                if let Err(record) = self.checkpoints.record_failure(&reason).await {
                    error!(dataset = %self.config.id, error = %record, "Could not record failure");
                }
                self.set_failed(reason);
            }
        }
        result
    }

    async fn run_inner(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), IndexerError> {
        let mut session = loop {
            match self.start().await {
                Ok(session) => break session,
                Err(e) if source_unavailable(&e) => {
                    warn!(dataset = %self.config.id, error = %e, "Block source unavailable during startup, stalling");
                    if !self.pause(shutdown).await {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e),
            }
        };
        let result = self.sync(&mut session, shutdown).await;
        if result.is_ok() {
            if let Some(snapshot) = session.cursor.snapshot() {
                self.checkpoints.persist(&snapshot).await?;
            }
        }
        result
    }

    // ─── Startup ─────────────────────────────────────────────────────────────

    async fn start(&mut self) -> Result<Session, IndexerError> {
        self.set_state(DatasetState::Starting);
        let id = self.config.id.clone();

        let checkpoint = self.checkpoints.checkpoint().await?;
        if let Some(reason) = checkpoint.as_ref().and_then(|cp| cp.fatal_error.clone()) {
            warn!(dataset = %id, reason, "Dataset has a recorded failure, not starting");
            return Err(IndexerError::DatasetFailed { dataset: id, reason });
        }

        let manifest = {
            let resolver = &self.resolver;
            let address = self.config.manifest.as_str();
            self.retry
                .run("resolve manifest", || async move { resolver.resolve(address).await })
                .await?
        };
        let start_block = self.config.start_block.unwrap_or_else(|| manifest.start_block());

        {
            let graph = &self.graph;
            let manifest = &manifest;
            self.retry
                .run("ensure schema", || async move { graph.ensure_schema(manifest).await.map_err(IndexerError::from) })
                .await?;
        }

        let committer = BlockCommitter::new(self.entities.clone(), self.graph.clone(), &manifest);
        let head = {
            let committer = &committer;
            self.retry
                .run("recover stores", || async move { committer.recover().await.map_err(IndexerError::from) })
                .await?
        };

        let cursor = match checkpoint.and_then(|cp| cp.cursor) {
            Some(saved) => {
                let at = saved.ptr();
                if head.as_ref().map_or(true, |h| h.number < at.number) {
                    return Err(IndexerError::CheckpointMismatch {
                        checkpoint: at.number,
                        stores: head.map(|h| h.number),
                    });
                }
                if head.as_ref() != Some(&at) {
                    info!(dataset = %id, checkpoint = %at, "Reverting stores to checkpoint");
                    self.revert(&committer, at.number).await?;
                    let (entities, _) = committer.heads().await?;
                    if entities.as_ref() != Some(&at) {
                        return Err(IndexerError::CheckpointMismatch {
                            checkpoint: at.number,
                            stores: entities.map(|h| h.number),
                        });
                    }
                }
                info!(dataset = %id, block = %at, "Resuming from checkpoint");
                ChainCursor::resume(self.source.clone(), start_block, self.config.window_size, saved)
            }
            None => self.fresh_cursor(&committer, head, start_block).await?,
        };

        let mut session = Session {
            manifest,
            committer,
            cursor,
        };

        let verified = {
            let cursor = &session.cursor;
            self.retry
                .run("verify checkpoint", || async move { cursor.verify_canonical().await.map_err(IndexerError::from) })
                .await?
        };
        self.handle_outcome(&mut session, verified).await?;

        self.set_head(session.cursor.last_processed().map(Block::ptr));
        info!(
            dataset = %id,
            next = session.cursor.next_number(),
            window = self.config.window_size,
            "Pipeline started"
        );
        Ok(session)
    }

    /// Cursor for a dataset without a checkpoint. Anything the stores hold
    /// was never checkpointed and is reverted.
    async fn fresh_cursor(
        &self,
        committer: &BlockCommitter,
        head: Option<BlockPtr>,
        start_block: u64,
    ) -> Result<ChainCursor, IndexerError> {
        let mut cursor = ChainCursor::new(self.source.clone(), start_block, self.config.window_size);
        let Some(head) = head else {
            return Ok(cursor);
        };
        warn!(dataset = %self.config.id, stores = %head, "Stores hold blocks without a checkpoint, reverting");
        if start_block > 0 {
            self.revert(committer, start_block - 1).await?;
            return Ok(cursor);
        }

        // Nothing sits below genesis: keep block 0 and resume from it.
        self.revert(committer, 0).await?;
        let (genesis, _) = committer.heads().await?;
        if let Some(genesis) = genesis {
            let block = self
                .source
                .get_block(&BlockId::Hash(genesis.hash.clone()))
                .await?
                .ok_or_else(|| IndexerError::CheckpointMismatch {
                    checkpoint: 0,
                    stores: Some(genesis.number),
                })?;
            cursor.reset_to(block);
        }
        Ok(cursor)
    }

    // ─── Main loop ───────────────────────────────────────────────────────────

    async fn sync(&mut self, session: &mut Session, shutdown: &mut watch::Receiver<bool>) -> Result<(), IndexerError> {
        loop {
            if *shutdown.borrow() {
                info!(dataset = %self.config.id, "Shutdown requested");
                return Ok(());
            }
            if self.reached_stop(session) {
                info!(dataset = %self.config.id, stop = ?self.config.stop_block, "Stop block reached");
                return Ok(());
            }

            let outcome = {
                let cursor = &session.cursor;
                self.retry
                    .run("advance cursor", || async move { cursor.advance().await.map_err(IndexerError::from) })
                    .await
            };
            let handled = match outcome {
                Ok(Outcome::UpToDate) => {
                    self.set_state(DatasetState::Live);
                    if !self.pause(shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
                Ok(outcome) => self.handle_outcome(session, outcome).await,
                Err(e) => Err(e),
            };
            match handled {
                Ok(()) => {}
                Err(e) if source_unavailable(&e) => {
                    // The cursor only moves after a commit, so the same block
                    // is fetched again once the endpoint is back.
                    warn!(dataset = %self.config.id, error = %e, "Block source unavailable, stalling");
                    if !self.pause(shutdown).await {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn reached_stop(&self, session: &Session) -> bool {
        match (self.config.stop_block, session.cursor.last_processed()) {
            (Some(stop), Some(last)) => last.number >= stop,
            _ => false,
        }
    }

    /// Sleep for the poll interval. Returns `false` if shutdown was signalled.
    async fn pause(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        tokio::select! {
            _ = tokio::time::sleep(interval) => true,
            changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
        }
    }

    async fn handle_outcome(&mut self, session: &mut Session, outcome: Outcome) -> Result<(), IndexerError> {
        match outcome {
            Outcome::UpToDate => Ok(()),
            Outcome::NextBlock(block) => {
                self.set_state(DatasetState::Syncing);
                self.process_block(session, block).await
            }
            Outcome::Reorg(event) => self.handle_reorg(session, event).await,
            Outcome::DeepReorg {
                last_processed,
                oldest_retained,
            } => self.handle_deep_reorg(session, last_processed, oldest_retained).await,
        }
    }

    async fn process_block(&mut self, session: &mut Session, block: Block) -> Result<(), IndexerError> {
        let ptr = block.ptr();

        let events = {
            let source = &self.source;
            let ptr = &ptr;
            self.retry
                .run("fetch events", || async move { source.get_events(ptr).await.map_err(IndexerError::from) })
                .await?
        };
        let matched: Vec<MatchedEvent> = events
            .into_iter()
            .filter_map(|event| {
                let handler = session.manifest.handler_for(&event)?.handler.clone();
                Some(MatchedEvent { handler, event })
            })
            .collect();

        let ops = self.mapping.apply(&block, &matched)?;

        let outcome = {
            let committer = &session.committer;
            let (ptr, ops) = (&ptr, ops.as_slice());
            self.retry
                .run("commit block", || async move { committer.commit(ptr, ops).await.map_err(IndexerError::from) })
                .await?
        };
        if outcome == StageOutcome::AlreadyCommitted {
            debug!(dataset = %self.config.id, block = %ptr, "Block was already committed");
        }

        session
            .cursor
            .accept(block)
            .map_err(|e| IndexerError::Other(format!("cursor rejected committed block {ptr}: {e}")))?;
        if let Some(snapshot) = session.cursor.snapshot() {
            self.checkpoints.maybe_persist(&snapshot).await?;
        }
        self.set_head(Some(ptr.clone()));
        debug!(
            dataset = %self.config.id,
            block = %ptr,
            events = matched.len(),
            ops = ops.len(),
            "Block processed"
        );
        Ok(())
    }

    async fn handle_reorg(&mut self, session: &mut Session, event: ReorgEvent) -> Result<(), IndexerError> {
        self.set_state(DatasetState::ReorgRecovery);
        warn!(
            dataset = %self.config.id,
            depth = event.depth,
            ancestor = %event.revert_to,
            replay_from = event.replay_from,
            "Reverting to common ancestor"
        );
        self.revert(&session.committer, event.revert_to.number).await?;
        let dropped = session.cursor.rewind_to(&event.revert_to);
        if let Some(snapshot) = session.cursor.snapshot() {
            self.checkpoints.persist(&snapshot).await?;
        }
        self.set_head(Some(event.revert_to));
        debug!(dataset = %self.config.id, dropped = dropped.len(), "Cursor rewound");
        Ok(())
    }

    async fn handle_deep_reorg(
        &mut self,
        session: &mut Session,
        last_processed: BlockPtr,
        oldest_retained: u64,
    ) -> Result<(), IndexerError> {
        let DeepReorgPolicy::Rebootstrap { finality_depth } = self.config.deep_reorg_policy else {
            return Err(IndexerError::DeepReorg {
                last_processed: last_processed.number,
                oldest_retained,
            });
        };

        self.set_state(DatasetState::ReorgRecovery);
        let depth = finality_depth.max(self.config.window_size as u64);
        let target = last_processed.number.saturating_sub(depth);
        // Fetched before anything is reverted, so an unreachable endpoint
        // leaves the stores untouched.
        let mut canonical = self.canonical_block(target).await?;
        warn!(
            dataset = %self.config.id,
            last = %last_processed,
            target,
            "Reorg deeper than window, re-bootstrapping"
        );
        self.revert(&session.committer, target).await?;

        let (head, _) = session.committer.heads().await?;
        match head {
            Some(head) => {
                if canonical.number != head.number {
                    canonical = self.canonical_block(head.number).await?;
                }
                if canonical.hash != head.hash {
                    warn!(
                        dataset = %self.config.id,
                        stores = %head,
                        canonical = %canonical.hash,
                        "Stores diverge from the canonical chain below the finality depth"
                    );
                }
                session.cursor.reset_to(canonical);
                if let Some(snapshot) = session.cursor.snapshot() {
                    self.checkpoints.persist(&snapshot).await?;
                }
            }
            None => {
                let start_block = self
                    .config
                    .start_block
                    .unwrap_or_else(|| session.manifest.start_block());
                session.cursor = ChainCursor::new(self.source.clone(), start_block, self.config.window_size);
                self.checkpoints.delete().await?;
            }
        }
        self.set_head(session.cursor.last_processed().map(Block::ptr));
        Ok(())
    }

    async fn canonical_block(&self, number: u64) -> Result<Block, IndexerError> {
        let source = &self.source;
        self.retry
            .run("fetch canonical block", || async move {
                source.get_block(&BlockId::Number(number)).await.map_err(IndexerError::from)
            })
            .await?
            .ok_or_else(|| IndexerError::Other(format!("canonical block {number} not found")))
    }

    async fn revert(&self, committer: &BlockCommitter, block: u64) -> Result<(), IndexerError> {
        self.retry
            .run("revert stores", || async move { committer.revert_to(block).await.map_err(IndexerError::from) })
            .await
    }

    // ─── Status ──────────────────────────────────────────────────────────────

    fn set_state(&self, state: DatasetState) {
        if let Some(mut status) = self.status.get_mut(&self.config.id) {
            status.state = state;
        }
    }

    fn set_head(&self, head: Option<BlockPtr>) {
        if let Some(mut status) = self.status.get_mut(&self.config.id) {
            status.head = head;
        }
    }

    fn set_failed(&self, reason: String) {
        if let Some(mut status) = self.status.get_mut(&self.config.id) {
            status.state = DatasetState::Failed;
            status.fatal_error = Some(reason);
        }
    }
}

/// A source failure that outlived the retry budget. The pipeline waits it
/// out instead of failing the dataset.
fn source_unavailable(e: &IndexerError) -> bool {
    matches!(e, IndexerError::Source(source) if source.is_retryable())
}

impl std::fmt::Debug for DatasetPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetPipeline")
            .field("id", &self.config.id)
            .field("manifest", &self.config.manifest)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use blockgraph_core::checkpoint::MemoryCheckpointStore;
    use blockgraph_core::entity::{fields, EntityKey};
    use blockgraph_core::error::SourceError;
    use blockgraph_core::manifest::StaticManifestResolver;
    use blockgraph_core::mapping::HandlerMapping;
    use blockgraph_core::memory::{InMemoryEntityStore, InMemoryGraphStore};
    use blockgraph_core::retry::RetryConfig;
    use blockgraph_core::source::InMemoryChain;
    use blockgraph_core::store::BlockStore;
    use blockgraph_core::types::ChainEvent;

    const MANIFEST: &str = r#"{
        "name": "blocks",
        "data_sources": [{
            "name": "Any",
            "event_handlers": [{ "event": "Ping()", "topic0": "0xping", "handler": "handlePing" }]
        }],
        "entities": [{ "name": "Ping" }]
    }"#;

    struct Fixture {
        chain: Arc<InMemoryChain>,
        entities: Arc<InMemoryEntityStore>,
        graph: Arc<InMemoryGraphStore>,
        checkpoints: Arc<MemoryCheckpointStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                chain: Arc::new(InMemoryChain::new()),
                entities: Arc::new(InMemoryEntityStore::new("pings")),
                graph: Arc::new(InMemoryGraphStore::new("pings")),
                checkpoints: Arc::new(MemoryCheckpointStore::new()),
            }
        }

        fn pipeline(&self, config: PipelineConfig) -> DatasetPipeline {
            self.pipeline_over(self.chain.clone(), config)
        }

        fn pipeline_over(&self, source: Arc<dyn BlockSource>, config: PipelineConfig) -> DatasetPipeline {
            let resolver = StaticManifestResolver::new().with("QmPings", Manifest::from_json(MANIFEST).unwrap());
            let mapping = HandlerMapping::new().on("handlePing", |ctx, event| {
                let id = format!("{}-{}", event.block_number, event.log_index);
                ctx.create(EntityKey::new("Ping", id), fields([("block", ctx.block().number)]));
                Ok(())
            });
            DatasetPipeline::new(
                config,
                PipelineParts {
                    source,
                    resolver: Arc::new(resolver),
                    mapping: Arc::new(mapping),
                    entities: self.entities.clone(),
                    graph: self.graph.clone(),
                    checkpoints: Box::new(self.checkpoints.clone()),
                },
            )
            .unwrap()
        }

        fn ping(&self, block_hash: &str) {
            self.chain.add_event(
                block_hash,
                ChainEvent {
                    address: "0xAny".into(),
                    topics: vec!["0xping".into()],
                    data: "0x".into(),
                    tx_hash: "0x01".into(),
                    block_number: 0,
                    log_index: 0,
                },
            );
        }
    }

    /// Serves `chain`, but the next `failures` event fetches time out.
    struct FlakyEvents {
        chain: Arc<InMemoryChain>,
        failures: AtomicU32,
    }

    #[async_trait]
    impl BlockSource for FlakyEvents {
        async fn get_head(&self) -> Result<Block, SourceError> {
            self.chain.get_head().await
        }

        async fn get_block(&self, id: &BlockId) -> Result<Option<Block>, SourceError> {
            self.chain.get_block(id).await
        }

        async fn get_events(&self, block: &BlockPtr) -> Result<Vec<ChainEvent>, SourceError> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(SourceError::Transient("timeout".into()));
            }
            self.chain.get_events(block).await
        }
    }

    fn config(stop: u64) -> PipelineConfig {
        PipelineConfig {
            id: "pings".into(),
            manifest: "QmPings".into(),
            start_block: Some(1),
            stop_block: Some(stop),
            window_size: 8,
            checkpoint_interval: 2,
            poll_interval_ms: 5,
            retry: RetryConfig {
                max_retries: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                multiplier: 2.0,
            },
            ..PipelineConfig::default()
        }
    }

    #[tokio::test]
    async fn runs_to_stop_block_and_checkpoints() {
        let fx = Fixture::new();
        let blocks = fx.chain.extend(5, "a");
        fx.ping(&blocks[2].hash);

        let (_tx, rx) = watch::channel(false);
        let pipeline = fx.pipeline(config(5));
        let status = pipeline.status_map();
        pipeline.run(rx).await.unwrap();

        assert_eq!(fx.entities.head().await.unwrap(), Some(blocks[4].ptr()));
        assert_eq!(fx.graph.head().await.unwrap(), Some(blocks[4].ptr()));
        assert_eq!(fx.entities.entity_count(5).await.unwrap(), 1);

        let cp = fx.checkpoints.load("pings").await.unwrap().unwrap();
        assert_eq!(cp.block_number(), Some(5));
        assert_eq!(status.get("pings").unwrap().state, DatasetState::Stopped);
    }

    #[tokio::test]
    async fn event_fetch_outage_stalls_instead_of_failing() {
        let fx = Fixture::new();
        let blocks = fx.chain.extend(3, "a");
        fx.ping(&blocks[1].hash);
        // More failures than one retry budget (max_retries = 3) absorbs.
        let source = Arc::new(FlakyEvents {
            chain: fx.chain.clone(),
            failures: AtomicU32::new(5),
        });

        let (_tx, rx) = watch::channel(false);
        let pipeline = fx.pipeline_over(source.clone(), config(3));
        let status = pipeline.status_map();
        tokio::time::timeout(Duration::from_secs(5), pipeline.run(rx))
            .await
            .expect("pipeline did not recover from the outage")
            .unwrap();

        assert_eq!(source.failures.load(Ordering::SeqCst), 0);
        assert_eq!(fx.entities.head().await.unwrap(), Some(blocks[2].ptr()));
        assert_eq!(fx.graph.head().await.unwrap(), Some(blocks[2].ptr()));
        assert_eq!(fx.entities.entity_count(3).await.unwrap(), 1);

        let cp = fx.checkpoints.load("pings").await.unwrap().unwrap();
        assert_eq!(cp.fatal_error, None);
        assert_eq!(cp.block_number(), Some(3));
        let status = status.get("pings").unwrap().clone();
        assert_eq!(status.state, DatasetState::Stopped);
        assert_eq!(status.fatal_error, None);
    }

    #[tokio::test]
    async fn refuses_to_start_with_recorded_failure() {
        let fx = Fixture::new();
        fx.chain.extend(3, "a");
        let mgr = CheckpointManager::new(Box::new(fx.checkpoints.clone()), "pings", 1);
        mgr.record_failure("mapping error").await.unwrap();

        let (_tx, rx) = watch::channel(false);
        let err = fx.pipeline(config(3)).run(rx).await.unwrap_err();
        assert!(matches!(err, IndexerError::DatasetFailed { .. }));
        assert_eq!(fx.entities.head().await.unwrap(), None);

        assert!(mgr.clear_failure().await.unwrap());
        let (_tx, rx) = watch::channel(false);
        fx.pipeline(config(3)).run(rx).await.unwrap();
        assert_eq!(fx.entities.head().await.unwrap().map(|h| h.number), Some(3));
    }

    #[tokio::test]
    async fn checkpoint_ahead_of_stores_is_fatal() {
        let fx = Fixture::new();
        let blocks = fx.chain.extend(3, "a");
        let mut mgr = CheckpointManager::new(Box::new(fx.checkpoints.clone()), "pings", 1);
        mgr.persist(&blockgraph_core::cursor::Cursor {
            last_processed_block: blocks[2].clone(),
            segment: vec![blocks[2].clone()],
        })
        .await
        .unwrap();

        let (_tx, rx) = watch::channel(false);
        let err = fx.pipeline(config(3)).run(rx).await.unwrap_err();
        assert!(matches!(err, IndexerError::CheckpointMismatch { checkpoint: 3, stores: None }));
        let cp = fx.checkpoints.load("pings").await.unwrap().unwrap();
        assert!(cp.fatal_error.is_some());
    }

    #[tokio::test]
    async fn shutdown_stops_a_live_pipeline() {
        let fx = Fixture::new();
        fx.chain.extend(2, "a");
        let (tx, rx) = watch::channel(false);
        let mut cfg = config(0);
        cfg.stop_block = None;
        cfg.checkpoint_interval = PipelineConfig::default().checkpoint_interval;
        let pipeline = fx.pipeline(cfg);
        let status = pipeline.status_map();
        let task = tokio::spawn(pipeline.run(rx));

        while fx.entities.head().await.unwrap().map(|h| h.number) != Some(2) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        // Saved after the commit itself, not only on shutdown.
        let cp = fx.checkpoints.load("pings").await.unwrap().unwrap();
        assert_eq!(cp.block_number(), Some(2));
        tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(status.get("pings").unwrap().state, DatasetState::Stopped);
        let cp = fx.checkpoints.load("pings").await.unwrap().unwrap();
        assert_eq!(cp.block_number(), Some(2));
    }
}
