//! The public entry point: fans batches of attachments out to every ready
//! backend and folds their job events into one task table, one result cache
//! and one outbound event stream.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::ResultCache;
use crate::events::{EventBus, OcrEvent};
use crate::indicators::{Indicator, IndicatorExtractor};
use crate::ocr::{OcrBackend, OcrInput};
use crate::queue::{Job, JobEvent, JobEventKind, JobListener, JobQueue};
use crate::store::{ImageStore, ReadError};
use crate::task::{ProgressAggregate, Task, TaskId, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Processing,
    Complete,
}

#[derive(Debug)]
struct Batch {
    tasks: HashSet<TaskId>,
    state: BatchState,
    /// Final progress, kept once the batch's tasks leave the live table.
    settled: Option<ProgressAggregate>,
}

impl Batch {
    fn new() -> Self {
        Self {
            tasks: HashSet::new(),
            state: BatchState::Processing,
            settled: None,
        }
    }
}

struct State {
    /// Bumped on every effective cancel; job events from older generations
    /// are discarded.
    generation: u64,
    token: CancellationToken,
    tasks: HashMap<TaskId, Task>,
    batches: HashMap<String, Batch>,
    cache: ResultCache,
}

impl State {
    fn aggregate(&self) -> ProgressAggregate {
        ProgressAggregate::from_tasks(self.tasks.values())
    }

    /// Progress over the tasks admitted for one batch. Other batches sharing
    /// the live table do not affect it.
    fn batch_aggregate(&self, batch_id: &str) -> ProgressAggregate {
        match self.batches.get(batch_id) {
            Some(Batch {
                settled: Some(progress),
                ..
            }) => *progress,
            Some(batch) => {
                ProgressAggregate::from_tasks(batch.tasks.iter().filter_map(|id| self.tasks.get(id)))
            }
            None => ProgressAggregate::default(),
        }
    }

    fn aggregate_event(&self, batch_id: &str) -> OcrEvent {
        OcrEvent::Aggregate {
            batch_id: batch_id.to_string(),
            progress: self.batch_aggregate(batch_id),
        }
    }

    /// Drop tasks belonging to batches that already completed.
    fn prune_finished(&mut self) {
        let State { tasks, batches, .. } = self;
        for batch in batches.values_mut() {
            if batch.state == BatchState::Complete && batch.settled.is_none() {
                batch.settled = Some(ProgressAggregate::from_tasks(
                    batch.tasks.iter().filter_map(|id| tasks.get(id)),
                ));
                for id in batch.tasks.drain() {
                    tasks.remove(&id);
                }
            }
        }
    }

    /// Mark the batch complete if every admitted task is terminal. Returns
    /// true on the transition.
    fn settle_batch(&mut self, batch_id: &str) -> bool {
        let State { tasks, batches, .. } = self;
        let Some(batch) = batches.get_mut(batch_id) else {
            return false;
        };
        if batch.state == BatchState::Complete {
            return false;
        }
        let done = batch
            .tasks
            .iter()
            .all(|id| tasks.get(id).map_or(true, |t| t.status.is_terminal()));
        if done {
            batch.state = BatchState::Complete;
        }
        done
    }
}

struct Inner {
    store: Arc<dyn ImageStore>,
    extractor: Arc<dyn IndicatorExtractor>,
    queues: Mutex<Vec<JobQueue>>,
    state: Mutex<State>,
    events: EventBus,
}

/// Builder for [`Orchestrator`]. Backends are registered in the order given.
pub struct OrchestratorBuilder {
    store: Arc<dyn ImageStore>,
    extractor: Arc<dyn IndicatorExtractor>,
    backends: Vec<Arc<dyn OcrBackend>>,
    cache: ResultCache,
}

impl OrchestratorBuilder {
    pub fn backend(mut self, backend: Arc<dyn OcrBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn backends(mut self, backends: impl IntoIterator<Item = Arc<dyn OcrBackend>>) -> Self {
        self.backends.extend(backends);
        self
    }

    /// Start from an existing cache, e.g. results restored by the host.
    pub fn cache(mut self, cache: ResultCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn build(self) -> Orchestrator {
        let inner = Arc::new(Inner {
            store: self.store,
            extractor: self.extractor,
            queues: Mutex::new(Vec::new()),
            state: Mutex::new(State {
                generation: 0,
                token: CancellationToken::new(),
                tasks: HashMap::new(),
                batches: HashMap::new(),
                cache: self.cache,
            }),
            events: EventBus::new(),
        });

        let orchestrator = Orchestrator { inner };
        {
            let mut queues = orchestrator.inner.lock_queues();
            for backend in self.backends {
                if queues.iter().any(|q| q.backend_id() == backend.id()) {
                    warn!("Duplicate backend id '{}' ignored", backend.id());
                    continue;
                }
                queues.push(JobQueue::new(backend, orchestrator.listener()));
            }
        }
        orchestrator
    }
}

/// Cloning is cheap; clones share the same task table, cache and queues.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn builder(
        store: Arc<dyn ImageStore>,
        extractor: Arc<dyn IndicatorExtractor>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            store,
            extractor,
            backends: Vec::new(),
            cache: ResultCache::new(),
        }
    }

    fn listener(&self) -> JobListener {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Arc::new(move |event: JobEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.on_job_event(event);
            }
        })
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<OcrEvent> {
        self.inner.events.subscribe()
    }

    /// True if at least one registered backend is usable.
    pub fn is_ready(&self) -> bool {
        self.inner
            .lock_queues()
            .iter()
            .any(|q| q.backend().is_ready())
    }

    pub fn backend_ids(&self) -> Vec<String> {
        self.inner
            .lock_queues()
            .iter()
            .map(|q| q.backend_id().to_string())
            .collect()
    }

    /// Submit a batch. Tasks are created before this returns; reading and
    /// recognition run in the background and report through events.
    /// Files submitted under a batch id that is still processing join it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn process_attachments<I, S>(&self, batch_id: impl Into<String>, files: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let batch_id = batch_id.into();
        let mut seen = HashSet::new();
        let files: Vec<String> = files
            .into_iter()
            .map(Into::into)
            .filter(|f| seen.insert(f.clone()))
            .collect();

        let queues: Vec<JobQueue> = self
            .inner
            .lock_queues()
            .iter()
            .filter(|q| {
                let ready = q.backend().is_ready();
                if !ready {
                    debug!("Backend '{}' not ready, skipping for batch {}", q.backend_id(), batch_id);
                }
                ready
            })
            .cloned()
            .collect();

        let inner = &self.inner;
        let mut state = inner.lock_state();
        state.prune_finished();
        let token = state.token.clone();
        let generation = state.generation;

        let mut plan: Vec<(String, Vec<(JobQueue, TaskId)>)> = Vec::new();
        let mut admitted = Vec::new();
        let mut skipped = 0;
        for file_id in files {
            let mut units = Vec::new();
            for queue in &queues {
                let backend_id = queue.backend_id();
                if !state.cache.claim(&file_id, backend_id) {
                    debug!("Skipping '{}' on {}: cached or in flight", file_id, backend_id);
                    skipped += 1;
                    inner.events.publish(OcrEvent::Skipped {
                        file_id: file_id.clone(),
                        backend_id: backend_id.to_string(),
                    });
                    continue;
                }
                let task = Task::new(&batch_id, &file_id, backend_id);
                units.push((queue.clone(), task.id.clone()));
                admitted.push(task.id.clone());
                state.tasks.insert(task.id.clone(), task);
            }
            if !units.is_empty() {
                plan.push((file_id, units));
            }
        }

        info!(
            "Batch {}: {} tasks admitted across {} backends, {} skipped",
            batch_id,
            admitted.len(),
            queues.len(),
            skipped
        );

        let batch = state.batches.entry(batch_id.clone()).or_insert_with(Batch::new);
        batch.state = BatchState::Processing;
        batch.settled = None;
        batch.tasks.extend(admitted);

        inner.events.publish(state.aggregate_event(&batch_id));
        if state.settle_batch(&batch_id) {
            inner.events.publish(OcrEvent::BatchComplete { batch_id });
        }
        drop(state);

        if plan.is_empty() {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.read_and_enqueue(plan, generation, token).await });
    }

    /// Abort all outstanding work. Every non-terminal task becomes cancelled,
    /// the live table is cleared and the aggregate resets. Cached results are
    /// kept. Calling it with nothing in flight does nothing.
    pub fn cancel(&self) {
        let inner = &self.inner;
        let mut state = inner.lock_state();
        let open_batches = state
            .batches
            .values()
            .any(|b| b.state == BatchState::Processing);
        if state.tasks.is_empty() && !open_batches {
            return;
        }

        state.token.cancel();
        state.token = CancellationToken::new();
        state.generation += 1;

        let State {
            tasks,
            batches,
            cache,
            generation,
            ..
        } = &mut *state;

        let mut live: Vec<&mut Task> = tasks.values_mut().filter(|t| !t.status.is_terminal()).collect();
        live.sort_by(|a, b| a.id.cmp(&b.id));
        info!("Cancelling {} live tasks (generation {})", live.len(), generation);
        for task in live {
            task.cancel();
            cache.release(&task.file_id, &task.backend_id);
            inner.events.publish(OcrEvent::Cancelled {
                file_id: task.file_id.clone(),
                backend_id: task.backend_id.clone(),
            });
        }

        let mut closing: Vec<&String> = batches
            .iter()
            .filter(|(_, b)| b.state == BatchState::Processing)
            .map(|(id, _)| id)
            .collect();
        closing.sort();
        for batch_id in closing {
            inner.events.publish(OcrEvent::BatchComplete {
                batch_id: batch_id.clone(),
            });
            inner.events.publish(OcrEvent::Aggregate {
                batch_id: batch_id.clone(),
                progress: ProgressAggregate::default(),
            });
        }
        for batch in batches.values_mut() {
            if batch.settled.is_none() {
                batch.settled = Some(match batch.state {
                    BatchState::Processing => ProgressAggregate::default(),
                    BatchState::Complete => ProgressAggregate::from_tasks(
                        batch.tasks.iter().filter_map(|id| tasks.get(id)),
                    ),
                });
            }
            batch.state = BatchState::Complete;
            batch.tasks.clear();
        }

        tasks.clear();
    }

    /// Snapshot of the live task table in creation order.
    pub fn task_status(&self) -> Vec<Task> {
        let state = self.inner.lock_state();
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    /// Progress over the whole live task table.
    pub fn progress(&self) -> ProgressAggregate {
        self.inner.lock_state().aggregate()
    }

    /// Progress of one batch. `None` for a batch id never submitted.
    pub fn batch_progress(&self, batch_id: &str) -> Option<ProgressAggregate> {
        let state = self.inner.lock_state();
        state
            .batches
            .contains_key(batch_id)
            .then(|| state.batch_aggregate(batch_id))
    }

    /// `None` for a batch id never submitted.
    pub fn batch_state(&self, batch_id: &str) -> Option<BatchState> {
        self.inner
            .lock_state()
            .batches
            .get(batch_id)
            .map(|b| b.state)
    }

    /// Add a backend. An existing backend with the same id is removed first,
    /// without cancelling its in-flight work.
    pub async fn register_backend(&self, backend: Arc<dyn OcrBackend>) {
        let id = backend.id().to_string();
        if self.remove_backend(&id, false).await {
            info!("Replaced backend '{}'", id);
        } else {
            info!("Registered backend '{}' (limit {})", id, backend.concurrency_limit());
        }
        let queue = JobQueue::new(backend, self.listener());
        self.inner.lock_queues().push(queue);
    }

    /// Remove a backend. Its queued units are cancelled; in-flight units run to
    /// completion unless `cancel_in_flight` is set. Resolves after the backend
    /// is idle and has been shut down. Returns false for an unknown id.
    pub async fn remove_backend(&self, backend_id: &str, cancel_in_flight: bool) -> bool {
        let queue = {
            let mut queues = self.inner.lock_queues();
            match queues.iter().position(|q| q.backend_id() == backend_id) {
                Some(pos) => queues.remove(pos),
                None => return false,
            }
        };

        info!(
            "Removing backend '{}' ({} running, {} queued)",
            backend_id,
            queue.active_count(),
            queue.pending_count()
        );
        queue.close(cancel_in_flight);
        queue.wait_idle().await;
        queue.backend().shutdown().await;
        debug!("Backend '{}' shut down", backend_id);
        true
    }

    pub fn has_cached(&self, file_id: &str, backend_id: &str) -> bool {
        self.inner.lock_state().cache.has_cached(file_id, backend_id)
    }

    /// Cached results for one file, per backend.
    pub fn cached_indicators(&self, file_id: &str) -> Option<HashMap<String, Vec<Indicator>>> {
        self.inner.lock_state().cache.get(file_id).cloned()
    }

    /// Cached results for one file, merged across backends.
    pub fn merged_indicators(&self, file_id: &str) -> Vec<Indicator> {
        self.inner.lock_state().cache.merged(file_id)
    }

    /// Record a result obtained elsewhere. Returns false if one is already
    /// cached for the pair or the pair is being recognized right now; the
    /// running task's result then becomes the cached one.
    pub fn seed_cache(&self, file_id: &str, backend_id: &str, indicators: Vec<Indicator>) -> bool {
        let mut state = self.inner.lock_state();
        if state.cache.is_claimed(file_id, backend_id) {
            debug!("Not seeding '{}' on {}: task in flight", file_id, backend_id);
            return false;
        }
        state.cache.record(file_id, backend_id, indicators)
    }

    pub fn invalidate(&self, file_id: &str) -> bool {
        let removed = self.inner.lock_state().cache.invalidate(file_id);
        if removed {
            debug!("Invalidated cached results for '{}'", file_id);
        }
        removed
    }

    pub fn clear_cache(&self) {
        self.inner.lock_state().cache.clear();
        info!("Result cache cleared");
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_queues(&self) -> MutexGuard<'_, Vec<JobQueue>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn read_and_enqueue(
        self: Arc<Self>,
        plan: Vec<(String, Vec<(JobQueue, TaskId)>)>,
        generation: u64,
        token: CancellationToken,
    ) {
        for (file_id, units) in plan {
            if token.is_cancelled() {
                debug!("Batch cancelled before reading '{}'", file_id);
                return;
            }
            match self.store.read_binary(&file_id).await {
                Ok(data) => {
                    let input = OcrInput::new(file_id, data);
                    for (queue, task_id) in units {
                        queue.enqueue(Job {
                            task_id,
                            input: input.clone(),
                            generation,
                            token: token.clone(),
                        });
                    }
                }
                Err(e) => self.on_read_error(&file_id, units, generation, e),
            }
        }
    }

    /// A file that cannot be read gets no backend tasks: the ones admitted
    /// for it are withdrawn and a single error is reported.
    fn on_read_error(
        &self,
        file_id: &str,
        units: Vec<(JobQueue, TaskId)>,
        generation: u64,
        error: ReadError,
    ) {
        warn!("Failed to read attachment '{}': {}", file_id, error);
        let mut state = self.lock_state();
        if state.generation != generation {
            return;
        }

        let mut batch_ids = Vec::new();
        for (_, task_id) in units {
            let Some(task) = state.tasks.remove(&task_id) else {
                continue;
            };
            state.cache.release(&task.file_id, &task.backend_id);
            if let Some(batch) = state.batches.get_mut(&task.batch_id) {
                batch.tasks.remove(&task_id);
            }
            if !batch_ids.contains(&task.batch_id) {
                batch_ids.push(task.batch_id);
            }
        }

        self.events.publish(OcrEvent::Error {
            file_id: file_id.to_string(),
            backend_id: None,
            message: error.to_string(),
            retryable: matches!(error, ReadError::Io { .. }),
        });
        for batch_id in batch_ids {
            self.events.publish(state.aggregate_event(&batch_id));
            if state.settle_batch(&batch_id) {
                info!("Batch {} complete", batch_id);
                self.events.publish(OcrEvent::BatchComplete { batch_id });
            }
        }
    }

    fn on_job_event(&self, event: JobEvent) {
        let mut state = self.lock_state();
        if event.generation != state.generation {
            debug!(
                "Discarding stale {:?} for '{}' on {}",
                event.kind, event.file_id, event.backend_id
            );
            return;
        }

        let State { tasks, cache, .. } = &mut *state;
        let Some(task) = tasks.get_mut(&event.task_id) else {
            return;
        };
        let file_id = event.file_id;
        let backend_id = event.backend_id;

        match event.kind {
            JobEventKind::Started => {
                if !task.advance(TaskStatus::Processing) {
                    return;
                }
                self.events.publish(OcrEvent::Progress {
                    file_id,
                    backend_id,
                    percent: task.progress,
                });
            }
            JobEventKind::Progress(percent) => {
                if !task.set_progress(percent) {
                    return;
                }
                self.events.publish(OcrEvent::Progress {
                    file_id,
                    backend_id,
                    percent: task.progress,
                });
            }
            JobEventKind::Completed(text) => {
                let indicators = self.extractor.extract(&text);
                if !task.complete(text, indicators.clone()) {
                    return;
                }
                info!(
                    "{} recognized '{}': {} indicators",
                    backend_id,
                    file_id,
                    indicators.len()
                );
                cache.record(&file_id, &backend_id, indicators.clone());
                self.events.publish(OcrEvent::Progress {
                    file_id: file_id.clone(),
                    backend_id: backend_id.clone(),
                    percent: 100,
                });
                self.events.publish(OcrEvent::Result {
                    file_id,
                    backend_id,
                    indicators,
                });
            }
            JobEventKind::Failed { message, retryable } => {
                if !task.fail(message.clone(), retryable) {
                    return;
                }
                cache.release(&file_id, &backend_id);
                self.events.publish(OcrEvent::Error {
                    file_id,
                    backend_id: Some(backend_id),
                    message,
                    retryable,
                });
            }
            JobEventKind::Cancelled => {
                if !task.cancel() {
                    return;
                }
                cache.release(&file_id, &backend_id);
                self.events.publish(OcrEvent::Cancelled { file_id, backend_id });
            }
        }

        let batch_id = task.batch_id.clone();
        self.events.publish(state.aggregate_event(&batch_id));
        if state.settle_batch(&batch_id) {
            info!("Batch {} complete", batch_id);
            self.events.publish(OcrEvent::BatchComplete { batch_id });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::{OcrError, ProgressReporter};
    use std::time::Duration;

    struct MemoryStore(HashMap<String, Vec<u8>>);

    #[async_trait::async_trait]
    impl ImageStore for MemoryStore {
        async fn read_binary(&self, file_id: &str) -> Result<Vec<u8>, ReadError> {
            self.0
                .get(file_id)
                .cloned()
                .ok_or_else(|| ReadError::NotFound(file_id.to_string()))
        }
    }

    struct EchoBackend {
        id: &'static str,
        delay: Duration,
        ready: bool,
    }

    #[async_trait::async_trait]
    impl OcrBackend for EchoBackend {
        fn id(&self) -> &str {
            self.id
        }

        fn concurrency_limit(&self) -> usize {
            2
        }

        fn is_ready(&self) -> bool {
            self.ready
        }

        async fn recognize(
            &self,
            input: &OcrInput,
            progress: &ProgressReporter,
        ) -> Result<String, OcrError> {
            progress.report(50);
            tokio::time::sleep(self.delay).await;
            Ok(format!("ip 10.0.0.{}", input.data.len()))
        }
    }

    fn ip_extractor() -> Arc<dyn IndicatorExtractor> {
        Arc::new(|text: &str| {
            text.split_whitespace()
                .filter(|w| w.contains('.'))
                .map(|w| Indicator::new("ipv4", w))
                .collect::<Vec<_>>()
        })
    }

    fn store(files: &[(&str, usize)]) -> Arc<dyn ImageStore> {
        Arc::new(MemoryStore(
            files
                .iter()
                .map(|(name, len)| (name.to_string(), vec![0u8; *len]))
                .collect(),
        ))
    }

    fn echo(id: &'static str, ready: bool) -> Arc<dyn OcrBackend> {
        Arc::new(EchoBackend {
            id,
            delay: Duration::from_millis(10),
            ready,
        })
    }

    async fn wait_for_batch(rx: &mut mpsc::UnboundedReceiver<OcrEvent>, batch: &str) -> Vec<OcrEvent> {
        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = matches!(&event, OcrEvent::BatchComplete { batch_id } if batch_id == batch);
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_are_extracted_and_cached() {
        let orchestrator = Orchestrator::builder(store(&[("a.png", 3)]), ip_extractor())
            .backend(echo("fast", true))
            .build();
        let mut rx = orchestrator.subscribe();

        orchestrator.process_attachments("b1", ["a.png"]);
        assert_eq!(orchestrator.batch_state("b1"), Some(BatchState::Processing));
        let events = wait_for_batch(&mut rx, "b1").await;

        assert!(events.contains(&OcrEvent::Result {
            file_id: "a.png".into(),
            backend_id: "fast".into(),
            indicators: vec![Indicator::new("ipv4", "10.0.0.3")],
        }));
        assert!(events.contains(&OcrEvent::Progress {
            file_id: "a.png".into(),
            backend_id: "fast".into(),
            percent: 50,
        }));
        assert_eq!(orchestrator.batch_state("b1"), Some(BatchState::Complete));
        assert!(orchestrator.has_cached("a.png", "fast"));
        assert_eq!(
            orchestrator.merged_indicators("a.png"),
            vec![Indicator::new("ipv4", "10.0.0.3")]
        );

        let tasks = orchestrator.task_status();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert_eq!(tasks[0].extracted_text.as_deref(), Some("ip 10.0.0.3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unready_backends_are_skipped() {
        let orchestrator = Orchestrator::builder(store(&[("a.png", 1)]), ip_extractor())
            .backend(echo("fast", true))
            .backend(echo("offline", false))
            .build();
        assert!(orchestrator.is_ready());

        orchestrator.process_attachments("b1", ["a.png"]);
        let tasks = orchestrator.task_status();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].backend_id, "fast");
    }

    #[tokio::test]
    async fn test_empty_batch_completes_immediately() {
        let orchestrator = Orchestrator::builder(store(&[]), ip_extractor())
            .backend(echo("offline", false))
            .build();
        assert!(!orchestrator.is_ready());
        let mut rx = orchestrator.subscribe();

        orchestrator.process_attachments("b1", ["a.png"]);
        let events = wait_for_batch(&mut rx, "b1").await;
        assert_eq!(events.last(), Some(&OcrEvent::BatchComplete { batch_id: "b1".into() }));
        assert_eq!(orchestrator.batch_state("b1"), Some(BatchState::Complete));
        assert_eq!(orchestrator.batch_state("never"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_withdraws_tasks_for_that_file() {
        let orchestrator = Orchestrator::builder(store(&[("a.png", 1)]), ip_extractor())
            .backend(echo("fast", true))
            .backend(echo("slow", true))
            .build();
        let mut rx = orchestrator.subscribe();

        orchestrator.process_attachments("b1", ["a.png", "missing.png"]);
        assert_eq!(orchestrator.task_status().len(), 4);
        let events = wait_for_batch(&mut rx, "b1").await;

        let read_errors: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, OcrEvent::Error { backend_id: None, .. }))
            .collect();
        assert_eq!(read_errors.len(), 1);
        assert_eq!(orchestrator.task_status().len(), 2);
        assert_eq!(orchestrator.progress().completed_tasks, 2);

        // The claim is released, so a later batch may retry the file.
        orchestrator.process_attachments("b2", ["missing.png"]);
        let retried = orchestrator.task_status();
        assert_eq!(retried.len(), 2);
        assert!(retried.iter().all(|t| t.file_id == "missing.png"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_late_results_and_keeps_cache() {
        let orchestrator = Orchestrator::builder(store(&[("a.png", 1), ("b.png", 2)]), ip_extractor())
            .backend(echo("fast", true))
            .build();
        orchestrator.seed_cache("b.png", "fast", vec![]);
        let mut rx = orchestrator.subscribe();

        orchestrator.process_attachments("b1", ["a.png", "b.png"]);
        tokio::time::sleep(Duration::from_millis(1)).await;
        orchestrator.cancel();

        assert!(orchestrator.task_status().is_empty());
        assert_eq!(orchestrator.progress(), ProgressAggregate::default());
        assert!(orchestrator.has_cached("b.png", "fast"));
        assert!(!orchestrator.has_cached("a.png", "fast"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!orchestrator.has_cached("a.png", "fast"));

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(events.contains(&OcrEvent::Skipped {
            file_id: "b.png".into(),
            backend_id: "fast".into(),
        }));
        assert!(events.contains(&OcrEvent::Cancelled {
            file_id: "a.png".into(),
            backend_id: "fast".into(),
        }));
        assert!(!events.iter().any(|e| matches!(e, OcrEvent::Result { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_backend_cancels_queued_units() {
        let files: Vec<(String, usize)> = (0..5).map(|n| (format!("{}.png", n), 1)).collect();
        let refs: Vec<(&str, usize)> = files.iter().map(|(f, l)| (f.as_str(), *l)).collect();
        let orchestrator = Orchestrator::builder(store(&refs), ip_extractor())
            .backend(echo("fast", true))
            .build();
        let mut rx = orchestrator.subscribe();

        orchestrator.process_attachments("b1", files.iter().map(|(f, _)| f.clone()));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(orchestrator.remove_backend("fast", false).await);
        assert!(!orchestrator.remove_backend("fast", false).await);
        assert!(orchestrator.backend_ids().is_empty());

        let events = wait_for_batch(&mut rx, "b1").await;
        let completed = events
            .iter()
            .filter(|e| matches!(e, OcrEvent::Result { .. }))
            .count();
        let cancelled = events
            .iter()
            .filter(|e| matches!(e, OcrEvent::Cancelled { .. }))
            .count();
        assert_eq!(completed, 2);
        assert_eq!(cancelled, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_backend_replaces_same_id() {
        let orchestrator = Orchestrator::builder(store(&[("a.png", 1)]), ip_extractor())
            .backend(echo("fast", true))
            .build();
        orchestrator.register_backend(echo("fast", true)).await;
        orchestrator.register_backend(echo("slow", true)).await;
        assert_eq!(orchestrator.backend_ids(), vec!["fast", "slow"]);
    }

    #[tokio::test]
    async fn test_cache_management() {
        let orchestrator = Orchestrator::builder(store(&[]), ip_extractor()).build();
        assert!(orchestrator.seed_cache("a.png", "fast", vec![Indicator::new("ipv4", "1.1.1.1")]));
        assert!(!orchestrator.seed_cache("a.png", "fast", vec![]));
        assert_eq!(orchestrator.cached_indicators("a.png").unwrap()["fast"].len(), 1);

        assert!(orchestrator.invalidate("a.png"));
        assert!(orchestrator.cached_indicators("a.png").is_none());

        orchestrator.seed_cache("b.png", "fast", vec![]);
        orchestrator.clear_cache();
        assert!(!orchestrator.has_cached("b.png", "fast"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_seed_cache_refuses_pair_in_flight() {
        let orchestrator = Orchestrator::builder(store(&[("a.png", 3)]), ip_extractor())
            .backend(echo("fast", true))
            .build();
        let mut rx = orchestrator.subscribe();

        orchestrator.process_attachments("b1", ["a.png"]);
        assert!(!orchestrator.seed_cache("a.png", "fast", vec![Indicator::new("ipv4", "9.9.9.9")]));

        let events = wait_for_batch(&mut rx, "b1").await;
        let published = events.iter().find_map(|e| match e {
            OcrEvent::Result { indicators, .. } => Some(indicators.clone()),
            _ => None,
        });
        assert_eq!(published, Some(vec![Indicator::new("ipv4", "10.0.0.3")]));
        assert_eq!(
            orchestrator.cached_indicators("a.png").unwrap()["fast"],
            vec![Indicator::new("ipv4", "10.0.0.3")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_progress_survives_pruning() {
        let orchestrator = Orchestrator::builder(store(&[("a.png", 1), ("b.png", 2)]), ip_extractor())
            .backend(echo("fast", true))
            .build();
        let mut rx = orchestrator.subscribe();

        orchestrator.process_attachments("b1", ["a.png"]);
        assert_eq!(orchestrator.batch_progress("b1").unwrap().total_tasks, 1);
        wait_for_batch(&mut rx, "b1").await;

        orchestrator.process_attachments("b2", ["b.png"]);
        let b1 = orchestrator.batch_progress("b1").unwrap();
        assert_eq!((b1.completed_tasks, b1.total_tasks), (1, 1));
        assert_eq!(b1.overall_progress, 100.0);
        assert_eq!(orchestrator.batch_progress("b2").unwrap().completed_tasks, 0);
        assert!(orchestrator.batch_progress("never").is_none());
    }
}
