//! Per-backend job queue.
//!
//! Each registered backend gets one queue. The queue admits jobs FIFO while
//! fewer than `concurrency_limit` recognitions are running, and re-drains from
//! the completion path of every unit, so there is no polling and no idle gap.
//! Queues never read orchestrator state: everything they observe is reported
//! through the [`JobListener`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ocr::{OcrBackend, OcrInput, ProgressReporter};
use crate::task::TaskId;

/// One unit of work for this queue's backend.
#[derive(Debug, Clone)]
pub struct Job {
    pub task_id: TaskId,
    pub input: OcrInput,
    /// Orchestrator generation the job was admitted under.
    pub generation: u64,
    /// Batch-level cancellation, shared by every job of a generation.
    pub token: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEventKind {
    /// Admitted: pending → processing, emitted before the backend is invoked.
    Started,
    Progress(u8),
    Completed(String),
    Failed { message: String, retryable: bool },
    Cancelled,
}

impl JobEventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEventKind::Completed(_) | JobEventKind::Failed { .. } | JobEventKind::Cancelled
        )
    }
}

#[derive(Debug, Clone)]
pub struct JobEvent {
    pub task_id: TaskId,
    pub file_id: String,
    pub backend_id: String,
    pub generation: u64,
    pub kind: JobEventKind,
}

pub type JobListener = Arc<dyn Fn(JobEvent) + Send + Sync>;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Job>,
    active: usize,
    closed: bool,
}

struct QueueInner {
    backend: Arc<dyn OcrBackend>,
    backend_id: String,
    limit: usize,
    listener: JobListener,
    abort: CancellationToken,
    state: Mutex<QueueState>,
    idle: Notify,
}

#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl JobQueue {
    pub fn new(backend: Arc<dyn OcrBackend>, listener: JobListener) -> Self {
        let backend_id = backend.id().to_string();
        let limit = backend.concurrency_limit().max(1);
        Self {
            inner: Arc::new(QueueInner {
                backend,
                backend_id,
                limit,
                listener,
                abort: CancellationToken::new(),
                state: Mutex::new(QueueState::default()),
                idle: Notify::new(),
            }),
        }
    }

    pub fn backend(&self) -> &Arc<dyn OcrBackend> {
        &self.inner.backend
    }

    pub fn backend_id(&self) -> &str {
        &self.inner.backend_id
    }

    pub fn concurrency_limit(&self) -> usize {
        self.inner.limit
    }

    pub fn active_count(&self) -> usize {
        self.lock().active
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a job and start it right away if a slot is free. Never blocks.
    /// A closed queue rejects the job with a `Cancelled` event.
    pub fn enqueue(&self, job: Job) {
        {
            let mut state = self.lock();
            if !state.closed {
                state.pending.push_back(job);
                drop(state);
                self.drain();
                return;
            }
        }
        debug!("{}: queue closed, rejecting {}", self.backend_id(), job.input.file_id);
        self.emit(&job, JobEventKind::Cancelled);
    }

    /// Admit queued jobs while capacity remains. Every admission decision is
    /// made under the queue lock, so overlapping calls cannot over-admit.
    fn drain(&self) {
        loop {
            let next = {
                let mut state = self.lock();
                if state.active >= self.inner.limit {
                    return;
                }
                match state.pending.pop_front() {
                    None => {
                        if state.active == 0 {
                            self.inner.idle.notify_waiters();
                        }
                        return;
                    }
                    Some(job) if job.token.is_cancelled() => Err(job),
                    Some(job) => {
                        state.active += 1;
                        Ok(job)
                    }
                }
            };

            match next {
                Ok(job) => self.start(job),
                Err(stale) => self.emit(&stale, JobEventKind::Cancelled),
            }
        }
    }

    fn start(&self, job: Job) {
        let queue = self.clone();
        tokio::spawn(async move {
            let outcome = queue.run(&job).await;
            queue.emit(&job, outcome);
            queue.finish();
            queue.drain();
        });
    }

    async fn run(&self, job: &Job) -> JobEventKind {
        if job.token.is_cancelled() || self.inner.abort.is_cancelled() {
            return JobEventKind::Cancelled;
        }
        self.emit(job, JobEventKind::Started);

        let reporter = {
            let queue = self.clone();
            let job = job.clone();
            ProgressReporter::new(move |percent| queue.emit(&job, JobEventKind::Progress(percent)))
        };

        // Recognition runs in its own task so a panicking backend fails the
        // unit instead of wedging the queue's active count.
        let backend = self.inner.backend.clone();
        let input = job.input.clone();
        let mut handle =
            tokio::spawn(async move { backend.recognize(&input, &reporter).await });

        tokio::select! {
            biased;
            _ = job.token.cancelled() => {
                handle.abort();
                JobEventKind::Cancelled
            }
            _ = self.inner.abort.cancelled() => {
                handle.abort();
                JobEventKind::Cancelled
            }
            joined = &mut handle => match joined {
                Ok(Ok(text)) => JobEventKind::Completed(text),
                Ok(Err(e)) => {
                    warn!("{}: recognition of {} failed: {}", self.backend_id(), job.input.file_id, e);
                    JobEventKind::Failed {
                        message: e.to_string(),
                        retryable: e.is_retryable(),
                    }
                }
                Err(e) => {
                    warn!("{}: recognition task for {} aborted: {}", self.backend_id(), job.input.file_id, e);
                    JobEventKind::Failed {
                        message: format!("recognition task aborted: {}", e),
                        retryable: false,
                    }
                }
            }
        }
    }

    fn finish(&self) {
        let mut state = self.lock();
        state.active = state.active.saturating_sub(1);
    }

    fn emit(&self, job: &Job, kind: JobEventKind) {
        (self.inner.listener)(JobEvent {
            task_id: job.task_id.clone(),
            file_id: job.input.file_id.clone(),
            backend_id: self.inner.backend_id.clone(),
            generation: job.generation,
            kind,
        });
    }

    /// Stop admitting work. Queued jobs are rejected with `Cancelled`;
    /// running ones are aborted only when `cancel_in_flight` is set.
    pub fn close(&self, cancel_in_flight: bool) {
        let rejected: Vec<Job> = {
            let mut state = self.lock();
            state.closed = true;
            let rejected: Vec<Job> = state.pending.drain(..).collect();
            if state.active == 0 {
                self.inner.idle.notify_waiters();
            }
            rejected
        };
        debug!(
            "{}: closing queue, {} queued jobs rejected",
            self.backend_id(),
            rejected.len()
        );
        for job in &rejected {
            self.emit(job, JobEventKind::Cancelled);
        }
        if cancel_in_flight {
            self.inner.abort.cancel();
        }
    }

    /// Resolve once no job is running and none is queued.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            {
                let state = self.lock();
                if state.active == 0 && state.pending.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::OcrError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingBackend {
        limit: usize,
        delay: Duration,
        running: AtomicUsize,
        max_running: AtomicUsize,
        started: Mutex<Vec<String>>,
    }

    impl CountingBackend {
        fn new(limit: usize, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                limit,
                delay,
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                started: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl OcrBackend for CountingBackend {
        fn id(&self) -> &str {
            "counting"
        }

        fn concurrency_limit(&self) -> usize {
            self.limit
        }

        async fn recognize(
            &self,
            input: &OcrInput,
            _progress: &ProgressReporter,
        ) -> Result<String, OcrError> {
            self.started.lock().unwrap().push(input.file_id.clone());
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if input.file_id.starts_with("bad") {
                return Err(OcrError::Failed("unreadable".into()));
            }
            Ok(format!("text of {}", input.file_id))
        }
    }

    fn recording_listener() -> (JobListener, Arc<Mutex<Vec<JobEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let listener: JobListener = Arc::new(move |e| sink.lock().unwrap().push(e));
        (listener, events)
    }

    fn job(file_id: &str, token: &CancellationToken) -> Job {
        Job {
            task_id: TaskId::generate(),
            input: OcrInput::new(file_id, vec![0u8]),
            generation: 0,
            token: token.clone(),
        }
    }

    fn terminal_count(events: &Mutex<Vec<JobEvent>>) -> usize {
        events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind.is_terminal())
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit_is_enforced() {
        let backend = CountingBackend::new(2, Duration::from_millis(20));
        let (listener, events) = recording_listener();
        let queue = JobQueue::new(backend.clone(), listener);
        let token = CancellationToken::new();

        for n in 0..7 {
            queue.enqueue(job(&format!("f{}.png", n), &token));
        }
        assert_eq!(queue.active_count(), 2);
        assert_eq!(queue.pending_count(), 5);

        queue.wait_idle().await;
        assert_eq!(backend.max_running.load(Ordering::SeqCst), 2);
        assert_eq!(terminal_count(&events), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_is_fifo() {
        let backend = CountingBackend::new(1, Duration::from_millis(5));
        let (listener, _events) = recording_listener();
        let queue = JobQueue::new(backend.clone(), listener);
        let token = CancellationToken::new();

        for name in ["a.png", "b.png", "c.png", "d.png"] {
            queue.enqueue(job(name, &token));
        }
        queue.wait_idle().await;

        assert_eq!(
            *backend.started.lock().unwrap(),
            vec!["a.png", "b.png", "c.png", "d.png"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_precedes_terminal_event() {
        let backend = CountingBackend::new(1, Duration::from_millis(5));
        let (listener, events) = recording_listener();
        let queue = JobQueue::new(backend, listener);
        let token = CancellationToken::new();

        queue.enqueue(job("a.png", &token));
        queue.enqueue(job("bad.png", &token));
        queue.wait_idle().await;

        let kinds: Vec<_> = events.lock().unwrap().iter().map(|e| e.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                JobEventKind::Started,
                JobEventKind::Completed("text of a.png".into()),
                JobEventKind::Started,
                JobEventKind::Failed {
                    message: "Recognition failed: unreadable".into(),
                    retryable: false
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_token_skips_queued_and_aborts_running() {
        let backend = CountingBackend::new(1, Duration::from_millis(50));
        let (listener, events) = recording_listener();
        let queue = JobQueue::new(backend.clone(), listener);
        let token = CancellationToken::new();

        queue.enqueue(job("a.png", &token));
        queue.enqueue(job("b.png", &token));
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        queue.wait_idle().await;

        let cancelled = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == JobEventKind::Cancelled)
            .count();
        assert_eq!(cancelled, 2);
        assert_eq!(*backend.started.lock().unwrap(), vec!["a.png"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_rejects_queued_and_future_jobs() {
        let backend = CountingBackend::new(1, Duration::from_millis(20));
        let (listener, events) = recording_listener();
        let queue = JobQueue::new(backend.clone(), listener);
        let token = CancellationToken::new();

        queue.enqueue(job("a.png", &token));
        queue.enqueue(job("b.png", &token));
        queue.enqueue(job("c.png", &token));
        queue.close(false);
        queue.enqueue(job("d.png", &token));
        queue.wait_idle().await;

        let events = events.lock().unwrap();
        let completed: Vec<_> = events
            .iter()
            .filter(|e| matches!(e.kind, JobEventKind::Completed(_)))
            .map(|e| e.file_id.as_str())
            .collect();
        let cancelled: Vec<_> = events
            .iter()
            .filter(|e| e.kind == JobEventKind::Cancelled)
            .map(|e| e.file_id.as_str())
            .collect();
        assert_eq!(completed, vec!["a.png"]);
        assert_eq!(cancelled, vec!["b.png", "c.png", "d.png"]);
        assert!(queue.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_panic_fails_only_that_unit() {
        struct PanickyBackend;

        #[async_trait::async_trait]
        impl OcrBackend for PanickyBackend {
            fn id(&self) -> &str {
                "panicky"
            }
            fn concurrency_limit(&self) -> usize {
                1
            }
            async fn recognize(
                &self,
                input: &OcrInput,
                _progress: &ProgressReporter,
            ) -> Result<String, OcrError> {
                if input.file_id == "boom.png" {
                    panic!("engine crashed");
                }
                Ok("fine".into())
            }
        }

        let (listener, events) = recording_listener();
        let queue = JobQueue::new(Arc::new(PanickyBackend), listener);
        let token = CancellationToken::new();
        queue.enqueue(job("boom.png", &token));
        queue.enqueue(job("ok.png", &token));
        queue.wait_idle().await;

        let events = events.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| e.file_id == "boom.png" && matches!(e.kind, JobEventKind::Failed { .. })));
        assert!(events
            .iter()
            .any(|e| e.file_id == "ok.png" && e.kind == JobEventKind::Completed("fine".into())));
    }
}
