//! Local recognition backend running a CPU-bound engine on dedicated threads.
//!
//! Each worker thread owns one [`RecognitionEngine`] instance; only those threads
//! ever touch an engine. Requests travel over a channel and results come back on
//! a oneshot, so the async side never blocks the runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{OcrBackend, OcrError, OcrInput, ProgressReporter};

/// Synchronous text recognizer owned by a single worker thread.
pub trait RecognitionEngine: Send {
    fn recognize(&mut self, image: &[u8]) -> Result<String, OcrError>;
}

struct Request {
    input: OcrInput,
    reply: oneshot::Sender<Result<String, OcrError>>,
}

pub struct LocalBackend {
    id: String,
    workers: usize,
    timeout: Duration,
    sender: Mutex<Option<mpsc::Sender<Request>>>,
    shutting_down: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalBackend {
    /// Start one worker thread per engine. The number of engines is the
    /// backend's concurrency limit.
    pub fn spawn<E>(id: impl Into<String>, engines: Vec<E>, timeout: Duration) -> Result<Self, OcrError>
    where
        E: RecognitionEngine + 'static,
    {
        let id = id.into();
        if engines.is_empty() {
            return Err(OcrError::NotReady(format!("{}: no engine instances", id)));
        }

        let (sender, receiver) = mpsc::channel::<Request>();
        let receiver = Arc::new(Mutex::new(receiver));
        let shutting_down = Arc::new(AtomicBool::new(false));
        let workers = engines.len();

        let mut handles = Vec::with_capacity(workers);
        for (n, engine) in engines.into_iter().enumerate() {
            let receiver = receiver.clone();
            let shutting_down = shutting_down.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-worker-{}", id, n))
                .spawn(move || worker_loop(engine, receiver, shutting_down))?;
            handles.push(handle);
        }

        info!("{}: started {} local recognition workers", id, workers);

        Ok(Self {
            id,
            workers,
            timeout,
            sender: Mutex::new(Some(sender)),
            shutting_down,
            handles: Mutex::new(handles),
        })
    }

    fn sender(&self) -> Option<mpsc::Sender<Request>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn worker_loop<E: RecognitionEngine>(
    mut engine: E,
    receiver: Arc<Mutex<mpsc::Receiver<Request>>>,
    shutting_down: Arc<AtomicBool>,
) {
    loop {
        let next = receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv();
        let Ok(request) = next else {
            break;
        };

        if shutting_down.load(Ordering::SeqCst) {
            let _ = request.reply.send(Err(OcrError::ShuttingDown));
            continue;
        }

        let result = engine.recognize(&request.input.data);

        // A result produced after shutdown began belongs to a torn-down backend.
        let result = if shutting_down.load(Ordering::SeqCst) {
            Err(OcrError::ShuttingDown)
        } else {
            result
        };
        let _ = request.reply.send(result);
    }
    debug!("local recognition worker exiting");
}

#[async_trait::async_trait]
impl OcrBackend for LocalBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn concurrency_limit(&self) -> usize {
        self.workers
    }

    fn is_ready(&self) -> bool {
        !self.shutting_down.load(Ordering::SeqCst) && self.sender().is_some()
    }

    async fn recognize(
        &self,
        input: &OcrInput,
        progress: &ProgressReporter,
    ) -> Result<String, OcrError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(OcrError::ShuttingDown);
        }
        let sender = self.sender().ok_or(OcrError::ShuttingDown)?;

        let (reply, response) = oneshot::channel();
        sender
            .send(Request {
                input: input.clone(),
                reply,
            })
            .map_err(|_| OcrError::ShuttingDown)?;
        progress.report(10);

        match tokio::time::timeout(self.timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OcrError::ShuttingDown),
            Err(_) => Err(OcrError::Timeout(self.timeout)),
        }
    }

    async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("{}: shutting down local workers", self.id);

        // Dropping the sender lets idle workers fall out of `recv`.
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        let id = self.id.clone();
        let joined = tokio::task::spawn_blocking(move || {
            for handle in handles {
                if handle.join().is_err() {
                    warn!("{}: worker thread panicked", id);
                }
            }
        })
        .await;
        if let Err(e) = joined {
            warn!("{}: failed to join workers: {}", self.id, e);
        }
    }
}

impl Drop for LocalBackend {
    fn drop(&mut self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
