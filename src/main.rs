//! Indicator OCR host bridge - exposes the orchestrator over HTTP.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use indicator_ocr::config::Settings;
use indicator_ocr::ocr::gemini::GeminiBackend;
use indicator_ocr::ocr::openai::OpenAiVisionBackend;
use indicator_ocr::ocr::tesseract;
use indicator_ocr::{
    FsImageStore, Indicator, OcrBackend, OcrEvent, Orchestrator, PatternExtractor,
    ProgressAggregate, Task,
};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    orchestrator: Orchestrator,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "indicator_ocr=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::load(std::path::Path::new("configs/settings.json"))?;

    let extractor = PatternExtractor::compile(&settings.indicator_patterns);
    info!("Compiled {} indicator patterns", extractor.len());

    let store = FsImageStore::new(settings.vault_root.clone());
    info!("Reading attachments from {:?}", settings.vault_root);

    let orchestrator = Orchestrator::builder(Arc::new(store), Arc::new(extractor))
        .backends(build_backends(&settings).await)
        .build();
    info!("Backends: {:?} (ready: {})", orchestrator.backend_ids(), orchestrator.is_ready());

    tokio::spawn(log_events(orchestrator.clone()));

    let state = AppState {
        orchestrator: orchestrator.clone(),
    };

    // Build router
    let app = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/batches", post(submit_batch))
        .route("/cancel", post(cancel))
        .route("/tasks", get(tasks))
        .route("/progress", get(progress))
        .route("/results", get(results))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    // Run server
    let listener = tokio::net::TcpListener::bind(&settings.listen_addr).await?;
    info!("Server listening on http://{}", settings.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    orchestrator.cancel();
    for id in orchestrator.backend_ids() {
        orchestrator.remove_backend(&id, true).await;
    }
    info!("Shut down");
    Ok(())
}

async fn build_backends(settings: &Settings) -> Vec<Arc<dyn OcrBackend>> {
    let mut backends: Vec<Arc<dyn OcrBackend>> = Vec::new();

    if settings.local.enabled {
        match tesseract::start_backend(settings.local.clone()).await {
            Ok(backend) => backends.push(Arc::new(backend)),
            Err(e) => warn!("Local OCR unavailable: {}", e),
        }
    }
    if settings.openai.enabled {
        let backend = OpenAiVisionBackend::from_settings(&settings.openai);
        if !backend.is_ready() {
            warn!("OpenAI backend has no API key, it will be skipped");
        }
        backends.push(Arc::new(backend));
    }
    if settings.gemini.enabled {
        let backend = GeminiBackend::from_settings(&settings.gemini);
        if !backend.is_ready() {
            warn!("Gemini backend has no API key, it will be skipped");
        }
        backends.push(Arc::new(backend));
    }
    backends
}

async fn log_events(orchestrator: Orchestrator) {
    let mut events = orchestrator.subscribe();
    while let Some(event) = events.recv().await {
        match &event {
            OcrEvent::Error { file_id, backend_id, message, .. } => {
                error!("OCR error for '{}' ({:?}): {}", file_id, backend_id, message)
            }
            OcrEvent::Result { file_id, backend_id, indicators } => {
                info!("{} found {} indicators in '{}'", backend_id, indicators.len(), file_id)
            }
            OcrEvent::BatchComplete { batch_id } => info!("Batch {} complete", batch_id),
            other => debug!("{:?}", other),
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

/// Whether any backend can take work.
async fn ready(State(state): State<AppState>) -> Result<&'static str, StatusCode> {
    if state.orchestrator.is_ready() {
        Ok("ready")
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

#[derive(serde::Deserialize)]
struct BatchRequest {
    batch_id: Option<String>,
    files: Vec<String>,
}

#[derive(serde::Serialize)]
struct BatchAccepted {
    batch_id: String,
    tasks: usize,
}

/// Submit attachments for recognition. Results arrive asynchronously.
async fn submit_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> Result<(StatusCode, Json<BatchAccepted>), (StatusCode, String)> {
    if request.files.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No files given".to_string()));
    }
    let batch_id = request
        .batch_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    info!("Received batch {} with {} files", batch_id, request.files.len());
    state
        .orchestrator
        .process_attachments(batch_id.clone(), request.files);

    let tasks = state
        .orchestrator
        .task_status()
        .iter()
        .filter(|t| t.batch_id == batch_id)
        .count();
    Ok((StatusCode::ACCEPTED, Json(BatchAccepted { batch_id, tasks })))
}

/// Cancel all outstanding work.
async fn cancel(State(state): State<AppState>) -> StatusCode {
    state.orchestrator.cancel();
    StatusCode::NO_CONTENT
}

/// Snapshot of the live task table.
async fn tasks(State(state): State<AppState>) -> Json<Vec<Task>> {
    Json(state.orchestrator.task_status())
}

async fn progress(State(state): State<AppState>) -> Json<ProgressAggregate> {
    Json(state.orchestrator.progress())
}

#[derive(serde::Deserialize)]
struct ResultsQuery {
    file: String,
}

/// Cached indicators for one attachment, per backend.
async fn results(
    State(state): State<AppState>,
    Query(query): Query<ResultsQuery>,
) -> Result<Json<HashMap<String, Vec<Indicator>>>, StatusCode> {
    state
        .orchestrator
        .cached_indicators(&query.file)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}
