//! Segretario Gateway: HTTP surface for the entry ledger.
//! Upload-and-save, latest entries, voice transcription and transcription save, plus health and
//! readiness. Clients are built once at startup and shared through axum state.

use axum::{
    body::Body,
    extract::{
        multipart::{Multipart, MultipartError, MultipartRejection},
        rejection::JsonRejection,
        ConnectInfo, DefaultBodyLimit, State,
    },
    http::{header::InvalidHeaderValue, HeaderValue, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use segretario_core::{
    build_service, config::ServerConfig, EntrySubmission, GatewayConfig, LedgerError,
    LedgerService, TranscriptionRequest, UploadedFile,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct AppState {
    ledger: LedgerService,
}

#[derive(Deserialize)]
struct SaveTranscriptionBody {
    #[serde(default)]
    transcription: Option<String>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = match GatewayConfig::load().and_then(|cfg| cfg.validate().map(|_| cfg)) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("[SEGRETARIO] Refusing to start: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!(
        "[SEGRETARIO] Gateway v{} starting in {:?} mode",
        segretario_core::version(),
        cfg.mode
    );

    let state = Arc::new(AppState {
        ledger: build_service(&cfg),
    });
    let report = state.ledger.readiness();
    if !report.ready {
        tracing::warn!(
            "[SEGRETARIO] Starting degraded: spreadsheet={:?}, speech={:?}",
            report.spreadsheet,
            report.speech
        );
    }

    let app = match build_app(state, &cfg.server) {
        Ok(app) => app.layer(axum::middleware::from_fn(log_request)),
        Err(e) => {
            tracing::error!("[SEGRETARIO] Invalid CORS origin in server.allowed_origins: {}", e);
            std::process::exit(1);
        }
    };

    let addr = cfg.bind_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("[SEGRETARIO] Cannot bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    tracing::info!("[SEGRETARIO] Listening on http://{}", addr);

    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    {
        tracing::error!("[SEGRETARIO] Server error: {}", e);
        std::process::exit(1);
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("[SEGRETARIO] Shutdown requested, draining in-flight requests");
    }
}

fn build_app(state: Arc<AppState>, server: &ServerConfig) -> Result<Router, InvalidHeaderValue> {
    let origins = server
        .allowed_origins
        .iter()
        .map(|o| o.trim())
        .filter(|o| !o.is_empty())
        .map(HeaderValue::from_str)
        .collect::<Result<Vec<_>, _>>()?;
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Ok(Router::new()
        .route("/health", get(health))
        .route("/api/ready", get(ready))
        .route("/api/upload-and-save", post(upload_and_save))
        .route("/api/latest-entries", get(latest_entries))
        .route("/api/transcribe-voice", post(transcribe_voice))
        .route("/api/save-transcription", post(save_transcription))
        .with_state(state)
        .layer(DefaultBodyLimit::max(server.max_body_bytes))
        .layer(cors))
}

async fn log_request(
    peer: Option<ConnectInfo<SocketAddr>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    match peer {
        Some(ConnectInfo(addr)) => tracing::info!(
            "[SEGRETARIO] {} {} from {} -> {}",
            method,
            path,
            addr,
            response.status()
        ),
        None => tracing::info!("[SEGRETARIO] {} {} -> {}", method, path, response.status()),
    }
    response
}

/// Error body `{"error": message}`; 400 for bad input, 500 for everything upstream.
#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Ledger(LedgerError),
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        ApiError::Ledger(e)
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        ApiError::BadRequest(format!("Richiesta multipart non valida: {}", e.body_text()))
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(e: MultipartRejection) -> Self {
        ApiError::BadRequest(format!("Richiesta multipart non valida: {}", e.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Ledger(e) if e.is_client_error() => (StatusCode::BAD_REQUEST, e.to_string()),
            ApiError::Ledger(e) => {
                match std::error::Error::source(&e) {
                    Some(cause) => tracing::error!("[SEGRETARIO] {} (cause: {})", e, cause),
                    None => tracing::error!("[SEGRETARIO] {}", e),
                }
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        if status == StatusCode::BAD_REQUEST {
            tracing::warn!("[SEGRETARIO] Rejected request: {}", message);
        }
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Text fields and file parts of a multipart form, keyed by field name. Later parts with the
/// same name replace earlier ones.
#[derive(Default)]
struct FormParts {
    texts: HashMap<String, String>,
    files: HashMap<String, UploadedFile>,
}

async fn read_form(mut multipart: Multipart) -> Result<FormParts, ApiError> {
    let mut form = FormParts::default();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match field.file_name().map(str::to_string) {
            Some(file_name) => {
                let mime = field.content_type().map(str::to_string);
                let bytes = field.bytes().await?;
                form.files
                    .insert(name, UploadedFile::new(file_name, mime, bytes.to_vec()));
            }
            None => {
                let text = field.text().await?;
                form.texts.insert(name, text);
            }
        }
    }
    Ok(form)
}

async fn health() -> &'static str {
    "OK"
}

async fn ready(State(state): State<Arc<AppState>>) -> Response {
    let report = state.ledger.readiness();
    let status = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

/// POST /api/upload-and-save: optional attachment to Drive, then one ledger row.
async fn upload_and_save(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut form = read_form(multipart?).await?;
    // An empty file input still sends a part, with an empty file name.
    let file = form.files.remove("file").filter(|f| !f.file_name.is_empty());
    let message = state
        .ledger
        .submit_entry(EntrySubmission {
            manual_text: form.texts.remove("manualTextInput"),
            voice_transcription: form.texts.remove("voiceTranscription"),
            file,
        })
        .await?;
    Ok(Json(serde_json::json!({ "message": message })))
}

async fn latest_entries(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let entries = state.ledger.latest_entries().await?;
    Ok(Json(serde_json::json!(entries)))
}

/// POST /api/transcribe-voice: returns the transcript without storing it.
async fn transcribe_voice(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut form = read_form(multipart?).await?;
    let transcription = state
        .ledger
        .transcribe(TranscriptionRequest {
            audio: form.files.remove("audio"),
            language: form.texts.remove("language"),
            sample_rate: form.texts.remove("sampleRate"),
            encoding: form.texts.remove("encoding"),
        })
        .await?;
    Ok(Json(serde_json::json!({ "transcription": transcription })))
}

async fn save_transcription(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SaveTranscriptionBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(body) = body.map_err(|e| {
        ApiError::BadRequest(format!("Corpo JSON non valido: {}", e.body_text()))
    })?;
    let message = state.ledger.save_transcription(body.transcription).await?;
    Ok(Json(serde_json::json!({ "message": message })))
}
