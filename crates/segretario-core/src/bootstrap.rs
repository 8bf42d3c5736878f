//! Build the ledger service from configuration.
//!
//! Clients are constructed once. A client that cannot be built (missing key, bad HTTP setup,
//! no Drive folder) is kept as [`ClientHandle::Unavailable`] so the gateway still starts and
//! readiness reports the reason.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{BackendMode, GatewayConfig};
use crate::credentials::{ServiceAccountKey, ServiceAccountTokens, TokenSource};
use crate::ledger::{ClientHandle, LedgerService, LedgerSettings};
use crate::memory::{MemorySheet, MemoryStorage};
use crate::sheets::{GoogleSheetsClient, SheetStore};
use crate::speech::{GoogleSpeechClient, PlaceholderRecognizer, SpeechRecognizer};
use crate::storage::{GoogleDriveClient, ObjectStore};

pub fn build_service(cfg: &GatewayConfig) -> LedgerService {
    let settings = LedgerSettings::from_config(cfg);
    match cfg.mode {
        BackendMode::Mock => {
            tracing::warn!("[BOOT] Mock mode: entries live in memory and transcription is a placeholder");
            LedgerService::new(
                ClientHandle::Ready(Arc::new(MemorySheet::default())),
                ClientHandle::Ready(Arc::new(MemoryStorage::new())),
                ClientHandle::Ready(Arc::new(PlaceholderRecognizer::new())),
                settings,
            )
        }
        BackendMode::Google => {
            let (sheet, storage, speech) = google_clients(cfg);
            LedgerService::new(sheet, storage, speech, settings)
        }
    }
}

type Clients = (
    ClientHandle<dyn SheetStore>,
    ClientHandle<dyn ObjectStore>,
    ClientHandle<dyn SpeechRecognizer>,
);

fn unavailable(reason: String) -> Clients {
    tracing::error!("[BOOT] Google clients unavailable: {}", reason);
    (
        ClientHandle::Unavailable(reason.clone()),
        ClientHandle::Unavailable(reason.clone()),
        ClientHandle::Unavailable(reason),
    )
}

fn google_clients(cfg: &GatewayConfig) -> Clients {
    let g = &cfg.google;
    let timeout = Duration::from_secs(g.http_timeout_secs);

    let http = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(c) => c,
        Err(e) => return unavailable(format!("http client: {}", e)),
    };
    let key = match ServiceAccountKey::from_file(&g.credentials_path) {
        Ok(k) => k,
        Err(e) => return unavailable(e.to_string()),
    };
    let tokens = ServiceAccountTokens::new(key, &g.token_url, http.clone());
    tracing::info!("[BOOT] Authenticated as {}", tokens.client_email());
    let tokens: Arc<dyn TokenSource> = Arc::new(tokens);

    let sheet: ClientHandle<dyn SheetStore> = ClientHandle::Ready(Arc::new(GoogleSheetsClient::new(
        http.clone(),
        Arc::clone(&tokens),
        g.sheets_base_url.clone(),
        g.spreadsheet_id.clone(),
        g.worksheet_name.clone(),
    )));
    tracing::info!(
        "[BOOT] Spreadsheet {} / worksheet {}",
        g.spreadsheet_id,
        g.worksheet_name
    );

    let storage: ClientHandle<dyn ObjectStore> = if g.drive_folder_id.trim().is_empty() {
        ClientHandle::Unavailable("drive folder not configured".to_string())
    } else {
        match reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
        {
            Ok(drive_http) => ClientHandle::Ready(Arc::new(GoogleDriveClient::new(
                drive_http,
                Arc::clone(&tokens),
                g.drive_upload_base_url.clone(),
                g.drive_folder_id.clone(),
                g.upload_chunk_bytes,
            ))),
            Err(e) => ClientHandle::Unavailable(format!("drive http client: {}", e)),
        }
    };

    let speech: ClientHandle<dyn SpeechRecognizer> =
        ClientHandle::Ready(Arc::new(GoogleSpeechClient::new(
            http,
            tokens,
            g.speech_base_url.clone(),
            Duration::from_millis(cfg.speech.poll_interval_ms),
        )));

    (sheet, storage, speech)
}
