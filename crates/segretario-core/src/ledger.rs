//! **Entry ledger**: the four operations behind the HTTP surface.
//!
//! `LedgerService` owns long-lived handles to the sheet, storage and speech clients (built once
//! at startup) and sequences the remote calls for each request:
//!
//! ```text
//! submit_entry        [upload attachment] -> append (ts, text, url)
//! latest_entries      read all rows -> last N, newest first, keyed by header
//! transcribe          resolve settings -> long-running recognition -> joined transcript
//! save_transcription  append (ts, transcription[, ""])
//! ```
//!
//! A failed step stops the request. There is no rollback: an upload followed by a failed append
//! leaves the uploaded file in place (logged as orphaned).

use chrono::Local;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{GatewayConfig, RowLayout};
use crate::error::{LedgerError, LedgerResult};
use crate::sheets::SheetStore;
use crate::speech::{join_transcript, AudioEncoding, RecognitionSettings, SpeechRecognizer};
use crate::storage::{ObjectStore, UploadedFile};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub const MSG_ENTRY_SAVED: &str = "Dati salvati con successo.";
pub const MSG_TRANSCRIPTION_SAVED: &str = "Trascrizione salvata con successo.";
const ERR_SHEET_UNREACHABLE: &str = "Impossibile accedere al foglio di calcolo.";
const ERR_UPLOAD_FAILED: &str = "Impossibile caricare il file su Google Drive.";
const ERR_ENTRY_NOT_SAVED: &str = "Impossibile salvare i dati.";
const ERR_LATEST_ENTRIES: &str = "Impossibile recuperare gli ultimi inserimenti.";
const ERR_NO_AUDIO: &str = "Nessun file audio fornito nella richiesta.";
const ERR_EMPTY_AUDIO: &str = "Il file audio inviato è vuoto.";
const ERR_SPEECH_UNAVAILABLE: &str = "Servizio di trascrizione non disponibile.";
const ERR_TRANSCRIPTION_MISSING: &str = "Trascrizione mancante.";
const ERR_TRANSCRIPTION_NOT_SAVED: &str = "Impossibile salvare la trascrizione.";

/// A client that either initialized at startup or is known to be unavailable (with the reason).
pub enum ClientHandle<T: ?Sized> {
    Ready(Arc<T>),
    Unavailable(String),
}

impl<T: ?Sized> ClientHandle<T> {
    pub fn status(&self) -> ComponentStatus {
        match self {
            ClientHandle::Ready(_) => ComponentStatus::Ok,
            ClientHandle::Unavailable(reason) => ComponentStatus::Unavailable(reason.clone()),
        }
    }

    fn get(&self, component: &str, user_message: &str) -> LedgerResult<&Arc<T>> {
        match self {
            ClientHandle::Ready(client) => Ok(client),
            ClientHandle::Unavailable(reason) => {
                tracing::error!("[LEDGER] {} unavailable: {}", component, reason);
                Err(LedgerError::Unavailable(user_message.to_string()))
            }
        }
    }
}

impl<T: ?Sized> Clone for ClientHandle<T> {
    fn clone(&self) -> Self {
        match self {
            ClientHandle::Ready(c) => ClientHandle::Ready(Arc::clone(c)),
            ClientHandle::Unavailable(r) => ClientHandle::Unavailable(r.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentStatus {
    Ok,
    Unavailable(String),
}

impl ComponentStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ComponentStatus::Ok)
    }
}

impl Serialize for ComponentStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ComponentStatus::Ok => serializer.serialize_str("ok"),
            ComponentStatus::Unavailable(reason) => {
                serializer.serialize_str(&format!("unavailable: {}", reason))
            }
        }
    }
}

/// Readiness of each remote client. Storage is optional: entries without attachments still work.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    pub ready: bool,
    pub spreadsheet: ComponentStatus,
    pub storage: ComponentStatus,
    pub speech: ComponentStatus,
}

/// One ledger row before it is laid out into cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRecord {
    pub timestamp: String,
    pub text: String,
    pub file_url: Option<String>,
}

impl LedgerRecord {
    pub fn new(timestamp: impl Into<String>, text: impl Into<String>, file_url: Option<String>) -> Self {
        Self {
            timestamp: timestamp.into(),
            text: text.into(),
            file_url,
        }
    }

    /// Record stamped with the current local time.
    pub fn now(text: impl Into<String>, file_url: Option<String>) -> Self {
        Self::new(Local::now().format(TIMESTAMP_FORMAT).to_string(), text, file_url)
    }

    pub fn into_row(self, layout: RowLayout) -> Vec<String> {
        match (layout, self.file_url) {
            (RowLayout::Legacy, None) => vec![self.timestamp, self.text],
            (_, url) => vec![self.timestamp, self.text, url.unwrap_or_default()],
        }
    }
}

/// Join manual and voice text with one space, even when either side is empty.
pub fn combine_text(manual: &str, voice: &str, trim: bool) -> String {
    let joined = format!("{} {}", manual, voice);
    if trim {
        joined.trim().to_string()
    } else {
        joined
    }
}

/// Latest `limit` data rows, newest first, each keyed by the lower-cased header.
///
/// Cells pair with headers positionally; a later duplicate header overwrites an earlier one.
pub fn latest_entries(rows: &[Vec<String>], limit: usize) -> Vec<BTreeMap<String, String>> {
    if rows.len() < 2 {
        return Vec::new();
    }
    let headers: Vec<String> = rows[0].iter().map(|h| h.to_lowercase()).collect();
    let data = &rows[1..];
    let take = limit.min(data.len());
    data[data.len() - take..]
        .iter()
        .rev()
        .map(|row| {
            headers
                .iter()
                .zip(row.iter())
                .map(|(h, v)| (h.clone(), v.clone()))
                .collect()
        })
        .collect()
}

/// Form fields of an upload-and-save submission.
#[derive(Debug, Clone, Default)]
pub struct EntrySubmission {
    pub manual_text: Option<String>,
    pub voice_transcription: Option<String>,
    pub file: Option<UploadedFile>,
}

/// Form fields of a transcription request. Overrides are raw strings as received.
#[derive(Debug, Clone, Default)]
pub struct TranscriptionRequest {
    pub audio: Option<UploadedFile>,
    pub language: Option<String>,
    pub sample_rate: Option<String>,
    pub encoding: Option<String>,
}

/// Tunables taken from [`GatewayConfig`].
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub latest_entries_limit: usize,
    pub row_layout: RowLayout,
    pub trim_combined_text: bool,
    pub default_language: String,
    pub default_encoding: AudioEncoding,
    pub default_sample_rate: u32,
    pub recognition_timeout: Duration,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            latest_entries_limit: 5,
            row_layout: RowLayout::Canonical,
            trim_combined_text: false,
            default_language: "it-IT".to_string(),
            default_encoding: AudioEncoding::WebmOpus,
            default_sample_rate: 48_000,
            recognition_timeout: Duration::from_secs(300),
        }
    }
}

impl LedgerSettings {
    pub fn from_config(cfg: &GatewayConfig) -> Self {
        Self {
            latest_entries_limit: cfg.ledger.latest_entries_limit,
            row_layout: cfg.ledger.row_layout,
            trim_combined_text: cfg.ledger.trim_combined_text,
            default_language: cfg.speech.language_code.clone(),
            default_encoding: cfg.default_encoding(),
            default_sample_rate: cfg.speech.sample_rate_hertz,
            recognition_timeout: Duration::from_secs(cfg.speech.timeout_secs),
        }
    }

    /// Resolve per-request overrides. Unknown encodings are rejected; a sample rate that is
    /// not an integer silently falls back to the default.
    pub fn resolve_recognition(
        &self,
        language: Option<&str>,
        sample_rate: Option<&str>,
        encoding: Option<&str>,
    ) -> LedgerResult<RecognitionSettings> {
        let encoding = match encoding {
            Some(raw) => AudioEncoding::parse(raw).map_err(|e| {
                LedgerError::client(format!("Codifica audio non supportata: {}.", e.0))
            })?,
            None => self.default_encoding,
        };
        let sample_rate_hertz = sample_rate
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(self.default_sample_rate);
        let language_code = language
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .unwrap_or(&self.default_language)
            .to_string();
        Ok(RecognitionSettings {
            encoding,
            sample_rate_hertz,
            language_code,
        })
    }
}

/// The ledger service shared by every request handler.
#[derive(Clone)]
pub struct LedgerService {
    sheet: ClientHandle<dyn SheetStore>,
    storage: ClientHandle<dyn ObjectStore>,
    speech: ClientHandle<dyn SpeechRecognizer>,
    settings: LedgerSettings,
}

impl LedgerService {
    pub fn new(
        sheet: ClientHandle<dyn SheetStore>,
        storage: ClientHandle<dyn ObjectStore>,
        speech: ClientHandle<dyn SpeechRecognizer>,
        settings: LedgerSettings,
    ) -> Self {
        Self {
            sheet,
            storage,
            speech,
            settings,
        }
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    pub fn readiness(&self) -> ReadinessReport {
        let spreadsheet = self.sheet.status();
        let storage = self.storage.status();
        let speech = self.speech.status();
        ReadinessReport {
            ready: spreadsheet.is_ok() && speech.is_ok(),
            spreadsheet,
            storage,
            speech,
        }
    }

    /// Upload-and-save: optional attachment upload, then one appended row.
    pub async fn submit_entry(&self, submission: EntrySubmission) -> LedgerResult<&'static str> {
        let text = combine_text(
            submission.manual_text.as_deref().unwrap_or(""),
            submission.voice_transcription.as_deref().unwrap_or(""),
            self.settings.trim_combined_text,
        );
        // Resolve the sheet before uploading so an unreachable sheet cannot orphan a file.
        let sheet = self.sheet.get("spreadsheet", ERR_SHEET_UNREACHABLE)?;

        let file_url = match submission.file {
            Some(file) => {
                let storage = self.storage.get("storage", ERR_UPLOAD_FAILED)?;
                let url = storage.upload(file).await.map_err(|e| {
                    tracing::error!("[LEDGER] Attachment upload failed: {}", e);
                    LedgerError::Storage {
                        message: ERR_UPLOAD_FAILED.to_string(),
                        source: e,
                    }
                })?;
                tracing::info!("[LEDGER] Attachment stored at {}", url);
                Some(url)
            }
            None => {
                tracing::info!("[LEDGER] Submission without attachment");
                None
            }
        };

        let record = LedgerRecord::now(text, file_url);
        tracing::info!(
            "[LEDGER] Appending entry: timestamp={}, text={:?}, file_url={:?}",
            record.timestamp,
            record.text,
            record.file_url
        );
        let orphan = record.file_url.clone();
        sheet
            .append_row(record.into_row(RowLayout::Canonical))
            .await
            .map_err(|e| {
                tracing::error!("[LEDGER] Entry append failed: {}", e);
                if let Some(url) = orphan {
                    tracing::warn!("[LEDGER] Uploaded file left without a ledger row: {}", url);
                }
                LedgerError::Sheet {
                    message: ERR_ENTRY_NOT_SAVED.to_string(),
                    source: e,
                }
            })?;
        tracing::info!("[LEDGER] Entry saved");
        Ok(MSG_ENTRY_SAVED)
    }

    /// Most recent entries, newest first.
    pub async fn latest_entries(&self) -> LedgerResult<Vec<BTreeMap<String, String>>> {
        let sheet = self.sheet.get("spreadsheet", ERR_SHEET_UNREACHABLE)?;
        let rows = sheet.read_all_rows().await.map_err(|e| {
            tracing::error!("[LEDGER] Reading latest entries failed: {}", e);
            LedgerError::Sheet {
                message: ERR_LATEST_ENTRIES.to_string(),
                source: e,
            }
        })?;
        let entries = latest_entries(&rows, self.settings.latest_entries_limit);
        if entries.is_empty() {
            tracing::info!("[LEDGER] No entries in the sheet yet");
        } else {
            tracing::info!("[LEDGER] Returning {} latest entries", entries.len());
        }
        Ok(entries)
    }

    /// Transcribe uploaded audio. The result is returned, not stored.
    pub async fn transcribe(&self, request: TranscriptionRequest) -> LedgerResult<String> {
        let audio = request.audio.ok_or_else(|| LedgerError::client(ERR_NO_AUDIO))?;
        if audio.file_name.is_empty() {
            return Err(LedgerError::client(ERR_EMPTY_AUDIO));
        }
        let settings = self.settings.resolve_recognition(
            request.language.as_deref(),
            request.sample_rate.as_deref(),
            request.encoding.as_deref(),
        )?;
        let recognizer = self.speech.get("speech", ERR_SPEECH_UNAVAILABLE)?;

        tracing::info!(
            "[LEDGER] Transcribing {} ({} bytes) as {} at {} Hz, {}",
            audio.file_name,
            audio.len(),
            settings.encoding,
            settings.sample_rate_hertz,
            settings.language_code
        );
        let results = recognizer
            .long_running_recognize(audio.bytes, &settings, self.settings.recognition_timeout)
            .await
            .map_err(|e| {
                tracing::error!("[LEDGER] Transcription failed: {}", e);
                LedgerError::Speech {
                    message: format!("Errore durante la trascrizione: {}", e),
                    source: e,
                }
            })?;
        Ok(join_transcript(&results))
    }

    /// Persist a transcription as its own row.
    pub async fn save_transcription(&self, transcription: Option<String>) -> LedgerResult<&'static str> {
        let text = match transcription {
            Some(t) if !t.is_empty() => t,
            _ => {
                tracing::warn!("[LEDGER] Save requested without a transcription");
                return Err(LedgerError::client(ERR_TRANSCRIPTION_MISSING));
            }
        };
        let sheet = self.sheet.get("spreadsheet", ERR_SHEET_UNREACHABLE)?;
        let record = LedgerRecord::now(text, None);
        tracing::info!(
            "[LEDGER] Appending transcription: timestamp={}, text={:?}",
            record.timestamp,
            record.text
        );
        sheet
            .append_row(record.into_row(self.settings.row_layout))
            .await
            .map_err(|e| {
                tracing::error!("[LEDGER] Transcription append failed: {}", e);
                LedgerError::Sheet {
                    message: ERR_TRANSCRIPTION_NOT_SAVED.to_string(),
                    source: e,
                }
            })?;
        Ok(MSG_TRANSCRIPTION_SAVED)
    }
}
