//! Gateway configuration loaded from `config/segretario.toml` and `SEGRETARIO__*` env vars.
//!
//! Remote identifiers (spreadsheet id, Drive folder, credentials path) are validated once at
//! startup; a bad value stops the gateway instead of failing inside every request.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::speech::AudioEncoding;

const DEFAULT_CONFIG_PATH: &str = "config/segretario";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config load: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which client implementations the gateway wires in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// Google Sheets, Drive and Speech-to-Text.
    Google,
    /// In-memory sheet and storage plus a placeholder recognizer. Local development only.
    Mock,
}

/// Row shape written by `save_transcription`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowLayout {
    /// `(timestamp, text, file_url)` for every write path.
    #[default]
    Canonical,
    /// Transcriptions are written as `(timestamp, text)`.
    Legacy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// CORS allow-list. `null` is the origin browsers send for `file://` pages.
    pub allowed_origins: Vec<String>,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleConfig {
    /// Path to the service-account JSON key.
    pub credentials_path: String,
    pub spreadsheet_id: String,
    pub worksheet_name: String,
    pub drive_folder_id: String,
    pub token_url: String,
    pub sheets_base_url: String,
    pub drive_upload_base_url: String,
    pub speech_base_url: String,
    pub http_timeout_secs: u64,
    /// Resumable upload chunk size. Rounded down to a multiple of 256 KiB.
    pub upload_chunk_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    pub language_code: String,
    pub encoding: String,
    pub sample_rate_hertz: u32,
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub latest_entries_limit: usize,
    #[serde(default)]
    pub row_layout: RowLayout,
    /// Trim the joined manual/voice text. Off keeps the single-space join as-is.
    #[serde(default)]
    pub trim_combined_text: bool,
}

/// Full gateway configuration.
///
/// | Key | Default |
/// |-----|---------|
/// | mode | google |
/// | server.host / server.port | 127.0.0.1 / 5000 |
/// | server.allowed_origins | http://localhost:8080, null |
/// | speech.language_code / encoding / sample_rate_hertz | it-IT / WEBM_OPUS / 48000 |
/// | speech.timeout_secs | 300 |
/// | ledger.latest_entries_limit | 5 |
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub mode: BackendMode,
    pub server: ServerConfig,
    pub google: GoogleConfig,
    pub speech: SpeechConfig,
    pub ledger: LedgerConfig,
}

impl GatewayConfig {
    /// Load config from file and environment. Precedence: env `SEGRETARIO__*` > file named by
    /// `SEGRETARIO_CONFIG` (or `config/segretario.toml`) > defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("SEGRETARIO_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let builder = Self::defaults()?
            .add_source(config::File::with_name(&config_path).required(false))
            .add_source(
                config::Environment::with_prefix("SEGRETARIO")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("server.allowed_origins")
                    .try_parsing(true),
            );
        Ok(builder.build()?.try_deserialize()?)
    }

    /// Defaults overlaid with an inline TOML document.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let built = Self::defaults()?
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?;
        Ok(built.try_deserialize()?)
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Ok(config::Config::builder()
            .set_default("mode", "google")?
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 5000_i64)?
            .set_default("server.allowed_origins", vec!["http://localhost:8080", "null"])?
            .set_default("server.max_body_bytes", 50_i64 * 1024 * 1024)?
            .set_default("google.credentials_path", "")?
            .set_default("google.spreadsheet_id", "")?
            .set_default("google.worksheet_name", "Foglio1")?
            .set_default("google.drive_folder_id", "")?
            .set_default("google.token_url", "https://oauth2.googleapis.com/token")?
            .set_default("google.sheets_base_url", "https://sheets.googleapis.com")?
            .set_default("google.drive_upload_base_url", "https://www.googleapis.com")?
            .set_default("google.speech_base_url", "https://speech.googleapis.com")?
            .set_default("google.http_timeout_secs", 60_i64)?
            .set_default("google.upload_chunk_bytes", 8_i64 * 1024 * 1024)?
            .set_default("speech.language_code", "it-IT")?
            .set_default("speech.encoding", "WEBM_OPUS")?
            .set_default("speech.sample_rate_hertz", 48_000_i64)?
            .set_default("speech.timeout_secs", 300_i64)?
            .set_default("speech.poll_interval_ms", 1_000_i64)?
            .set_default("ledger.latest_entries_limit", 5_i64)?
            .set_default("ledger.row_layout", "canonical")?
            .set_default("ledger.trim_combined_text", false)?)
    }

    /// Fail-fast checks run before any client is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.allowed_origins.iter().all(|o| o.trim().is_empty()) {
            return Err(invalid("server.allowed_origins must list at least one origin"));
        }
        if self.server.max_body_bytes == 0 {
            return Err(invalid("server.max_body_bytes must be positive"));
        }
        AudioEncoding::parse(&self.speech.encoding)
            .map_err(|e| invalid(format!("speech.encoding: {}", e)))?;
        if self.speech.sample_rate_hertz == 0 {
            return Err(invalid("speech.sample_rate_hertz must be positive"));
        }
        if self.speech.language_code.trim().is_empty() {
            return Err(invalid("speech.language_code is empty"));
        }
        if self.speech.timeout_secs == 0 {
            return Err(invalid("speech.timeout_secs must be positive"));
        }
        if self.ledger.latest_entries_limit == 0 {
            return Err(invalid("ledger.latest_entries_limit must be positive"));
        }

        if self.mode == BackendMode::Google {
            let g = &self.google;
            for (key, value) in [
                ("google.credentials_path", &g.credentials_path),
                ("google.spreadsheet_id", &g.spreadsheet_id),
                ("google.worksheet_name", &g.worksheet_name),
            ] {
                if value.trim().is_empty() {
                    return Err(invalid(format!("{} is required in google mode", key)));
                }
            }
            if !Path::new(g.credentials_path.trim()).is_file() {
                return Err(invalid(format!(
                    "google.credentials_path {} is not a readable file",
                    g.credentials_path
                )));
            }
            if g.drive_folder_id.trim().is_empty() {
                // Uploads will report the storage client as unavailable.
                tracing::warn!("google.drive_folder_id is empty; file attachments will be rejected");
            }
            if g.http_timeout_secs == 0 {
                return Err(invalid("google.http_timeout_secs must be positive"));
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn default_encoding(&self) -> AudioEncoding {
        AudioEncoding::parse(&self.speech.encoding).unwrap_or_default()
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}
