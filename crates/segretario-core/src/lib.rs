//! Segretario core library.
//! Entry ledger on a Google Sheets worksheet, attachments in Google Drive, dictation via
//! Google Speech-to-Text.

pub mod bootstrap;
pub mod config;
pub mod credentials;
pub mod error;
pub mod ledger;
pub mod memory;
pub mod sheets;
pub mod speech;
pub mod storage;

#[cfg(test)]
mod testing;

pub use bootstrap::build_service;
pub use config::{BackendMode, ConfigError, GatewayConfig, RowLayout};
pub use error::{LedgerError, LedgerResult};
pub use ledger::{
    ClientHandle, ComponentStatus, EntrySubmission, LedgerService, LedgerSettings,
    ReadinessReport, TranscriptionRequest,
};
pub use memory::{MemorySheet, MemoryStorage};
pub use speech::{AudioEncoding, PlaceholderRecognizer};
pub use storage::UploadedFile;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
