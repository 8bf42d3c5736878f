//! In-memory sheet and storage for `mode = "mock"`. Nothing leaves the process.

use async_trait::async_trait;
use std::sync::Mutex;

use crate::error::{SheetError, StorageError};
use crate::sheets::{fill_gaps, SheetStore};
use crate::storage::{ObjectStore, UploadedFile};

/// Header written by the mock sheet; matches the columns of a ledger row.
pub const DEFAULT_HEADER: [&str; 3] = ["Data", "Testo", "File"];

/// Worksheet held in a `Vec`, header row first.
#[derive(Debug)]
pub struct MemorySheet {
    rows: Mutex<Vec<Vec<String>>>,
}

impl Default for MemorySheet {
    fn default() -> Self {
        Self::with_header(&DEFAULT_HEADER)
    }
}

impl MemorySheet {
    pub fn with_header(header: &[&str]) -> Self {
        Self::with_rows(vec![header.iter().map(|h| h.to_string()).collect()])
    }

    pub fn with_rows(rows: Vec<Vec<String>>) -> Self {
        Self {
            rows: Mutex::new(rows),
        }
    }

    /// Snapshot of every row, header included.
    pub fn rows(&self) -> Vec<Vec<String>> {
        self.rows.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SheetStore for MemorySheet {
    async fn append_row(&self, row: Vec<String>) -> Result<(), SheetError> {
        self.rows
            .lock()
            .map_err(|e| SheetError::Backend(format!("memory sheet lock poisoned: {}", e)))?
            .push(row);
        Ok(())
    }

    async fn read_all_rows(&self) -> Result<Vec<Vec<String>>, SheetError> {
        let rows = self
            .rows
            .lock()
            .map_err(|e| SheetError::Backend(format!("memory sheet lock poisoned: {}", e)))?
            .clone();
        Ok(fill_gaps(rows))
    }
}

/// Stored attachment metadata (content is dropped after counting).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub file_name: String,
    pub mime_type: String,
    pub size: usize,
    pub url: String,
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: Mutex<Vec<StoredObject>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn objects(&self) -> Vec<StoredObject> {
        self.objects.lock().map(|o| o.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ObjectStore for MemoryStorage {
    async fn upload(&self, file: UploadedFile) -> Result<String, StorageError> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|e| StorageError::Backend(format!("memory storage lock poisoned: {}", e)))?;
        let url = format!("memory://uploads/{}/{}", objects.len() + 1, file.file_name);
        objects.push(StoredObject {
            file_name: file.file_name,
            mime_type: file.mime_type,
            size: file.bytes.len(),
            url: url.clone(),
        });
        Ok(url)
    }
}
