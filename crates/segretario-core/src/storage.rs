//! Object storage: resumable uploads into one Google Drive folder.
//!
//! Files are sent in fixed-size chunks (multiples of 256 KiB, as the Drive API requires); each
//! chunk is logged with overall progress. The result is a shareable `drive.google.com` link.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use crate::credentials::TokenSource;
use crate::error::StorageError;

/// Drive requires every non-final chunk to be a multiple of this.
pub const CHUNK_GRANULARITY: usize = 256 * 1024;

/// Consecutive `308` answers without progress before the upload is abandoned.
const MAX_STALLED_CHUNKS: u32 = 3;

/// A file received from the client, held in memory only for the duration of the request.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(file_name: impl Into<String>, mime_type: Option<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Storage for attachments. Returns a reference the ledger can record.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store the file and return its shareable URL.
    async fn upload(&self, file: UploadedFile) -> Result<String, StorageError>;
}

pub fn drive_share_url(file_id: &str) -> String {
    format!("https://drive.google.com/file/d/{}/view?usp=sharing", file_id)
}

/// Round `requested` down to the chunk granularity, never below one granule.
pub fn normalize_chunk_size(requested: usize) -> usize {
    (requested / CHUNK_GRANULARITY).max(1) * CHUNK_GRANULARITY
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
}

/// Google Drive v3 client that uploads into a single parent folder.
pub struct GoogleDriveClient {
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    upload_base_url: String,
    folder_id: String,
    chunk_size: usize,
}

impl GoogleDriveClient {
    /// `http` must not follow redirects: Drive answers an accepted chunk with `308`.
    pub fn new(
        http: reqwest::Client,
        tokens: Arc<dyn TokenSource>,
        upload_base_url: impl Into<String>,
        folder_id: impl Into<String>,
        chunk_size: usize,
    ) -> Self {
        Self {
            http,
            tokens,
            upload_base_url: upload_base_url.into().trim_end_matches('/').to_string(),
            folder_id: folder_id.into(),
            chunk_size: normalize_chunk_size(chunk_size),
        }
    }

    async fn start_session(&self, file: &UploadedFile) -> Result<String, StorageError> {
        let token = self.tokens.access_token().await?;
        let res = self
            .http
            .post(format!("{}/upload/drive/v3/files", self.upload_base_url))
            .query(&[("uploadType", "resumable"), ("supportsAllDrives", "true")])
            .bearer_auth(token)
            .header("X-Upload-Content-Type", file.mime_type.as_str())
            .header("X-Upload-Content-Length", file.len().to_string())
            .json(&serde_json::json!({
                "name": file.file_name,
                "parents": [self.folder_id],
            }))
            .send()
            .await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(StorageError::Api {
                status: status.as_u16(),
                body,
            });
        }
        res.headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| StorageError::Session("no Location header in session response".into()))
    }

    async fn send_chunks(&self, session: &str, file: &UploadedFile) -> Result<DriveFile, StorageError> {
        let total = file.len();
        // First byte the server has not confirmed yet.
        let mut offset = 0usize;
        let mut stalled = 0u32;
        loop {
            let end = (offset + self.chunk_size).min(total);
            let content_range = if total == 0 {
                "bytes */0".to_string()
            } else {
                format!("bytes {}-{}/{}", offset, end - 1, total)
            };
            let token = self.tokens.access_token().await?;
            let res = self
                .http
                .put(session)
                .bearer_auth(token)
                .header(reqwest::header::CONTENT_RANGE, content_range)
                .body(file.bytes[offset..end].to_vec())
                .send()
                .await?;

            match res.status().as_u16() {
                200 | 201 => {
                    tracing::info!("[DRIVE] Upload of {} complete (100%)", file.file_name);
                    return Ok(res.json().await?);
                }
                308 => {
                    // `Range: bytes=0-N` is what the server has persisted; no header means nothing.
                    let confirmed = res
                        .headers()
                        .get(reqwest::header::RANGE)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|r| r.rsplit('-').next())
                        .and_then(|n| n.parse::<usize>().ok())
                        .map(|last| last + 1)
                        .unwrap_or(0);
                    if confirmed > offset {
                        offset = confirmed;
                        stalled = 0;
                    } else {
                        stalled += 1;
                        if stalled > MAX_STALLED_CHUNKS {
                            return Err(StorageError::Session(format!(
                                "no progress after {} attempts at offset {}",
                                stalled, offset
                            )));
                        }
                        tracing::warn!(
                            "[DRIVE] Chunk at offset {} of {} not persisted, resending",
                            offset,
                            file.file_name
                        );
                    }
                    if offset >= total {
                        return Err(StorageError::Session(
                            "server accepted every byte but did not finalize the file".into(),
                        ));
                    }
                    tracing::info!(
                        "[DRIVE] Uploading {}: {}%",
                        file.file_name,
                        offset * 100 / total
                    );
                }
                code => {
                    let body = res.text().await.unwrap_or_default();
                    return Err(StorageError::Api { status: code, body });
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for GoogleDriveClient {
    async fn upload(&self, file: UploadedFile) -> Result<String, StorageError> {
        tracing::info!(
            "[DRIVE] Uploading {} ({}, {} bytes) into folder {}",
            file.file_name,
            file.mime_type,
            file.len(),
            self.folder_id
        );
        let session = self.start_session(&file).await?;
        let created = self.send_chunks(&session, &file).await?;
        let url = drive_share_url(&created.id);
        tracing::info!("[DRIVE] File stored with id {}: {}", created.id, url);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{bind_stub, serve_stub, spawn_stub, StaticToken};
    use axum::{
        http::{HeaderMap, StatusCode},
        response::IntoResponse,
        routing::{post, put},
        Json, Router,
    };
    use std::sync::Mutex;

    #[test]
    fn chunk_size_is_rounded_to_granularity() {
        assert_eq!(normalize_chunk_size(0), CHUNK_GRANULARITY);
        assert_eq!(normalize_chunk_size(CHUNK_GRANULARITY + 1), CHUNK_GRANULARITY);
        assert_eq!(normalize_chunk_size(3 * CHUNK_GRANULARITY), 3 * CHUNK_GRANULARITY);
    }

    #[test]
    fn missing_mime_type_falls_back_to_octet_stream() {
        let f = UploadedFile::new("nota.bin", None, vec![1]);
        assert_eq!(f.mime_type, "application/octet-stream");
        let f = UploadedFile::new("nota.webm", Some("audio/webm".into()), vec![]);
        assert_eq!(f.mime_type, "audio/webm");
        assert!(f.is_empty());
    }

    #[test]
    fn share_url_format() {
        assert_eq!(
            drive_share_url("abc"),
            "https://drive.google.com/file/d/abc/view?usp=sharing"
        );
    }

    #[tokio::test]
    async fn resumable_upload_sends_chunks_until_finalized() {
        let (listener, base) = bind_stub().await;
        let session_url = format!("{}/session", base);
        let ranges: Arc<Mutex<Vec<String>>> = Arc::default();
        let seen = Arc::clone(&ranges);
        let app = Router::new()
            .route(
                "/upload/drive/v3/files",
                post(move |headers: HeaderMap, Json(meta): Json<serde_json::Value>| {
                    let session_url = session_url.clone();
                    async move {
                        assert_eq!(meta["parents"][0], "folder-1");
                        assert_eq!(meta["name"], "voce.webm");
                        assert_eq!(headers["x-upload-content-type"], "audio/webm");
                        let mut out = HeaderMap::new();
                        out.insert("location", session_url.parse().unwrap());
                        (StatusCode::OK, out)
                    }
                }),
            )
            .route(
                "/session",
                put(move |headers: HeaderMap, body: axum::body::Bytes| {
                    let range = headers["content-range"].to_str().unwrap().to_string();
                    seen.lock().unwrap().push(range.clone());
                    // "bytes {first}-{last}/{total}"
                    let (span, total) = range.trim_start_matches("bytes ").split_once('/').unwrap();
                    let total: usize = total.parse().unwrap();
                    let last: usize = span.split_once('-').unwrap().1.parse().unwrap();
                    assert!(!body.is_empty());
                    let res = if last + 1 < total {
                        let mut out = HeaderMap::new();
                        out.insert("range", format!("bytes=0-{}", last).parse().unwrap());
                        (StatusCode::PERMANENT_REDIRECT, out).into_response()
                    } else {
                        Json(serde_json::json!({"id": "file-xyz", "name": "voce.webm"}))
                            .into_response()
                    };
                    async move { res }
                }),
            );
        serve_stub(listener, app);

        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();
        let client = GoogleDriveClient::new(
            http,
            Arc::new(StaticToken::new("t")),
            base,
            "folder-1",
            CHUNK_GRANULARITY,
        );
        let bytes = vec![7u8; CHUNK_GRANULARITY * 2 + 10];
        let url = client
            .upload(UploadedFile::new("voce.webm", Some("audio/webm".into()), bytes))
            .await
            .unwrap();
        assert_eq!(url, drive_share_url("file-xyz"));

        let ranges = ranges.lock().unwrap().clone();
        let total = CHUNK_GRANULARITY * 2 + 10;
        assert_eq!(
            ranges,
            vec![
                format!("bytes 0-{}/{}", CHUNK_GRANULARITY - 1, total),
                format!("bytes {}-{}/{}", CHUNK_GRANULARITY, 2 * CHUNK_GRANULARITY - 1, total),
                format!("bytes {}-{}/{}", 2 * CHUNK_GRANULARITY, total - 1, total),
            ]
        );
    }

    /// Session stub that persists only contiguous chunks. The first `bare_308s` PUTs are
    /// answered with a `308` carrying no `Range` header and are not persisted.
    fn strict_session(
        bare_308s: usize,
        ranges: Arc<Mutex<Vec<String>>>,
    ) -> axum::routing::MethodRouter {
        let state = Arc::new(Mutex::new((0usize, bare_308s)));
        put(move |headers: HeaderMap, body: axum::body::Bytes| {
            let range = headers["content-range"].to_str().unwrap().to_string();
            ranges.lock().unwrap().push(range.clone());
            let (span, total) = range.trim_start_matches("bytes ").split_once('/').unwrap();
            let total: usize = total.parse().unwrap();
            let (first, last) = span.split_once('-').unwrap();
            let (first, last): (usize, usize) = (first.parse().unwrap(), last.parse().unwrap());
            assert_eq!(body.len(), last - first + 1);

            let mut state = state.lock().unwrap();
            let (committed, bare_left) = &mut *state;
            let res = if *bare_left > 0 {
                *bare_left -= 1;
                (StatusCode::PERMANENT_REDIRECT, HeaderMap::new()).into_response()
            } else if first != *committed {
                (StatusCode::BAD_REQUEST, format!("gap: expected offset {}", committed))
                    .into_response()
            } else if last + 1 < total {
                *committed = last + 1;
                let mut out = HeaderMap::new();
                out.insert("range", format!("bytes=0-{}", last).parse().unwrap());
                (StatusCode::PERMANENT_REDIRECT, out).into_response()
            } else {
                Json(serde_json::json!({"id": "file-retry"})).into_response()
            };
            async move { res }
        })
    }

    async fn drive_with_session(session: axum::routing::MethodRouter) -> GoogleDriveClient {
        let (listener, base) = bind_stub().await;
        let session_url = format!("{}/session", base);
        let app = Router::new()
            .route(
                "/upload/drive/v3/files",
                post(move || {
                    let mut out = HeaderMap::new();
                    out.insert("location", session_url.parse().unwrap());
                    async move { (StatusCode::OK, out) }
                }),
            )
            .route("/session", session);
        serve_stub(listener, app);
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();
        GoogleDriveClient::new(
            http,
            Arc::new(StaticToken::new("t")),
            base,
            "folder-1",
            CHUNK_GRANULARITY,
        )
    }

    #[tokio::test]
    async fn bare_308_resends_chunk_from_last_confirmed_offset() {
        let ranges: Arc<Mutex<Vec<String>>> = Arc::default();
        let client = drive_with_session(strict_session(1, Arc::clone(&ranges))).await;
        let total = CHUNK_GRANULARITY * 2;
        let url = client
            .upload(UploadedFile::new("nota.ogg", Some("audio/ogg".into()), vec![3u8; total]))
            .await
            .unwrap();
        assert_eq!(url, drive_share_url("file-retry"));
        assert_eq!(
            ranges.lock().unwrap().clone(),
            vec![
                format!("bytes 0-{}/{}", CHUNK_GRANULARITY - 1, total),
                format!("bytes 0-{}/{}", CHUNK_GRANULARITY - 1, total),
                format!("bytes {}-{}/{}", CHUNK_GRANULARITY, total - 1, total),
            ]
        );
    }

    #[tokio::test]
    async fn upload_without_progress_gives_up() {
        let ranges: Arc<Mutex<Vec<String>>> = Arc::default();
        let client = drive_with_session(strict_session(usize::MAX, Arc::clone(&ranges))).await;
        let err = client
            .upload(UploadedFile::new("a.bin", None, vec![1u8; 10]))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Session(_)));
        let ranges = ranges.lock().unwrap();
        assert_eq!(ranges.len(), MAX_STALLED_CHUNKS as usize + 1);
        assert!(ranges.iter().all(|r| r == "bytes 0-9/10"));
    }

    #[tokio::test]
    async fn rejected_session_is_an_api_error() {
        let app = Router::new().route(
            "/upload/drive/v3/files",
            post(|| async { (StatusCode::NOT_FOUND, "File not found: folder-1") }),
        );
        let base = spawn_stub(app).await;
        let client = GoogleDriveClient::new(
            reqwest::Client::new(),
            Arc::new(StaticToken::new("t")),
            base,
            "folder-1",
            CHUNK_GRANULARITY,
        );
        let err = client
            .upload(UploadedFile::new("a.txt", Some("text/plain".into()), b"ciao".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Api { status: 404, .. }));
    }
}
