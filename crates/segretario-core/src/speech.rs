//! **Speech-to-Text**: long-running recognition of uploaded audio.
//!
//! `GoogleSpeechClient` submits `speech:longrunningrecognize` and polls the returned operation
//! until it is done or the deadline passes. `PlaceholderRecognizer` answers locally for mock mode.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::credentials::TokenSource;
use crate::error::SpeechError;

/// Audio encodings accepted by the recognition API (v1 enum names).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AudioEncoding {
    EncodingUnspecified,
    Linear16,
    Flac,
    Mulaw,
    Amr,
    AmrWb,
    OggOpus,
    SpeexWithHeaderByte,
    Mp3,
    #[default]
    WebmOpus,
}

/// The requested encoding after normalization, which matched no [`AudioEncoding`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unsupported audio encoding {0}")]
pub struct UnsupportedEncoding(pub String);

impl AudioEncoding {
    pub const ALL: [AudioEncoding; 10] = [
        AudioEncoding::EncodingUnspecified,
        AudioEncoding::Linear16,
        AudioEncoding::Flac,
        AudioEncoding::Mulaw,
        AudioEncoding::Amr,
        AudioEncoding::AmrWb,
        AudioEncoding::OggOpus,
        AudioEncoding::SpeexWithHeaderByte,
        AudioEncoding::Mp3,
        AudioEncoding::WebmOpus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AudioEncoding::EncodingUnspecified => "ENCODING_UNSPECIFIED",
            AudioEncoding::Linear16 => "LINEAR16",
            AudioEncoding::Flac => "FLAC",
            AudioEncoding::Mulaw => "MULAW",
            AudioEncoding::Amr => "AMR",
            AudioEncoding::AmrWb => "AMR_WB",
            AudioEncoding::OggOpus => "OGG_OPUS",
            AudioEncoding::SpeexWithHeaderByte => "SPEEX_WITH_HEADER_BYTE",
            AudioEncoding::Mp3 => "MP3",
            AudioEncoding::WebmOpus => "WEBM_OPUS",
        }
    }

    /// Uppercase and turn hyphens into underscores (`webm-opus` -> `WEBM_OPUS`).
    pub fn normalize(raw: &str) -> String {
        raw.to_uppercase().replace('-', "_")
    }

    pub fn parse(raw: &str) -> Result<Self, UnsupportedEncoding> {
        let normalized = Self::normalize(raw);
        Self::ALL
            .into_iter()
            .find(|e| e.as_str() == normalized)
            .ok_or(UnsupportedEncoding(normalized))
    }
}

impl std::fmt::Display for AudioEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recognition parameters resolved for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionSettings {
    pub encoding: AudioEncoding,
    pub sample_rate_hertz: u32,
    pub language_code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RecognitionAlternative {
    #[serde(default)]
    pub transcript: String,
    #[serde(default)]
    pub confidence: f64,
}

/// One segment of a recognition response. Alternatives are ordered best-first.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RecognitionResult {
    #[serde(default)]
    pub alternatives: Vec<RecognitionAlternative>,
}

/// Top alternative of every segment, space-joined and trimmed. Segments with no alternatives
/// contribute nothing.
pub fn join_transcript(results: &[RecognitionResult]) -> String {
    let mut transcript = String::new();
    for alt in results.iter().filter_map(|r| r.alternatives.first()) {
        transcript.push_str(&alt.transcript);
        transcript.push(' ');
    }
    transcript.trim().to_string()
}

/// Backend for turning an audio buffer into recognition segments.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Run one recognition job to completion, giving up after `timeout`.
    async fn long_running_recognize(
        &self,
        audio: Vec<u8>,
        settings: &RecognitionSettings,
        timeout: Duration,
    ) -> Result<Vec<RecognitionResult>, SpeechError>;
}

#[derive(Serialize)]
struct RecognitionAudio {
    content: String,
}

#[derive(Serialize)]
struct LongRunningRequest<'a> {
    config: &'a RecognitionSettings,
    audio: RecognitionAudio,
}

#[derive(Debug, Deserialize)]
struct Operation {
    name: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<OperationStatus>,
    #[serde(default)]
    response: Option<RecognizeResponse>,
}

#[derive(Debug, Deserialize)]
struct OperationStatus {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct RecognizeResponse {
    #[serde(default)]
    results: Vec<RecognitionResult>,
}

/// Google Cloud Speech-to-Text v1 REST client.
pub struct GoogleSpeechClient {
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    base_url: String,
    poll_interval: Duration,
}

impl GoogleSpeechClient {
    pub fn new(
        http: reqwest::Client,
        tokens: Arc<dyn TokenSource>,
        base_url: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            http,
            tokens,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            poll_interval,
        }
    }

    async fn submit(
        &self,
        audio: Vec<u8>,
        settings: &RecognitionSettings,
    ) -> Result<Operation, SpeechError> {
        let body = LongRunningRequest {
            config: settings,
            audio: RecognitionAudio {
                content: base64::engine::general_purpose::STANDARD.encode(audio),
            },
        };
        let token = self.tokens.access_token().await?;
        let res = self
            .http
            .post(format!("{}/v1/speech:longrunningrecognize", self.base_url))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        read_operation(res).await
    }

    async fn poll(&self, name: &str) -> Result<Operation, SpeechError> {
        let token = self.tokens.access_token().await?;
        let res = self
            .http
            .get(format!("{}/v1/operations/{}", self.base_url, name))
            .bearer_auth(token)
            .send()
            .await?;
        read_operation(res).await
    }

    async fn run(
        &self,
        audio: Vec<u8>,
        settings: &RecognitionSettings,
    ) -> Result<Vec<RecognitionResult>, SpeechError> {
        let mut op = self.submit(audio, settings).await?;
        tracing::info!(
            "[SPEECH] Recognition operation {} submitted ({}, {} Hz, {})",
            op.name,
            settings.encoding,
            settings.sample_rate_hertz,
            settings.language_code
        );
        while !op.done {
            tokio::time::sleep(self.poll_interval).await;
            let name = op.name.clone();
            op = self.poll(&name).await?;
        }
        if let Some(status) = op.error {
            return Err(SpeechError::Operation {
                code: status.code,
                message: status.message,
            });
        }
        Ok(op.response.unwrap_or_default().results)
    }
}

async fn read_operation(res: reqwest::Response) -> Result<Operation, SpeechError> {
    let status = res.status();
    if !status.is_success() {
        let body = res.text().await.unwrap_or_default();
        return Err(SpeechError::Api {
            status: status.as_u16(),
            body,
        });
    }
    Ok(res.json().await?)
}

#[async_trait]
impl SpeechRecognizer for GoogleSpeechClient {
    async fn long_running_recognize(
        &self,
        audio: Vec<u8>,
        settings: &RecognitionSettings,
        timeout: Duration,
    ) -> Result<Vec<RecognitionResult>, SpeechError> {
        tokio::time::timeout(timeout, self.run(audio, settings))
            .await
            .map_err(|_| SpeechError::Timeout(timeout))?
    }
}

/// Recognizer for mock mode: answers immediately without any remote call.
#[derive(Debug, Default)]
pub struct PlaceholderRecognizer {
    /// If set, returned as the only segment instead of the default description.
    pub response: Option<String>,
}

impl PlaceholderRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self {
            response: Some(s.into()),
        }
    }
}

#[async_trait]
impl SpeechRecognizer for PlaceholderRecognizer {
    async fn long_running_recognize(
        &self,
        audio: Vec<u8>,
        settings: &RecognitionSettings,
        _timeout: Duration,
    ) -> Result<Vec<RecognitionResult>, SpeechError> {
        let transcript = self.response.clone().unwrap_or_else(|| {
            format!(
                "[placeholder transcript: {} bytes, {} {} Hz, {}]",
                audio.len(),
                settings.encoding,
                settings.sample_rate_hertz,
                settings.language_code
            )
        });
        Ok(vec![RecognitionResult {
            alternatives: vec![RecognitionAlternative {
                transcript,
                confidence: 1.0,
            }],
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{spawn_stub, StaticToken};
    use axum::{extract::Path, routing::post, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn segment(alts: &[&str]) -> RecognitionResult {
        RecognitionResult {
            alternatives: alts
                .iter()
                .map(|t| RecognitionAlternative {
                    transcript: t.to_string(),
                    confidence: 0.9,
                })
                .collect(),
        }
    }

    #[test]
    fn encoding_is_normalized_before_lookup() {
        assert_eq!(AudioEncoding::parse("webm-opus").unwrap(), AudioEncoding::WebmOpus);
        assert_eq!(AudioEncoding::parse("linear16").unwrap(), AudioEncoding::Linear16);
        assert_eq!(AudioEncoding::parse("Amr-Wb").unwrap(), AudioEncoding::AmrWb);
        let err = AudioEncoding::parse("audio/wav").unwrap_err();
        assert_eq!(err.0, "AUDIO/WAV");
    }

    #[test]
    fn every_encoding_round_trips_through_its_name() {
        for enc in AudioEncoding::ALL {
            assert_eq!(AudioEncoding::parse(enc.as_str()).unwrap(), enc);
        }
    }

    #[test]
    fn settings_serialize_in_api_shape() {
        let settings = RecognitionSettings {
            encoding: AudioEncoding::OggOpus,
            sample_rate_hertz: 16_000,
            language_code: "en-US".into(),
        };
        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "encoding": "OGG_OPUS",
                "sampleRateHertz": 16000,
                "languageCode": "en-US"
            })
        );
    }

    #[test]
    fn transcript_joins_top_alternatives() {
        let results = vec![
            segment(&["buongiorno", "buon giorno"]),
            segment(&[]),
            segment(&["a tutti "]),
        ];
        assert_eq!(join_transcript(&results), "buongiorno a tutti");
        assert_eq!(join_transcript(&[]), "");
    }

    #[test]
    fn operation_response_parses_results() {
        let op: Operation = serde_json::from_str(
            r#"{
                "name": "4242",
                "done": true,
                "response": {
                    "@type": "type.googleapis.com/google.cloud.speech.v1.LongRunningRecognizeResponse",
                    "results": [{"alternatives": [{"transcript": "ciao", "confidence": 0.93}]}]
                }
            }"#,
        )
        .unwrap();
        assert!(op.done);
        assert_eq!(join_transcript(&op.response.unwrap().results), "ciao");

        let pending: Operation = serde_json::from_str(r#"{"name": "4242"}"#).unwrap();
        assert!(!pending.done);
    }

    #[tokio::test]
    async fn placeholder_returns_configured_response() {
        let settings = RecognitionSettings {
            encoding: AudioEncoding::WebmOpus,
            sample_rate_hertz: 48_000,
            language_code: "it-IT".into(),
        };
        let rec = PlaceholderRecognizer::with_response("hello world");
        let results = rec
            .long_running_recognize(vec![1, 2, 3], &settings, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(join_transcript(&results), "hello world");

        let rec = PlaceholderRecognizer::new();
        let results = rec
            .long_running_recognize(vec![0; 10], &settings, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(join_transcript(&results).contains("10 bytes"));
    }

    fn italian_webm() -> RecognitionSettings {
        RecognitionSettings {
            encoding: AudioEncoding::WebmOpus,
            sample_rate_hertz: 48_000,
            language_code: "it-IT".into(),
        }
    }

    /// Speech API stub: `submit` answers the initial request; each poll of `operations/op-1`
    /// returns the next entry of `polls`, repeating the last one.
    async fn speech_stub(
        submit: serde_json::Value,
        polls: Vec<serde_json::Value>,
        submitted: Arc<Mutex<Option<serde_json::Value>>>,
        poll_count: Arc<AtomicUsize>,
    ) -> String {
        let app = Router::new().route(
            "/v1/*rest",
            post(move |Path(rest): Path<String>, Json(body): Json<serde_json::Value>| {
                assert_eq!(rest, "speech:longrunningrecognize");
                *submitted.lock().unwrap() = Some(body);
                let submit = submit.clone();
                async move { Json(submit) }
            })
            .get(move |Path(rest): Path<String>| {
                assert_eq!(rest, "operations/op-1");
                let n = poll_count.fetch_add(1, Ordering::SeqCst);
                let reply = polls[n.min(polls.len() - 1)].clone();
                async move { Json(reply) }
            }),
        );
        spawn_stub(app).await
    }

    fn client(base: String) -> GoogleSpeechClient {
        GoogleSpeechClient::new(
            reqwest::Client::new(),
            Arc::new(StaticToken::new("t")),
            base,
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn long_running_job_is_polled_until_done() {
        let submitted: Arc<Mutex<Option<serde_json::Value>>> = Arc::default();
        let polls = Arc::new(AtomicUsize::new(0));
        let base = speech_stub(
            serde_json::json!({"name": "op-1"}),
            vec![
                serde_json::json!({"name": "op-1", "metadata": {"progressPercent": 40}}),
                serde_json::json!({"name": "op-1", "done": false}),
                serde_json::json!({
                    "name": "op-1",
                    "done": true,
                    "response": {"results": [
                        {"alternatives": [{"transcript": "ciao", "confidence": 0.9}]},
                        {"alternatives": [{"transcript": "mondo", "confidence": 0.8}]}
                    ]}
                }),
            ],
            Arc::clone(&submitted),
            Arc::clone(&polls),
        )
        .await;

        let results = client(base)
            .long_running_recognize(b"opus".to_vec(), &italian_webm(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(join_transcript(&results), "ciao mondo");
        assert_eq!(polls.load(Ordering::SeqCst), 3);

        let body = submitted.lock().unwrap().clone().unwrap();
        assert_eq!(body["config"]["encoding"], "WEBM_OPUS");
        assert_eq!(body["config"]["sampleRateHertz"], 48000);
        assert_eq!(body["config"]["languageCode"], "it-IT");
        assert_eq!(
            body["audio"]["content"],
            base64::engine::general_purpose::STANDARD.encode(b"opus")
        );
    }

    #[tokio::test]
    async fn failed_operation_reports_code_and_message() {
        let base = speech_stub(
            serde_json::json!({
                "name": "op-1",
                "done": true,
                "error": {"code": 3, "message": "bad sample rate"}
            }),
            vec![serde_json::json!({})],
            Arc::default(),
            Arc::default(),
        )
        .await;

        let err = client(base)
            .long_running_recognize(vec![0; 4], &italian_webm(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SpeechError::Operation { code: 3, .. }));
        assert_eq!(err.to_string(), "recognition operation failed (3): bad sample rate");
    }

    #[tokio::test]
    async fn unfinished_job_times_out_with_exact_deadline() {
        let polls = Arc::new(AtomicUsize::new(0));
        let base = speech_stub(
            serde_json::json!({"name": "op-1"}),
            vec![serde_json::json!({"name": "op-1", "done": false})],
            Arc::default(),
            Arc::clone(&polls),
        )
        .await;

        let err = client(base)
            .long_running_recognize(vec![0; 4], &italian_webm(), Duration::from_millis(150))
            .await
            .unwrap_err();
        assert!(matches!(err, SpeechError::Timeout(d) if d == Duration::from_millis(150)));
        assert_eq!(err.to_string(), "recognition did not finish within 150ms");
        assert!(polls.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn unsupported_encoding_message() {
        let err = AudioEncoding::parse("aac").unwrap_err();
        assert_eq!(err.to_string(), "unsupported audio encoding AAC");
    }
}
