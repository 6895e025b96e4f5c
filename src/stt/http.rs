//! HTTP batch recognizer (whisper.cpp-style inference server).
//!
//! Audio is posted as raw 16-bit PCM; the server answers `{"text": "..."}`.
//! Streaming recognition posts each chunk in order.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::warn;

use super::{AudioStream, SegmentStream, SpeechBackend};
use crate::config::SttConfig;
use crate::error::{Result, SpeechError};
use crate::pipeline::messages::TranscriptSegment;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct InferenceResponse {
    #[serde(default)]
    text: String,
}

/// Recognizer backed by an HTTP inference endpoint.
#[derive(Debug, Clone)]
pub struct HttpRecognizer {
    client: reqwest::Client,
    endpoint: url::Url,
    sample_rate_hz: u32,
    language_code: String,
    initial_prompt: Option<String>,
}

impl HttpRecognizer {
    /// Build a recognizer for `config.server_url`.
    ///
    /// # Errors
    ///
    /// Returns a config error if the URL is invalid or not http(s).
    pub fn new(config: &SttConfig) -> Result<Self> {
        let endpoint = url::Url::parse(&config.server_url).map_err(|e| {
            SpeechError::Config(format!("invalid stt.server_url '{}': {e}", config.server_url))
        })?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(SpeechError::Config(format!(
                "stt.server_url must be http or https, got '{}'",
                endpoint.scheme()
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SpeechError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            sample_rate_hz: config.sample_rate_hz,
            language_code: config.language_code.clone(),
            initial_prompt: config.initial_prompt.clone(),
        })
    }

    async fn post(&self, audio: Bytes) -> Result<Option<TranscriptSegment>> {
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .query(&[
                ("sample_rate", self.sample_rate_hz.to_string()),
                ("language", self.language_code.clone()),
            ]);
        if let Some(prompt) = &self.initial_prompt {
            request = request.query(&[("prompt", prompt)]);
        }
        let response = request
            .body(audio)
            .send()
            .await
            .map_err(|e| SpeechError::Stt(format!("recognition request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SpeechError::Stt(format!(
                "recognition server HTTP {}",
                status.as_u16()
            )));
        }
        let body: InferenceResponse = response
            .json()
            .await
            .map_err(|e| SpeechError::Stt(format!("invalid recognition response: {e}")))?;
        let text = body.text.trim();
        Ok((!text.is_empty()).then(|| TranscriptSegment::final_text(text)))
    }
}

#[async_trait]
impl SpeechBackend for HttpRecognizer {
    async fn stream_recognize(&self, audio: AudioStream) -> Result<SegmentStream> {
        let this = self.clone();
        Ok(Box::pin(async_stream::stream! {
            let mut audio = audio;
            while let Some(chunk) = audio.next().await {
                match this.post(chunk).await {
                    Ok(Some(segment)) => yield segment,
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "chunk recognition failed"),
                }
            }
        }))
    }

    async fn recognize_batch(&self, audio: Bytes) -> Result<Vec<TranscriptSegment>> {
        Ok(self.post(audio).await?.into_iter().collect())
    }
}
