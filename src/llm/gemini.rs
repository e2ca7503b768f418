//! Google Gemini provider implementation
//!
//! Uses `streamGenerateContent` with `alt=sse`, so each server-sent event
//! carries one partial `GenerateContentResponse`.

use super::config::LlmConfig;
use super::types::{LlmRequest, MessageRole};
use super::{LlmError, LlmService, TokenStream};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Gemini service implementation
pub struct GeminiService {
    client: Client,
    api_key: Option<String>,
    url: String,
    model_id: String,
    max_output_tokens: u32,
    temperature: f32,
}

impl GeminiService {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            config.base_url.trim_end_matches('/'),
            config.model
        );

        // No overall timeout here: the bridge bounds each fragment and the
        // whole stream itself.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| LlmError::unknown(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            url,
            model_id: config.model.clone(),
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
        })
    }

    fn translate_request(&self, request: &LlmRequest) -> GeminiRequest {
        let contents = request
            .messages
            .iter()
            .filter(|msg| !msg.text.is_empty())
            .map(|msg| {
                let role = match msg.role {
                    MessageRole::User => "user",
                    MessageRole::Assistant => "model",
                };
                GeminiContent {
                    role: Some(role.to_string()),
                    parts: vec![GeminiPart {
                        text: Some(msg.text.clone()),
                    }],
                }
            })
            .collect();

        GeminiRequest {
            contents,
            generation_config: GeminiGenerationConfig {
                max_output_tokens: self.max_output_tokens,
                temperature: self.temperature,
            },
        }
    }
}

#[async_trait]
impl LlmService for GeminiService {
    async fn stream(&self, request: &LlmRequest) -> Result<TokenStream, LlmError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| LlmError::auth("GOOGLE_API_KEY is not set"))?;

        let response = self
            .client
            .post(&self.url)
            .header("x-goog-api-key", api_key)
            .json(&self.translate_request(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::timeout(format!("Request timeout: {e}"))
                } else if e.is_connect() {
                    LlmError::network(format!("Connection failed: {e}"))
                } else {
                    LlmError::unknown(format!("Request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<GeminiErrorResponse>(&body)
                .map(|r| r.error.message)
                .unwrap_or(body);
            return Err(LlmError::from_status(status.as_u16(), &message));
        }

        let mut bytes = response.bytes_stream();
        Ok(Box::pin(async_stream::stream! {
            let mut events = SseDataLines::default();
            loop {
                let payloads = match bytes.next().await {
                    Some(Ok(chunk)) => events.feed(&chunk),
                    Some(Err(e)) => {
                        yield Err(LlmError::network(format!("Stream interrupted: {e}")));
                        return;
                    }
                    None => {
                        let rest = events.finish();
                        for data in rest {
                            match parse_chunk(&data) {
                                Ok(texts) => {
                                    for text in texts {
                                        yield Ok(text);
                                    }
                                }
                                Err(e) => yield Err(e),
                            }
                        }
                        return;
                    }
                };

                for data in payloads {
                    match parse_chunk(&data) {
                        Ok(texts) => {
                            for text in texts {
                                yield Ok(text);
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
        }))
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// Splits an SSE byte stream into `data:` payloads.
///
/// Buffers raw bytes so a chunk boundary inside a multi-byte character or a
/// line never corrupts the payload. Accepts both `\n` and `\r\n` endings.
#[derive(Debug, Default)]
struct SseDataLines {
    buf: Vec<u8>,
}

impl SseDataLines {
    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(data) = Self::data_payload(&line) {
                payloads.push(data);
            }
        }
        payloads
    }

    fn finish(&mut self) -> Vec<String> {
        let line = std::mem::take(&mut self.buf);
        Self::data_payload(&line).into_iter().collect()
    }

    fn data_payload(line: &[u8]) -> Option<String> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches(['\r', '\n']);
        let data = line.strip_prefix("data:")?.trim_start();
        if data.is_empty() || data == "[DONE]" {
            None
        } else {
            Some(data.to_string())
        }
    }
}

/// Text deltas carried by one streamed response chunk
fn parse_chunk(data: &str) -> Result<Vec<String>, LlmError> {
    let chunk: GeminiStreamChunk = serde_json::from_str(data)
        .map_err(|e| LlmError::unknown(format!("Failed to parse stream chunk: {e}")))?;

    if let Some(error) = chunk.error {
        let status = error.code.and_then(|c| u16::try_from(c).ok()).unwrap_or(500);
        return Err(LlmError::from_status(status, &error.message));
    }

    if let Some(reason) = chunk.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(LlmError::invalid_request(format!("Prompt blocked: {reason}")));
    }

    Ok(chunk
        .candidates
        .into_iter()
        .take(1)
        .filter_map(|c| c.content)
        .flat_map(|content| content.parts)
        .filter_map(|part| part.text)
        .filter(|text| !text.is_empty())
        .collect())
}

// Gemini API types

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiStreamChunk {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    prompt_feedback: Option<GeminiPromptFeedback>,
    error: Option<GeminiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorResponse {
    error: GeminiError,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    message: String,
    code: Option<i64>,
    #[allow(dead_code)]
    status: Option<String>,
}
