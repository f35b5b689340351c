//! REST client for the generative-language service.
//!
//! [`GenerativeBackend`] is the seam the chat and image layers depend on;
//! [`GeminiClient`] is the reqwest implementation.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tracing::{debug, warn};

use super::sse::{SseEvent, SseLineParser};
use super::types::{
    Content, ErrorEnvelope, GenerateContentRequest, GenerateContentResponse, GenerationConfig,
    ROLE_USER, extract_error_message,
};
use crate::config::ApiConfig;
use crate::error::{AuraError, Result};
use crate::retry::RemoteOutcome;

/// Ordered text fragments of one streamed turn.
///
/// An `Err` item ends the stream.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Everything needed to request one text turn.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub system_instruction: Option<String>,
    /// Conversation so far, ending with the new user message.
    pub contents: Vec<Content>,
}

impl TurnRequest {
    fn to_wire(&self) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: self.contents.clone(),
            system_instruction: self.system_instruction.as_deref().map(Content::system),
            generation_config: None,
        }
    }
}

/// Remote operations used by the chat and image layers.
#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    /// Open a streamed text turn.
    ///
    /// Errors returned here happen before any fragment was produced, so the
    /// call may be retried as a whole.
    async fn stream_turn(&self, request: &TurnRequest) -> Result<FragmentStream>;

    /// Generate one image for `prompt`.
    async fn generate_image(&self, prompt: &str) -> RemoteOutcome<Vec<u8>>;
}

/// Client for the REST endpoints.
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    text_model: String,
    image_model: String,
    response_timeout: Duration,
}

impl std::fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiClient")
            .field("base_url", &self.base_url)
            .field("text_model", &self.text_model)
            .field("image_model", &self.image_model)
            .finish_non_exhaustive()
    }
}

impl GeminiClient {
    /// Build a client from the `[api]` section, resolving the API key.
    ///
    /// # Errors
    ///
    /// Returns a config error when no API key is available or the HTTP
    /// client cannot be constructed.
    pub fn from_config(api: &ApiConfig) -> Result<Self> {
        let api_key = api.resolve_api_key()?;
        Self::new(api_key, api)
    }

    /// Build a client with an explicit API key.
    ///
    /// # Errors
    ///
    /// Returns a config error when the HTTP client cannot be constructed.
    pub fn new(api_key: impl Into<String>, api: &ApiConfig) -> Result<Self> {
        let response_timeout = Duration::from_secs(api.request_timeout_secs.max(1));
        let http = reqwest::Client::builder()
            .connect_timeout(response_timeout)
            .build()
            .map_err(|e| AuraError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: api.base_url.trim_end_matches('/').to_owned(),
            text_model: api.text_model.clone(),
            image_model: api.image_model.clone(),
            response_timeout,
        })
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        let model = model.strip_prefix("models/").unwrap_or(model);
        format!("{}/v1beta/models/{model}:{method}", self.base_url)
    }

    /// POST `body` and return the response once its status is known good.
    async fn post<B: Serialize + ?Sized>(&self, url: &str, body: &B) -> Result<reqwest::Response> {
        let send = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send();
        let response = tokio::time::timeout(self.response_timeout, send)
            .await
            .map_err(|_| {
                AuraError::TransientRemote(format!(
                    "no response within {}s",
                    self.response_timeout.as_secs()
                ))
            })??;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            let err = AuraError::from_status(status.as_u16(), extract_error_message(&body_text));
            debug!(status = status.as_u16(), error = %err, "remote call rejected");
            return Err(err);
        }
        Ok(response)
    }

    async fn request_image(&self, prompt: &str) -> Result<Option<Vec<u8>>> {
        let url = self.model_url(&self.image_model, "generateContent");
        let body = GenerateContentRequest {
            contents: vec![Content::text(ROLE_USER, prompt)],
            system_instruction: None,
            generation_config: Some(GenerationConfig {
                response_modalities: Some(vec!["TEXT".to_owned(), "IMAGE".to_owned()]),
                temperature: None,
            }),
        };
        let response = self.post(&url, &body).await?;
        let text = response.text().await?;
        let parsed: GenerateContentResponse = serde_json::from_str(&text)
            .map_err(|e| AuraError::Protocol(format!("invalid image response: {e}")))?;

        if let Some(reason) = parsed.block_reason() {
            warn!(reason, "image prompt blocked");
            return Ok(None);
        }
        let Some(inline) = parsed.inline_data() else {
            debug!("image response carried no inline data");
            return Ok(None);
        };
        match base64::engine::general_purpose::STANDARD.decode(inline.data.as_bytes()) {
            Ok(bytes) if !bytes.is_empty() => Ok(Some(bytes)),
            Ok(_) => Ok(None),
            Err(e) => {
                warn!(error = %e, "image payload is not valid base64");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl GenerativeBackend for GeminiClient {
    async fn stream_turn(&self, request: &TurnRequest) -> Result<FragmentStream> {
        let url = format!(
            "{}?alt=sse",
            self.model_url(&self.text_model, "streamGenerateContent")
        );
        let response = self.post(&url, &request.to_wire()).await?;
        Ok(Box::pin(fragment_stream(response.bytes_stream())))
    }

    async fn generate_image(&self, prompt: &str) -> RemoteOutcome<Vec<u8>> {
        self.request_image(prompt).await.into()
    }
}

struct FragmentState {
    byte_stream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    parser: SseLineParser,
    pending: VecDeque<Result<String>>,
    finished: bool,
}

impl FragmentState {
    fn queue_event(&mut self, event: &SseEvent) {
        if event.is_done() {
            return;
        }
        match parse_chunk(&event.data) {
            Ok(Some(text)) => self.pending.push_back(Ok(text)),
            Ok(None) => {}
            Err(e) => self.pending.push_back(Err(e)),
        }
    }
}

/// Decode one SSE payload into its text, if it carries any.
fn parse_chunk(data: &str) -> Result<Option<String>> {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(data) {
        let message = if envelope.error.status.is_empty() {
            envelope.error.message
        } else {
            format!("{} ({})", envelope.error.message, envelope.error.status)
        };
        return Err(AuraError::from_status(envelope.error.code, message));
    }
    let chunk: GenerateContentResponse = serde_json::from_str(data)
        .map_err(|e| AuraError::Protocol(format!("invalid stream chunk: {e}")))?;
    if let Some(reason) = chunk.block_reason() {
        return Err(AuraError::PermanentRemote(format!("prompt blocked: {reason}")));
    }
    let text = chunk.text();
    Ok((!text.is_empty()).then_some(text))
}

/// Turn an SSE byte stream into text fragments. Stops after the first error.
fn fragment_stream(
    byte_stream: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
) -> impl Stream<Item = Result<String>> + Send {
    futures_util::stream::unfold(
        FragmentState {
            byte_stream: Box::pin(byte_stream),
            parser: SseLineParser::new(),
            pending: VecDeque::new(),
            finished: false,
        },
        |mut state| async move {
            loop {
                if let Some(item) = state.pending.pop_front() {
                    if item.is_err() {
                        state.finished = true;
                        state.pending.clear();
                    }
                    return Some((item, state));
                }
                if state.finished {
                    return None;
                }
                match state.byte_stream.next().await {
                    Some(Ok(chunk)) => {
                        for event in state.parser.push(&chunk) {
                            state.queue_event(&event);
                        }
                    }
                    Some(Err(e)) => {
                        state.finished = true;
                        let err = AuraError::TransientRemote(format!("stream read failed: {e}"));
                        return Some((Err(err), state));
                    }
                    None => {
                        state.finished = true;
                        if let Some(event) = state.parser.flush() {
                            state.queue_event(&event);
                        }
                    }
                }
            }
        },
    )
}
