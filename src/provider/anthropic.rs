use super::{
    ChatChunk, CompletionOptions, FinishReason, Message, Provider, Role, Segment, SegmentResult,
    RateLimitFuture, StartFuture, TokenUsage,
};
use crate::error::ProviderError;
use crate::usage::RATE_LIMIT_HEADERS;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

pub const DEFAULT_API_BASE: &str = "https://api.anthropic.com/";
pub const DEFAULT_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    http: reqwest::Client,
    api_key: String,
    api_base: Url,
    version: String,
    beta: Option<String>,
}

impl AnthropicProvider {
    pub fn new(http: reqwest::Client, api_key: String) -> anyhow::Result<Self> {
        Ok(Self {
            http,
            api_key,
            api_base: Url::parse(DEFAULT_API_BASE)?,
            version: DEFAULT_VERSION.to_string(),
            beta: None,
        })
    }

    pub fn with_api_base(mut self, api_base: &str) -> anyhow::Result<Self> {
        self.api_base = Url::parse(api_base)?;
        Ok(self)
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_beta(mut self, beta: Option<String>) -> Self {
        self.beta = beta;
        self
    }

    fn messages_url(&self) -> Result<Url, ProviderError> {
        self.api_base
            .join("v1/messages")
            .map_err(|e| ProviderError::Protocol(format!("invalid API base: {e}")))
    }

    fn headers(&self) -> Result<HeaderMap, ProviderError> {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        h.insert(
            HeaderName::from_static("x-api-key"),
            HeaderValue::from_str(&self.api_key)
                .map_err(|e| ProviderError::Protocol(format!("invalid API key header: {e}")))?,
        );
        h.insert(
            HeaderName::from_static("anthropic-version"),
            HeaderValue::from_str(&self.version)
                .map_err(|e| ProviderError::Protocol(format!("invalid version header: {e}")))?,
        );
        if let Some(beta) = &self.beta {
            h.insert(
                HeaderName::from_static("anthropic-beta"),
                HeaderValue::from_str(beta)
                    .map_err(|e| ProviderError::Protocol(format!("invalid beta header: {e}")))?,
            );
        }
        Ok(h)
    }

    /// Sends a one-token request and returns its rate-limit headers.
    pub async fn probe_rate_limits(&self, model: &str) -> Result<HashMap<String, String>, ProviderError> {
        let body = MessagesRequest {
            model: model.to_string(),
            max_tokens: 1,
            system: None,
            messages: vec![WireMessage {
                role: "user",
                content: "Hi".to_string(),
            }],
            stream: false,
        };

        tracing::debug!(model, "probing rate limits");
        let resp = self
            .http
            .post(self.messages_url()?)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            tracing::error!(%status, body = %text, "rate-limit probe failed");
            return Err(ProviderError::from_status(status.as_u16(), text));
        }

        let mut headers = collect_headers(resp.headers());
        headers.retain(|k, _| RATE_LIMIT_HEADERS.contains(&k.as_str()));
        Ok(headers)
    }
}

impl Provider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn fetch_rate_limits(&self, model: &str) -> RateLimitFuture {
        let this = self.clone();
        let model = model.to_string();
        Box::pin(async move { this.probe_rate_limits(&model).await })
    }

    fn start_completion(&self, history: &[Message], options: &CompletionOptions) -> StartFuture {
        let this = self.clone();
        let body = MessagesRequest::new(history, options);

        Box::pin(async move {
            let resp = this
                .http
                .post(this.messages_url()?)
                .headers(this.headers()?)
                .json(&body)
                .send()
                .await?;

            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(ProviderError::from_status(status.as_u16(), text));
            }

            let raw_headers = collect_headers(resp.headers());
            let (tx, rx) = mpsc::channel::<Result<ChatChunk, ProviderError>>(64);
            let (result_tx, result_rx) = oneshot::channel();

            tokio::spawn(async move {
                let mut stream = resp.bytes_stream();
                let mut parser = SseParser::new();
                let mut segment = SegmentAccumulator::default();

                while let Some(item) = stream.next().await {
                    let bytes = match item {
                        Ok(b) => b,
                        Err(e) => {
                            let _ = tx.send(Err(e.into())).await;
                            return;
                        }
                    };

                    for ev in parser.push(&bytes) {
                        let event = match ev.and_then(|data| decode_event(&data)) {
                            Ok(Some(event)) => event,
                            Ok(None) => continue,
                            Err(e) => {
                                let _ = tx.send(Err(e)).await;
                                return;
                            }
                        };

                        match segment.apply(event) {
                            Ok(Step::Chunk(text)) => {
                                if tx.send(Ok(ChatChunk { text })).await.is_err() {
                                    tracing::debug!("reader gone, dropping provider stream");
                                    return;
                                }
                            }
                            Ok(Step::Continue) => {}
                            Ok(Step::Finished) => {
                                let _ = result_tx.send(segment.into_result(raw_headers));
                                return;
                            }
                            Err(e) => {
                                let _ = tx.send(Err(e)).await;
                                return;
                            }
                        }
                    }
                }

                let _ = tx
                    .send(Err(ProviderError::Stream(
                        "stream ended before message_stop".to_string(),
                    )))
                    .await;
            });

            let out = ReceiverStream::new(rx);
            Ok(Segment {
                chunks: Box::pin(out),
                result: result_rx,
            })
        })
    }
}

fn collect_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    stream: bool,
}

impl MessagesRequest {
    /// No `tools` are ever declared, so `ToolChoice::None` is already in
    /// effect and the API rejects a `tool_choice` sent without tools.
    fn new(history: &[Message], options: &CompletionOptions) -> Self {
        Self {
            model: options.model.clone(),
            max_tokens: options.max_tokens,
            system: options.system.clone(),
            messages: history
                .iter()
                .map(|m| WireMessage {
                    role: match m.role {
                        Role::User => "user",
                        Role::Assistant => "assistant",
                    },
                    content: m.content.clone(),
                })
                .collect(),
            stream: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StartMessage,
    },
    ContentBlockStart {},
    ContentBlockDelta {
        delta: BlockDelta,
    },
    ContentBlockStop {},
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<WireUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: WireError,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct StartMessage {
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct BlockDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireError {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

fn decode_event(data: &str) -> Result<Option<StreamEvent>, ProviderError> {
    if data.trim().is_empty() {
        return Ok(None);
    }
    match serde_json::from_str::<StreamEvent>(data) {
        Ok(event) => Ok(Some(event)),
        Err(e) => {
            // Event types added after this client was written.
            let typed = serde_json::from_str::<serde_json::Value>(data)
                .ok()
                .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_owned));
            match typed {
                Some(kind) => {
                    tracing::debug!(%kind, "ignoring unknown stream event");
                    Ok(None)
                }
                None => Err(ProviderError::Protocol(format!("bad stream event: {e}"))),
            }
        }
    }
}

pub(crate) fn finish_reason(stop_reason: Option<&str>) -> FinishReason {
    match stop_reason {
        Some("end_turn" | "stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        _ => FinishReason::Other,
    }
}

enum Step {
    Chunk(String),
    Continue,
    Finished,
}

/// Folds stream events into the segment's terminal record.
#[derive(Debug, Default)]
struct SegmentAccumulator {
    text: String,
    input_tokens: u32,
    output_tokens: u32,
    stop_reason: Option<String>,
}

impl SegmentAccumulator {
    fn apply(&mut self, event: StreamEvent) -> Result<Step, ProviderError> {
        match event {
            StreamEvent::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    self.input_tokens = usage.input_tokens.unwrap_or(0);
                    self.output_tokens = usage.output_tokens.unwrap_or(0);
                }
                Ok(Step::Continue)
            }
            StreamEvent::ContentBlockDelta { delta } => match delta.text {
                Some(text) if !text.is_empty() => {
                    self.text.push_str(&text);
                    Ok(Step::Chunk(text))
                }
                _ => Ok(Step::Continue),
            },
            StreamEvent::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason;
                }
                if let Some(out) = usage.and_then(|u| u.output_tokens) {
                    self.output_tokens = out;
                }
                Ok(Step::Continue)
            }
            StreamEvent::MessageStop => Ok(Step::Finished),
            StreamEvent::Error { error } => Err(ProviderError::Stream(format!(
                "{}: {}",
                error.kind, error.message
            ))),
            StreamEvent::ContentBlockStart {} | StreamEvent::ContentBlockStop {} | StreamEvent::Ping => {
                Ok(Step::Continue)
            }
        }
    }

    fn into_result(self, raw_headers: HashMap<String, String>) -> SegmentResult {
        SegmentResult {
            finish_reason: finish_reason(self.stop_reason.as_deref()),
            usage: TokenUsage::new(self.input_tokens, self.output_tokens),
            text: self.text,
            raw_headers,
        }
    }
}

/// Minimal SSE parser.
///
/// - Collects UTF-8 lines
/// - Yields the joined `data:` payload when a blank line ends an event
struct SseParser {
    buf: Vec<u8>,
    cur_data: String,
}

impl SseParser {
    fn new() -> Self {
        Self {
            buf: Vec::new(),
            cur_data: String::new(),
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Vec<Result<String, ProviderError>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line = self.buf.drain(..=pos).collect::<Vec<u8>>();
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }

            if line.is_empty() {
                if !self.cur_data.is_empty() {
                    if self.cur_data.ends_with('\n') {
                        self.cur_data.pop();
                    }
                    out.push(Ok(std::mem::take(&mut self.cur_data)));
                }
                continue;
            }

            let s = match std::str::from_utf8(&line) {
                Ok(s) => s,
                Err(e) => {
                    out.push(Err(ProviderError::Protocol(format!(
                        "SSE line is not valid UTF-8: {e}"
                    ))));
                    continue;
                }
            };

            // `event:` duplicates the JSON `type` field; id/retry/comments are unused.
            if let Some(rest) = s.strip_prefix("data:") {
                let rest = rest.strip_prefix(' ').unwrap_or(rest);
                self.cur_data.push_str(rest);
                self.cur_data.push('\n');
            }
        }

        out
    }
}
