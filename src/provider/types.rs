use crate::error::ProviderError;
use futures_core::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A tool call the model made in an earlier turn, with its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default)]
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_invocations: Option<Vec<ToolInvocation>>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_invocations: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_invocations: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolChoice {
    #[default]
    Auto,
    /// Forbid provider-side tool invocation for this segment.
    None,
}

#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub model: String,
    pub max_tokens: u32,
    pub system: Option<String>,
    pub tool_choice: ToolChoice,
}

#[derive(Debug, Clone)]
pub struct ChatChunk {
    pub text: String,
}

/// Provider-reported terminal status of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    Stop,
    Length,
    Error,
    Other,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// Terminal record of one segment, produced once at stream end.
#[derive(Debug, Clone)]
pub struct SegmentResult {
    pub text: String,
    pub finish_reason: FinishReason,
    pub usage: TokenUsage,
    pub raw_headers: HashMap<String, String>,
}

pub type ChunkStream = BoxStream<'static, Result<ChatChunk, ProviderError>>;

/// One started provider completion.
///
/// `result` resolves after the last chunk has been sent. If the sender is
/// dropped without a value the segment failed mid-stream and the failure
/// itself travels through `chunks`.
pub struct Segment {
    pub chunks: ChunkStream,
    pub result: oneshot::Receiver<SegmentResult>,
}

pub type StartFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<Segment, ProviderError>> + Send>>;

pub type RateLimitFuture = std::pin::Pin<
    Box<dyn std::future::Future<Output = Result<HashMap<String, String>, ProviderError>> + Send>,
>;

/// Provider interface.
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start a completion over `history`.
    ///
    /// Resolves once the provider has accepted the request; failures known
    /// before any content exists are returned here rather than in the stream.
    fn start_completion(&self, history: &[Message], options: &CompletionOptions) -> StartFuture;

    /// Fetch the provider's current rate-limit headers.
    ///
    /// Providers without rate-limit reporting return an empty map.
    fn fetch_rate_limits(&self, _model: &str) -> RateLimitFuture {
        Box::pin(async { Ok(HashMap::new()) })
    }
}
