use super::{
    ChatChunk, CompletionOptions, FinishReason, Message, Provider, Role, Segment, SegmentResult,
    RateLimitFuture, StartFuture, TokenUsage,
};
use crate::error::ProviderError;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

/// How a scripted segment ends once its chunks are sent.
#[derive(Debug, Clone)]
pub enum SegmentEnd {
    Finish(FinishReason),
    /// Emit a stream error instead of a result.
    Fail(String),
    /// Never finish; wait until the reader goes away.
    Hang,
}

#[derive(Debug, Clone)]
pub struct ScriptedSegment {
    pub chunks: Vec<String>,
    pub end: SegmentEnd,
    pub headers: HashMap<String, String>,
    /// Refuse to start with this HTTP status.
    pub reject_status: Option<u16>,
    /// Wait this long before the segment is accepted.
    pub start_delay: Option<Duration>,
}

impl ScriptedSegment {
    pub fn finish(chunks: &[&str], reason: FinishReason) -> Self {
        Self {
            chunks: chunks.iter().map(|c| (*c).to_string()).collect(),
            end: SegmentEnd::Finish(reason),
            headers: HashMap::new(),
            reject_status: None,
            start_delay: None,
        }
    }

    pub fn fail(chunks: &[&str], message: &str) -> Self {
        Self {
            end: SegmentEnd::Fail(message.to_string()),
            ..Self::finish(chunks, FinishReason::Error)
        }
    }

    pub fn hang(chunks: &[&str]) -> Self {
        Self {
            end: SegmentEnd::Hang,
            ..Self::finish(chunks, FinishReason::Other)
        }
    }

    pub fn reject(status: u16) -> Self {
        Self {
            reject_status: Some(status),
            ..Self::finish(&[], FinishReason::Error)
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn delayed_start(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }
}

/// A call the stub received.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub history: Vec<Message>,
    pub options: CompletionOptions,
}

/// In-process provider.
///
/// Plays back scripted segments in order; once the script runs out it
/// echoes the last user message.
#[derive(Debug, Default)]
pub struct StubProvider {
    script: Mutex<VecDeque<ScriptedSegment>>,
    calls: Mutex<Vec<RecordedCall>>,
    released: Arc<AtomicUsize>,
    rate_limits: HashMap<String, String>,
    delay: Duration,
}

impl StubProvider {
    pub fn new() -> Self {
        Self {
            delay: Duration::from_millis(120),
            ..Self::default()
        }
    }

    pub fn scripted(segments: Vec<ScriptedSegment>) -> Self {
        Self {
            script: Mutex::new(segments.into()),
            ..Self::default()
        }
    }

    /// Pause before each chunk.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Headers returned by the rate-limit probe.
    pub fn with_rate_limits(mut self, headers: HashMap<String, String>) -> Self {
        self.rate_limits = headers;
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of segments whose reader disappeared before they finished.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    fn echo(history: &[Message], options: &CompletionOptions) -> ScriptedSegment {
        let prompt = history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let header = format!("[stub provider]\nmodel: {}\n\n", options.model);

        ScriptedSegment {
            chunks: vec![header, "You said: ".to_string(), prompt],
            end: SegmentEnd::Finish(FinishReason::Stop),
            headers: HashMap::new(),
            reject_status: None,
            start_delay: None,
        }
    }
}

impl Provider for StubProvider {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn fetch_rate_limits(&self, _model: &str) -> RateLimitFuture {
        let headers = self.rate_limits.clone();
        Box::pin(async move { Ok(headers) })
    }

    fn start_completion(&self, history: &[Message], options: &CompletionOptions) -> StartFuture {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedCall {
                history: history.to_vec(),
                options: options.clone(),
            });

        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| Self::echo(history, options));

        let prompt_tokens = u32::try_from(history.len()).unwrap_or(u32::MAX);
        let released = self.released.clone();
        let delay = self.delay;

        Box::pin(async move {
            if let Some(start_delay) = next.start_delay {
                tokio::time::sleep(start_delay).await;
            }
            if let Some(status) = next.reject_status {
                return Err(ProviderError::from_status(status, "scripted rejection".into()));
            }

            let (tx, rx) = mpsc::channel::<Result<ChatChunk, ProviderError>>(32);
            let (result_tx, result_rx) = oneshot::channel();

            tokio::spawn(async move {
                let mut text = String::new();
                for chunk in next.chunks {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    text.push_str(&chunk);
                    if tx.send(Ok(ChatChunk { text: chunk })).await.is_err() {
                        released.fetch_add(1, Ordering::SeqCst);
                        return;
                    }
                }

                match next.end {
                    SegmentEnd::Finish(finish_reason) => {
                        let completion_tokens =
                            u32::try_from(text.split_whitespace().count()).unwrap_or(u32::MAX);
                        let _ = result_tx.send(SegmentResult {
                            text,
                            finish_reason,
                            usage: TokenUsage::new(prompt_tokens, completion_tokens),
                            raw_headers: next.headers,
                        });
                    }
                    SegmentEnd::Fail(message) => {
                        let _ = tx.send(Err(ProviderError::Stream(message))).await;
                    }
                    SegmentEnd::Hang => {
                        tx.closed().await;
                        released.fetch_add(1, Ordering::SeqCst);
                        drop(result_tx);
                    }
                }
            });

            Ok(Segment {
                chunks: Box::pin(ReceiverStream::new(rx)),
                result: result_rx,
            })
        })
    }
}
