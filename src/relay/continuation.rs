//! Continuation of truncated completions.
//!
//! A logical chat request starts one segment and keeps its output stream
//! open. Whenever a segment stops because it hit the token budget, the
//! partial answer and [`CONTINUE_PROMPT`] are appended to the history and a
//! new segment is switched in behind it, up to the segment cap.

use super::switchable::{OutputStream, SwitchableStream};
use crate::error::RelayError;
use crate::provider::{
    CompletionOptions, FinishReason, Message, Provider, SegmentResult, ToolChoice,
};
use crate::usage::UsageStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Completion budget requested for every segment.
pub const MAX_TOKENS: u32 = 8192;

/// Segments allowed per logical request.
pub const MAX_RESPONSE_SEGMENTS: usize = 2;

pub const CONTINUE_PROMPT: &str = "Continue your prior response. IMPORTANT: Immediately begin from where you left off without any interruptions.\nDo not repeat any content, including artifact and action tags.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationState {
    Running,
    AwaitingContinuation,
    Done,
}

/// What a finished request leaves behind.
#[derive(Debug)]
pub struct ChatOutcome {
    pub history: Vec<Message>,
    pub switches: usize,
    pub segments: usize,
    pub finish_reason: FinishReason,
}

/// A started request: the stitched output and the task driving it.
pub struct ChatSession {
    pub output: OutputStream,
    pub driver: JoinHandle<Result<ChatOutcome, RelayError>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    provider: Arc<dyn Provider>,
    usage: Arc<UsageStore>,
    max_segments: usize,
}

impl Orchestrator {
    pub fn new(provider: Arc<dyn Provider>, usage: Arc<UsageStore>) -> Self {
        Self {
            provider,
            usage,
            max_segments: MAX_RESPONSE_SEGMENTS,
        }
    }

    pub fn with_max_segments(mut self, max_segments: usize) -> Self {
        self.max_segments = max_segments.max(1);
        self
    }

    /// Starts the first segment and hands back the stitched output.
    ///
    /// Fails without creating any output if the provider refuses the first
    /// segment. Later failures end the output with an error instead.
    pub async fn start(
        &self,
        history: Vec<Message>,
        options: CompletionOptions,
    ) -> Result<ChatSession, RelayError> {
        let segment = self.provider.start_completion(&history, &options).await?;

        let (mut stream, output) = SwitchableStream::new();
        stream.switch_source(segment.chunks)?;

        tracing::debug!(
            provider = self.provider.name(),
            messages = history.len(),
            "first segment started"
        );

        let driver = Driver {
            provider: self.provider.clone(),
            usage: self.usage.clone(),
            max_segments: self.max_segments,
            history,
            options,
            stream,
            segments: 1,
            state: ContinuationState::Running,
        };

        Ok(ChatSession {
            output,
            driver: tokio::spawn(driver.run(segment.result)),
        })
    }
}

struct Driver {
    provider: Arc<dyn Provider>,
    usage: Arc<UsageStore>,
    max_segments: usize,
    history: Vec<Message>,
    options: CompletionOptions,
    stream: SwitchableStream,
    segments: usize,
    state: ContinuationState,
}

impl Driver {
    async fn run(
        mut self,
        mut pending: oneshot::Receiver<SegmentResult>,
    ) -> Result<ChatOutcome, RelayError> {
        loop {
            let received = tokio::select! {
                biased;
                () = self.stream.cancelled() => return Err(self.abandon()),
                received = &mut pending => received,
            };

            let Ok(result) = received else {
                // The source already pushed its failure to the output.
                self.enter(ContinuationState::Done);
                self.stream.close();
                return Err(RelayError::SourceTransport(
                    "segment ended without a result".to_string(),
                ));
            };

            tracing::info!(
                prompt_tokens = result.usage.prompt_tokens,
                completion_tokens = result.usage.completion_tokens,
                total_tokens = result.usage.total_tokens,
                finish_reason = ?result.finish_reason,
                switches = self.stream.switches(),
                max_segments = self.max_segments,
                "segment finished"
            );
            self.report_usage(&result.raw_headers);

            if result.finish_reason != FinishReason::Length {
                self.enter(ContinuationState::Done);
                self.stream.close();
                return Ok(ChatOutcome {
                    switches: self.stream.switches(),
                    segments: self.segments,
                    finish_reason: result.finish_reason,
                    history: self.history,
                });
            }

            if self.stream.is_cancelled() {
                return Err(self.abandon());
            }

            if self.segments >= self.max_segments {
                self.enter(ContinuationState::Done);
                tracing::error!(max_segments = self.max_segments, "maximum segments reached");
                self.stream.fail(RelayError::SegmentBoundExceeded {
                    max: self.max_segments,
                });
                return Err(RelayError::SegmentBoundExceeded {
                    max: self.max_segments,
                });
            }

            self.enter(ContinuationState::AwaitingContinuation);
            tracing::info!(
                max_tokens = self.options.max_tokens,
                segments_left = self.max_segments - self.segments,
                "reached max token limit, continuing message"
            );

            self.history.push(Message::assistant(result.text));
            self.history.push(Message::user(CONTINUE_PROMPT));

            let options = CompletionOptions {
                tool_choice: ToolChoice::None,
                ..self.options.clone()
            };
            let start = self.provider.start_completion(&self.history, &options);
            let started = tokio::select! {
                biased;
                () = self.stream.cancelled() => return Err(self.abandon()),
                started = start => started,
            };

            let segment = match started {
                Ok(segment) => segment,
                Err(e) => {
                    self.enter(ContinuationState::Done);
                    tracing::error!(error = %e, "continuation segment failed to start");
                    self.stream.fail(RelayError::source(&e));
                    return Err(e.into());
                }
            };

            self.stream.switch_source(segment.chunks)?;
            self.segments += 1;
            pending = segment.result;
            self.enter(ContinuationState::Running);
        }
    }

    fn enter(&mut self, next: ContinuationState) {
        tracing::debug!(from = ?self.state, to = ?next, segments = self.segments, "continuation state");
        self.state = next;
    }

    fn abandon(&mut self) -> RelayError {
        tracing::debug!(segments = self.segments, "consumer disconnected, no further segments");
        self.enter(ContinuationState::Done);
        self.stream.close();
        RelayError::Cancelled
    }

    fn report_usage(&self, headers: &HashMap<String, String>) {
        if headers.is_empty() {
            tracing::debug!("segment carried no rate-limit headers");
            return;
        }
        // Rejections are logged by the store and never reach the response.
        let _ = self.usage.publish(headers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::stub::{ScriptedSegment, StubProvider};
    use crate::usage;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    fn options() -> CompletionOptions {
        CompletionOptions {
            model: "test-model".into(),
            max_tokens: MAX_TOKENS,
            system: None,
            tool_choice: ToolChoice::Auto,
        }
    }

    fn orchestrator(provider: &Arc<StubProvider>, max_segments: usize) -> Orchestrator {
        Orchestrator::new(provider.clone(), Arc::new(UsageStore::new())).with_max_segments(max_segments)
    }

    async fn drain(output: &mut OutputStream) -> (String, Option<RelayError>) {
        let mut text = String::new();
        while let Some(item) = output.next().await {
            match item {
                Ok(chunk) => text.push_str(&chunk.text),
                Err(e) => return (text, Some(e)),
            }
        }
        (text, None)
    }

    #[tokio::test]
    async fn single_segment_passes_through() {
        let provider = Arc::new(StubProvider::scripted(vec![ScriptedSegment::finish(
            &["Hel", "lo"],
            FinishReason::Stop,
        )]));
        let mut session = orchestrator(&provider, 2)
            .start(vec![Message::user("hi")], options())
            .await
            .unwrap();

        let (text, err) = drain(&mut session.output).await;
        assert_eq!(text, "Hello");
        assert!(err.is_none());

        let outcome = session.driver.await.unwrap().unwrap();
        assert_eq!(outcome.switches, 0);
        assert_eq!(outcome.segments, 1);
        assert_eq!(outcome.history, vec![Message::user("hi")]);
    }

    #[tokio::test]
    async fn truncated_segment_is_continued_seamlessly() {
        let provider = Arc::new(StubProvider::scripted(vec![
            ScriptedSegment::finish(&["partial", "…"], FinishReason::Length),
            ScriptedSegment::finish(&[" done."], FinishReason::Stop),
        ]));
        let mut session = orchestrator(&provider, 2)
            .start(vec![Message::user("write a lot")], options())
            .await
            .unwrap();

        let (text, err) = drain(&mut session.output).await;
        assert_eq!(text, "partial… done.");
        assert!(err.is_none());

        let outcome = session.driver.await.unwrap().unwrap();
        assert_eq!(outcome.switches, 1);
        assert_eq!(outcome.finish_reason, FinishReason::Stop);
        assert_eq!(
            outcome.history,
            vec![
                Message::user("write a lot"),
                Message::assistant("partial…"),
                Message::user(CONTINUE_PROMPT),
            ]
        );

        let calls = provider.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].history.len(), 3);
        assert_eq!(calls[1].options.tool_choice, ToolChoice::None);
        assert_eq!(calls[1].options.model, "test-model");
    }

    #[tokio::test]
    async fn bound_of_one_never_starts_a_second_segment() {
        let provider = Arc::new(StubProvider::scripted(vec![
            ScriptedSegment::finish(&["cut"], FinishReason::Length),
            ScriptedSegment::finish(&["unused"], FinishReason::Stop),
        ]));
        let mut session = orchestrator(&provider, 1)
            .start(vec![Message::user("go")], options())
            .await
            .unwrap();

        let (text, err) = drain(&mut session.output).await;
        assert_eq!(text, "cut");
        assert!(matches!(err, Some(RelayError::SegmentBoundExceeded { max: 1 })));

        let result = session.driver.await.unwrap();
        assert!(matches!(result, Err(RelayError::SegmentBoundExceeded { max: 1 })));
        assert_eq!(provider.calls().len(), 1);
    }

    #[tokio::test]
    async fn never_starts_more_than_max_segments() {
        let script = (0..5)
            .map(|_| ScriptedSegment::finish(&["more "], FinishReason::Length))
            .collect();
        let provider = Arc::new(StubProvider::scripted(script));
        let mut session = orchestrator(&provider, 3)
            .start(vec![Message::user("go")], options())
            .await
            .unwrap();

        let (text, err) = drain(&mut session.output).await;
        assert_eq!(text, "more more more ");
        assert!(matches!(err, Some(RelayError::SegmentBoundExceeded { max: 3 })));
        assert!(session.driver.await.unwrap().is_err());

        let calls = provider.calls();
        assert_eq!(calls.len(), 3);
        // Two messages per continuation round.
        assert_eq!(calls[2].history.len(), 5);
    }

    #[tokio::test]
    async fn first_segment_refusal_fails_before_streaming() {
        let provider = Arc::new(StubProvider::scripted(vec![ScriptedSegment::reject(429)]));
        let result = orchestrator(&provider, 2)
            .start(vec![Message::user("hi")], options())
            .await;

        assert!(matches!(
            result.err(),
            Some(RelayError::Provider(crate::error::ProviderError::RateLimited))
        ));
    }

    #[tokio::test]
    async fn continuation_refusal_ends_stream_abnormally() {
        let provider = Arc::new(StubProvider::scripted(vec![
            ScriptedSegment::finish(&["so far"], FinishReason::Length),
            ScriptedSegment::reject(500),
        ]));
        let mut session = orchestrator(&provider, 2)
            .start(vec![Message::user("hi")], options())
            .await
            .unwrap();

        let (text, err) = drain(&mut session.output).await;
        assert_eq!(text, "so far");
        assert!(matches!(err, Some(RelayError::SourceTransport(_))));
        assert!(matches!(
            session.driver.await.unwrap(),
            Err(RelayError::Provider(_))
        ));
    }

    #[tokio::test]
    async fn mid_stream_failure_is_not_retried() {
        let provider = Arc::new(StubProvider::scripted(vec![
            ScriptedSegment::fail(&["half"], "connection reset"),
            ScriptedSegment::finish(&["retry"], FinishReason::Stop),
        ]));
        let mut session = orchestrator(&provider, 2)
            .start(vec![Message::user("hi")], options())
            .await
            .unwrap();

        let (text, err) = drain(&mut session.output).await;
        assert_eq!(text, "half");
        assert!(matches!(err, Some(RelayError::SourceTransport(_))));
        assert!(matches!(
            session.driver.await.unwrap(),
            Err(RelayError::SourceTransport(_))
        ));
        assert_eq!(provider.calls().len(), 1);
    }

    #[tokio::test]
    async fn disconnect_releases_source_and_stops() {
        let provider = Arc::new(StubProvider::scripted(vec![ScriptedSegment::hang(&["tick"])]));
        let mut session = orchestrator(&provider, 2)
            .start(vec![Message::user("hi")], options())
            .await
            .unwrap();

        let first = session.output.next().await.unwrap().unwrap();
        assert_eq!(first.text, "tick");
        drop(session.output);

        let result = tokio::time::timeout(Duration::from_secs(1), session.driver)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(RelayError::Cancelled)));

        tokio::time::timeout(Duration::from_secs(1), async {
            while provider.released() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(provider.calls().len(), 1);
    }

    #[tokio::test]
    async fn disconnect_before_truncation_starts_no_continuation() {
        let provider = Arc::new(
            StubProvider::scripted(vec![
                ScriptedSegment::finish(&["one ", "two"], FinishReason::Length),
                ScriptedSegment::finish(&["never"], FinishReason::Stop),
            ])
            .with_delay(Duration::from_millis(50)),
        );
        let mut session = orchestrator(&provider, 2)
            .start(vec![Message::user("hi")], options())
            .await
            .unwrap();

        let first = session.output.next().await.unwrap().unwrap();
        assert_eq!(first.text, "one ");
        drop(session.output);

        let result = tokio::time::timeout(Duration::from_secs(1), session.driver)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(RelayError::Cancelled)));
        assert_eq!(provider.calls().len(), 1);
    }

    #[tokio::test]
    async fn disconnect_while_continuation_is_starting() {
        let provider = Arc::new(StubProvider::scripted(vec![
            ScriptedSegment::finish(&["part"], FinishReason::Length),
            ScriptedSegment::finish(&["rest"], FinishReason::Stop)
                .delayed_start(Duration::from_secs(30)),
        ]));
        let mut session = orchestrator(&provider, 3)
            .start(vec![Message::user("hi")], options())
            .await
            .unwrap();

        let first = session.output.next().await.unwrap().unwrap();
        assert_eq!(first.text, "part");

        tokio::time::timeout(Duration::from_secs(1), async {
            while provider.calls().len() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        drop(session.output);

        let result = tokio::time::timeout(Duration::from_secs(1), session.driver)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(RelayError::Cancelled)));
        assert_eq!(provider.calls().len(), 2);
    }

    #[tokio::test]
    async fn usage_headers_are_published_best_effort() {
        let good: HashMap<String, String> = [
            (usage::INPUT_TOKENS_LIMIT, "100"),
            (usage::INPUT_TOKENS_REMAINING, "90"),
            (usage::OUTPUT_TOKENS_LIMIT, "100"),
            (usage::OUTPUT_TOKENS_REMAINING, "80"),
            (usage::TOKENS_LIMIT, "200"),
            (usage::TOKENS_REMAINING, "170"),
            (usage::REQUESTS_LIMIT, "5"),
            (usage::REQUESTS_REMAINING, "4"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let mut bad = good.clone();
        bad.insert(usage::REQUESTS_LIMIT.to_string(), "0".to_string());

        let provider = Arc::new(StubProvider::scripted(vec![
            ScriptedSegment::finish(&["a"], FinishReason::Length).with_headers(good),
            ScriptedSegment::finish(&["b"], FinishReason::Stop).with_headers(bad),
        ]));
        let store = Arc::new(UsageStore::new());
        let mut session = Orchestrator::new(provider.clone(), store.clone())
            .start(vec![Message::user("hi")], options())
            .await
            .unwrap();

        let (text, err) = drain(&mut session.output).await;
        assert_eq!(text, "ab");
        assert!(err.is_none());
        session.driver.await.unwrap().unwrap();

        let snapshot = store.current().unwrap();
        assert_eq!(snapshot.requests_limit, 5);
        assert_eq!(snapshot.total_tokens_remaining, 170);
    }
}
