//! One consumer-facing chunk stream whose producer can be swapped.
//!
//! Two stages: sources are queued on a feed channel in attachment order, and
//! a single pump task drains them one after another into the output channel
//! read by [`OutputStream`]. Attaching a source only touches the feed, never
//! the reader, so a source is never forwarded before its predecessor has
//! been drained.

use crate::error::RelayError;
use crate::provider::{ChatChunk, ChunkStream};
use futures_core::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFuture};

const OUTPUT_BUFFER: usize = 64;

enum Feed {
    Source(ChunkStream),
    Fail(RelayError),
}

/// Controller side of a switchable stream.
pub struct SwitchableStream {
    feed: Option<mpsc::UnboundedSender<Feed>>,
    attached: usize,
    cancel: CancellationToken,
}

impl SwitchableStream {
    /// Creates the controller and its consumer stream.
    ///
    /// Spawns the pump task, so it must be called inside a Tokio runtime.
    pub fn new() -> (Self, OutputStream) {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel(OUTPUT_BUFFER);
        let cancel = CancellationToken::new();

        tokio::spawn(pump(feed_rx, out_tx, cancel.clone()));

        let output = OutputStream {
            inner: ReceiverStream::new(out_rx),
            finished: false,
            _release: cancel.clone().drop_guard(),
        };
        let controller = Self {
            feed: Some(feed_tx),
            attached: 0,
            cancel,
        };
        (controller, output)
    }

    /// Queues `source` behind whatever is currently attached.
    pub fn switch_source(&mut self, source: ChunkStream) -> Result<(), RelayError> {
        let feed = self.feed.as_ref().ok_or(RelayError::AlreadyClosed)?;
        if feed.send(Feed::Source(source)).is_err() {
            // The pump is gone: either the reader left or a source failed.
            return Err(if self.cancel.is_cancelled() {
                RelayError::Cancelled
            } else {
                RelayError::AlreadyClosed
            });
        }

        self.attached += 1;
        if self.attached > 1 {
            tracing::debug!(switches = self.switches(), "switched output source");
        }
        Ok(())
    }

    /// Number of redirections after the first attach.
    pub fn switches(&self) -> usize {
        self.attached.saturating_sub(1)
    }

    /// No more sources; the output ends once the attached ones drain.
    pub fn close(&mut self) {
        if self.feed.take().is_some() {
            tracing::debug!(sources = self.attached, "output stream closed");
        }
    }

    /// Ends the output with `err` after the attached sources drain.
    pub fn fail(&mut self, err: RelayError) {
        if let Some(feed) = self.feed.take() {
            let _ = feed.send(Feed::Fail(err));
        }
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.feed.is_none()
    }

    /// True once the consumer has dropped its stream.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the consumer drops its stream.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

async fn pump(
    mut feed: mpsc::UnboundedReceiver<Feed>,
    out: mpsc::Sender<Result<ChatChunk, RelayError>>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            next = feed.recv() => next,
        };

        let mut source = match next {
            Some(Feed::Source(source)) => source,
            Some(Feed::Fail(err)) => {
                let _ = out.send(Err(err)).await;
                return;
            }
            None => return,
        };

        loop {
            let item = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::debug!("consumer gone, releasing active source");
                    return;
                }
                item = source.next() => item,
            };

            match item {
                Some(Ok(chunk)) => {
                    if out.send(Ok(chunk)).await.is_err() {
                        cancel.cancel();
                        return;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "source failed mid-stream");
                    let _ = out.send(Err(RelayError::source(&e))).await;
                    return;
                }
                None => break,
            }
        }
    }
}

/// Consumer side: a single-pass stream of chunks.
///
/// Ends after the first error. Dropping it releases the attached source.
pub struct OutputStream {
    inner: ReceiverStream<Result<ChatChunk, RelayError>>,
    finished: bool,
    _release: DropGuard,
}

impl Stream for OutputStream {
    type Item = Result<ChatChunk, RelayError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        let polled = Pin::new(&mut this.inner).poll_next(cx);
        if matches!(polled, Poll::Ready(None | Some(Err(_)))) {
            this.finished = true;
        }
        polled
    }
}
