// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::backend::LineStream;
use super::lease::{InstanceInfo, InstanceLease};
use super::{DispatchError, Dispatcher};
use crate::protocols::{CompletionRequest, Endpoint, StreamChunk};

const CHANNEL_CAPACITY: usize = 32;

/// What to do after a line has been handled.
enum Step {
    Continue,
    Recompute,
    Closed,
}

/// The decode side of a request: relays lines from the current decode backend to the client
/// and re-dispatches when a backend asks for a recompute.
pub struct DecodeSession {
    dispatcher: Arc<Dispatcher>,
    endpoint: Endpoint,
    request: CompletionRequest,
    lease: Option<InstanceLease>,
    first: Option<String>,
    lines: LineStream,
    generated: String,
    completion_tokens: u64,
}

impl DecodeSession {
    pub(crate) fn new(
        dispatcher: Arc<Dispatcher>,
        endpoint: Endpoint,
        request: CompletionRequest,
        lease: InstanceLease,
        first: Option<String>,
        lines: LineStream,
    ) -> Self {
        DecodeSession {
            dispatcher,
            endpoint,
            request,
            lease: Some(lease),
            first,
            lines,
            generated: String::new(),
            completion_tokens: 0,
        }
    }

    pub fn is_stream(&self) -> bool {
        self.request.is_stream()
    }

    /// Backends of the current attempt.
    pub fn instance(&self) -> Option<&InstanceInfo> {
        self.lease.as_ref().map(InstanceLease::info)
    }

    /// Relays the session on a background task.
    ///
    /// The receiver yields the client-visible body. Cancelling `token` stops the relay and
    /// drops the in-flight backend call; load is returned either way.
    pub fn spawn(self, token: CancellationToken) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(self.run(tx, token));
        rx
    }

    async fn run(mut self, tx: mpsc::Sender<Bytes>, token: CancellationToken) {
        loop {
            let line = match self.first.take() {
                Some(line) => line,
                None => {
                    let next = tokio::select! {
                        biased;
                        _ = token.cancelled() => None,
                        next = self.lines.next() => Some(next),
                    };
                    let Some(next) = next else {
                        tracing::debug!(request_id = ?self.request_id(), "decode relay cancelled");
                        return;
                    };
                    match next {
                        Some(Ok(line)) => line,
                        Some(Err(err)) => {
                            tracing::error!(
                                request_id = ?self.request_id(),
                                %err,
                                "decode stream interrupted after response started"
                            );
                            self.abort();
                            return;
                        }
                        None => return,
                    }
                }
            };

            match self.handle_line(line, &tx).await {
                Step::Continue => {}
                Step::Closed => return,
                Step::Recompute => {
                    let recomputed = tokio::select! {
                        biased;
                        _ = token.cancelled() => return,
                        result = self.recompute() => result,
                    };
                    if let Err(err) = recomputed {
                        tracing::error!(
                            request_id = ?self.request_id(),
                            %err,
                            "recompute failed, closing stream"
                        );
                        self.abort();
                        return;
                    }
                }
            }
        }
    }

    async fn handle_line(&mut self, line: String, tx: &mpsc::Sender<Bytes>) -> Step {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Step::Continue;
        }

        let out = match StreamChunk::parse(trimmed) {
            StreamChunk::Opaque | StreamChunk::NoChoices => trimmed.to_string(),
            StreamChunk::Choice(mut chunk) => {
                self.generated.push_str(&chunk.content);
                self.completion_tokens += if self.request.is_stream() {
                    1
                } else {
                    chunk.completion_tokens.unwrap_or(0)
                };

                if chunk.is_recomputed() {
                    return Step::Recompute;
                }
                if self.request.retry_count() > 0 && !self.request.is_stream() {
                    chunk.patch_content(self.request.is_chat(), &self.generated);
                    chunk.to_line()
                } else {
                    trimmed.to_string()
                }
            }
        };

        let terminator = if self.request.is_stream() { "\n\n" } else { "\n" };
        if tx.send(Bytes::from(out + terminator)).await.is_err() {
            tracing::debug!(request_id = ?self.request_id(), "client went away");
            return Step::Closed;
        }
        Step::Continue
    }

    /// Moves the request to a fresh prefill and decode pair, continuing after what was
    /// already generated.
    async fn recompute(&mut self) -> Result<(), DispatchError> {
        self.request
            .recompute(&self.generated, self.completion_tokens)?;
        self.dispatcher.metrics().inc_recompute();
        tracing::info!(
            request_id = ?self.request_id(),
            retry_count = self.request.retry_count(),
            completion_tokens = self.completion_tokens,
            "decode backend requested recompute"
        );

        // the superseded pair is released before a new one is charged
        let superseded = self.lease.take().map(InstanceLease::release);

        let lease = match self
            .dispatcher
            .select_instance(self.endpoint, &mut self.request)
            .await
        {
            Ok(lease) => lease,
            Err(err) => {
                if let Some(info) = &superseded {
                    info.mark_aborted();
                }
                return Err(err);
            }
        };
        let (first, lines) = self
            .dispatcher
            .open_decode(self.endpoint, &self.request, &lease)
            .await?;

        self.lease = Some(lease);
        self.first = first;
        self.lines = lines;
        Ok(())
    }

    fn request_id(&self) -> Option<&str> {
        self.lease.as_ref().map(InstanceLease::request_id)
    }

    fn abort(&self) {
        if let Some(lease) = &self.lease {
            lease.mark_aborted();
        }
    }
}
