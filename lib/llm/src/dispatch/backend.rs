// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Outbound calls to prefill and decode backends.

use std::pin::Pin;

use futures::{Stream, StreamExt, TryStreamExt};
use serde_json::Value;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;

use crate::kv_router::BackendInstance;

const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Longest line accepted from a backend; a non-stream response arrives as a single line.
const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Decode response body split into lines.
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String, LinesCodecError>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("failed to read response body: {0}")]
    Body(#[from] LinesCodecError),
}

/// Identity of one outbound call.
#[derive(Debug, Clone, Copy)]
pub struct BackendCall<'a> {
    pub path: &'a str,
    pub request_id: &'a str,
    pub api_key: Option<&'a str>,
}

impl BackendCall<'_> {
    fn request(&self, instance: &BackendInstance, payload: &Value) -> reqwest::RequestBuilder {
        let mut builder = instance
            .client()
            .post(instance.url(self.path))
            .header(REQUEST_ID_HEADER, self.request_id)
            .json(payload);
        if let Some(key) = self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    /// Sends the non-streaming prime call and returns the decoded response body.
    pub async fn prime(
        &self,
        instance: &BackendInstance,
        payload: &Value,
    ) -> Result<Value, BackendError> {
        let response = self
            .request(instance, payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    /// Opens a decode stream and reads up to its first line.
    ///
    /// Nothing has reached the client until this returns, so every failure here is safe to
    /// retry. `None` means the backend closed the body without sending anything.
    pub async fn open_stream(
        &self,
        instance: &BackendInstance,
        payload: &Value,
    ) -> Result<(Option<String>, LineStream), BackendError> {
        let response = self
            .request(instance, payload)
            .send()
            .await?
            .error_for_status()?;

        let mut lines = lines(response);
        let first = lines.next().await.transpose()?;
        Ok((first, lines))
    }
}

fn lines(response: reqwest::Response) -> LineStream {
    split_lines(response.bytes_stream(), MAX_LINE_LENGTH)
}

fn split_lines<S, E>(body: S, max_length: usize) -> LineStream
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let body = body.map_err(std::io::Error::other);
    Box::pin(FramedRead::new(
        StreamReader::new(body),
        LinesCodec::new_with_max_length(max_length),
    ))
}
