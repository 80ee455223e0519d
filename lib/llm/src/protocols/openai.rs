// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! OpenAI completions and chat completions, as far as the router needs to understand them.

use serde_json::{Map, Value};

use super::{KvTransferParams, TokenIdType};
use crate::config::DEFAULT_MAX_TOKENS;

const DATA_PREFIX: &str = "data: ";

/// The stop reason a decode backend reports when it lost its KV cache and needs the
/// request re-dispatched.
pub const RECOMPUTED_STOP_REASON: &str = "recomputed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Completions,
    ChatCompletions,
}

impl Endpoint {
    /// Path on the router and on every backend.
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Completions => "/v1/completions",
            Endpoint::ChatCompletions => "/v1/chat/completions",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Completions => "completions",
            Endpoint::ChatCompletions => "chat_completions",
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("request body must be a JSON object")]
    NotAnObject,

    #[error("request must contain `prompt` or `messages`")]
    MissingPrompt,

    #[error("cannot re-dispatch a request whose prompt is not text")]
    NonTextPrompt,
}

/// A client request, kept as the raw JSON object it arrived as.
///
/// Chat requests are those carrying `messages`. The prompt captured at parse time is the
/// base every recompute rewrites from: `prompt` when present, otherwise the first message's
/// content.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    body: Map<String, Value>,
    chat: bool,
    stream: bool,
    origin_prompt: Option<String>,
    origin_max_tokens: u64,
    retry_count: u32,
}

impl CompletionRequest {
    pub fn parse(bytes: &[u8]) -> Result<Self, RequestError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let Value::Object(body) = value else {
            return Err(RequestError::NotAnObject);
        };
        Self::from_body(body)
    }

    pub fn from_body(body: Map<String, Value>) -> Result<Self, RequestError> {
        let chat = body.contains_key("messages");
        let origin_prompt = match body.get("prompt") {
            Some(Value::String(prompt)) => Some(prompt.clone()),
            Some(_) => None,
            None if chat => Some(
                first_message(&body)
                    .and_then(|message| message.get("content"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            ),
            None => return Err(RequestError::MissingPrompt),
        };

        let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
        let origin_max_tokens = body
            .get("max_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_TOKENS);

        Ok(CompletionRequest {
            body,
            chat,
            stream,
            origin_prompt,
            origin_max_tokens,
            retry_count: 0,
        })
    }

    pub fn is_chat(&self) -> bool {
        self.chat
    }

    pub fn is_stream(&self) -> bool {
        self.stream
    }

    pub fn origin_max_tokens(&self) -> u64 {
        self.origin_max_tokens
    }

    /// Number of recomputes applied so far.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    pub fn prompt(&self) -> Option<&Value> {
        self.body.get("prompt")
    }

    /// Text prompt of a completions request.
    pub fn prompt_text(&self) -> Option<&str> {
        if self.chat {
            return None;
        }
        self.prompt().and_then(Value::as_str)
    }

    /// Token ids supplied directly by the client: an integer `prompt` or `prompt_token_ids`.
    pub fn token_ids(&self) -> Option<Vec<TokenIdType>> {
        if self.chat {
            return None;
        }
        self.prompt()
            .and_then(token_array)
            .or_else(|| self.body.get("prompt_token_ids").and_then(token_array))
    }

    /// Size of the serialized body, the load estimate charged to backends.
    pub fn load_units(&self) -> i64 {
        serde_json::to_vec(&self.body)
            .map(|bytes| bytes.len() as i64)
            .unwrap_or_default()
    }

    /// Body of the single-token prime call sent to the prefill backend.
    pub fn prime_payload(&self, aborted: Vec<String>) -> Value {
        let mut body = self.body.clone();
        body.insert(
            "kv_transfer_params".to_string(),
            serde_json::to_value(KvTransferParams::prime(aborted)).unwrap_or(Value::Null),
        );
        body.insert("stream".to_string(), Value::Bool(false));
        body.insert("max_tokens".to_string(), Value::from(1));
        body.insert("min_tokens".to_string(), Value::from(1));
        body.remove("stream_options");
        Value::Object(body)
    }

    /// Carries the prefill backend's transfer parameters into the decode call.
    pub fn set_transfer_params(&mut self, params: Option<Value>) {
        match params {
            Some(Value::Object(params)) if !params.is_empty() => {
                self.body
                    .insert("kv_transfer_params".to_string(), Value::Object(params));
            }
            _ => {
                self.body.remove("kv_transfer_params");
            }
        }
    }

    /// Rewrites the request to continue after `generated` text.
    ///
    /// The prompt becomes the original prompt followed by everything generated so far, and
    /// the token budget shrinks by what was already produced. The budget never drops below
    /// one token.
    pub fn recompute(
        &mut self,
        generated: &str,
        completion_tokens: u64,
    ) -> Result<(), RequestError> {
        let origin = self
            .origin_prompt
            .as_deref()
            .ok_or(RequestError::NonTextPrompt)?;
        let prompt = Value::String(format!("{origin}{generated}"));

        let in_messages = self.chat && !self.body.contains_key("prompt");
        if in_messages {
            let message = self
                .body
                .get_mut("messages")
                .and_then(Value::as_array_mut)
                .and_then(|messages| messages.first_mut())
                .and_then(Value::as_object_mut)
                .ok_or(RequestError::MissingPrompt)?;
            message.insert("content".to_string(), prompt);
        } else {
            self.body.insert("prompt".to_string(), prompt);
        }
        self.body.remove("prompt_token_ids");

        self.retry_count += 1;
        let remaining = self.origin_max_tokens as i64 - completion_tokens as i64
            + i64::from(self.retry_count);
        self.body
            .insert("max_tokens".to_string(), Value::from(remaining.max(1)));
        Ok(())
    }
}

fn first_message(body: &Map<String, Value>) -> Option<&Map<String, Value>> {
    body.get("messages")?
        .as_array()?
        .first()?
        .as_object()
}

fn token_array(value: &Value) -> Option<Vec<TokenIdType>> {
    let items = value.as_array()?;
    if items.is_empty() {
        return None;
    }
    items
        .iter()
        .map(|item| item.as_u64().and_then(|id| TokenIdType::try_from(id).ok()))
        .collect()
}

/// One line of a decode backend's response body.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// Not JSON, e.g. the `[DONE]` sentinel. Forwarded as is.
    Opaque,
    /// JSON without choices, e.g. a trailing usage chunk. Forwarded as is.
    NoChoices,
    Choice(ChoiceChunk),
}

impl StreamChunk {
    pub fn parse(line: &str) -> StreamChunk {
        let payload = line.strip_prefix(DATA_PREFIX).unwrap_or(line);
        let Ok(Value::Object(json)) = serde_json::from_str::<Value>(payload) else {
            return StreamChunk::Opaque;
        };

        let first = json
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(Value::as_object);
        let Some(choice) = first else {
            return StreamChunk::NoChoices;
        };

        let content = ["delta", "message"]
            .iter()
            .filter_map(|key| choice.get(*key)?.get("content")?.as_str())
            .chain(choice.get("text").and_then(Value::as_str))
            .find(|text| !text.is_empty())
            .unwrap_or_default()
            .to_string();
        let stop_reason = choice
            .get("stop_reason")
            .and_then(Value::as_str)
            .map(str::to_string);
        let completion_tokens = json
            .get("usage")
            .and_then(|usage| usage.get("completion_tokens"))
            .and_then(Value::as_u64);

        StreamChunk::Choice(ChoiceChunk {
            json,
            prefixed: line.starts_with(DATA_PREFIX),
            content,
            stop_reason,
            completion_tokens,
        })
    }
}

/// A chunk carrying at least one choice.
#[derive(Debug, Clone, PartialEq)]
pub struct ChoiceChunk {
    json: Map<String, Value>,
    prefixed: bool,
    /// Text generated by this chunk: delta content, message content, or completion text.
    pub content: String,
    pub stop_reason: Option<String>,
    /// `usage.completion_tokens`, if reported.
    pub completion_tokens: Option<u64>,
}

impl ChoiceChunk {
    pub fn is_recomputed(&self) -> bool {
        self.stop_reason.as_deref() == Some(RECOMPUTED_STOP_REASON)
    }

    /// Replaces the first choice's full text, used once a response spans several backends.
    pub fn patch_content(&mut self, chat: bool, text: &str) {
        let Some(choice) = self
            .json
            .get_mut("choices")
            .and_then(Value::as_array_mut)
            .and_then(|choices| choices.first_mut())
            .and_then(Value::as_object_mut)
        else {
            return;
        };

        if chat {
            if let Some(message) = choice.get_mut("message").and_then(Value::as_object_mut) {
                message.insert("content".to_string(), Value::String(text.to_string()));
            }
        } else {
            choice.insert("text".to_string(), Value::String(text.to_string()));
        }
        self.content = text.to_string();
    }

    /// Serializes the chunk back into a line, keeping its `data: ` prefix if it had one.
    pub fn to_line(&self) -> String {
        let json = Value::Object(self.json.clone()).to_string();
        if self.prefixed {
            format!("{DATA_PREFIX}{json}")
        } else {
            json
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn request(body: Value) -> CompletionRequest {
        CompletionRequest::parse(body.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn test_parse_rejects_bad_bodies() {
        assert_matches!(
            CompletionRequest::parse(b"{not json"),
            Err(RequestError::InvalidJson(_))
        );
        assert_matches!(
            CompletionRequest::parse(b"[1, 2]"),
            Err(RequestError::NotAnObject)
        );
        assert_matches!(
            CompletionRequest::parse(br#"{"model": "m"}"#),
            Err(RequestError::MissingPrompt)
        );
    }

    #[test]
    fn test_defaults() {
        let req = request(json!({"prompt": "hi"}));
        assert!(!req.is_chat());
        assert!(!req.is_stream());
        assert_eq!(req.origin_max_tokens(), 16);
        assert_eq!(req.prompt_text(), Some("hi"));
    }

    #[test]
    fn test_token_ids() {
        let req = request(json!({"prompt": [1, 2, 3]}));
        assert_eq!(req.token_ids(), Some(vec![1, 2, 3]));

        let req = request(json!({"prompt": "text", "prompt_token_ids": [7, 8]}));
        assert_eq!(req.token_ids(), Some(vec![7, 8]));

        let req = request(json!({"prompt": [1, -2]}));
        assert_eq!(req.token_ids(), None);

        let req = request(json!({"messages": [{"role": "user", "content": "hi"}]}));
        assert_eq!(req.token_ids(), None);
    }

    #[test]
    fn test_prime_payload() {
        let req = request(json!({
            "prompt": "hi",
            "stream": true,
            "max_tokens": 50,
            "stream_options": {"include_usage": true},
        }));
        let payload = req.prime_payload(vec!["old".to_string()]);
        assert_eq!(payload["stream"], json!(false));
        assert_eq!(payload["max_tokens"], json!(1));
        assert_eq!(payload["min_tokens"], json!(1));
        assert!(payload.get("stream_options").is_none());
        assert_eq!(payload["kv_transfer_params"]["do_remote_decode"], json!(true));
        assert_eq!(payload["kv_transfer_params"]["aborted_request"], json!(["old"]));

        // the client's own request is untouched
        assert_eq!(req.body()["max_tokens"], json!(50));
        assert!(req.is_stream());
    }

    #[test]
    fn test_transfer_params() {
        let mut req = request(json!({"prompt": "hi"}));
        req.set_transfer_params(Some(json!({"remote_engine_id": "e1"})));
        assert_eq!(req.body()["kv_transfer_params"]["remote_engine_id"], json!("e1"));

        req.set_transfer_params(Some(json!({})));
        assert!(req.body().get("kv_transfer_params").is_none());
    }

    #[test]
    fn test_recompute_completion() {
        let mut req = request(json!({"prompt": "Once", "max_tokens": 20}));
        req.recompute(" upon a", 2).unwrap();
        assert_eq!(req.body()["prompt"], json!("Once upon a"));
        assert_eq!(req.body()["max_tokens"], json!(19));
        assert_eq!(req.retry_count(), 1);

        // always rewritten from the original prompt
        req.recompute(" upon a time", 3).unwrap();
        assert_eq!(req.body()["prompt"], json!("Once upon a time"));
        assert_eq!(req.body()["max_tokens"], json!(19));
    }

    #[test]
    fn test_recompute_chat() {
        let mut req = request(json!({
            "messages": [
                {"role": "user", "content": "Tell me"},
                {"role": "assistant", "content": "later"},
            ],
        }));
        assert!(req.is_chat());
        req.recompute(" a story", 2).unwrap();
        assert_eq!(req.body()["messages"][0]["content"], json!("Tell me a story"));
        assert_eq!(req.body()["messages"][1]["content"], json!("later"));
        assert_eq!(req.body()["max_tokens"], json!(15));
    }

    #[test]
    fn test_recompute_budget_floor() {
        let mut req = request(json!({"prompt": "x", "max_tokens": 2}));
        req.recompute("abcdef", 6).unwrap();
        assert_eq!(req.body()["max_tokens"], json!(1));
    }

    #[test]
    fn test_recompute_token_prompt() {
        let mut req = request(json!({"prompt": [1, 2]}));
        assert_matches!(req.recompute("x", 1), Err(RequestError::NonTextPrompt));
    }

    #[test]
    fn test_parse_chunks() {
        assert_eq!(StreamChunk::parse("data: [DONE]"), StreamChunk::Opaque);
        assert_eq!(
            StreamChunk::parse(r#"data: {"choices": [], "usage": {"completion_tokens": 3}}"#),
            StreamChunk::NoChoices
        );

        let StreamChunk::Choice(chunk) =
            StreamChunk::parse(r#"data: {"choices": [{"delta": {"content": "Hel"}}]}"#)
        else {
            panic!("expected a choice chunk");
        };
        assert_eq!(chunk.content, "Hel");
        assert!(!chunk.is_recomputed());

        let StreamChunk::Choice(chunk) = StreamChunk::parse(
            r#"{"choices": [{"text": "lo", "stop_reason": "recomputed"}], "usage": {"completion_tokens": 4}}"#,
        ) else {
            panic!("expected a choice chunk");
        };
        assert_eq!(chunk.content, "lo");
        assert!(chunk.is_recomputed());
        assert_eq!(chunk.completion_tokens, Some(4));
    }

    #[test]
    fn test_empty_delta_falls_through() {
        let StreamChunk::Choice(chunk) = StreamChunk::parse(
            r#"{"choices": [{"delta": {"content": ""}, "message": {"content": "full"}}]}"#,
        ) else {
            panic!("expected a choice chunk");
        };
        assert_eq!(chunk.content, "full");
    }

    #[test]
    fn test_patch_content() {
        let StreamChunk::Choice(mut chunk) =
            StreamChunk::parse(r#"{"choices": [{"message": {"role": "assistant", "content": "b"}}]}"#)
        else {
            panic!("expected a choice chunk");
        };
        chunk.patch_content(true, "ab");
        let line: Value = serde_json::from_str(&chunk.to_line()).unwrap();
        assert_eq!(line["choices"][0]["message"]["content"], json!("ab"));
        assert_eq!(line["choices"][0]["message"]["role"], json!("assistant"));

        let StreamChunk::Choice(mut chunk) =
            StreamChunk::parse(r#"data: {"choices": [{"text": "b"}]}"#)
        else {
            panic!("expected a choice chunk");
        };
        chunk.patch_content(false, "ab");
        assert_eq!(chunk.to_line(), r#"data: {"choices":[{"text":"ab"}]}"#);
    }
}
