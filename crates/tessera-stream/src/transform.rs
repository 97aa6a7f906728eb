//! Line-oriented rewriting of streamed event records.
//!
//! Upstream bytes arrive in arbitrary chunks. The transformer reassembles
//! newline-delimited lines (including UTF-8 sequences split across chunks)
//! and rewrites every `data:` line whose JSON payload carries a `response`.
//! While rewriting it accumulates thinking text per candidate and caches
//! continuation signatures paired with the exact text they were issued for.
//!
//! Everything else, including malformed JSON, is emitted byte-for-byte.

use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StreamError;
use crate::hooks::{NoHooks, StreamHooks};
use crate::signature::{SignatureStore, SignedThinking};
use crate::thought_buffer::ThoughtBuffer;

/// Marker that starts a transformable line.
pub const EVENT_PREFIX: &str = "data:";

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Per-stream transformer settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformerConfig {
    /// Cache thinking signatures seen in the stream.
    pub cache_signatures: bool,
    /// Session the signatures are cached under.
    pub signature_session_key: Option<String>,
    /// Text injected once into the first rewritten response.
    pub debug_text: Option<String>,
}

impl TransformerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable signature caching under `session_key`.
    pub fn with_signature_cache(mut self, session_key: impl Into<String>) -> Self {
        self.cache_signatures = true;
        self.signature_session_key = Some(session_key.into());
        self
    }

    pub fn with_debug_text(mut self, text: impl Into<String>) -> Self {
        self.debug_text = Some(text.into());
        self
    }

    fn session_key(&self) -> Option<&str> {
        if !self.cache_signatures {
            return None;
        }
        self.signature_session_key
            .as_deref()
            .filter(|key| !key.is_empty())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────────────────────────

/// Where thinking content lives in a response.
///
/// Only the outer list is decoded here; each candidate, part, and block is
/// decoded separately so one malformed entry never hides its neighbours.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ThinkingShape {
    /// Candidate list with nested content parts.
    Candidates { candidates: Vec<Value> },
    /// Flat content block list.
    Blocks { content: Vec<Value> },
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    index: Option<Value>,
    #[serde(default)]
    content: Option<Value>,
}

impl Candidate {
    fn parts(&self) -> &[Value] {
        self.content
            .as_ref()
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    thought: Option<Value>,
    #[serde(default)]
    text: Option<Value>,
    #[serde(default, rename = "thoughtSignature")]
    thought_signature: Option<Value>,
}

impl Part {
    fn is_thought(&self) -> bool {
        matches!(self.thought, Some(Value::Bool(true)))
    }
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default, rename = "type")]
    kind: Option<Value>,
    #[serde(default)]
    thinking: Option<Value>,
    #[serde(default)]
    text: Option<Value>,
    #[serde(default)]
    signature: Option<Value>,
}

fn as_text(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str)
}

// ─────────────────────────────────────────────────────────────────────────────
// StreamTransformer
// ─────────────────────────────────────────────────────────────────────────────

/// Stateful transform over one response stream.
///
/// Feed chunks with [`push`](Self::push) in arrival order and call
/// [`finish`](Self::finish) once at end of input.
pub struct StreamTransformer {
    config: TransformerConfig,
    store: Arc<SignatureStore>,
    hooks: Arc<dyn StreamHooks>,
    thoughts: ThoughtBuffer,
    /// Decoded text after the last newline.
    carry: String,
    /// Trailing bytes of an incomplete UTF-8 sequence.
    partial_utf8: Vec<u8>,
    debug_injected: bool,
}

impl std::fmt::Debug for StreamTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransformer")
            .field("config", &self.config)
            .field("carry_len", &self.carry.len())
            .field("debug_injected", &self.debug_injected)
            .finish()
    }
}

impl StreamTransformer {
    pub fn new(config: TransformerConfig, store: Arc<SignatureStore>) -> Self {
        Self {
            config,
            store,
            hooks: Arc::new(NoHooks),
            thoughts: ThoughtBuffer::new(),
            carry: String::new(),
            partial_utf8: Vec::new(),
            debug_injected: false,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn StreamHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    /// Thinking text accumulated so far in this stream.
    pub fn thought_buffer(&self) -> &ThoughtBuffer {
        &self.thoughts
    }

    /// Consume a chunk and return the rewritten bytes for every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Bytes {
        let decoded = self.decode(chunk);
        self.carry.push_str(&decoded);

        let Some(last_newline) = self.carry.rfind('\n') else {
            return Bytes::new();
        };

        let rest = self.carry.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.carry, rest);

        let mut out = String::with_capacity(complete.len());
        // `complete` ends with '\n', so the final split segment is empty.
        for line in complete[..complete.len() - 1].split('\n') {
            out.push_str(&self.transform_line(line));
            out.push('\n');
        }
        Bytes::from(out)
    }

    /// Flush buffered input at end of stream.
    ///
    /// Any unterminated final line goes through the same rewrite. The thought
    /// buffer is cleared so nothing leaks into a later stream.
    pub fn finish(&mut self) -> Bytes {
        if !self.partial_utf8.is_empty() {
            let tail = std::mem::take(&mut self.partial_utf8);
            self.carry.push_str(&String::from_utf8_lossy(&tail));
        }

        let remaining = std::mem::take(&mut self.carry);
        let out = if remaining.is_empty() {
            Bytes::new()
        } else {
            Bytes::from(self.transform_line(&remaining))
        };

        self.thoughts.clear();
        out
    }

    /// Rewrite a single line without its terminator.
    pub fn transform_line(&mut self, line: &str) -> String {
        let Some(payload) = line.strip_prefix(EVENT_PREFIX) else {
            return line.to_string();
        };
        let payload = payload.trim();
        if payload.is_empty() {
            return line.to_string();
        }

        let mut envelope: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::trace!(error = %e, "Passing through unparseable event payload");
                return line.to_string();
            }
        };

        let Some(mut response) = envelope.get_mut("response").map(Value::take) else {
            return line.to_string();
        };

        if let Some(session_key) = self.config.session_key() {
            cache_thinking_signatures(
                &response,
                session_key,
                &mut self.thoughts,
                &self.store,
                self.hooks.as_ref(),
            );
        }

        if let Some(text) = self.config.debug_text.as_deref() {
            if !self.debug_injected {
                response = self.hooks.inject_debug(response, text);
                self.debug_injected = true;
            }
        }

        envelope["response"] = self.hooks.transform_thinking_parts(response);

        match serde_json::to_string(&envelope) {
            Ok(json) => format!("{} {}", EVENT_PREFIX, json),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to re-serialize event payload");
                line.to_string()
            }
        }
    }

    /// Decode as much of `chunk` as forms complete UTF-8, keeping a split
    /// trailing sequence for the next chunk. Invalid bytes become U+FFFD.
    fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.partial_utf8);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.partial_utf8 = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }
}

/// Record thinking text and cache any signatures found in `response`.
///
/// Every candidate and block is visited; a signature is paired with the text
/// accumulated up to the moment it appears.
fn cache_thinking_signatures(
    response: &Value,
    session_key: &str,
    thoughts: &mut ThoughtBuffer,
    store: &SignatureStore,
    hooks: &dyn StreamHooks,
) {
    let Ok(shape) = ThinkingShape::deserialize(response) else {
        return;
    };

    match shape {
        ThinkingShape::Candidates { candidates } => {
            for (position, candidate) in candidates.iter().enumerate() {
                let Ok(candidate) = Candidate::deserialize(candidate) else {
                    tracing::trace!(position, "Skipping malformed candidate");
                    continue;
                };
                let index = candidate
                    .index
                    .as_ref()
                    .and_then(Value::as_u64)
                    .and_then(|i| usize::try_from(i).ok())
                    .unwrap_or(position);
                for part in candidate.parts() {
                    let Ok(part) = Part::deserialize(part) else {
                        continue;
                    };
                    if part.is_thought() {
                        if let Some(text) = as_text(part.text.as_ref()) {
                            thoughts.set(index, text);
                        }
                    }
                    if let Some(signature) =
                        as_text(part.thought_signature.as_ref()).filter(|s| !s.is_empty())
                    {
                        let text = thoughts.get(index).unwrap_or_default();
                        if !text.is_empty() {
                            store_signature(store, hooks, session_key, text, signature);
                        }
                    }
                }
            }
        }
        ThinkingShape::Blocks { content } => {
            let mut thinking = String::new();
            for block in &content {
                let Ok(block) = ContentBlock::deserialize(block) else {
                    continue;
                };
                if as_text(block.kind.as_ref()) == Some("thinking") {
                    if let Some(text) =
                        as_text(block.thinking.as_ref()).or(as_text(block.text.as_ref()))
                    {
                        thinking.push_str(text);
                    }
                }
                if let Some(signature) = as_text(block.signature.as_ref()).filter(|s| !s.is_empty())
                {
                    if !thinking.is_empty() {
                        store_signature(store, hooks, session_key, &thinking, signature);
                    }
                }
            }
        }
    }
}

fn store_signature(
    store: &SignatureStore,
    hooks: &dyn StreamHooks,
    session_key: &str,
    text: &str,
    signature: &str,
) {
    store.set(session_key, SignedThinking::new(text, signature));
    hooks.on_cache_signature(session_key, text, signature);
    tracing::debug!(
        session = %session_key,
        text_len = text.len(),
        "Cached thinking signature"
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream adapter
// ─────────────────────────────────────────────────────────────────────────────

/// A rewritten byte stream.
pub type TransformedStream = Pin<Box<dyn Stream<Item = Result<Bytes, StreamError>> + Send>>;

struct AdapterState<S> {
    upstream: Pin<Box<S>>,
    transformer: Option<StreamTransformer>,
}

/// Run `upstream` through `transformer`, flushing at end of input.
///
/// An upstream error is yielded once and ends the stream.
pub fn transform_stream<S, E>(upstream: S, transformer: StreamTransformer) -> TransformedStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display,
{
    Box::pin(futures::stream::unfold(
        AdapterState {
            upstream: Box::pin(upstream),
            transformer: Some(transformer),
        },
        |mut state| async move {
            loop {
                let transformer = state.transformer.as_mut()?;
                match state.upstream.next().await {
                    Some(Ok(chunk)) => {
                        let out = transformer.push(&chunk);
                        if !out.is_empty() {
                            return Some((Ok(out), state));
                        }
                    }
                    Some(Err(e)) => {
                        state.transformer = None;
                        return Some((Err(StreamError::Upstream(e.to_string())), state));
                    }
                    None => {
                        let out = transformer.finish();
                        state.transformer = None;
                        if out.is_empty() {
                            return None;
                        }
                        return Some((Ok(out), state));
                    }
                }
            }
        },
    ))
}
