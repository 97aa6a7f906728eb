//! Caller-supplied hooks invoked while rewriting a stream.

use serde_json::{Value, json};

/// Hooks a [`crate::StreamTransformer`] calls for each rewritten record.
///
/// Every method has a default, so implementors override only what they need.
pub trait StreamHooks: Send + Sync {
    /// A signature was cached for `text` under `session_key`.
    fn on_cache_signature(&self, _session_key: &str, _text: &str, _signature: &str) {}

    /// Inject debug text into the first rewritten response of a stream.
    fn inject_debug(&self, response: Value, text: &str) -> Value {
        inject_debug_thinking(response, text)
    }

    /// Rewrite thinking parts in a response before it is re-serialized.
    fn transform_thinking_parts(&self, response: Value) -> Value {
        response
    }
}

/// Hooks with default behavior only.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl StreamHooks for NoHooks {}

/// Prepend `text` as a thinking item to a response.
///
/// Candidate responses get a thought part on the first candidate; content
/// block responses get a leading `thinking` block. Other shapes are returned
/// unchanged.
pub fn inject_debug_thinking(mut response: Value, text: &str) -> Value {
    if let Some(parts) = response
        .pointer_mut("/candidates/0/content/parts")
        .and_then(Value::as_array_mut)
    {
        parts.insert(0, json!({"thought": true, "text": text}));
        return response;
    }

    if let Some(blocks) = response.get_mut("content").and_then(Value::as_array_mut) {
        blocks.insert(0, json!({"type": "thinking", "thinking": text}));
    }

    response
}
