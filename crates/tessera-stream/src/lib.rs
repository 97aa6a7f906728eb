//! Streaming response rewriting with thinking-signature caching.
//!
//! Sits between an upstream model API and the client, rewriting
//! newline-delimited `data:` event records on the fly.
//!
//! # Components
//!
//! - [`transform`]: [`StreamTransformer`], line reassembly and record rewriting
//! - [`signature`]: [`SignatureStore`], per-session signatures with TTL and bounds
//! - [`thought_buffer`]: per-candidate accumulation of partial thinking text
//! - [`hooks`]: caller callbacks and the default debug-text injection
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use tessera_stream::{SignatureStore, StreamTransformer, TransformerConfig};
//!
//! let store = Arc::new(SignatureStore::default());
//! let mut transformer = StreamTransformer::new(
//!     TransformerConfig::new().with_signature_cache("session-1"),
//!     store.clone(),
//! );
//!
//! let out = transformer.push(b": keep-alive\n");
//! assert_eq!(&out[..], b": keep-alive\n");
//! ```

pub mod error;
pub mod hooks;
pub mod signature;
pub mod thought_buffer;
pub mod transform;

pub use error::{Result, StreamError};
pub use hooks::{NoHooks, StreamHooks, inject_debug_thinking};
pub use signature::{SignatureStore, SignatureStoreConfig, SignedThinking};
pub use thought_buffer::ThoughtBuffer;
pub use transform::{
    EVENT_PREFIX, StreamTransformer, TransformedStream, TransformerConfig, transform_stream,
};
