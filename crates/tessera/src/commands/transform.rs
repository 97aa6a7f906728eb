//! Transform command - rewrite an event stream from stdin to stdout.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use clap::Args;
use futures::StreamExt;
use tessera_stream::{SignatureStore, StreamHooks, StreamTransformer, transform_stream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::Context;

const READ_CHUNK: usize = 8 * 1024;

/// Arguments for the transform command.
#[derive(Args, Debug)]
pub struct TransformArgs {
    /// Cache thinking signatures under this session key
    #[arg(long)]
    pub session: Option<String>,

    /// Inject this text as a thinking item into the first response
    #[arg(long)]
    pub debug_text: Option<String>,
}

/// Logs each cached signature.
struct LoggingHooks;

impl StreamHooks for LoggingHooks {
    fn on_cache_signature(&self, session_key: &str, text: &str, signature: &str) {
        tracing::debug!(
            session = %session_key,
            text_len = text.len(),
            signature_len = signature.len(),
            "Signature cached"
        );
    }
}

/// Run the transform command.
pub async fn run(args: TransformArgs, ctx: &Context) -> Result<()> {
    let mut config = ctx.config.config.stream.clone();
    if let Some(session) = args.session {
        config = config.with_signature_cache(session);
    }
    if let Some(text) = args.debug_text {
        config = config.with_debug_text(text);
    }
    let session_key = config.signature_session_key.clone();

    let store = Arc::new(SignatureStore::new(ctx.config.config.signatures.clone()));
    let transformer =
        StreamTransformer::new(config, store.clone()).with_hooks(Arc::new(LoggingHooks));

    let mut out = transform_stream(stdin_chunks(), transformer);
    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = out.next().await {
        stdout.write_all(&chunk?).await?;
    }
    stdout.flush().await?;

    if let Some(session) = session_key {
        tracing::info!(
            session = %session,
            signatures = store.entry_count(&session),
            "Stream finished"
        );
    }
    Ok(())
}

/// Stdin as a stream of byte chunks.
fn stdin_chunks() -> impl futures::Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    futures::stream::unfold(Some(tokio::io::stdin()), |stdin| async move {
        let mut stdin = stdin?;
        let mut buf = vec![0u8; READ_CHUNK];
        match stdin.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), Some(stdin)))
            }
            Err(e) => Some((Err(e), None)),
        }
    })
}
