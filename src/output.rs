//! Forwarding process output to an observer.

use crate::environment::OutputStream;
use futures_util::StreamExt;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Which process a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Install,
    Server,
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputKind::Install => f.write_str("install"),
            OutputKind::Server => f.write_str("server"),
        }
    }
}

/// Receives the text output of spawned processes.
pub trait OutputSink: Send + Sync {
    fn write(&self, kind: OutputKind, chunk: &str);

    fn close(&self, _kind: OutputKind) {}

    fn abort(&self, _kind: OutputKind, _reason: &str) {}
}

/// Logs every chunk through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl OutputSink for TracingSink {
    fn write(&self, kind: OutputKind, chunk: &str) {
        info!(stream = %kind, "{}", chunk.trim_end());
    }

    fn close(&self, kind: OutputKind) {
        debug!(stream = %kind, "Output complete");
    }

    fn abort(&self, kind: OutputKind, reason: &str) {
        warn!(stream = %kind, reason, "Output failed");
    }
}

/// Drain `output` into `sink` until the stream ends or fails.
/// A stream error aborts the sink and is not propagated.
pub async fn pipe_output(mut output: OutputStream, sink: Arc<dyn OutputSink>, kind: OutputKind) {
    while let Some(chunk) = output.next().await {
        match chunk {
            Ok(text) => sink.write(kind, &text),
            Err(e) => {
                sink.abort(kind, &e.to_string());
                return;
            }
        }
    }
    sink.close(kind);
}
