//! Streaming chunk emitter
//!
//! Server-internal bridge between the per-token generation loop and the
//! chunked delivery contract: every published update rewrites the full
//! cumulative text, bumps the update counter, and posts `chunk_ready`.
//! Whether the stream ends at end-of-generation, at the token cap, or on an
//! engine fault, [`ChunkPublisher::finish`] still runs, so the client always
//! observes a final update with `generation_complete` set and is never left
//! waiting.

use tracing::warn;

use crate::error::BridgeError;
use crate::region::SharedRegion;
use crate::sem::Semaphore;
use crate::shm::Creator;

/// Publishes incremental response updates during one streaming request.
pub struct ChunkPublisher<'a> {
    region: &'a mut SharedRegion,
    chunk_ready: &'a Semaphore<Creator>,
    truncation_logged: bool,
}

impl<'a> ChunkPublisher<'a> {
    pub fn new(region: &'a mut SharedRegion, chunk_ready: &'a Semaphore<Creator>) -> Self {
        Self {
            region,
            chunk_ready,
            truncation_logged: false,
        }
    }

    /// Clear per-request streaming state before any update becomes
    /// observable.
    pub fn begin(&mut self) {
        self.region.begin_response();
    }

    /// Publish the cumulative text as one chunk and signal the client.
    pub fn publish(&mut self, text: &str, tokens: usize) -> Result<(), BridgeError> {
        let truncated = self.region.publish_chunk(text, tokens as i32);
        if truncated && !self.truncation_logged {
            // Silent on the wire; the client keeps receiving the bounded
            // prefix. Log once per request, not once per token.
            warn!(
                "response exceeded {} bytes; streaming a truncated prefix",
                crate::region::RESPONSE_CAP - 1
            );
            self.truncation_logged = true;
        }
        self.chunk_ready.post()
    }

    /// Publish the terminal update: `generation_complete` goes true exactly
    /// once, on this final signal.
    pub fn finish(&mut self) -> Result<(), BridgeError> {
        self.region.finish_response();
        self.chunk_ready.post()
    }
}
