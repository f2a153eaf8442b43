//! Shared region layout and transport codec
//!
//! The single fixed-layout block both processes map. Field order and buffer
//! sizes are the wire contract: the peer may be built separately, so the
//! struct is `#[repr(C)]` and every text field is a fixed, NUL-terminated
//! byte buffer with silent truncation at capacity.
//!
//! Flags and counters are atomics. In whole mode the handshake alone makes
//! concurrent access unreachable, but in streaming mode the server rewrites
//! the response while the client may still be reading the previous chunk, so
//! the client reads through [`SharedRegion::read_chunk`], which snapshots the
//! buffer between two loads of `update_counter` and retries when a publish
//! landed in between.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::shm::SharedMemorySafe;

/// Capacity of the system prompt buffer, terminator included.
pub const SYSTEM_PROMPT_CAP: usize = 4096;
/// Capacity of the user prompt buffer, terminator included.
pub const USER_PROMPT_CAP: usize = 4096;
/// Capacity of the response buffer, terminator included.
pub const RESPONSE_CAP: usize = 32768;

/// The fixed-layout block shared by server and client.
///
/// Which side may write is decided entirely by the protocol phase, never by
/// a lock: the client writes during its turn (request fields), the server
/// writes during its turn (response fields and counters).
#[repr(C)]
pub struct SharedRegion {
    system_prompt: [u8; SYSTEM_PROMPT_CAP],
    user_prompt: [u8; USER_PROMPT_CAP],
    response: [u8; RESPONSE_CAP],
    shutdown_requested: AtomicBool,
    stream_mode: AtomicBool,
    update_counter: AtomicI32,
    generation_complete: AtomicBool,
    tokens_generated: AtomicI32,
}

// All fields are fixed-size arrays and atomics: zero-init valid, repr(C),
// no pointers, sound without Drop.
unsafe impl SharedMemorySafe for SharedRegion {}

/// One observed streaming update, snapshotted from the region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Value of `update_counter` at the time of the snapshot.
    pub counter: i32,
    /// Cumulative response text generated so far.
    pub text: String,
    /// Tokens reflected in `text`.
    pub tokens: i32,
    /// True exactly once, on the final update of a request.
    pub complete: bool,
}

/// Copy `text` into `buf`, truncating silently at `buf.len() - 1` bytes and
/// zero-filling the remainder. Returns true if truncation occurred.
fn write_bounded(buf: &mut [u8], text: &str) -> bool {
    let cap = buf.len() - 1;
    let bytes = text.as_bytes();
    let n = bytes.len().min(cap);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf[n..].fill(0);
    bytes.len() > cap
}

/// Decode the NUL-terminated prefix of `buf` as UTF-8.
fn read_bounded(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

impl SharedRegion {
    // ==================== Client-side writes ====================

    /// Encode a request into the region.
    ///
    /// Clears the response area and every per-request flag and counter, then
    /// writes both prompts with silent truncation. Returns true if either
    /// prompt was truncated. Must only be called while the client owns the
    /// turn (after `ready`, before posting `prompt_written`).
    pub fn write_request(&mut self, system_prompt: &str, user_prompt: &str, stream: bool) -> bool {
        self.response.fill(0);
        self.shutdown_requested.store(false, Ordering::Release);
        self.generation_complete.store(false, Ordering::Release);
        self.update_counter.store(0, Ordering::Release);
        self.tokens_generated.store(0, Ordering::Release);

        let truncated = write_bounded(&mut self.system_prompt, system_prompt);
        let truncated = write_bounded(&mut self.user_prompt, user_prompt) || truncated;
        self.stream_mode.store(stream, Ordering::Release);
        truncated
    }

    /// Flag the server to exit its loop on the next cycle. The request
    /// buffers are cleared so the server never mistakes leftovers for a
    /// prompt.
    pub fn write_shutdown(&mut self) {
        self.system_prompt.fill(0);
        self.user_prompt.fill(0);
        self.shutdown_requested.store(true, Ordering::Release);
    }

    // ==================== Server-side reads ====================

    pub fn read_system_prompt(&self) -> String {
        read_bounded(&self.system_prompt)
    }

    pub fn read_user_prompt(&self) -> String {
        read_bounded(&self.user_prompt)
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    pub fn stream_mode(&self) -> bool {
        self.stream_mode.load(Ordering::Acquire)
    }

    // ==================== Server-side writes ====================

    /// Reset the per-request streaming state before the first chunk becomes
    /// observable.
    pub fn begin_response(&mut self) {
        self.response.fill(0);
        self.generation_complete.store(false, Ordering::Release);
        self.update_counter.store(0, Ordering::Release);
        self.tokens_generated.store(0, Ordering::Release);
    }

    /// Whole-mode publish: write the full response once. `update_counter` is
    /// left untouched; whole-mode readers never inspect it. Returns true on
    /// truncation.
    pub fn write_response(&mut self, text: &str, tokens: i32) -> bool {
        let truncated = write_bounded(&mut self.response, text);
        self.tokens_generated.store(tokens, Ordering::Release);
        truncated
    }

    /// Streaming publish: rewrite the full cumulative text and make the
    /// update observable by bumping `update_counter`. The counter bump is the
    /// last write, so a reader that sees the new counter value sees the bytes
    /// it announces. Returns true on truncation.
    pub fn publish_chunk(&mut self, text: &str, tokens: i32) -> bool {
        let truncated = write_bounded(&mut self.response, text);
        self.tokens_generated.store(tokens, Ordering::Release);
        self.update_counter.fetch_add(1, Ordering::Release);
        truncated
    }

    /// Terminal streaming update: mark the request complete without touching
    /// the text. Bumps the counter so the completion itself is a distinct
    /// observable update.
    pub fn finish_response(&self) {
        self.generation_complete.store(true, Ordering::Release);
        self.update_counter.fetch_add(1, Ordering::Release);
    }

    // ==================== Client-side reads ====================

    /// Decode the response text. Never blocks, never mutates. Only meaningful
    /// while the client owns the turn (whole mode, after `response_written`).
    pub fn read_response(&self) -> String {
        read_bounded(&self.response)
    }

    pub fn tokens_generated(&self) -> i32 {
        self.tokens_generated.load(Ordering::Acquire)
    }

    pub fn generation_complete(&self) -> bool {
        self.generation_complete.load(Ordering::Acquire)
    }

    pub fn update_counter(&self) -> i32 {
        self.update_counter.load(Ordering::Acquire)
    }

    /// Counter-stable snapshot for streaming readers.
    ///
    /// The server may publish the next chunk while this copy is in progress;
    /// if the counter moved between the two loads the snapshot is discarded
    /// and retaken, so a returned [`Chunk`] is internally consistent.
    pub fn read_chunk(&self) -> Chunk {
        loop {
            let before = self.update_counter.load(Ordering::Acquire);
            let text = read_bounded(&self.response);
            let tokens = self.tokens_generated.load(Ordering::Acquire);
            let complete = self.generation_complete.load(Ordering::Acquire);
            std::sync::atomic::fence(Ordering::Acquire);
            let after = self.update_counter.load(Ordering::Relaxed);
            if before == after {
                return Chunk {
                    counter: after,
                    text,
                    tokens,
                    complete,
                };
            }
        }
    }
}
