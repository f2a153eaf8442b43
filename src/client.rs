//! Consumer-side protocol mirror
//!
//! [`BridgeClient`] opens the named objects a running server created and
//! walks the same handshake from the other side: wait `ready`, write the
//! request, post `prompt_written`, then collect the response: in one piece
//! (whole mode) or through the [`Chunks`] iterator (streaming mode).
//!
//! ## Example
//!
//! ```rust,no_run
//! use llamabridge::{BridgeClient, BridgeConfig, BridgeRequest};
//!
//! # fn main() -> Result<(), llamabridge::BridgeError> {
//! let mut client = BridgeClient::connect(&BridgeConfig::default())?;
//!
//! let response = client.request_whole(
//!     &BridgeRequest::new("Say hi.").with_system("You are terse."),
//! )?;
//! println!("{}", response.text);
//!
//! for chunk in client.send_streaming(&BridgeRequest::new("Tell me more."))? {
//!     let chunk = chunk?;
//!     print!("{}", chunk.text);
//! }
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use tracing::warn;

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::region::Chunk;
use crate::sem::{Semaphore, WaitOutcome};
use crate::shm::Opener;
use crate::transport::ClientTransport;

/// One request as the client sees it.
#[derive(Debug, Clone, Default)]
pub struct BridgeRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub stream: bool,
}

impl BridgeRequest {
    pub fn new(user_prompt: impl Into<String>) -> Self {
        Self {
            user_prompt: user_prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_system(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

/// A completed whole-mode response.
#[derive(Debug, Clone)]
pub struct BridgeResponse {
    pub text: String,
    pub tokens_generated: i32,
}

/// Client handle over an open transport.
pub struct BridgeClient {
    transport: ClientTransport,
    wait_timeout: Option<Duration>,
}

impl BridgeClient {
    /// Open the server's named objects. Fails if the server is not running.
    pub fn connect(config: &BridgeConfig) -> Result<Self, BridgeError> {
        Ok(Self {
            transport: ClientTransport::open(config)?,
            wait_timeout: config.wait_timeout,
        })
    }

    fn wait_on(&self, sem: &Semaphore<Opener>) -> Result<(), BridgeError> {
        loop {
            let outcome = match self.wait_timeout {
                Some(timeout) => sem.wait_timeout(timeout)?,
                None => sem.wait()?,
            };
            match outcome {
                WaitOutcome::Acquired => return Ok(()),
                WaitOutcome::Interrupted => continue,
                WaitOutcome::TimedOut => {
                    return Err(BridgeError::PeerUnresponsive {
                        resource: sem.name().to_string(),
                        timeout: self.wait_timeout.unwrap_or_default(),
                    })
                }
            }
        }
    }

    /// Write a request and hand the turn to the server.
    ///
    /// Blocks until the server signals `ready`. After this returns, the
    /// response must be collected with [`recv_whole`](Self::recv_whole) or
    /// by draining a [`Chunks`] iterator, matching the request's mode.
    pub fn send(&mut self, request: &BridgeRequest) -> Result<(), BridgeError> {
        self.wait_on(self.transport.ready())?;

        let truncated = self.transport.region_mut().write_request(
            &request.system_prompt,
            &request.user_prompt,
            request.stream,
        );
        if truncated {
            warn!("prompt exceeded its buffer; the server sees a truncated prefix");
        }

        self.transport.prompt_written().post()
    }

    /// Wait for the completion signal and read the full response.
    pub fn recv_whole(&mut self) -> Result<BridgeResponse, BridgeError> {
        self.wait_on(self.transport.response_written())?;
        let region = self.transport.region();
        Ok(BridgeResponse {
            text: region.read_response(),
            tokens_generated: region.tokens_generated(),
        })
    }

    /// Whole-mode convenience: send and wait for the single response.
    pub fn request_whole(&mut self, request: &BridgeRequest) -> Result<BridgeResponse, BridgeError> {
        let request = BridgeRequest {
            stream: false,
            ..request.clone()
        };
        self.send(&request)?;
        self.recv_whole()
    }

    /// Streaming convenience: send and return the chunk iterator.
    pub fn send_streaming(&mut self, request: &BridgeRequest) -> Result<Chunks<'_>, BridgeError> {
        let request = BridgeRequest {
            stream: true,
            ..request.clone()
        };
        self.send(&request)?;
        Ok(Chunks {
            client: self,
            last_counter: 0,
            done: false,
        })
    }

    /// Ask the server to exit its loop. Takes the client's turn like any
    /// request but carries no prompt; the server exits without processing
    /// and without posting `response_written`.
    pub fn request_shutdown(&mut self) -> Result<(), BridgeError> {
        self.wait_on(self.transport.ready())?;
        self.transport.region_mut().write_shutdown();
        self.transport.prompt_written().post()
    }
}

/// Iterator over streaming chunks for one request.
///
/// Yields every update with a counter the client has not seen before, ends
/// after the update carrying `generation_complete`, and performs the final
/// `response_written` synchronization before yielding that last chunk.
/// Stale wakeups (leftover posts whose counter the iterator has already
/// observed) are skipped silently.
pub struct Chunks<'a> {
    client: &'a mut BridgeClient,
    last_counter: i32,
    done: bool,
}

impl Iterator for Chunks<'_> {
    type Item = Result<Chunk, BridgeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            if let Err(e) = self.client.wait_on(self.client.transport.chunk_ready()) {
                self.done = true;
                return Some(Err(e));
            }

            let chunk = self.client.transport.region().read_chunk();
            if chunk.counter <= self.last_counter {
                // A post from a previous request, or one that was coalesced
                // with a later update we already consumed.
                continue;
            }
            self.last_counter = chunk.counter;

            if chunk.complete {
                self.done = true;
                if let Err(e) = self
                    .client
                    .wait_on(self.client.transport.response_written())
                {
                    return Some(Err(e));
                }
            }
            return Some(Ok(chunk));
        }
    }
}
