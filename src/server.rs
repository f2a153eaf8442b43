//! Server request-processing loop
//!
//! A state machine over the handshake: post `ready`, block on
//! `prompt_written`, run the engine (whole or streaming), post
//! `response_written`, repeat, until the shutdown flag or a termination
//! signal ends the loop. The current [`Phase`] is an explicit value, not a
//! position in control flow, so every region access happens under a named
//! protocol phase.

use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::engine::{build_prompt, generate, InferenceEngine};
use crate::error::BridgeError;
use crate::sem::WaitOutcome;
use crate::signals;
use crate::streaming::ChunkPublisher;
use crate::transport::ServerTransport;

/// Protocol phase of the server loop.
///
/// Writes to the shared region are only legal in `Processing`; reads of the
/// request fields are only legal between `AwaitingPrompt` and
/// `PublishingDone`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// About to signal readiness for the next request.
    Ready,
    /// Blocked until the client posts `prompt_written`.
    AwaitingPrompt,
    /// Engine running; server owns the response fields.
    Processing,
    /// About to post `response_written`.
    PublishingDone,
    /// Terminal: no further semaphore posts, resources released on drop.
    ShuttingDown,
}

/// The worker-side protocol driver.
pub struct ServerLoop<E: InferenceEngine> {
    transport: ServerTransport,
    engine: E,
    config: BridgeConfig,
    phase: Phase,
    requests_served: u64,
}

impl<E: InferenceEngine> ServerLoop<E> {
    pub fn new(transport: ServerTransport, engine: E, config: BridgeConfig) -> Self {
        Self {
            transport,
            engine,
            config,
            phase: Phase::Ready,
            requests_served: 0,
        }
    }

    /// Current protocol phase, mostly useful for diagnostics and tests.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Requests fully served so far.
    pub fn requests_served(&self) -> u64 {
        self.requests_served
    }

    /// Run the request loop until shutdown.
    ///
    /// Returns `Ok` on a clean shutdown (flag or signal). The transport is
    /// dropped by the caller when the `ServerLoop` goes out of scope, which
    /// unlinks every named object, the same path regardless of how the
    /// loop ended.
    pub fn run(&mut self) -> Result<(), BridgeError> {
        loop {
            self.phase = Phase::Ready;
            if signals::shutdown_requested() {
                self.phase = Phase::ShuttingDown;
                info!("termination signal observed; shutting down");
                return Ok(());
            }
            self.transport.ready().post()?;

            self.phase = Phase::AwaitingPrompt;
            if !self.await_prompt()? {
                self.phase = Phase::ShuttingDown;
                info!("shutdown observed; shutting down");
                return Ok(());
            }

            self.phase = Phase::Processing;
            let system_prompt = self.transport.region().read_system_prompt();
            let user_prompt = self.transport.region().read_user_prompt();
            let stream = self.transport.region().stream_mode();
            info!(
                stream,
                system_len = system_prompt.len(),
                user_len = user_prompt.len(),
                "processing request"
            );

            let prompt = build_prompt(&system_prompt, &user_prompt);
            if stream {
                self.process_streaming(&prompt)?;
            } else {
                self.process_whole(&prompt);
            }

            // No multi-turn context across requests at the engine level: the
            // next prompt starts from a clean sequence.
            self.engine.reset_sequence();

            self.phase = Phase::PublishingDone;
            self.transport.response_written().post()?;
            self.requests_served += 1;
        }
    }

    /// Block until `prompt_written`, re-checking the shutdown sources
    /// whenever the wait is interrupted. Returns false when the loop should
    /// terminate instead of processing.
    fn await_prompt(&mut self) -> Result<bool, BridgeError> {
        loop {
            let outcome = match self.config.wait_timeout {
                Some(timeout) => self.transport.prompt_written().wait_timeout(timeout)?,
                None => self.transport.prompt_written().wait()?,
            };
            match outcome {
                WaitOutcome::Acquired => break,
                // EINTR or an expired bound: nothing was consumed, so
                // checking the flags and re-waiting cannot lose a post.
                WaitOutcome::Interrupted | WaitOutcome::TimedOut => {
                    if signals::shutdown_requested() {
                        return Ok(false);
                    }
                }
            }
        }

        if signals::shutdown_requested() || self.transport.region().shutdown_requested() {
            return Ok(false);
        }
        Ok(true)
    }

    /// Whole mode: run the engine to completion, publish once. The update
    /// counter stays untouched and `chunk_ready` is never posted.
    fn process_whole(&mut self, prompt: &str) {
        let max_tokens = self.config.max_tokens;
        let outcome = generate(&mut self.engine, prompt, max_tokens, |_, _| {});

        let region = self.transport.region_mut();
        match outcome {
            Ok(generation) => {
                let truncated = region.write_response(&generation.text, generation.tokens as i32);
                if truncated {
                    warn!(
                        "response exceeded {} bytes; returning a truncated prefix",
                        crate::region::RESPONSE_CAP - 1
                    );
                }
                info!(tokens = generation.tokens, "request complete");
            }
            Err(e) => {
                // The request still completes with an empty response so the
                // client is released; the failure is visible only in logs.
                warn!("engine failed before producing output: {e}");
                region.write_response("", 0);
            }
        }
    }

    /// Streaming mode: publish each token as a chunk. The terminal update is
    /// published on every exit path, including engine failure mid-stream;
    /// partial output already published is the de facto result.
    fn process_streaming(&mut self, prompt: &str) -> Result<(), BridgeError> {
        let max_tokens = self.config.max_tokens;
        let Self {
            transport, engine, ..
        } = self;

        let (region, chunk_ready) = transport.split_for_streaming();
        let mut publisher = ChunkPublisher::new(region, chunk_ready);
        publisher.begin();

        let mut publish_err = None;
        let outcome = generate(engine, prompt, max_tokens, |text, tokens| {
            if publish_err.is_none() {
                if let Err(e) = publisher.publish(text, tokens) {
                    publish_err = Some(e);
                }
            }
        });

        match &outcome {
            Ok(generation) => info!(tokens = generation.tokens, "streaming request complete"),
            Err(e) => warn!("engine failed before producing output: {e}"),
        }

        publisher.finish()?;
        if let Some(e) = publish_err {
            return Err(e);
        }
        Ok(())
    }
}
