//! # Llamabridge
//!
//! A shared-memory request/response bridge between a long-running LLM
//! inference worker and a separate client process, synchronized by named
//! POSIX semaphores, with optional token-by-token streaming.
//!
//! ## Features
//!
//! - Fixed-layout shared region (`#[repr(C)]`, bounded NUL-terminated
//!   buffers) mapped by both processes
//! - Four-semaphore handshake that serializes access without any lock on
//!   the region itself
//! - Whole and streaming response delivery, with strictly increasing chunk
//!   counters and a single completion signal per request
//! - Engine-agnostic: inference is consumed through the
//!   [`InferenceEngine`] trait, one token at a time
//! - RAII resource lifecycle: the server creates and unlinks every named
//!   object, the client only opens them; stale leftovers from a crashed
//!   server are recovered at startup
//!
//! ## Example
//!
//! ```rust,no_run
//! use llamabridge::prelude::*;
//!
//! # fn main() -> Result<(), BridgeError> {
//! // Worker process
//! let config = BridgeConfig::default();
//! let transport = ServerTransport::create(&config)?;
//! let mut server = ServerLoop::new(transport, EchoEngine::new(), config.clone());
//! server.run()?;
//! # Ok(())
//! # }
//! ```
//!
//! The client side mirrors the protocol through [`BridgeClient`]; see
//! [`client`] for a usage example.

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod region;
pub mod sem;
pub mod server;
pub mod shm;
pub mod signals;
pub mod streaming;
pub mod transport;

pub use client::{BridgeClient, BridgeRequest, BridgeResponse, Chunks};
pub use config::{BridgeConfig, BridgeConfigBuilder};
pub use engine::{build_prompt, generate, EchoEngine, Generation, InferenceEngine, TokenId};
pub use error::BridgeError;
pub use region::{Chunk, SharedRegion, RESPONSE_CAP, SYSTEM_PROMPT_CAP, USER_PROMPT_CAP};
pub use sem::{Semaphore, WaitOutcome};
pub use server::{Phase, ServerLoop};
pub use shm::{Creator, Opener, SharedMemorySafe, Shm};
pub use streaming::ChunkPublisher;
pub use transport::{ClientTransport, ServerTransport};

/// The common imports for either side of the bridge.
pub mod prelude {
    pub use crate::{
        BridgeClient, BridgeConfig, BridgeError, BridgeRequest, BridgeResponse, EchoEngine,
        InferenceEngine, ServerLoop, ServerTransport,
    };
}
