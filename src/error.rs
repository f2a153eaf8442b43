use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Failed to set up {resource}: {source}")]
    ResourceSetup {
        resource: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Semaphore operation on {name} failed: {source}")]
    Semaphore {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Peer did not respond within {timeout:?} while waiting on {resource}")]
    PeerUnresponsive { resource: String, timeout: Duration },

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
