//! End-to-end protocol tests
//!
//! Run the real server loop on a background thread against real shared
//! memory and semaphores, with a scripted engine standing in for the
//! inference backend, and drive it from a client on the test thread. Each
//! test uses its own instance prefix so tests can run in parallel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use llamabridge::{
    BridgeClient, BridgeConfig, BridgeError, BridgeRequest, InferenceEngine, Phase, ServerLoop,
    ServerTransport, TokenId,
};

/// Engine that emits a fixed script of pieces, with optional fault
/// injection, and counts how often it is driven.
struct ScriptedEngine {
    pieces: Vec<&'static str>,
    cursor: usize,
    fail_decode_after: Option<usize>,
    tokenize_calls: Arc<AtomicUsize>,
    resets: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    fn new(pieces: Vec<&'static str>) -> Self {
        Self {
            pieces,
            cursor: 0,
            fail_decode_after: None,
            tokenize_calls: Arc::new(AtomicUsize::new(0)),
            resets: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn failing_after(mut self, generated_tokens: usize) -> Self {
        self.fail_decode_after = Some(generated_tokens);
        self
    }
}

impl InferenceEngine for ScriptedEngine {
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, BridgeError> {
        self.tokenize_calls.fetch_add(1, Ordering::SeqCst);
        Ok((0..text.split_whitespace().count() as TokenId).collect())
    }

    fn decode(&mut self, tokens: &[TokenId]) -> Result<(), BridgeError> {
        if let Some(limit) = self.fail_decode_after {
            // Single-token decodes are generated tokens being fed back.
            if tokens.len() == 1 && self.cursor >= limit {
                return Err(BridgeError::Generation("scripted decode fault".into()));
            }
        }
        Ok(())
    }

    fn sample_next(&mut self) -> TokenId {
        let id = self.cursor as TokenId;
        self.cursor += 1;
        id
    }

    fn is_end_of_sequence(&self, token: TokenId) -> bool {
        token as usize >= self.pieces.len()
    }

    fn detokenize(&self, token: TokenId) -> Result<String, BridgeError> {
        Ok(self.pieces[token as usize].to_string())
    }

    fn reset_sequence(&mut self) {
        self.cursor = 0;
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

fn test_config(tag: &str) -> BridgeConfig {
    BridgeConfig::builder()
        .prefix(format!("lbproto_{}_{}", std::process::id(), tag))
        // A hung handshake should fail the test, not the CI job.
        .wait_timeout(Duration::from_secs(5))
        .build()
}

fn spawn_server(
    config: &BridgeConfig,
    engine: ScriptedEngine,
) -> thread::JoinHandle<ServerLoop<ScriptedEngine>> {
    let transport = ServerTransport::create(config).unwrap();
    let config = config.clone();
    thread::spawn(move || {
        let mut server = ServerLoop::new(transport, engine, config);
        server.run().unwrap();
        server
    })
}

#[test]
fn whole_mode_end_to_end() {
    let config = test_config("whole");
    let engine = ScriptedEngine::new(vec!["Hello", ", ", "world", "!"]);
    let tokenize_calls = engine.tokenize_calls.clone();
    let handle = spawn_server(&config, engine);

    let mut client = BridgeClient::connect(&config).unwrap();
    let response = client
        .request_whole(&BridgeRequest::new("Say hi.").with_system("You are terse."))
        .unwrap();

    assert_eq!(response.text, "Hello, world!");
    assert_eq!(response.tokens_generated, 4);
    assert_eq!(tokenize_calls.load(Ordering::SeqCst), 1);

    client.request_shutdown().unwrap();
    let server = handle.join().unwrap();
    assert_eq!(server.requests_served(), 1);
}

#[test]
fn streaming_end_to_end_with_token_cap() {
    let config = BridgeConfig::builder()
        .prefix(format!("lbproto_{}_streamcap", std::process::id()))
        .wait_timeout(Duration::from_secs(5))
        .max_tokens(5)
        .build();
    let engine = ScriptedEngine::new(vec!["a ", "b ", "c ", "d ", "e ", "f ", "g "]);
    let handle = spawn_server(&config, engine);

    let mut client = BridgeClient::connect(&config).unwrap();
    let chunks: Vec<_> = client
        .send_streaming(&BridgeRequest::new("Say hi.").with_system("You are terse."))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    // At least one text chunk, at most one per token plus the terminal
    // completion marker.
    assert!(!chunks.is_empty());
    assert!(chunks.len() <= 6);

    for pair in chunks.windows(2) {
        assert!(pair[1].counter > pair[0].counter, "counters must strictly increase");
        assert!(
            pair[1].text.starts_with(&pair[0].text),
            "chunk text is cumulative"
        );
    }

    let (last, rest) = chunks.split_last().unwrap();
    assert!(rest.iter().all(|c| !c.complete));
    assert!(last.complete);
    assert_eq!(last.tokens, 5);
    assert_eq!(last.text, "a b c d e ");

    client.request_shutdown().unwrap();
    handle.join().unwrap();
}

#[test]
fn streaming_runs_to_natural_end_of_sequence() {
    let config = test_config("streameos");
    let engine = ScriptedEngine::new(vec!["only ", "three ", "words"]);
    let handle = spawn_server(&config, engine);

    let mut client = BridgeClient::connect(&config).unwrap();
    let chunks: Vec<_> = client
        .send_streaming(&BridgeRequest::new("go"))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    let last = chunks.last().unwrap();
    assert!(last.complete);
    assert_eq!(last.tokens, 3);
    assert_eq!(last.text, "only three words");

    client.request_shutdown().unwrap();
    handle.join().unwrap();
}

#[test]
fn shutdown_skips_engine_and_completion_signal() {
    let config = test_config("shutdown");
    let engine = ScriptedEngine::new(vec!["never"]);
    let tokenize_calls = engine.tokenize_calls.clone();
    let handle = spawn_server(&config, engine);

    let mut client = BridgeClient::connect(&config).unwrap();
    let probe = llamabridge::ClientTransport::open(&config).unwrap();
    client.request_shutdown().unwrap();

    let server = handle.join().unwrap();
    assert_eq!(server.phase(), Phase::ShuttingDown);
    assert_eq!(server.requests_served(), 0);
    assert_eq!(tokenize_calls.load(Ordering::SeqCst), 0);
    // The shutdown cycle must not have posted a completion signal. The
    // transport is still alive inside the returned ServerLoop, so the probe
    // handle remains valid here.
    assert!(!probe.response_written().try_wait().unwrap());
}

#[test]
fn engine_fault_mid_stream_still_completes() {
    let config = test_config("fault");
    let engine = ScriptedEngine::new(vec!["one ", "two ", "three ", "four "]).failing_after(2);
    let handle = spawn_server(&config, engine);

    let mut client = BridgeClient::connect(&config).unwrap();
    let chunks: Vec<_> = client
        .send_streaming(&BridgeRequest::new("go"))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    // Partial output already published is the de facto result; the client
    // still observes a completed request and is never left waiting.
    let last = chunks.last().unwrap();
    assert!(last.complete);
    assert_eq!(last.tokens, 2);
    assert_eq!(last.text, "one two ");

    client.request_shutdown().unwrap();
    handle.join().unwrap();
}

#[test]
fn requests_alternate_modes_on_one_server() {
    let config = test_config("alternate");
    let engine = ScriptedEngine::new(vec!["same ", "script ", "each ", "turn"]);
    let resets = engine.resets.clone();
    let handle = spawn_server(&config, engine);

    let mut client = BridgeClient::connect(&config).unwrap();

    let whole = client.request_whole(&BridgeRequest::new("first")).unwrap();
    assert_eq!(whole.text, "same script each turn");

    let chunks: Vec<_> = client
        .send_streaming(&BridgeRequest::new("second"))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(chunks.last().unwrap().text, "same script each turn");

    // The engine starts every request from a clean sequence.
    let again = client.request_whole(&BridgeRequest::new("third")).unwrap();
    assert_eq!(again.text, "same script each turn");
    assert_eq!(again.tokens_generated, 4);
    assert_eq!(resets.load(Ordering::SeqCst), 3);

    client.request_shutdown().unwrap();
    let server = handle.join().unwrap();
    assert_eq!(server.requests_served(), 3);
}

#[test]
fn consecutive_streaming_requests_ignore_stale_chunks() {
    let config = test_config("stale_chunks");
    let engine = ScriptedEngine::new(vec!["x ", "y ", "z "]);
    let handle = spawn_server(&config, engine);

    let mut client = BridgeClient::connect(&config).unwrap();

    for _ in 0..2 {
        let chunks: Vec<_> = client
            .send_streaming(&BridgeRequest::new("again"))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        let last = chunks.last().unwrap();
        assert!(last.complete);
        assert_eq!(last.text, "x y z ");
        for pair in chunks.windows(2) {
            assert!(pair[1].counter > pair[0].counter);
        }
    }

    client.request_shutdown().unwrap();
    handle.join().unwrap();
}

#[test]
fn empty_system_prompt_is_a_valid_request() {
    let config = test_config("nosystem");
    let engine = ScriptedEngine::new(vec!["ok"]);
    let handle = spawn_server(&config, engine);

    let mut client = BridgeClient::connect(&config).unwrap();
    let response = client.request_whole(&BridgeRequest::new("hello")).unwrap();
    assert_eq!(response.text, "ok");

    client.request_shutdown().unwrap();
    handle.join().unwrap();
}
