//! # Llamabridge worker
//!
//! ## Modes
//!
//! ```bash
//! llamabridge                  # Shared-memory worker for host-app integration
//! llamabridge --test           # Interactive chatbot, transport bypassed
//! llamabridge --test --user "What is Rust?"   # One-shot request
//! llamabridge --test --stream  # Show tokens as they generate
//! ```
//!
//! In the default mode the process creates the shared region and the four
//! handshake semaphores, then serves requests until the client sets the
//! shutdown flag or the process receives SIGINT/SIGTERM. `--system`,
//! `--user`, `--stream` and `--max-tokens` only affect the direct-call test
//! path; they are not part of the IPC protocol.

use std::io::{self, BufRead, Write};

use clap::Parser;
use llamabridge::{
    build_prompt, generate, BridgeConfig, EchoEngine, InferenceEngine, ServerLoop,
    ServerTransport,
};

#[derive(Parser)]
#[command(name = "llamabridge")]
#[command(author, version, about = "Shared-memory bridge for a local LLM worker")]
struct Cli {
    /// Run in interactive test mode as a chatbot, bypassing the transport
    #[arg(long)]
    test: bool,

    /// Custom system prompt (test mode only)
    #[arg(long, value_name = "TEXT")]
    system: Option<String>,

    /// Single user prompt for one-shot mode (test mode only)
    #[arg(long, value_name = "TEXT")]
    user: Option<String>,

    /// Print tokens as they generate (test mode only)
    #[arg(long)]
    stream: bool,

    /// Maximum tokens to generate; 0 means unlimited
    #[arg(long, value_name = "N", default_value_t = 4096)]
    max_tokens: usize,

    /// Instance prefix for the named shared memory and semaphores
    #[arg(long, value_name = "NAME", default_value = llamabridge::config::DEFAULT_PREFIX)]
    instance: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = BridgeConfig::builder()
        .prefix(&cli.instance)
        .max_tokens(cli.max_tokens)
        .build();

    if cli.test {
        run_test_mode(&cli)
    } else {
        run_worker(config)
    }
}

// ==================== Shared-memory worker ====================

fn run_worker(config: BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("Starting in shared memory mode...");

    llamabridge::signals::install()?;

    let transport = ServerTransport::create(&config)?;
    println!("Shared memory initialized successfully.");
    println!("  Region:   {}", config.shm_name());
    println!("  Instance: {}", config.prefix);

    let engine = EchoEngine::new();
    let mut server = ServerLoop::new(transport, engine, config);

    println!("Ready to process requests.");
    server.run()?;

    // Dropping the ServerLoop releases the transport, which unmaps the
    // region and unlinks every named object.
    println!("Shutdown complete ({} requests served).", server.requests_served());
    Ok(())
}

// ==================== Direct test mode ====================

fn run_test_mode(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let system_prompt = cli
        .system
        .clone()
        .unwrap_or_else(|| "You are my best assistant.".to_string());

    if cli.max_tokens == 0 {
        println!("Max tokens: Unlimited (will generate until the model stops naturally)");
    } else {
        println!("Max tokens: {}", cli.max_tokens);
    }

    let mut engine = EchoEngine::new();

    match &cli.user {
        Some(user_prompt) => {
            // One-shot mode
            run_once(&mut engine, &system_prompt, user_prompt, cli.stream, cli.max_tokens)?;
            Ok(())
        }
        None => run_interactive(&mut engine, &system_prompt, cli.stream, cli.max_tokens),
    }
}

fn run_once<E: InferenceEngine>(
    engine: &mut E,
    system_prompt: &str,
    user_prompt: &str,
    stream: bool,
    max_tokens: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let prompt = build_prompt(system_prompt, user_prompt);

    if stream {
        let mut printed = 0;
        let generation = generate(engine, &prompt, max_tokens, |text, _| {
            print!("{}", &text[printed..]);
            let _ = io::stdout().flush();
            printed = text.len();
        })?;
        println!();
        println!("\n--- Generation Complete ---");
        println!("Tokens generated: {}", generation.tokens);
    } else {
        let generation = generate(engine, &prompt, max_tokens, |_, _| {})?;
        println!("{}", generation.text);
        println!("\n--- Generation Complete ---");
        println!("Tokens generated: {}", generation.tokens);
    }

    engine.reset_sequence();
    Ok(())
}

fn run_interactive<E: InferenceEngine>(
    engine: &mut E,
    system_prompt: &str,
    stream: bool,
    max_tokens: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    println!();
    println!("Interactive chatbot mode");
    println!("System: {system_prompt}");
    if stream {
        println!("Mode: Streaming (tokens appear as they generate)");
    } else {
        println!("Mode: Normal (full response at once)");
    }
    println!();
    println!("Type your message and press Enter. Type 'exit' or 'quit' to end.");

    let stdin = io::stdin();
    loop {
        print!("\n\x1b[1;36mYou:\x1b[0m ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break; // EOF
        }
        let input = line.trim();

        if input.is_empty() {
            continue;
        }
        if matches!(input, "exit" | "quit" | "bye") {
            println!("\n\x1b[1;33mGoodbye!\x1b[0m");
            break;
        }

        print!("\n\x1b[1;32mAssistant:\x1b[0m ");
        io::stdout().flush()?;
        run_once(engine, system_prompt, input, stream, max_tokens)?;
    }

    Ok(())
}
