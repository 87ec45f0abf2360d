//! # Dropwatch CLI Entry Point
//!
//! The main executable for the Dropwatch tool. This file drives the application lifecycle:
//!
//! 1. **Initialization**: Installs logging and parses command-line arguments using [`cli::Cli`].
//! 2. **Schema**: Loads the node's protobuf.js schema via `dropwatch_core`.
//! 3. **Execution**: Watches the status socket, or inspects the schema offline.
//! 4. **Presentation**: Formats and prints decoded frames or errors to standard output/error.

mod cli;
mod formatter;

use clap::Parser;
use cli::{Cli, Commands};
use dropwatch_core::{
    frame::{DecodedFrame, FrameDecoder},
    schema::{SchemaLoader, SchemaRegistry, SchemaSource},
    session::{self, SessionConfig},
};
use formatter::{FormattedString, MessageList};
use std::process;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Diagnostics go to stderr, decoded frames to stdout
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();
    let source = args.schema_source();
    let host = args.host;

    match args.command {
        Commands::Watch {
            socket_path,
            message,
            backlog,
        } => {
            let config = SessionConfig {
                host,
                schema: source,
                socket_path,
                message,
                backlog,
            };
            run_watch(config).await
        }
        Commands::List => list_messages(host, source).await,
        Commands::Describe { message } => describe_message(host, source, &message).await,
        Commands::Decode { frame, message } => decode_frame(host, source, &message, &frame.0).await,
    }
}

async fn load_or_exit(host: String, source: SchemaSource) -> SchemaRegistry {
    match SchemaLoader::new(host, source).load().await {
        Ok(registry) => registry,
        Err(err) => {
            eprintln!("{}", FormattedString::from(err));
            process::exit(1);
        }
    }
}

async fn run_watch(config: SessionConfig) {
    let mut print_frame = |frame: DecodedFrame| println!("{}", FormattedString::from(frame));

    match session::watch(&config, &mut print_frame).await {
        Ok(summary) => eprintln!("{}", FormattedString::from(summary)),
        Err(err) => {
            eprintln!("{}", FormattedString::from(err));
            process::exit(1);
        }
    }
}

async fn list_messages(host: String, source: SchemaSource) {
    let registry = load_or_exit(host, source).await;
    println!("{}", FormattedString::from(MessageList(registry.message_names())));
}

async fn describe_message(host: String, source: SchemaSource, message: &str) {
    let registry = load_or_exit(host, source).await;

    match registry.lookup_message(message) {
        Ok(descriptor) => println!("{}", FormattedString::from(descriptor)),
        Err(err) => {
            eprintln!("{}", FormattedString::from(err));
            process::exit(1);
        }
    }
}

async fn decode_frame(host: String, source: SchemaSource, message: &str, frame: &[u8]) {
    let registry = load_or_exit(host, source).await;

    let decoder = match FrameDecoder::new(&registry, message) {
        Ok(decoder) => decoder,
        Err(err) => {
            eprintln!("{}", FormattedString::from(err));
            process::exit(1);
        }
    };

    match decoder.decode(frame) {
        Ok(decoded) => println!("{}", FormattedString::from(decoded)),
        Err(err) => {
            eprintln!("{}", FormattedString::from(err));
            process::exit(1);
        }
    }
}
