use clap::{Parser, Subcommand};

/// Streaming chat relay that stitches truncated completions together
#[derive(Debug, Parser)]
#[command(name = "chatrelay")]
#[command(version)]
#[command(about = "Streaming chat relay", long_about = None)]
pub struct Args {
    /// Model name
    #[arg(short = 'm', long = "model")]
    pub model: Option<String>,

    /// Provider (default: config/provider or "anthropic")
    #[arg(long = "provider")]
    pub provider: Option<String>,

    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// Prompt text (positional) (used when no subcommand is given)
    #[arg(value_name = "PROMPT")]
    pub prompt: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the chat API over HTTP
    Serve {
        /// Address to bind (default: config/server.host or 127.0.0.1)
        #[arg(long = "host")]
        host: Option<String>,

        /// Port to bind (default: config/server.port or 5173)
        #[arg(short = 'p', long = "port")]
        port: Option<u16>,
    },

    /// Query the provider's rate limits and print the usage snapshot
    Tokens,
}
