use clap::{Parser, Subcommand};

/// whisper: share secrets that expire
#[derive(Parser)]
#[command(name = "whisper", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server (default)
    Serve {
        /// Port to bind; overrides `app_port`
        #[arg(short, long, env = "WHISPER_APP_PORT")]
        port: Option<u16>,
    },

    /// Delete expired secrets from the configured backend once and exit
    Sweep,

    /// Validate the configuration and backend options, then exit
    CheckConfig,
}
