use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "sheetsight", about = "Sheet analytics backend")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the request-facing HTTP server.
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
    /// Run a sync worker process.
    Worker,
    /// Check connectivity to the configured backends.
    Check,
}
