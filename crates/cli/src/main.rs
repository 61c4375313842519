//! llamachat CLI: the main entry point.
//!
//! Commands:
//! - `chat`: interactive chat or single-message mode
//! - `bench`: benchmark the loaded model
//! - `sessions`: list stored conversations
//! - `config`: print the default configuration

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "llamachat",
    about = "llamachat: on-device LLM chat",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the local model
    Chat {
        /// GGUF model to load (overrides config and LLAMACHAT_MODEL)
        #[arg(long)]
        model: Option<String>,

        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Run the warm-up and standard benchmarks
    Bench {
        #[arg(long)]
        model: Option<String>,

        /// Prompt tokens of the warm-up run
        #[arg(long, default_value_t = 8)]
        pp: u32,

        /// Generated tokens of the warm-up run
        #[arg(long, default_value_t = 4)]
        tg: u32,

        /// Parallel sequences
        #[arg(long, default_value_t = 1)]
        pl: u32,

        /// Repetitions
        #[arg(long, default_value_t = 1)]
        nr: u32,
    },

    /// List stored sessions
    Sessions,

    /// Print the default configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Chat { model, message } => commands::chat::run(model, message).await?,
        Commands::Bench {
            model,
            pp,
            tg,
            pl,
            nr,
        } => commands::bench::run(model, pp, tg, pl, nr).await?,
        Commands::Sessions => commands::sessions::run().await?,
        Commands::Config => commands::config_cmd::show(),
    }

    Ok(())
}
