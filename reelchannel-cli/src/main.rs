mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "reelchannel")]
#[command(about = "Commit-reveal slot channel simulator")]
#[command(version)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full channel lifecycle locally: open, play, settle, claim
    Simulate {
        /// Channel deposit in whole tokens
        #[arg(long, default_value_t = 100)]
        deposit: u64,
        /// Number of rounds to play
        #[arg(long, default_value_t = 20)]
        rounds: u64,
        /// Fixed bet in whole tokens (1-5); random per round if omitted
        #[arg(long)]
        bet: Option<u64>,
    },
    /// Print the reel strips and the paytable
    Paytable,
    /// Build a hash chain from a seed and print its commitment
    Commit {
        /// Secret seed (hex encoded)
        seed: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(format!(
            "reelchannel={},reelchannel_core={}",
            log_level, log_level
        )))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Commands::Simulate {
            deposit,
            rounds,
            bet,
        } => commands::simulate(deposit, rounds, bet),
        Commands::Paytable => commands::show_paytable(),
        Commands::Commit { seed } => commands::show_commitment(&seed),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
