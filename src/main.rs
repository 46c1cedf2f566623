use clap::{Parser, Subcommand};
use std::error::Error;

#[derive(Parser)]
#[command(name = "portal")]
#[command(about = "Wormhole transit file transfer tooling", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a transit relay server
    Relay {
        /// Port to bind to (default: 4001)
        #[arg(short, long, default_value = "4001")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    match cli.command {
        Commands::Relay { port } => {
            portal::commands::relay::run(port).await?;
        }
    }

    Ok(())
}
