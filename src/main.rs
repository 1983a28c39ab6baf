//! flapwire - command-line client
//!
//! Signs on, sends and receives files, and works with directory listings.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use flapwire_client::Config;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flapwire")]
#[command(about = "Client for the FLAP/SNAC instant messaging protocol")]
#[command(version)]
struct Cli {
    /// YAML config file (overrides FLAPWIRE_CONFIG)
    #[arg(short, long, env = "FLAPWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Screen name to sign on with
    #[arg(short, long, env = "FLAPWIRE_SCREEN_NAME")]
    screen_name: Option<String>,

    /// Password
    #[arg(short, long, env = "FLAPWIRE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// PEM file of server certificates to trust in addition to the web roots
    #[arg(long)]
    pin_cert: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sign on and print the negotiated families and rate classes
    SignOn,

    /// Send a file or folder to a buddy
    SendFile {
        /// Recipient screen name
        buddy: String,

        /// File or folder to send
        path: PathBuf,

        /// Folder name the files are sent under
        #[arg(long)]
        folder_name: Option<String>,
    },

    /// Wait for file offers and accept them
    Receive {
        /// Directory to save into
        #[arg(default_value = ".")]
        dest: PathBuf,

        /// Only accept offers from this screen name
        #[arg(long)]
        from: Option<String>,
    },

    /// Encode or decode directory listings
    Listing {
        #[command(subcommand)]
        action: ListingAction,
    },

    /// Print the effective configuration as YAML
    Config,
}

#[derive(Subcommand)]
pub enum ListingAction {
    /// Build the listing of a directory and write it to a file
    Encode { dir: PathBuf, out: PathBuf },
    /// Print the entries of an encoded listing
    Decode { file: PathBuf },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => {
            let mut config = Config::from_file(path)?;
            config.apply_env_overrides();
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        None => Config::from_env(),
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{}: {}", "Error".red(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(cli.config.as_ref())?;
    let output = commands::Output { json: cli.json };

    match cli.command {
        Commands::Config => commands::print_config(&config),
        Commands::Listing { action } => match action {
            ListingAction::Encode { dir, out } => commands::encode_listing(&dir, &out, output),
            ListingAction::Decode { file } => commands::decode_listing(&file, output),
        },
        command => {
            let screen_name = cli.screen_name.ok_or("--screen-name is required")?;
            let password = cli.password.ok_or("--password or FLAPWIRE_PASSWORD is required")?;
            let login = commands::Login {
                screen_name,
                password,
                pin_cert: cli.pin_cert,
            };
            commands::execute(config, login, command, output).await
        }
    }
}
