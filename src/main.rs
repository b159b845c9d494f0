use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use wsfs::server::config::{self, Config, StorageConfig};
use wsfs::server::Server;

#[derive(Parser)]
#[command(name = "wsfs", version, about = "A filesystem served over one WebSocket connection")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server from a TOML configuration file.
    Serve {
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
    /// Serve one directory anonymously, no configuration file needed.
    QuickServe {
        #[arg(long, default_value = "127.0.0.1:20001")]
        listen: String,
        #[arg(long, default_value = ".")]
        root: PathBuf,
        #[arg(long)]
        read_only: bool,
    },
    /// Generate bcrypt hashes of the given passwords.
    Hash {
        #[arg(required = true)]
        passwords: Vec<String>,
    },
}

/// Exit codes: 0 normal, 1 server error after startup, 2 startup error.
const EXIT_RUNTIME: u8 = 1;
const EXIT_SETUP: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match Cli::parse().command {
        Command::Serve { config } => {
            let config = match config::load(&config) {
                Ok(config) => config,
                Err(err) => {
                    tracing::error!(error = %err, "cannot load configuration");
                    return ExitCode::from(EXIT_SETUP);
                }
            };
            serve(config).await
        }
        Command::QuickServe { listen, root, read_only } => {
            let mut config = Config::default();
            config.listener.address = listen;
            config.anonymous.enable = true;
            config.storages.push(StorageConfig {
                id: String::new(),
                path: root.display().to_string(),
                read_only,
            });
            serve(config).await
        }
        Command::Hash { passwords } => hash(passwords),
    }
}

async fn serve(config: Config) -> ExitCode {
    let server = match Server::new(config) {
        Ok(server) => server,
        Err(err) => {
            tracing::error!(error = %err, "server setup failed");
            return ExitCode::from(EXIT_SETUP);
        }
    };
    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "server exited with error");
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}

fn hash(passwords: Vec<String>) -> ExitCode {
    let mut failed = false;
    for password in passwords {
        match bcrypt::hash(&password, bcrypt::DEFAULT_COST) {
            Ok(hash) => println!("{password}: {hash}"),
            Err(err) => {
                eprintln!("hash failed for '{password}': {err}");
                failed = true;
            }
        }
    }
    if failed {
        ExitCode::from(EXIT_SETUP)
    } else {
        ExitCode::SUCCESS
    }
}
