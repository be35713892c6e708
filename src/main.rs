//! acesrv - session-authenticated command server.
//!
//! Usage:
//!   acesrv serve [--port 8080] [--policy public] [--write-dir DIR] ...
//!   acesrv client [--url http://127.0.0.1:8080] [-c COMMAND]...

use acesrv::activity_log::ActivityLog;
use acesrv::client::{AceClient, Prefer};
use acesrv::config::{
    Policy, ServerConfig, DEFAULT_AUTOSAVE_SECS, DEFAULT_CLIENT_TIMEOUT_SECS,
    DEFAULT_SERVER_TIMEOUT_SECS,
};
use acesrv::engine::Database;
use acesrv::error::{ClientError, StartupError};
use acesrv::http_server;
use acesrv::memstore::MemStore;
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "acesrv")]
#[command(about = "Session-authenticated command server")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Log at debug level
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        bind: IpAddr,

        /// How read access is granted
        #[arg(long, value_enum, default_value = "public")]
        policy: Policy,

        /// Directory receiving write secrets (omit to disable write access)
        #[arg(long)]
        write_dir: Option<PathBuf>,

        /// Directory receiving read secrets (directory-secret policy)
        #[arg(long)]
        read_dir: Option<PathBuf>,

        /// Seconds of inactivity before a client is dropped (0 = never)
        #[arg(long, default_value_t = DEFAULT_CLIENT_TIMEOUT_SECS)]
        client_timeout: u64,

        /// Seconds without clients before the server exits (0 = never)
        #[arg(long, default_value_t = DEFAULT_SERVER_TIMEOUT_SECS)]
        server_timeout: u64,

        /// Response size ceiling in bytes (0 = unlimited)
        #[arg(long, default_value = "0")]
        max_bytes: usize,

        /// Seconds between autosaves (0 = never)
        #[arg(long, default_value_t = DEFAULT_AUTOSAVE_SECS)]
        autosave: u64,

        /// Activity log file
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// JSON file the object store is loaded from and saved to
        #[arg(long)]
        data_file: Option<PathBuf>,
    },

    /// Connect to a server and run commands
    Client {
        /// Server base URL
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        url: String,

        /// Command to run (repeatable); reads stdin when none are given
        #[arg(short = 'c', long = "command")]
        commands: Vec<String>,

        /// File of data definitions to load before running commands
        #[arg(long)]
        ingest: Option<PathBuf>,

        /// Ask for read access even if the write secret is readable
        #[arg(long)]
        read_only: bool,

        /// Response size cap in bytes (0 = server default)
        #[arg(long, default_value = "0")]
        max_bytes: usize,
    },
}

fn init_tracing(verbose: bool, log: Option<&ActivityLog>) {
    let level = if verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
    let file_layer = log.map(|log| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(log.clone())
    });
    tracing_subscriber::registry()
        .with(level)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match args.command {
        Commands::Serve {
            port,
            bind,
            policy,
            write_dir,
            read_dir,
            client_timeout,
            server_timeout,
            max_bytes,
            autosave,
            log_file,
            data_file,
        } => {
            let log = match log_file.map(|path| {
                ActivityLog::open(&path).map_err(|source| StartupError::ActivityLog { path, source })
            }) {
                Some(Ok(log)) => Some(log),
                Some(Err(e)) => {
                    eprintln!("Error: {}", e);
                    exit(1);
                }
                None => None,
            };
            init_tracing(args.verbose, log.as_ref());

            let config = ServerConfig {
                policy,
                write_dir,
                read_dir,
                client_timeout: Duration::from_secs(client_timeout),
                server_timeout: Duration::from_secs(server_timeout),
                max_response_bytes: max_bytes,
                autosave_interval: Duration::from_secs(autosave),
            };
            let db: Arc<dyn Database> = match data_file {
                Some(path) => match MemStore::open(path) {
                    Ok(store) => Arc::new(store),
                    Err(e) => {
                        eprintln!("Error: {}", StartupError::Database(e));
                        exit(1);
                    }
                },
                None => Arc::new(MemStore::new()),
            };

            let addr = SocketAddr::new(bind, port);
            if let Err(e) = http_server::run_server(addr, config, db, log).await {
                eprintln!("Error: {}", e);
                exit(1);
            }
        }
        Commands::Client {
            url,
            commands,
            ingest,
            read_only,
            max_bytes,
        } => {
            init_tracing(args.verbose, None);
            if let Err(e) = run_client(&url, commands, ingest, read_only, max_bytes).await {
                eprintln!("Error: {}", e);
                exit(1);
            }
        }
    }
}

async fn run_client(
    url: &str,
    commands: Vec<String>,
    ingest: Option<PathBuf>,
    read_only: bool,
    max_bytes: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let prefer = if read_only { Prefer::Read } else { Prefer::Write };
    let mut client = AceClient::connect_with(url, prefer).await?;
    client.set_max_bytes(max_bytes);
    eprintln!(
        "// Connected as client {} with {} access",
        client.client_id(),
        client.access().as_str()
    );

    if let Some(path) = ingest {
        let data = std::fs::read_to_string(&path)?;
        print!("{}", client.ingest(&data).await?);
    }

    let commands = if commands.is_empty() {
        std::io::stdin().lock().lines().collect::<Result<Vec<_>, _>>()?
    } else {
        commands
    };
    for line in commands {
        match client.command_all(&line).await {
            Ok(text) if text.is_empty() => {}
            Ok(text) => println!("{}", text.trim_end()),
            // quit, shutdown now, or an expired session
            Err(ClientError::SessionClosed(text)) => {
                println!("{}", text.trim_end());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }
    client.quit().await?;
    Ok(())
}
