use std::{net::IpAddr, path::PathBuf, sync::Arc};

use clap::{Args, Parser, Subcommand};
use webpagereplay::{
    archive::{Archive, WritableArchive},
    config::Config,
    proxy::{self, SessionMode},
};

#[derive(Debug, Parser)]
#[command(name = "wpr")]
struct Cli {
    /// Log level override (trace, debug, info, warn, error, off).
    #[arg(long = "log_level", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record live traffic into a new archive.
    Record {
        /// Path of the archive to create.
        archive: PathBuf,
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Replay recorded traffic from an existing archive.
    Replay {
        /// Path of the archive to serve from.
        archive: PathBuf,
        #[command(flatten)]
        server: ServerArgs,
        /// JSON rules file with response header and push transformations.
        #[arg(long = "rules_file")]
        rules_file: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
struct ServerArgs {
    /// Address the listeners bind to.
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,
    /// Port for the plain HTTP listener; omit to disable.
    #[arg(long = "http_port")]
    http_port: Option<u16>,
    /// Port for the HTTPS listener; omit to disable.
    #[arg(long = "https_port")]
    https_port: Option<u16>,
    /// Port that terminates TLS but serves the HTTP archive; omit to disable.
    #[arg(long = "https_to_http_port")]
    https_to_http_port: Option<u16>,
    /// PEM root CA certificate used to mint per-host leaves.
    #[arg(long = "https_cert_file")]
    https_cert_file: Option<PathBuf>,
    /// PEM private key matching the root CA certificate.
    #[arg(long = "https_key_file")]
    https_key_file: Option<PathBuf>,
    /// Comma-separated scripts injected into every HTML response.
    #[arg(
        long = "inject_scripts",
        value_delimiter = ',',
        default_value = "deterministic.js"
    )]
    inject_scripts: Vec<PathBuf>,
}

impl ServerArgs {
    fn into_config(self, rules_file: Option<PathBuf>) -> Config {
        Config {
            host: self.host,
            http_port: self.http_port,
            https_port: self.https_port,
            https_to_http_port: self.https_to_http_port,
            https_cert_file: self.https_cert_file,
            https_key_file: self.https_key_file,
            inject_scripts: self.inject_scripts,
            rules_file,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = webpagereplay::logging::init(cli.log_level.as_deref()) {
        eprintln!("{err:#}");
        std::process::exit(1);
    }

    if let Err(err) = run(cli.command).await {
        tracing::error!("{err:#}");
        std::process::exit(1);
    }
}

async fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Record { archive, server } => {
            let config = server.into_config(None);
            let writable = Arc::new(WritableArchive::create(&archive)?);
            let handle = proxy::serve(&config, SessionMode::Record(Arc::clone(&writable))).await?;

            let exited_via_command = wait_for_shutdown(&handle).await;
            if !exited_via_command
                && let Err(err) = writable.close()
            {
                tracing::error!("flush archive on shutdown: {err}");
            }
            handle.shutdown().await;
        }
        Command::Replay {
            archive,
            server,
            rules_file,
        } => {
            let config = server.into_config(rules_file);
            let archive = Arc::new(Archive::open(&archive)?);
            tracing::info!(exchanges = archive.exchange_count(), "archive loaded");
            let handle = proxy::serve(&config, SessionMode::Replay(archive)).await?;

            wait_for_shutdown(&handle).await;
            handle.shutdown().await;
        }
    }

    Ok(())
}

/// Blocks until SIGINT or the exit magic URL. Returns true when the exit
/// command fired, in which case the archive was already flushed by the
/// handler.
async fn wait_for_shutdown(handle: &proxy::ServerHandle) -> bool {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received; shutting down");
            false
        }
        _ = handle.exit_requested() => true,
    }
}
