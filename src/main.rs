mod config;
mod connection;
mod daemon;
mod error;
mod filesystem;
mod sftp;

use anyhow::Context;
use clap::{ArgAction, Parser};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::Level;

use config::config::{HostKeySource, ServerConfig};
use connection::supervisor::Supervisor;
use sftp::binder::SftpBinder;
use sftp::credentials::{CredentialVerifier, SharedSecret};
use sftp::session::RusshNegotiator;

#[derive(Parser, Debug)]
#[command(name = "lightd-sftp")]
#[command(about = "Standalone SFTP server confined to a single directory", long_about = None)]
struct Cli {
    /// Address the SSH listener binds to
    #[arg(long, env = "LIGHTD_SFTP_LISTEN", default_value = "0.0.0.0:2222")]
    listen: SocketAddr,

    /// Directory every session is confined to
    #[arg(long, env = "LIGHTD_SFTP_ROOT", default_value = "/app/sky")]
    root: PathBuf,

    #[arg(long = "host-key", env = "LIGHTD_SFTP_HOST_KEY", default_value = "id_rsa")]
    host_key: PathBuf,

    /// Generate a throwaway ed25519 host key instead of loading one
    #[arg(long = "ephemeral-host-key")]
    ephemeral_host_key: bool,

    #[arg(long, env = "LIGHTD_SFTP_PASSWORD", default_value = "password", hide_env_values = true)]
    password: String,

    /// Seconds of silence before a connection is dropped
    #[arg(long = "inactivity-timeout", value_name = "SECS")]
    inactivity_timeout: Option<u64>,

    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

impl Cli {
    fn log_level(&self) -> Level {
        if self.quiet {
            return Level::WARN;
        }
        match self.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }

    fn into_config(self) -> ServerConfig {
        let host_key = if self.ephemeral_host_key {
            HostKeySource::Ephemeral
        } else {
            HostKeySource::File(self.host_key)
        };

        ServerConfig {
            listen: self.listen,
            root: self.root,
            host_key,
            password: self.password,
            inactivity_timeout: self.inactivity_timeout.map(Duration::from_secs),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let started = Instant::now();
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level()).init();

    let config = Arc::new(cli.into_config());
    daemon::start::print_banner(&config);

    daemon::start::prepare_root(&config.root)
        .await
        .context("Storage error! Please double check the served root")?;

    let key = config.load_host_key()?;
    let ssh_config = Arc::new(config.ssh_config(key));
    let verifier: Arc<dyn CredentialVerifier> = Arc::new(SharedSecret::new(config.password.clone()));
    let supervisor = Arc::new(Supervisor::new(
        RusshNegotiator::new(ssh_config, verifier),
        SftpBinder,
        config.root.clone(),
    ));

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind SFTP listener on {}", config.listen))?;

    tracing::info!("Total startup time: {}ms", started.elapsed().as_millis());
    tracing::info!("SFTP server listening on {}", config.listen);

    tokio::select! {
        result = sftp::server::run(listener, supervisor) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down SFTP server"),
    }

    Ok(())
}
