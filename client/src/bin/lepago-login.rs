use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use lepago_handshake::{
    HandshakeConfig, HandshakeOrchestrator, SessionPath, SessionPresence, SessionStore,
    SoapGateway,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "lepago-login",
    version,
    about = "Post-quantum login against the Lepago SOAP service"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Directory holding the persisted session
    #[arg(long, env = "LEPAGO_STATE_DIR", default_value = ".", global = true)]
    state_dir: PathBuf,

    #[command(flatten)]
    gateway: GatewayArgs,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Commands {
    /// Reanimate the persisted session or register a new one (default)
    Login,
    /// Report the persisted session without contacting the service
    Status,
    /// Delete the persisted session
    Forget {
        #[arg(long)]
        yes: bool,
    },
    /// Fold legacy per-field session files into session.json
    Migrate,
}

#[derive(Args, Debug)]
struct GatewayArgs {
    /// WSDL location (URL or file path)
    #[arg(long, env = "WSDL_SERVICE_PORT", global = true)]
    wsdl: Option<String>,

    /// Endpoint the SOAP calls are posted to
    #[arg(long, env = "EXECUTOR_URL", global = true)]
    endpoint: Option<String>,

    #[arg(long, env = "LEPAGO_ALIAS", global = true)]
    alias: Option<String>,

    #[arg(long, env = "LEPAGO_POW_DIFFICULTY", default_value_t = 4, global = true)]
    difficulty: u32,

    #[arg(long, env = "LEPAGO_CALL_TIMEOUT_SECS", default_value_t = 30, global = true)]
    call_timeout_secs: u64,

    /// 0 disables the wall-clock bound
    #[arg(long, env = "LEPAGO_POW_TIMEOUT_SECS", default_value_t = 120, global = true)]
    pow_timeout_secs: u64,

    /// 0 disables the iteration cap
    #[arg(
        long,
        env = "LEPAGO_POW_MAX_ITERATIONS",
        default_value_t = 100_000_000,
        global = true
    )]
    pow_max_iterations: u64,
}

impl GatewayArgs {
    fn to_config(&self, state_dir: &Path) -> Result<HandshakeConfig> {
        let mut builder = HandshakeConfig::builder()
            .state_dir(state_dir)
            .difficulty(self.difficulty)
            .call_timeout(Duration::from_secs(self.call_timeout_secs))
            .pow_timeout(nonzero(self.pow_timeout_secs).map(Duration::from_secs))
            .pow_max_iterations(nonzero(self.pow_max_iterations));
        if let Some(wsdl) = &self.wsdl {
            builder = builder.service_description(wsdl);
        }
        if let Some(endpoint) = &self.endpoint {
            builder = builder.endpoint(endpoint);
        }
        if let Some(alias) = &self.alias {
            builder = builder.alias(alias);
        }
        Ok(builder.build()?)
    }
}

fn nonzero(value: u64) -> Option<u64> {
    (value != 0).then_some(value)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Login) {
        Commands::Login => cmd_login(&cli).await,
        Commands::Status => cmd_status(&cli.state_dir),
        Commands::Forget { yes } => cmd_forget(&cli.state_dir, yes),
        Commands::Migrate => cmd_migrate(&cli.state_dir),
    }
}

async fn cmd_login(cli: &Cli) -> Result<()> {
    let config = cli
        .gateway
        .to_config(&cli.state_dir)
        .context("invalid configuration")?;
    let store = SessionStore::open(&config.state_dir).context("failed to open session store")?;
    let gateway = SoapGateway::connect(
        &config.service_description,
        &config.endpoint,
        config.call_timeout,
    )
    .await
    .context("failed to create SOAP client")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let watcher = tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling handshake");
            on_signal.cancel();
        }
    });

    let mut handshake =
        HandshakeOrchestrator::new(config, Arc::new(gateway), store).with_cancellation(cancel);
    let outcome = handshake.run().await;
    watcher.abort();

    let done = outcome?;
    let path = match done.path {
        SessionPath::Reanimated => "reanimated",
        SessionPath::Registered => "registered",
    };
    info!(nonce = done.nonce, "challenge accepted");
    println!("authenticated ({path}) alias={} idc={}", done.alias, done.idc);
    Ok(())
}

fn cmd_status(state_dir: &Path) -> Result<()> {
    let store = SessionStore::open(state_dir).context("failed to open session store")?;
    match store.probe() {
        SessionPresence::Absent => println!("absent"),
        SessionPresence::Present => {
            let record = store.load()?;
            println!("present alias={} idc={}", record.alias, record.idc);
        }
        SessionPresence::Corrupted(reason) => println!("corrupted: {reason}"),
    }
    Ok(())
}

fn cmd_forget(state_dir: &Path, yes: bool) -> Result<()> {
    if !yes {
        bail!("refusing to delete the session without --yes");
    }
    let store = SessionStore::open(state_dir).context("failed to open session store")?;
    if store.forget()? {
        println!("removed");
    } else {
        println!("nothing to remove");
    }
    Ok(())
}

fn cmd_migrate(state_dir: &Path) -> Result<()> {
    let store = SessionStore::open(state_dir).context("failed to open session store")?;
    if store.migrate_legacy().context("legacy migration failed")? {
        println!("migrated");
    } else {
        println!("nothing to migrate");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_disables_pow_bounds() {
        let cli = Cli::parse_from([
            "lepago-login",
            "--wsdl",
            "http://gw/lepago?wsdl",
            "--endpoint",
            "http://gw/lepago",
            "--alias",
            "cosapi",
            "--pow-timeout-secs",
            "0",
            "--pow-max-iterations",
            "0",
        ]);
        let config = cli.gateway.to_config(&cli.state_dir).unwrap();
        assert_eq!(config.pow_timeout, None);
        assert_eq!(config.pow_max_iterations, None);
        assert_eq!(config.difficulty, 4);
    }

    #[test]
    fn subcommand_defaults_to_login() {
        let cli = Cli::parse_from(["lepago-login"]);
        assert!(cli.command.is_none());
        let cli = Cli::parse_from(["lepago-login", "forget", "--yes", "--state-dir", "/tmp/x"]);
        assert!(matches!(cli.command, Some(Commands::Forget { yes: true })));
        assert_eq!(cli.state_dir, PathBuf::from("/tmp/x"));
    }
}
