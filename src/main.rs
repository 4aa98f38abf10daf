use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::RootConfig;
use headless::{HeadlessProxyAdapter, HeadlessServerAdapter};
use log::LevelFilter;
use rc_core::{config::RuntimeConfigProvider, Proxy, ProxyKernel};
use rc_magiclink::{
    crypto::{generate_key, AesCryptor},
    transport::websocket::{ProxyWebSocketTransport, ServerWebSocketTransport},
    MagicLink, SourceIdentifier,
};
use rc_server::ServerKernel;
use simple_logger::SimpleLogger;
use uuid::Uuid;

mod config;
mod headless;

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Configuration file.
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,
    /// Verbose level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Runs the proxy kernel.
    Proxy,
    /// Runs a backend server kernel.
    Server,
    /// Prints a new secret key.
    Keygen,
}

fn main() {
    let args = Args::parse();

    if let Mode::Keygen = args.mode {
        match generate_key() {
            Ok(key) => println!("{}", key),
            Err(err) => eprintln!("Could not generate a key: {}", err),
        }
        return;
    }

    let log_level = match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    if let Err(err) = SimpleLogger::new().with_level(log_level).init() {
        eprintln!("Could not set up logging: {}", err);
        return;
    }

    if let Err(err) = run(args) {
        log::error!("{:?}", err);
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run(args: Args) -> anyhow::Result<()> {
    let config = config::read_config(&args.config).await.with_context(|| {
        format!(
            "Could not read configuration file ({})",
            args.config.to_string_lossy()
        )
    })?;
    log::debug!("Parsed configuration: {:#?}", config);
    match args.mode {
        Mode::Proxy => run_proxy(config, args.config).await,
        Mode::Server => run_server(config).await,
        Mode::Keygen => Ok(()),
    }
}

async fn run_proxy(config: RootConfig, config_file: PathBuf) -> anyhow::Result<()> {
    let section = config
        .proxy
        .context("The configuration has no [proxy] section")?;
    let cryptor = AesCryptor::from_base64(&config.secret_key).context("Invalid secret key")?;
    let cryptor = Arc::new(cryptor);
    let bind: SocketAddr = section
        .bind_address
        .parse()
        .with_context(|| format!("Invalid bind address `{}`", section.bind_address))?;
    let identity = SourceIdentifier::proxy(section.uuid.unwrap_or_else(Uuid::new_v4));

    let transport = ProxyWebSocketTransport::bind(bind, cryptor.clone())?;
    let magic_link = MagicLink::new(identity, cryptor, transport, section.magic_link.to_config());
    let config_provider = Arc::new(RuntimeConfigProvider::new(section.runtime.clone()));
    let kernel = ProxyKernel::new(
        config_provider,
        magic_link,
        Arc::new(HeadlessProxyAdapter),
        &section.root_family,
        &section.families,
    )
    .await?;
    let proxy = Proxy::new(kernel);
    proxy.start().await;
    log::info!(
        "Proxy {} is listening for servers on {}",
        proxy.kernel.uuid,
        bind
    );

    let mut signals = Signals::new()?;
    while let Signal::Reload = signals.next().await {
        config::reload_proxy(&proxy, &config_file).await;
    }
    log::info!("Shutting down");
    proxy.shutdown().await;
    Ok(())
}

async fn run_server(config: RootConfig) -> anyhow::Result<()> {
    let section = config
        .server
        .context("The configuration has no [server] section")?;
    let cryptor = AesCryptor::from_base64(&config.secret_key).context("Invalid secret key")?;
    let cryptor = Arc::new(cryptor);
    let mut identity = section.identity.clone();
    identity.apply_env();
    let uuid = section.uuid.unwrap_or_else(Uuid::new_v4);

    let transport =
        ServerWebSocketTransport::new(section.proxy_address.as_str(), uuid, cryptor.clone());
    let magic_link = MagicLink::new(
        SourceIdentifier::server(uuid),
        cryptor,
        transport,
        section.magic_link.to_config(),
    );
    let adapter = Arc::new(HeadlessServerAdapter::default());
    let kernel = ServerKernel::new(identity, magic_link, adapter)?;
    kernel.start().await;
    log::info!(
        "Server {} is registering to {}",
        kernel.uuid,
        section.proxy_address
    );

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    kernel.shutdown().await;
    Ok(())
}

enum Signal {
    Shutdown,
    Reload,
}

/// Process signals: interrupt shuts down, hangup reloads the configuration.
struct Signals {
    #[cfg(unix)]
    hangup: tokio::signal::unix::Signal,
}

impl Signals {
    fn new() -> anyhow::Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            hangup: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?,
        })
    }

    #[cfg(unix)]
    async fn next(&mut self) -> Signal {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => Signal::Shutdown,
            _ = self.hangup.recv() => Signal::Reload,
        }
    }

    #[cfg(not(unix))]
    async fn next(&mut self) -> Signal {
        let _ = tokio::signal::ctrl_c().await;
        Signal::Shutdown
    }
}
