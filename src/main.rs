//! tapwire: local interception proxy
//!
//! This is the main entry point for the tapwire binary. It handles CLI
//! argument parsing, configuration loading, tracing initialization, and
//! builds the runtime that hosts every configured component.
//!
//! # Lifecycle
//!
//! 1. Load and validate configuration (`--check` stops here)
//! 2. Build the shared proxy environment (aliaser, certificates, upstream TLS)
//! 3. Register every component, fetching and loading its scripts
//! 4. Serve the control API when `general.control_addr` is set
//! 5. Start autostart components and dispatch events to scripts
//! 6. On Ctrl-C, close the control API, remove every component and stop
//!    each one once

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tapwire::{
    cli::Cli,
    component::{ComponentRegistry, ScriptEngine, ScriptFetcher},
    config::{ComponentConfig, Config, ConfigLoader, TlsConfig},
    control::ControlServer,
    event::EventBus,
    loopback::CommandAliaser,
    proxy::{ProxyEnv, ProxyServer},
    tls::{upstream_connector, CertificateAuthority, CertificateStore, UpstreamTrust},
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load(&cli)
        .context("Failed to load configuration")?;

    init_tracing(cli.verbose, config.general.log_level.as_deref())?;
    debug!("Loaded configuration: {:?}", config);

    if cli.check {
        println!(
            "Configuration OK: {} component(s)",
            config.components.len()
        );
        return Ok(());
    }

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(threads) = config.general.worker_threads {
        builder.worker_threads(threads);
    }
    let runtime = builder
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    let bus = EventBus::new();
    let env = build_env(&config, bus.clone())?;

    let engine = ScriptEngine::new(config.scripting.limits());
    let registry = Arc::new(ComponentRegistry::new(engine, bus).with_fetcher(script_fetcher()));

    let mut autostart = Vec::new();
    for (index, component) in config.components.iter().enumerate() {
        let ComponentConfig::ProxyServer(proxy) = component;
        let server = Arc::new(ProxyServer::from_config(
            proxy,
            &format!("components[{}]", index),
            env.clone(),
        )?);
        registry
            .add(server.clone())
            .await
            .with_context(|| format!("Failed to register component {}", index))?;
        if proxy.autostart {
            autostart.push(server);
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatch = registry.spawn(shutdown_rx.clone());

    let control = match config.general.control_addr {
        Some(addr) => {
            let (bound, task) = ControlServer::new(registry.clone(), env.clone())
                .spawn(addr, shutdown_rx)
                .await
                .context("Failed to start control API")?;
            info!("Control API on http://{}", bound);
            Some(task)
        }
        None => None,
    };

    for server in autostart {
        let route = server.route().remote_target();
        match server.start().await {
            Ok(addr) => info!("Relaying {} on {}", route, addr),
            Err(e) => error!("Failed to start proxy for {}: {}", route, e),
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    let _ = shutdown_tx.send(true);
    if let Some(task) = control {
        if let Err(e) = task.await {
            error!("Control API task failed: {}", e);
        }
    }
    registry.shutdown().await;
    if let Err(e) = dispatch.await {
        error!("Dispatch task failed: {}", e);
    }

    Ok(())
}

/// Script fetcher trusting the system roots for `https` script URLs.
///
/// Without native roots only `file` and `http` scripts can be loaded.
fn script_fetcher() -> ScriptFetcher {
    match upstream_connector(&UpstreamTrust::Native) {
        Ok(connector) => ScriptFetcher::new().with_tls(connector),
        Err(e) => {
            warn!("https script URLs unavailable: {}", e);
            ScriptFetcher::new()
        }
    }
}

/// Build the collaborators shared by every proxy.
///
/// Certificate material and the upstream connector are only built when a
/// configured binding needs them or the control API is enabled.
fn build_env(config: &Config, bus: EventBus) -> Result<ProxyEnv> {
    let aliaser =
        CommandAliaser::new().with_elevation(config.general.elevation.clone().unwrap_or_default());

    let mut env = ProxyEnv::new(bus)
        .with_aliaser(Arc::new(aliaser))
        .with_settle_delay(config.general.settle_delay());

    // Components added over the control API may need either TLS leg.
    let dynamic = config.general.control_addr.is_some();

    if config.needs_server_certificates() || dynamic {
        let store = build_certificate_store(&config.tls)?;
        env = env.with_certificates(Arc::new(store));
    }

    if config.needs_upstream_tls() || dynamic {
        let connector = upstream_connector(&config.tls.upstream())
            .context("Failed to build upstream TLS connector")?;
        env = env.with_upstream(connector);
    }

    Ok(env)
}

fn build_certificate_store(tls: &TlsConfig) -> Result<CertificateStore> {
    let ca = if tls.mint() {
        let ca = CertificateAuthority::generate().context("Failed to generate CA")?;
        if let Some(path) = &tls.ca_cert_out {
            ca.write_cert(path)
                .with_context(|| format!("Failed to export CA certificate to {:?}", path))?;
            info!("CA certificate written to {:?}", path);
        }
        Some(Arc::new(ca))
    } else {
        None
    };

    let mut store = CertificateStore::new(ca);
    for entry in &tls.certificates {
        store
            .load_files(&entry.alias, &entry.cert, &entry.key)
            .with_context(|| format!("Failed to load certificate for '{}'", entry.alias))?;
    }
    debug!("Loaded {} configured certificate(s)", store.configured_len());

    Ok(store)
}

/// Initialize the tracing subscriber.
///
/// Logs go to stderr.
///
/// # Verbosity Levels
/// - 0 (default): `RUST_LOG`, else `general.log_level`, else warnings
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8, configured: Option<&str>) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(configured.unwrap_or("warn"))),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
