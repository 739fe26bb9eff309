//! Switchyard binary entry point: flag parsing, logging setup, config
//! load, and listener startup.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use switchyard::config::{load_startup_config, GlobalConfig};
use switchyard::modules::admin::AdminServer;
use switchyard::modules::http_router::HostRouter;
use switchyard::modules::registry::Registry;
use switchyard::modules::tls::server_config_from_dir;

/// Dynamically reconfigurable L4/L7 reverse proxy and load balancer.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Admin API listen address.
    #[arg(long, default_value = "127.0.0.1:9090")]
    admin: String,

    /// HTTP virtual-host listener address.
    #[arg(long)]
    http: Option<String>,

    /// HTTPS virtual-host listener address. Requires --certs.
    #[arg(long)]
    https: Option<String>,

    /// Default config file. Never written.
    #[arg(long)]
    config: Option<PathBuf>,

    /// State config file, rewritten after every change and preferred over
    /// the default config at startup.
    #[arg(long)]
    state: Option<PathBuf>,

    /// Directory of <name>.pem / <name>.key certificate pairs.
    #[arg(long)]
    certs: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,

    /// Enable trace logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let default_directive = if args.verbose {
        "switchyard=trace"
    } else if args.debug {
        "switchyard=debug"
    } else {
        "switchyard=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directive.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("switchyard v{} starting", env!("CARGO_PKG_VERSION"));

    let startup = match load_startup_config(args.state.as_deref(), args.config.as_deref()) {
        Ok(Some(cfg)) => cfg,
        Ok(None) => {
            info!("no config file found, starting empty");
            GlobalConfig::default()
        }
        Err(e) => {
            error!(error = %e, "config load failed, starting empty");
            GlobalConfig::default()
        }
    };

    let registry = Arc::new(Registry::new(startup.clone()));

    // A service that fails to start at boot is logged and skipped, like
    // any other per-service failure; the admin API can retry it.
    for svc_cfg in startup.services {
        let name = svc_cfg.name.clone();
        if let Err(e) = registry.add_service(svc_cfg).await {
            error!(service = %name, error = %e, "could not start configured service");
        }
    }

    let admin = Arc::new(AdminServer::new(Arc::clone(&registry), args.state.clone()));
    Arc::clone(&admin).start(&args.admin).await?;

    let mut routers = Vec::new();

    if let Some(http_addr) = &args.http {
        let router = Arc::new(HostRouter::new(Arc::clone(&registry)));
        match Arc::clone(&router).start(http_addr).await {
            Ok(_) => routers.push(router),
            Err(e) => error!(address = %http_addr, error = %e, "http router failed to start"),
        }
    }

    if let Some(https_addr) = &args.https {
        match &args.certs {
            Some(dir) => match server_config_from_dir(dir) {
                Ok(tls_config) => {
                    let router = Arc::new(HostRouter::new_tls(Arc::clone(&registry), tls_config));
                    match Arc::clone(&router).start(https_addr).await {
                        Ok(_) => routers.push(router),
                        Err(e) => {
                            error!(address = %https_addr, error = %e, "https router failed to start");
                        }
                    }
                }
                Err(e) => error!(error = %e, "certificate load failed, https listener disabled"),
            },
            None => {
                warn!("--https given without --certs, https listener disabled");
            }
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
