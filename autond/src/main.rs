//  MAIN.rs
//    by Lut99
//
//  Created:
//    18 Nov 2024, 15:11:29
//  Last edited:
//    05 Mar 2025, 17:02:44
//  Auto updated?
//    Yes
//
//  Description:
//!   Entrypoint to the `autond` service.
//

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use auton_cfg::daemon::DaemonConfig;
use auton_cfg::info::Info as _;
use autond::server;
use autond::spec::Context;
use clap::Parser;
use dotenvy::dotenv;
use error_trace::trace;
use log::{debug, error, info, warn, LevelFilter};
use tokio::signal::unix::{signal, Signal, SignalKind};


/***** ARGUMENTS *****/
#[derive(Parser)]
#[clap(name = "Auton daemon", version = env!("CARGO_PKG_VERSION"), author, about = "An HTTP job-dispatch daemon: submit jobs against named endpoints, each backed by a subprocess or HTTP target, and poll for their output.")]
struct Arguments {
    /// Print debug info
    #[clap(long, action, help = "If given, shows additional logging information.", env = "DEBUG")]
    debug: bool,

    /// The daemon configuration file.
    #[clap(
        short,
        long,
        default_value = "/etc/auton/autond.yml",
        help = "The path to the daemon configuration. This defines the general daemon settings and the endpoint table.",
        env = "AUTOND_CONFIG_PATH"
    )]
    config_path: PathBuf,

    /// Overrides the configured bind address.
    #[clap(short, long, help = "If given, overrides the 'general.listen_addr' from the configuration.", env = "AUTOND_LISTEN_ADDR")]
    listen_addr: Option<SocketAddr>,
}





/***** ENTRYPOINT *****/
#[tokio::main]
async fn main() {
    dotenv().ok();
    let args: Arguments = Arguments::parse();

    // Configure logger.
    let mut logger = env_logger::builder();
    logger.format_module_path(false);

    if args.debug {
        logger.filter_level(LevelFilter::Debug).init();
    } else {
        logger.filter_level(LevelFilter::Info).init();
    }
    info!("Initializing autond v{}...", env!("CARGO_PKG_VERSION"));

    // Load the daemon config
    debug!("Loading config file '{}'...", args.config_path.display());
    let config: DaemonConfig = match DaemonConfig::from_path(&args.config_path) {
        Ok(config) => config,
        Err(err) => {
            error!("{}", trace!(("Failed to load the daemon config file"), err));
            std::process::exit(1);
        },
    };

    // Build the endpoint table and spawn the workers
    debug!("Initializing endpoints...");
    let (context, workers) = Context::from_config(&config, args.config_path.parent());
    if context.endpoints.is_empty() {
        error!("No endpoint initialized successfully; refusing to serve an empty daemon");
        std::process::exit(1);
    }
    for worker in workers {
        tokio::spawn(worker.run());
    }
    let context: Arc<Context> = Arc::new(context);

    // Run the server
    let bind_addr: SocketAddr = args.listen_addr.unwrap_or(config.general.listen_addr);
    let stop_context: Arc<Context> = context.clone();
    let handle = warp::serve(server::routes(context)).try_bind_with_graceful_shutdown(bind_addr, async move {
        // Register the signal handlers to be both Docker- and terminal-friendly
        let mut sigterm: Signal = match signal(SignalKind::terminate()) {
            Ok(handler) => handler,
            Err(err) => {
                error!("{}", trace!(("Failed to register SIGTERM signal handler"), err));
                warn!("Service will NOT shutdown gracefully on SIGTERM");
                loop {
                    tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                }
            },
        };
        let mut sigint: Signal = match signal(SignalKind::interrupt()) {
            Ok(handler) => handler,
            Err(err) => {
                error!("{}", trace!(("Failed to register SIGINT signal handler"), err));
                warn!("Service will NOT shutdown gracefully on SIGINT");
                loop {
                    tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                }
            },
        };

        // Wait until we receive such a signal after which we terminate the server
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        }
        stop_context.stop_plugins();
    });

    match handle {
        Ok((addr, srv)) => {
            info!("Now serving @ '{addr}'");
            srv.await
        },
        Err(err) => {
            error!("{}", trace!(("Failed to serve at '{bind_addr}'"), err));
            std::process::exit(1);
        },
    }
}
