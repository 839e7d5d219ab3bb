use clap::Parser;
use parasite_listener::app::{self, Options, RealScanner};
use std::panic::{self, PanicHookInfo};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

/// Log to stderr; stdout carries line protocol.
fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl-C");
        // Without a signal handler, run until the scanner stops.
        std::future::pending::<()>().await;
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd, Telegraf execd) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {info}");
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    init_logging(options.verbose);

    let config = match options.load_config() {
        Ok(config) => config,
        Err(why) => {
            tracing::error!("{why}");
            std::process::exit(EXIT_ERROR);
        }
    };

    let out = Box::new(std::io::stdout());
    match app::run(&config, options.backend, &RealScanner, out, ctrl_c()).await {
        Ok(summary) => {
            tracing::info!(
                accepted = summary.stats.accepted,
                devices = summary.history.latest_per_device().len(),
                "exiting"
            );
            std::process::exit(EXIT_SUCCESS)
        }
        Err(why) => {
            tracing::error!("{why}");
            std::process::exit(EXIT_ERROR);
        }
    }
}
