#![allow(missing_docs)]

//! Process entry point: CLI, logging, runtime, and pipeline lifecycle.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing_subscriber::EnvFilter;

use crate::cli::Opts;
use crate::config::schema::TableSchema;
use crate::config::Config;
use crate::topology;

pub struct Application;

impl Application {
    pub fn run() -> exitcode::ExitCode {
        let opts = match Opts::get_matches() {
            Ok(opts) => opts,
            Err(error) => {
                let _ = error.print();
                return exitcode::USAGE;
            }
        };

        init_logging(&opts);

        let config = match Config::load_from_path(&opts.config_path) {
            Ok(config) => config,
            Err(error) => {
                error!(message = "Configuration error.", error = %error);
                return exitcode::CONFIG;
            }
        };
        if opts.validate {
            info!(
                message = "Configuration OK.",
                path = %opts.config_path.display(),
            );
            return exitcode::OK;
        }

        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all();
        if let Some(threads) = opts.threads {
            if threads < 1 {
                error!(message = "The `threads` argument must be greater or equal to 1.");
                return exitcode::CONFIG;
            }
            builder.worker_threads(threads);
        }
        let runtime = match builder.build() {
            Ok(runtime) => runtime,
            Err(error) => {
                error!(message = "Failed to build async runtime.", error = %error);
                return exitcode::SOFTWARE;
            }
        };

        runtime.block_on(run_pipeline(opts, config))
    }
}

fn init_logging(opts: &Opts) {
    let filter = std::env::var("LOG2CLICKHOUSE_LOG")
        .unwrap_or_else(|_| opts.log_level().to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();
}

async fn run_pipeline(opts: Opts, config: Config) -> exitcode::ExitCode {
    info!(message = "Starting.", version = %crate::get_version());

    let schemas: IndexMap<String, Arc<TableSchema>> = config
        .tables
        .iter()
        .map(|(name, schema)| (name.clone(), Arc::new(schema.clone())))
        .collect();
    let service = config.sink.build(&schemas);

    match service.healthcheck().await {
        Ok(()) => info!(message = "Destination healthcheck passed."),
        Err(error) => {
            if opts.require_healthy == Some(true) {
                error!(message = "Destination healthcheck failed.", error = %error);
                return exitcode::UNAVAILABLE;
            }
            warn!(
                message = "Destination healthcheck failed, continuing anyway.",
                error = %error,
            );
        }
    }

    let mut topology = match topology::start(&config, Arc::new(service)).await {
        Ok(topology) => topology,
        Err(error) => {
            error!(message = "Failed to start pipeline.", error = %error);
            return exitcode::SOFTWARE;
        }
    };

    let finished = tokio::select! {
        result = topology.wait() => Some(result),
        signal = shutdown_signal() => {
            info!(message = "Signal received, shutting down.", signal = %signal);
            None
        }
    };
    match finished {
        Some(Ok(())) => {
            info!(message = "Pipeline finished.");
            exitcode::OK
        }
        Some(Err(error)) => {
            error!(message = "Pipeline failed.", error = %error);
            exitcode::SOFTWARE
        }
        None => match topology.stop().await {
            Ok(()) => exitcode::OK,
            Err(error) => {
                error!(message = "Shutdown did not complete cleanly.", error = %error);
                exitcode::SOFTWARE
            }
        },
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(error) => {
            error!(message = "Failed to install SIGINT handler.", error = %error);
            std::future::pending().await
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(error) => {
            error!(message = "Failed to install SIGTERM handler.", error = %error);
            std::future::pending().await
        }
    };
    tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "interrupt"
}
