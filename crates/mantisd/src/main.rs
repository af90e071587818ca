use std::process::ExitCode;

use color_eyre::eyre::{self, eyre};
use mantis_core::config::Config;
use mantisd::{
    Mantis,
    telemetry::{self, init_subscriber},
};
use tokio::{
    select,
    signal::unix::{SignalKind, signal},
};
use tracing::{error, info, instrument, warn};

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = color_eyre::install() {
        eprintln!("failed to install error reporting:\n{e:?}");
        return ExitCode::FAILURE;
    }

    // set up config
    let cfg: Config = match Config::load() {
        Err(err) => {
            eprintln!("failed to read config:\n{err:?}");
            return ExitCode::FAILURE;
        }
        Ok(cfg) => cfg,
    };

    // set up tracing
    let tracing_subscriber = telemetry::get_subscriber();
    init_subscriber(tracing_subscriber);
    info!(
        node = %cfg.node.primary,
        account = %cfg.account.address,
        strategies = cfg.strategies.len(),
        "starting mantis"
    );

    // spawn service
    let mut mantis = match Mantis::spawn(cfg) {
        Ok(mantis) => mantis,
        Err(e) => {
            error!(error = ?e, "failed initializing mantis");
            return ExitCode::FAILURE;
        }
    };
    info!(strategies = ?mantis.strategies(), "mantis running");

    let mut sigterm = signal(SignalKind::terminate())
        .expect("setting sigterm listener on unix should always work");

    let exit_reason = select! {
        _ = sigterm.recv() => Ok("received SIGTERM"),
        _ = tokio::signal::ctrl_c() => Ok("received ctrl-c"),
        res = &mut mantis => {
            res.and_then(|()| Err(eyre!("mantis service exited")))
        },
    };

    shutdown(exit_reason, mantis).await
}

#[instrument(skip_all)]
async fn shutdown(reason: eyre::Result<&str>, service: Mantis) -> ExitCode {
    let exit_code = match reason {
        Ok(reason) => {
            info!(reason, "shutting down");
            if let Err(e) = service.shutdown().await {
                warn!(error = ?e, "shutting down");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = ?e, "mantis service exited unexpectedly");
            ExitCode::FAILURE
        }
    };
    info!("shutdown successful");
    exit_code
}
