use std::process::ExitCode;

use eyre::WrapErr as _;
use tokio::{
    select,
    signal::unix::{
        signal,
        SignalKind,
    },
};
use tracing::{
    error,
    info,
    warn,
};
use wemixvisor::{
    config,
    telemetry,
    Config,
    Supervisor,
};

// Following the BSD convention for failing to read config
// See here: https://freedesktop.org/software/systemd/man/systemd.exec.html#Process%20Exit%20Codes
const EX_CONFIG: u8 = 78;

#[tokio::main]
async fn main() -> ExitCode {
    wemixvisor::install_error_handler()
        .expect("the error handler must be the first eyre hook installed");

    let cfg: Config = match config::get().wrap_err("failed reading config") {
        Err(e) => {
            eprintln!("failed to start wemixvisor:\n{e}");
            return ExitCode::from(EX_CONFIG);
        }
        Ok(cfg) => cfg,
    };

    let _telemetry_guard = match telemetry::configure()
        .set_filter_directives(&cfg.log)
        .set_force_stdout(cfg.force_stdout)
        .set_pretty_print(cfg.pretty_print)
        .try_init()
        .wrap_err("failed to setup telemetry")
    {
        Err(e) => {
            eprintln!("initializing wemixvisor failed:\n{e:?}");
            return ExitCode::FAILURE;
        }
        Ok(guard) => guard,
    };

    info!(
        config = serde_json::to_string(&cfg).expect("serializing to a string cannot fail"),
        "initializing wemixvisor"
    );

    let supervisor = match Supervisor::new(cfg) {
        Err(error) => {
            error!(%error, "failed initializing wemixvisor");
            return ExitCode::FAILURE;
        }
        Ok(supervisor) => supervisor,
    };

    let mut sigterm = signal(SignalKind::terminate())
        .expect("setting a SIGTERM listener should always work on unix; is this running on unix?");
    let mut sigint = signal(SignalKind::interrupt())
        .expect("setting a SIGINT listener should always work on unix");
    let mut sigquit = signal(SignalKind::quit())
        .expect("setting a SIGQUIT listener should always work on unix");

    let mut handle = supervisor.spawn();

    select!(
        _ = sigterm.recv() => {
            info!("received SIGTERM; shutting down");
            shutdown_gracefully(&mut handle).await
        }

        _ = sigint.recv() => {
            info!("received SIGINT; shutting down");
            shutdown_gracefully(&mut handle).await
        }

        _ = sigquit.recv() => {
            warn!("received SIGQUIT; killing node and exiting");
            match handle.kill().await {
                Ok(Ok(())) => ExitCode::SUCCESS,
                Ok(Err(error)) => {
                    error!(%error, "supervisor exited with an error during kill");
                    ExitCode::FAILURE
                }
                Err(error) => {
                    warn!(%error, "supervisor task panicked during kill");
                    ExitCode::FAILURE
                }
            }
        }

        res = &mut handle => {
            error!(
                error = res.err().map(tracing::field::display),
                "supervisor task exited unexpectedly",
            );
            ExitCode::FAILURE
        }
    )
}

async fn shutdown_gracefully(handle: &mut wemixvisor::supervisor::Handle) -> ExitCode {
    match handle.shutdown().await {
        Ok(Ok(())) => {
            info!("wemixvisor stopped");
            ExitCode::SUCCESS
        }
        Ok(Err(error)) => {
            error!(%error, "supervisor exited with an error during shutdown");
            ExitCode::FAILURE
        }
        Err(error) => {
            warn!(%error, "supervisor task panicked during shutdown");
            ExitCode::FAILURE
        }
    }
}
