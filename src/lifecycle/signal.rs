use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Cancel `cancel` on the first SIGINT or SIGTERM.
///
/// The listener stays alive afterwards: any signal received once the token
/// is cancelled exits the process at once with status 128 + signal number,
/// so a shutdown stuck on the tracking server can still be abandoned.
///
/// Handlers are registered before this returns, so a signal delivered
/// right after the call is not lost. Must be called inside a runtime.
#[cfg(unix)]
pub fn spawn_listener(cancel: CancellationToken) -> Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    debug!("listening for SIGINT and SIGTERM");

    Ok(tokio::spawn(async move {
        loop {
            let (name, signo) = tokio::select! {
                _ = sigint.recv() => ("SIGINT", libc::SIGINT),
                _ = sigterm.recv() => ("SIGTERM", libc::SIGTERM),
            };
            on_signal(&cancel, name, 128 + signo);
        }
    }))
}

#[cfg(not(unix))]
pub fn spawn_listener(cancel: CancellationToken) -> Result<JoinHandle<()>> {
    debug!("listening for ctrl-c");

    Ok(tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("failed to listen for ctrl-c");
                return;
            }
            on_signal(&cancel, "SIGINT", 130);
        }
    }))
}

fn on_signal(cancel: &CancellationToken, name: &str, exit_code: i32) {
    if cancel.is_cancelled() {
        warn!(
            signal = name,
            exit_code,
            "received another signal, exiting without closing the run",
        );
        std::process::exit(exit_code);
    }

    info!("received {name}, shutting down");
    cancel.cancel();
}
